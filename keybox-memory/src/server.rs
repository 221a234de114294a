use std::time::{Duration, Instant};

use async_trait::async_trait;
use keybox_backend::{Server, StoreResult};

use crate::connector::MemoryConnector;

/// Administrative handle over every database of a [`MemoryConnector`].
#[derive(Debug, Clone)]
pub struct MemoryServer {
    connector: MemoryConnector,
}

impl MemoryServer {
    pub(crate) fn new(connector: MemoryConnector) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl Server for MemoryServer {
    async fn ping(&self) -> StoreResult<Duration> {
        let started = Instant::now();
        let _ = self.connector.shared.databases.len();
        Ok(started.elapsed())
    }

    async fn info(&self) -> StoreResult<String> {
        let mut info = format!(
            "# Server\r\nstore:{}\r\nmode:in-process\r\n# Keyspace\r\n",
            self.connector.shared.label
        );
        let mut databases: Vec<i64> = self
            .connector
            .shared
            .databases
            .iter()
            .map(|entry| *entry.key())
            .collect();
        databases.sort_unstable();
        for db in databases {
            let keys = self.connector.database(db).len();
            info.push_str(&format!("db{db}:keys={keys}\r\n"));
        }
        Ok(info)
    }

    async fn database_size(&self, db: i64) -> StoreResult<u64> {
        Ok(self.connector.database(db).len())
    }

    async fn flush_database(&self, db: i64) -> StoreResult<()> {
        self.connector.database(db).clear();
        tracing::info!(store = %self.connector.shared.label, db, "Database flushed");
        Ok(())
    }
}
