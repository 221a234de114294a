use std::time::{Duration, Instant};

use async_trait::async_trait;
use keybox_backend::{Server, StoreResult};
use redis::aio::MultiplexedConnection;

use crate::connector::{RedisConnector, with_timeout};

/// Administrative handle.
///
/// Commands against database 0 reuse the handle's own connection; other
/// databases get a short-lived connection selected on demand.
#[derive(Clone)]
pub struct RedisServer {
    connector: RedisConnector,
    connection: MultiplexedConnection,
}

impl std::fmt::Debug for RedisServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisServer")
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}

impl RedisServer {
    pub(crate) fn new(connector: RedisConnector, connection: MultiplexedConnection) -> Self {
        Self {
            connector,
            connection,
        }
    }

    async fn connection_for(&self, db: i64) -> StoreResult<MultiplexedConnection> {
        if db == 0 {
            Ok(self.connection.clone())
        } else {
            Ok(self.connector.open(db).await?)
        }
    }
}

#[async_trait]
impl Server for RedisServer {
    async fn ping(&self) -> StoreResult<Duration> {
        let mut con = self.connection.clone();
        let started = Instant::now();
        let _: String = with_timeout(
            "PING",
            self.connector.command_timeout(),
            redis::cmd("PING").query_async(&mut con),
        )
        .await?;
        Ok(started.elapsed())
    }

    async fn info(&self) -> StoreResult<String> {
        let mut con = self.connection.clone();
        Ok(with_timeout(
            "INFO",
            self.connector.command_timeout(),
            redis::cmd("INFO").query_async(&mut con),
        )
        .await?)
    }

    async fn database_size(&self, db: i64) -> StoreResult<u64> {
        let mut con = self.connection_for(db).await?;
        Ok(with_timeout(
            "DBSIZE",
            self.connector.command_timeout(),
            redis::cmd("DBSIZE").query_async(&mut con),
        )
        .await?)
    }

    async fn flush_database(&self, db: i64) -> StoreResult<()> {
        let mut con = self.connection_for(db).await?;
        with_timeout(
            "FLUSHDB",
            self.connector.command_timeout(),
            redis::cmd("FLUSHDB").query_async::<()>(&mut con),
        )
        .await?;
        tracing::info!(store = %self.connector.label(), db, "Database flushed");
        Ok(())
    }
}
