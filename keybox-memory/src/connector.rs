use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use keybox_backend::{Connector, StoreResult};
use moka::policy::EvictionPolicy;
use tokio::sync::broadcast;
use tracing::debug;

use crate::builder::MemoryConnectorBuilder;
use crate::pubsub::{MemoryMessage, MemorySubscriber};
use crate::server::MemoryServer;
use crate::store::MemoryStore;

pub(crate) struct Shared {
    pub(crate) databases: DashMap<i64, MemoryStore>,
    pub(crate) publisher: broadcast::Sender<MemoryMessage>,
    pub(crate) max_entries: Option<u64>,
    pub(crate) eviction_policy: EvictionPolicy,
    pub(crate) label: String,
}

/// In-process [`Connector`].
///
/// Clones share the same databases; two connectors built separately do not.
#[derive(Clone)]
pub struct MemoryConnector {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector")
            .field("label", &self.shared.label)
            .field("databases", &self.shared.databases.len())
            .field("max_entries", &self.shared.max_entries)
            .finish()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MemoryConnector {
    /// Creates a new builder with an unbounded store.
    pub fn builder() -> MemoryConnectorBuilder {
        MemoryConnectorBuilder::new()
    }

    /// Handle to database `db`, created on first use.
    pub fn database(&self, db: i64) -> MemoryStore {
        self.shared
            .databases
            .entry(db)
            .or_insert_with(|| {
                debug!(store = %self.shared.label, db, "Creating in-memory database");
                MemoryStore::new(
                    self.shared.label.clone(),
                    db,
                    self.shared.max_entries,
                    self.shared.eviction_policy.clone(),
                    self.shared.publisher.clone(),
                )
            })
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Database = MemoryStore;
    type Server = MemoryServer;
    type Subscriber = MemorySubscriber;

    async fn connect(&self, db: i64) -> StoreResult<Self::Database> {
        Ok(self.database(db))
    }

    async fn server(&self) -> StoreResult<Self::Server> {
        Ok(MemoryServer::new(self.clone()))
    }

    async fn subscriber(&self) -> StoreResult<Self::Subscriber> {
        Ok(MemorySubscriber::new(self.shared.publisher.subscribe()))
    }

    fn name(&self) -> &str {
        &self.shared.label
    }
}
