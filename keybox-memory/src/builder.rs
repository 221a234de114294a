//! Builder for configuring [`MemoryConnector`].

use std::sync::Arc;

use dashmap::DashMap;
use moka::policy::EvictionPolicy;
use tokio::sync::broadcast;

use crate::connector::{MemoryConnector, Shared};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Builder for creating and configuring a [`MemoryConnector`].
///
/// Use [`MemoryConnector::builder`] to create a new builder instance.
///
/// # Examples
///
/// ```
/// use keybox_memory::MemoryConnector;
///
/// let connector = MemoryConnector::builder()
///     .max_entries(10_000)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct MemoryConnectorBuilder {
    max_entries: Option<u64>,
    eviction_policy: Option<EvictionPolicy>,
    label: String,
    channel_capacity: usize,
}

impl Default for MemoryConnectorBuilder {
    fn default() -> Self {
        Self {
            max_entries: None,
            eviction_policy: None,
            label: "memory".to_owned(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl MemoryConnectorBuilder {
    /// Creates a new builder for an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of keys each logical database can hold.
    ///
    /// When a database exceeds this capacity, least recently used keys are
    /// evicted.
    pub fn max_entries(mut self, capacity: u64) -> Self {
        self.max_entries = Some(capacity);
        self
    }

    /// Sets the eviction policy used once `max_entries` is reached.
    ///
    /// # Default
    ///
    /// [`EvictionPolicy::lru()`]. TinyLFU's admission policy may reject new
    /// writes outright, which a key-value store must not do silently.
    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = Some(policy);
        self
    }

    /// Sets a custom label used in logs and metric labels.
    ///
    /// # Default
    ///
    /// `"memory"`
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Number of published messages buffered for slow subscribers.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Builds the [`MemoryConnector`].
    pub fn build(self) -> MemoryConnector {
        let (publisher, _) = broadcast::channel(self.channel_capacity);
        MemoryConnector {
            shared: Arc::new(Shared {
                databases: DashMap::new(),
                publisher,
                max_entries: self.max_entries,
                eviction_policy: self.eviction_policy.unwrap_or_else(EvictionPolicy::lru),
                label: self.label,
            }),
        }
    }
}
