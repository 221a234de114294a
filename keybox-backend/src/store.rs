//! Store traits.
//!
//! A [`Connector`] knows how to open handles to a key-value store. A
//! [`Store`] is a handle to one logical database and exposes the small command
//! set the cache and the rate limiter are built on. A [`Server`] handle
//! carries administrative commands.
//!
//! Implementations map their native errors onto
//! [`FaultKind`](crate::FaultKind) so callers can decide whether to retry
//! without knowing the concrete store.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// Result of a store command.
pub type StoreResult<T> = Result<T, StoreError>;

/// Status of deleting result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    /// Record successfully deleted.
    Deleted(u32),
    /// Record already missing.
    Missing,
}

impl DeleteStatus {
    /// `true` when a record was removed.
    pub fn is_deleted(&self) -> bool {
        matches!(self, DeleteStatus::Deleted(_))
    }
}

/// A cache entry as it lives in the store.
///
/// `payload` is an [envelope](crate::envelope). `sliding` and `absolute` are
/// kept next to the payload so that reads and refreshes can re-arm the TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Enveloped, possibly compressed, serialized value.
    pub payload: Bytes,
    /// Sliding expiration re-armed on every read.
    pub sliding: Option<Duration>,
    /// Point in time after which the entry is gone regardless of reads.
    pub absolute: Option<DateTime<Utc>>,
}

impl StoredEntry {
    /// Entry without any expiration.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            sliding: None,
            absolute: None,
        }
    }

    /// Sets the sliding expiration.
    pub fn with_sliding(mut self, sliding: Option<Duration>) -> Self {
        self.sliding = sliding;
        self
    }

    /// Sets the absolute expiry.
    pub fn with_absolute(mut self, absolute: Option<DateTime<Utc>>) -> Self {
        self.absolute = absolute;
        self
    }

    /// TTL the store should apply right now.
    ///
    /// The smaller of the sliding window and the time left until the absolute
    /// expiry. `None` means the entry never expires. An absolute expiry in the
    /// past yields `Some(Duration::ZERO)`.
    pub fn effective_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        let until_absolute = self.absolute.map(|at| (at - now).to_std().unwrap_or_default());
        match (self.sliding, until_absolute) {
            (Some(sliding), Some(absolute)) => Some(sliding.min(absolute)),
            (sliding, absolute) => sliding.or(absolute),
        }
    }

    /// Approximate in-memory footprint in bytes.
    pub fn memory_size(&self) -> usize {
        self.payload.len() + std::mem::size_of::<Self>()
    }
}

/// One write of a batch.
#[derive(Debug, Clone)]
pub struct BatchWrite {
    pub key: String,
    pub entry: StoredEntry,
    pub ttl: Option<Duration>,
}

/// Member of a sorted set together with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// Handle to one logical database.
///
/// Handles are cheap to clone and safe to share; concurrent commands are
/// multiplexed by the implementation.
#[async_trait]
pub trait Store: Send + Sync {
    /// Round-trip liveness probe.
    async fn ping(&self) -> StoreResult<Duration>;

    async fn read(&self, key: &str) -> StoreResult<Option<StoredEntry>>;

    async fn write(&self, key: &str, entry: StoredEntry, ttl: Option<Duration>) -> StoreResult<()>;

    /// Pipelined writes. Not atomic: the result holds one flag per item, in order.
    async fn write_batch(&self, writes: Vec<BatchWrite>) -> StoreResult<Vec<bool>>;

    async fn remove(&self, key: &str) -> StoreResult<DeleteStatus>;

    /// Pipelined deletes. Returns how many keys were actually removed.
    async fn remove_batch(&self, keys: &[String]) -> StoreResult<u64>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Remaining time to live. `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Sets a TTL on an existing key. Returns `false` when the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Incrementally scans keys matching a glob pattern.
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Adds `member` to a set and (re)arms the set's TTL.
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Adds a scored member to a sorted set and (re)arms the set's TTL.
    async fn sorted_add(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// All members ordered by ascending score.
    async fn sorted_range(&self, key: &str) -> StoreResult<Vec<ScoredMember>>;

    /// Removes members with `min <= score <= max`. Returns the number removed.
    async fn sorted_remove_range_by_score(&self, key: &str, min: f64, max: f64)
    -> StoreResult<u64>;

    /// Publishes a message on a channel. Returns the number of receivers.
    async fn publish(&self, channel: &str, message: &[u8]) -> StoreResult<u64>;
}

/// Administrative handle.
#[async_trait]
pub trait Server: Send + Sync {
    async fn ping(&self) -> StoreResult<Duration>;

    /// Free-form server description (the `INFO` section for Redis).
    async fn info(&self) -> StoreResult<String>;

    async fn database_size(&self, db: i64) -> StoreResult<u64>;

    async fn flush_database(&self, db: i64) -> StoreResult<()>;
}

/// Opens handles to a store.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Database: Store + Clone + 'static;
    type Server: Server + Clone + 'static;
    type Subscriber: Send + 'static;

    /// Establishes a handle bound to database `db`.
    async fn connect(&self, db: i64) -> StoreResult<Self::Database>;

    /// Establishes an administrative handle.
    async fn server(&self) -> StoreResult<Self::Server>;

    /// Opens a dedicated publish/subscribe connection.
    async fn subscriber(&self) -> StoreResult<Self::Subscriber>;

    /// Short name used in logs and metric labels.
    fn name(&self) -> &str {
        "store"
    }
}
