//! Distributed cache over a [`ConnectionManager`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keybox_backend::metrics::{Timer, record_compress, record_decompress};
use keybox_backend::{
    BatchWrite, BoxError, CompressionMarker, Compressor, Connector, Format, GzipCompressor,
    JsonFormat, Namespace, PassthroughCompressor, Store, StoreError, StoredEntry, envelope,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::concurrency::{self, Flight, FlightGroup, SingleFlight};
use crate::connection::ConnectionManager;
use crate::error::CacheError;
use crate::metrics;
use crate::stats::{CacheCounters, CacheStatistics};

/// Tag indexes outlive their members by a fixed horizon.
pub const TAG_INDEX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Service-wide cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Key prefix and maximum key length.
    pub namespace: Namespace,
    /// Expiration applied when [`CacheOptions`] sets none.
    pub default_expiration: Duration,
    /// Compress values above `compression_threshold`.
    pub enable_compression: bool,
    /// Serialized values strictly larger than this are compressed.
    pub compression_threshold: usize,
    /// Database for cache entries; the manager's default when `None`.
    pub database: Option<i64>,
    /// Deduplication of concurrent `get_or_set` misses.
    pub single_flight: SingleFlight,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            namespace: Namespace::new("keybox"),
            default_expiration: Duration::from_secs(30 * 60),
            enable_compression: true,
            compression_threshold: 1024,
            database: None,
            single_flight: SingleFlight::Disabled,
        }
    }
}

/// Per-write options.
///
/// ```
/// use std::time::Duration;
/// use keybox::CacheOptions;
///
/// let options = CacheOptions::new()
///     .sliding(Duration::from_secs(300))
///     .absolute(Duration::from_secs(3600))
///     .tag("users");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Entry expires this long after the write, regardless of reads.
    pub absolute_expiration: Option<Duration>,
    /// Entry expires after this long without reads or refreshes.
    pub sliding_expiration: Option<Duration>,
    /// Tag indexes the key is registered under.
    pub tags: Vec<String>,
    /// Allow compression of this value when it crosses the threshold.
    pub compress: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            absolute_expiration: None,
            sliding_expiration: None,
            tags: Vec::new(),
            compress: true,
        }
    }
}

impl CacheOptions {
    /// Default expiration, no tags, compression allowed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the absolute expiration relative to now.
    pub fn absolute(mut self, ttl: Duration) -> Self {
        self.absolute_expiration = Some(ttl);
        self
    }

    /// Sets the sliding expiration.
    pub fn sliding(mut self, ttl: Duration) -> Self {
        self.sliding_expiration = Some(ttl);
        self
    }

    /// Adds a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Adds several tags.
    pub fn tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Allows or forbids compression.
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

/// Outcome of a non-atomic batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Items passed in.
    pub requested: usize,
    /// Items the store acknowledged.
    pub succeeded: usize,
}

impl BatchOutcome {
    /// Every item was written.
    pub fn is_complete(&self) -> bool {
        self.succeeded == self.requested
    }

    /// Items that were skipped or not acknowledged.
    pub fn failed(&self) -> usize {
        self.requested - self.succeeded
    }
}

struct Inner<C: Connector, F: Format> {
    connection: ConnectionManager<C>,
    settings: CacheSettings,
    format: F,
    compressor: Arc<dyn Compressor>,
    counters: CacheCounters,
    flights: FlightGroup,
}

/// Cache-aside service.
///
/// Reads degrade to misses on any store or decoding failure. Writes report
/// failures. Every store call runs through
/// [`ConnectionManager::execute_with_retry`] and races the service's
/// cancellation token, see [`with_cancellation`](Self::with_cancellation).
pub struct CacheService<C: Connector, F: Format = JsonFormat> {
    inner: Arc<Inner<C, F>>,
    cancel: CancellationToken,
}

impl<C: Connector, F: Format> Clone for CacheService<C, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            cancel: self.cancel.clone(),
        }
    }
}

impl<C: Connector, F: Format> std::fmt::Debug for CacheService<C, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("settings", &self.inner.settings)
            .field("format", &self.inner.format)
            .field("compressor", &self.inner.compressor)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> CacheService<C, JsonFormat> {
    /// JSON values, gzip compression above the threshold.
    pub fn new(connection: ConnectionManager<C>, settings: CacheSettings) -> Self {
        Self::builder(connection).settings(settings).build()
    }

    /// Starts a builder with default settings.
    pub fn builder(connection: ConnectionManager<C>) -> CacheServiceBuilder<C, JsonFormat> {
        CacheServiceBuilder {
            connection,
            settings: CacheSettings::default(),
            format: JsonFormat,
            compressor: None,
        }
    }
}

/// Builder for [`CacheService`].
pub struct CacheServiceBuilder<C: Connector, F: Format> {
    connection: ConnectionManager<C>,
    settings: CacheSettings,
    format: F,
    compressor: Option<Arc<dyn Compressor>>,
}

impl<C: Connector, F: Format> CacheServiceBuilder<C, F> {
    /// Replaces the settings.
    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Value format. Readers and writers of a key must agree on it.
    pub fn format<NewF: Format>(self, format: NewF) -> CacheServiceBuilder<C, NewF> {
        CacheServiceBuilder {
            connection: self.connection,
            settings: self.settings,
            format,
            compressor: self.compressor,
        }
    }

    /// Compressor for values above the threshold. Defaults to gzip.
    ///
    /// Readers decode by the payload marker, so changing it does not
    /// invalidate existing entries.
    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Builds the service.
    pub fn build(self) -> CacheService<C, F> {
        let compressor = match self.compressor {
            Some(compressor) => compressor,
            None if self.settings.enable_compression => Arc::new(GzipCompressor::default()),
            None => Arc::new(PassthroughCompressor),
        };
        CacheService {
            inner: Arc::new(Inner {
                connection: self.connection,
                settings: self.settings,
                format: self.format,
                compressor,
                counters: CacheCounters::default(),
                flights: FlightGroup::default(),
            }),
            cancel: CancellationToken::new(),
        }
    }
}

impl<C: Connector, F: Format> CacheService<C, F> {
    /// View of this service whose store calls abort when `token` is cancelled.
    ///
    /// The view shares connection, settings and statistics with `self`.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            cancel: token,
        }
    }

    /// Settings the service was built with.
    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// The shared connection manager.
    pub fn connection(&self) -> &ConnectionManager<C> {
        &self.inner.connection
    }

    /// Reads and decodes `key`.
    ///
    /// Store and decoding failures are logged and reported as a miss. Entries
    /// with a sliding expiration get their TTL re-armed on a hit.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let full_key = self.full_key(key)?;
        self.inner.counters.gets.incr();

        let read_key = full_key.as_str();
        let entry = match self.execute(move |db| async move { db.read(read_key).await }).await {
            Ok(entry) => entry,
            Err(error) if error.is_cancelled() => return Err(CacheError::Cancelled),
            Err(error) => {
                self.soft_failure("get", key, &error);
                return Ok(self.miss());
            }
        };
        let Some(entry) = entry else {
            debug!(key, "Cache miss");
            return Ok(self.miss());
        };

        let value = match self.decode::<T>(&entry.payload) {
            Ok(value) => value,
            Err(error) => {
                self.soft_failure("decode", key, &error);
                return Ok(self.miss());
            }
        };

        self.inner.counters.hits.incr();
        metrics::record_lookup(true);
        debug!(key, "Cache hit");
        if entry.sliding.is_some() {
            self.rearm(&full_key, &entry).await?;
        }
        Ok(Some(value))
    }

    /// Serializes and writes `value`, then registers the key under each tag.
    pub async fn set<T>(
        &self,
        key: &str,
        value: &T,
        options: &CacheOptions,
    ) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let full_key = self.full_key(key)?;
        let tag_keys = self.tag_keys(&options.tags)?;
        let write = self.encode(full_key, value, options).inspect_err(|_| {
            self.inner.counters.errors.incr();
            metrics::record_cache_error("encode");
        })?;
        let (bytes, compressed) = (write.entry.payload.len(), self.is_compressed(&write));

        let stored = self
            .execute(|db| {
                let write = write.clone();
                async move { db.write(&write.key, write.entry, write.ttl).await }
            })
            .await;
        if let Err(error) = stored {
            return Err(self.write_failure("set", key, error));
        }
        self.record_write(bytes, compressed);

        self.register_tags(&write.key, &tag_keys)
            .await
            .map_err(|error| self.write_failure("tag", key, error))?;
        debug!(key, bytes, compressed, "Cache entry written");
        Ok(())
    }

    /// Deletes `key`. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let full_key = self.full_key(key)?;
        let full_key = full_key.as_str();
        let status = self
            .execute(move |db| async move { db.remove(full_key).await })
            .await
            .map_err(|error| self.write_failure("remove", key, error))?;
        if status.is_deleted() {
            self.inner.counters.removes.incr();
        }
        Ok(status.is_deleted())
    }

    /// Deletes every key matching a glob `pattern` under the namespace.
    pub async fn remove_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let full_pattern = self.inner.settings.namespace.cache_pattern(pattern)?;
        let full_pattern = full_pattern.as_str();
        let keys = self
            .execute(move |db| async move { db.scan(full_pattern).await })
            .await
            .map_err(|error| self.write_failure("remove_by_pattern", pattern, error))?;
        let removed = self.remove_full_keys(&keys, "remove_by_pattern", pattern).await?;
        debug!(pattern, matched = keys.len(), removed, "Removed keys by pattern");
        Ok(removed)
    }

    /// Deletes every key registered under `tag`, then the tag index itself.
    ///
    /// The index may name keys that already expired; they do not count.
    pub async fn remove_by_tag(&self, tag: &str) -> Result<u64, CacheError> {
        let tag_key = self.inner.settings.namespace.tag_key(tag)?;
        let tag_key = tag_key.as_str();
        let keys = self
            .execute(move |db| async move { db.set_members(tag_key).await })
            .await
            .map_err(|error| self.write_failure("remove_by_tag", tag, error))?;
        let removed = self.remove_full_keys(&keys, "remove_by_tag", tag).await?;
        self.execute(move |db| async move { db.remove(tag_key).await })
            .await
            .map_err(|error| self.write_failure("remove_by_tag", tag, error))?;
        debug!(tag, removed, "Removed keys by tag");
        Ok(removed)
    }

    /// `false` on store failure.
    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let full_key = self.full_key(key)?;
        let full_key = full_key.as_str();
        match self
            .execute(move |db| async move { db.exists(full_key).await })
            .await
        {
            Ok(exists) => Ok(exists),
            Err(error) if error.is_cancelled() => Err(CacheError::Cancelled),
            Err(error) => {
                self.soft_failure("exists", key, &error);
                Ok(false)
            }
        }
    }

    /// Remaining TTL. `None` when missing, persistent, or on store failure.
    pub async fn get_ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let full_key = self.full_key(key)?;
        let full_key = full_key.as_str();
        match self
            .execute(move |db| async move { db.ttl(full_key).await })
            .await
        {
            Ok(ttl) => Ok(ttl),
            Err(error) if error.is_cancelled() => Err(CacheError::Cancelled),
            Err(error) => {
                self.soft_failure("get_ttl", key, &error);
                Ok(None)
            }
        }
    }

    /// Re-arms the sliding expiration of `key`. No-op on failure or when
    /// the entry has no sliding expiration.
    pub async fn refresh(&self, key: &str) -> Result<(), CacheError> {
        let full_key = self.full_key(key)?;
        let full_key = full_key.as_str();
        let entry = match self
            .execute(move |db| async move { db.read(full_key).await })
            .await
        {
            Ok(entry) => entry,
            Err(error) if error.is_cancelled() => return Err(CacheError::Cancelled),
            Err(error) => {
                self.soft_failure("refresh", key, &error);
                return Ok(());
            }
        };
        match entry {
            Some(entry) if entry.sliding.is_some() => self.rearm(full_key, &entry).await,
            _ => Ok(()),
        }
    }

    /// Cache-aside read.
    ///
    /// On a miss `factory` runs and its value is written before being
    /// returned. A failed write is logged; the value is still returned.
    ///
    /// With [`SingleFlight::Disabled`] concurrent misses for the same key
    /// each run their own factory. With [`SingleFlight::Enabled`] one caller
    /// runs it and the others wait, then read the cached value; a waiter that
    /// still misses runs its own factory.
    pub async fn get_or_set<T, Fut, E>(
        &self,
        key: &str,
        options: &CacheOptions,
        factory: impl FnOnce() -> Fut,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if let Some(value) = self.get::<T>(key).await? {
            return Ok(value);
        }
        if self.inner.settings.single_flight == SingleFlight::Disabled {
            return self.fill(key, options, factory).await;
        }

        let full_key = self.full_key(key)?;
        match self.inner.flights.join(&full_key) {
            Flight::Leader(_guard) => {
                // Another leader may have finished between our miss and the join.
                if let Some(value) = self.get::<T>(key).await? {
                    return Ok(value);
                }
                self.fill(key, options, factory).await
            }
            Flight::Follower(receiver) => {
                metrics::record_single_flight_wait();
                debug!(key, "Waiting for in-flight factory");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(CacheError::Cancelled),
                    _ = concurrency::wait(receiver) => {}
                }
                match self.get::<T>(key).await? {
                    Some(value) => Ok(value),
                    None => self.fill(key, options, factory).await,
                }
            }
        }
    }

    /// Writes many entries in one pipeline. Not atomic.
    ///
    /// Items with invalid keys or unserializable values are skipped and count
    /// as failed. A store failure fails the remaining items without an error.
    pub async fn set_batch<K, T, I>(
        &self,
        items: I,
        options: &CacheOptions,
    ) -> Result<BatchOutcome, CacheError>
    where
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
        T: Serialize,
    {
        let tag_keys = self.tag_keys(&options.tags)?;
        let mut requested = 0;
        let mut writes = Vec::new();
        for (key, value) in items {
            requested += 1;
            let key = key.as_ref();
            let prepared = self
                .full_key(key)
                .and_then(|full_key| self.encode(full_key, &value, options));
            match prepared {
                Ok(write) => writes.push(write),
                Err(error) => {
                    self.inner.counters.errors.incr();
                    warn!(key, %error, "Skipping batch item");
                }
            }
        }
        if writes.is_empty() {
            return Ok(BatchOutcome {
                requested,
                succeeded: 0,
            });
        }

        let flags = match self
            .execute(|db| {
                let writes = writes.clone();
                async move { db.write_batch(writes).await }
            })
            .await
        {
            Ok(flags) => flags,
            Err(error) if error.is_cancelled() => return Err(CacheError::Cancelled),
            Err(error) => {
                self.inner.counters.errors.incr();
                metrics::record_cache_error("set_batch");
                warn!(items = writes.len(), %error, "Batch write failed");
                vec![false; writes.len()]
            }
        };

        let mut succeeded = 0;
        for (write, written) in writes.iter().zip(flags) {
            if !written {
                continue;
            }
            succeeded += 1;
            self.record_write(write.entry.payload.len(), self.is_compressed(write));
            if let Err(error) = self.register_tags(&write.key, &tag_keys).await {
                if error.is_cancelled() {
                    return Err(CacheError::Cancelled);
                }
                warn!(key = %write.key, %error, "Failed to register batch item tags");
            }
        }
        let outcome = BatchOutcome {
            requested,
            succeeded,
        };
        debug!(requested, succeeded, "Batch written");
        Ok(outcome)
    }

    /// Deletes many keys in one pipeline. Invalid keys are skipped.
    pub async fn remove_batch<K: AsRef<str>>(&self, keys: &[K]) -> Result<u64, CacheError> {
        let mut full_keys = Vec::with_capacity(keys.len());
        for key in keys {
            match self.full_key(key.as_ref()) {
                Ok(full_key) => full_keys.push(full_key),
                Err(error) => warn!(key = key.as_ref(), %error, "Skipping batch key"),
            }
        }
        self.remove_full_keys(&full_keys, "remove_batch", "").await
    }

    /// Snapshot of the cache counters.
    pub fn statistics(&self) -> CacheStatistics {
        self.inner.counters.snapshot()
    }

    /// Zeroes the cache counters.
    pub fn reset_statistics(&self) {
        self.inner.counters.reset();
    }

    async fn execute<T, Op, Fut>(&self, operation: Op) -> Result<T, StoreError>
    where
        Op: Fn(C::Database) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.inner
            .connection
            .execute_with_retry(self.inner.settings.database, &self.cancel, operation)
            .await
    }

    fn full_key(&self, key: &str) -> Result<String, CacheError> {
        Ok(self.inner.settings.namespace.cache_key(key)?)
    }

    fn tag_keys(&self, tags: &[String]) -> Result<Vec<String>, CacheError> {
        tags.iter()
            .map(|tag| Ok(self.inner.settings.namespace.tag_key(tag)?))
            .collect()
    }

    fn encode<T>(
        &self,
        full_key: String,
        value: &T,
        options: &CacheOptions,
    ) -> Result<BatchWrite, CacheError>
    where
        T: Serialize + ?Sized,
    {
        let body = self.inner.format.serialize(value)?;
        let settings = &self.inner.settings;
        let compress = settings.enable_compression
            && options.compress
            && body.len() > settings.compression_threshold;
        let payload = if compress {
            let timer = Timer::new();
            let payload = envelope::seal(&body, self.inner.compressor.as_ref())?;
            record_compress(timer.elapsed());
            payload
        } else {
            envelope::seal(&body, &PassthroughCompressor)?
        };

        let now = Utc::now();
        let absolute = match (options.absolute_expiration, options.sliding_expiration) {
            (None, None) => Some(settings.default_expiration),
            (absolute, _) => absolute,
        };
        let entry = StoredEntry::new(payload)
            .with_sliding(options.sliding_expiration)
            .with_absolute(absolute.and_then(|ttl| {
                chrono::Duration::from_std(ttl)
                    .ok()
                    .and_then(|ttl| now.checked_add_signed(ttl))
            }));
        let ttl = entry.effective_ttl(now);
        Ok(BatchWrite {
            key: full_key,
            entry,
            ttl,
        })
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CacheError> {
        let timer = Timer::new();
        let body = envelope::open(payload)?;
        if envelope::marker_of(payload).is_some_and(|marker| marker != CompressionMarker::Plain) {
            record_decompress(timer.elapsed());
        }
        Ok(self.inner.format.deserialize(&body)?)
    }

    fn is_compressed(&self, write: &BatchWrite) -> bool {
        envelope::marker_of(&write.entry.payload)
            .is_some_and(|marker| marker != CompressionMarker::Plain)
    }

    async fn rearm(&self, full_key: &str, entry: &StoredEntry) -> Result<(), CacheError> {
        let Some(ttl) = entry.effective_ttl(Utc::now()) else {
            return Ok(());
        };
        match self
            .execute(move |db| async move { db.expire(full_key, ttl).await })
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if error.is_cancelled() => Err(CacheError::Cancelled),
            Err(error) => {
                self.soft_failure("refresh", full_key, &error);
                Ok(())
            }
        }
    }

    async fn register_tags(&self, full_key: &str, tag_keys: &[String]) -> Result<(), StoreError> {
        for tag_key in tag_keys {
            let tag_key = tag_key.as_str();
            self.execute(move |db| async move {
                db.set_add(tag_key, full_key, TAG_INDEX_TTL).await
            })
            .await?;
        }
        Ok(())
    }

    async fn fill<T, Fut, E>(
        &self,
        key: &str,
        options: &CacheOptions,
        factory: impl FnOnce() -> Fut,
    ) -> Result<T, CacheError>
    where
        T: Serialize,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let value = factory()
            .await
            .map_err(|error| CacheError::Factory(error.into()))?;
        match self.set(key, &value, options).await {
            Ok(()) => Ok(value),
            Err(CacheError::Cancelled) => Err(CacheError::Cancelled),
            Err(error) => {
                warn!(key, %error, "Failed to cache factory value");
                Ok(value)
            }
        }
    }

    async fn remove_full_keys(
        &self,
        keys: &[String],
        operation: &'static str,
        subject: &str,
    ) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self
            .execute(move |db| async move { db.remove_batch(keys).await })
            .await
            .map_err(|error| self.write_failure(operation, subject, error))?;
        self.inner.counters.removes.add(removed);
        Ok(removed)
    }

    fn miss<T>(&self) -> Option<T> {
        self.inner.counters.misses.incr();
        metrics::record_lookup(false);
        None
    }

    fn record_write(&self, bytes: usize, compressed: bool) {
        let counters = &self.inner.counters;
        counters.sets.incr();
        counters.bytes_written.add(bytes as u64);
        if compressed {
            counters.compressed_writes.incr();
        }
        metrics::record_write(bytes, compressed);
    }

    fn soft_failure(&self, operation: &'static str, key: &str, error: &dyn std::fmt::Display) {
        self.inner.counters.errors.incr();
        metrics::record_cache_error(operation);
        warn!(operation, key, %error, "Cache operation degraded");
    }

    fn write_failure(&self, operation: &'static str, key: &str, error: StoreError) -> CacheError {
        if !error.is_cancelled() {
            self.inner.counters.errors.incr();
            metrics::record_cache_error(operation);
            warn!(operation, key, %error, "Cache write failed");
        }
        CacheError::from(error)
    }
}
