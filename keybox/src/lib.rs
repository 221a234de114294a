#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Cache-aside service with compression, tagging and batching.
///
/// [`CacheService`] serializes values with a [`Format`](keybox_backend::Format),
/// compresses them above a threshold and stores them with absolute and sliding
/// expirations. Read failures degrade to misses.
pub mod cache;

/// Single-flight deduplication of concurrent cache misses.
pub mod concurrency;

/// Connection lifecycle and retried execution.
pub mod connection;

/// Error types of the cache and rate limiter.
pub mod error;

/// Metrics collection for cache and rate limit observability.
///
/// When the `metrics` feature is enabled, this module describes counters
/// for cache hits and misses, writes, retries and rate limit decisions.
pub mod metrics;

/// Sliding-window rate limiting.
pub mod rate_limit;

/// Retry policy with exponential backoff and jitter.
pub mod retry;

/// Statistics snapshots of the services.
pub mod stats;

pub use cache::{BatchOutcome, CacheOptions, CacheService, CacheServiceBuilder, CacheSettings};
pub use concurrency::SingleFlight;
pub use connection::{ConnectionManager, ConnectionOptions};
pub use error::{CacheError, RateLimitError};
pub use rate_limit::{
    CleanupHandle, RateLimitPolicy, RateLimitResult, RateLimitStatus, RateLimiter,
    RateLimiterSettings,
};
pub use retry::RetryPolicy;
pub use stats::{CacheStatistics, ConnectionStatistics, RateLimitingStatistics};

pub use keybox_backend::{
    BincodeFormat, Compressor, Connector, FaultKind, Format, GzipCompressor, JsonFormat,
    Namespace, PassthroughCompressor, StoreError,
};
#[cfg(feature = "zstd")]
pub use keybox_backend::ZstdCompressor;

/// The `keybox` prelude.
///
/// ```rust
/// use keybox::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CacheError, CacheOptions, CacheService, ConnectionManager, RateLimitPolicy, RateLimiter,
    };
}
