use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use keybox::{
    CacheSettings, ConnectionOptions, RateLimiterSettings, RetryPolicy, SingleFlight,
};
use keybox_backend::{Compressor, Namespace, PassthroughCompressor};
use serde::{Deserialize, Serialize};

use crate::compression::Compression;
use crate::error::ConfigError;

const MINUTE: u64 = 60;

/// Root configuration document.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
pub struct Settings {
    pub connection_string: String,
    /// Namespace prepended to every cache and rate-limit key.
    pub key_prefix: String,
    /// Expiration of entries written without one.
    pub default_expiration_minutes: u64,
    /// Upper bound of a full key, prefix included.
    pub max_key_length: usize,
    pub enable_compression: bool,
    /// Serialized values strictly larger than this are compressed.
    pub compression_threshold_bytes: usize,
    pub compression: Compression,
    /// Codec level; the codec default when absent.
    pub compression_level: Option<i32>,
    pub connect_timeout_seconds: u64,
    pub command_timeout_seconds: u64,
    /// Database of cache entries.
    pub database: i64,
    /// Deduplicate concurrent `get_or_set` misses.
    pub single_flight: bool,
    pub retry: Retry,
    pub connection_pool: ConnectionPool,
    pub rate_limiting: RateLimiting,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection_string: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "keybox".to_string(),
            default_expiration_minutes: 30,
            max_key_length: keybox_backend::DEFAULT_MAX_KEY_LENGTH,
            enable_compression: true,
            compression_threshold_bytes: 1024,
            compression: Compression::default(),
            compression_level: None,
            connect_timeout_seconds: 5,
            command_timeout_seconds: 5,
            database: 0,
            single_flight: false,
            retry: Retry::default(),
            connection_pool: ConnectionPool::default(),
            rate_limiting: RateLimiting::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
pub struct Retry {
    /// Retries after the first attempt.
    pub max_retry_attempts: u32,
    pub retry_delay_seconds: u64,
    pub enable_exponential_backoff: bool,
    pub enable_jitter: bool,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_delay_seconds: 1,
            enable_exponential_backoff: true,
            enable_jitter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
pub struct ConnectionPool {
    /// Maximum number of cached database handles.
    pub max_pool_size: usize,
    pub abort_on_connect_fail: bool,
    pub allow_admin: bool,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self {
            max_pool_size: keybox::connection::DEFAULT_MAX_POOL_SIZE,
            abort_on_connect_fail: false,
            allow_admin: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
pub struct RateLimiting {
    /// Database of window sets.
    pub database: i64,
    pub default_window_minutes: u64,
    /// Capacity of the distinct-client tracker.
    pub max_tracked_clients: u64,
    pub cleanup_interval_minutes: u64,
}

impl Default for RateLimiting {
    fn default() -> Self {
        Self {
            database: 1,
            default_window_minutes: 1,
            max_tracked_clients: 100_000,
            cleanup_interval_minutes: 5,
        }
    }
}

impl Settings {
    /// Parses and validates a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_saphyr::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads, parses and validates a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Checks ranges the type system does not.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_string.trim().is_empty() {
            return Err(ConfigError::invalid("ConnectionString", "must not be empty"));
        }
        if self.key_prefix.trim().is_empty() {
            return Err(ConfigError::invalid("KeyPrefix", "must not be empty"));
        }
        if self.max_key_length <= self.key_prefix.len() + 1 {
            return Err(ConfigError::invalid(
                "MaxKeyLength",
                format!("must exceed the prefix length of {}", self.key_prefix.len()),
            ));
        }
        positive("DefaultExpirationMinutes", self.default_expiration_minutes)?;
        positive("ConnectTimeoutSeconds", self.connect_timeout_seconds)?;
        positive("CommandTimeoutSeconds", self.command_timeout_seconds)?;
        non_negative("Database", self.database)?;
        if self.connection_pool.max_pool_size == 0 {
            return Err(ConfigError::invalid("MaxPoolSize", "must be at least 1"));
        }
        non_negative("RateLimiting.Database", self.rate_limiting.database)?;
        positive("DefaultWindowMinutes", self.rate_limiting.default_window_minutes)?;
        positive("MaxTrackedClients", self.rate_limiting.max_tracked_clients)?;
        positive("CleanupIntervalMinutes", self.rate_limiting.cleanup_interval_minutes)?;
        Ok(())
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.key_prefix.clone()).with_max_key_length(self.max_key_length)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retry_attempts,
            Duration::from_secs(self.retry.retry_delay_seconds),
        )
        .with_exponential_backoff(self.retry.enable_exponential_backoff)
        .with_jitter(self.retry.enable_jitter)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            database: self.database,
            retry: self.retry_policy(),
            max_pool_size: self.connection_pool.max_pool_size,
            abort_on_connect_fail: self.connection_pool.abort_on_connect_fail,
            allow_admin: self.connection_pool.allow_admin,
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            namespace: self.namespace(),
            default_expiration: minutes(self.default_expiration_minutes),
            enable_compression: self.enable_compression,
            compression_threshold: self.compression_threshold_bytes,
            database: Some(self.database),
            single_flight: if self.single_flight {
                SingleFlight::Enabled
            } else {
                SingleFlight::Disabled
            },
        }
    }

    pub fn rate_limiter_settings(&self) -> RateLimiterSettings {
        let rate_limiting = &self.rate_limiting;
        RateLimiterSettings {
            namespace: self.namespace(),
            database: Some(rate_limiting.database),
            default_window: minutes(rate_limiting.default_window_minutes),
            max_tracked_clients: rate_limiting.max_tracked_clients,
            cleanup_interval: minutes(rate_limiting.cleanup_interval_minutes),
        }
    }

    /// Compressor for values above the threshold, passthrough when
    /// compression is disabled.
    pub fn compressor(&self) -> Result<Arc<dyn Compressor>, ConfigError> {
        if !self.enable_compression {
            return Ok(Arc::new(PassthroughCompressor));
        }
        self.compression.to_compressor(self.compression_level)
    }

    #[cfg(feature = "redis")]
    pub fn redis_connector(&self) -> Result<keybox_redis::RedisConnector, ConfigError> {
        keybox_redis::RedisConnector::builder()
            .server(self.connection_string.clone())
            .connect_timeout(Duration::from_secs(self.connect_timeout_seconds))
            .command_timeout(Duration::from_secs(self.command_timeout_seconds))
            .build()
            .map_err(|e| ConfigError::BackendNotAvailable(format!("Redis: {}", e)))
    }
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(MINUTE))
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be positive"));
    }
    Ok(())
}

fn non_negative(field: &'static str, value: i64) -> Result<(), ConfigError> {
    if value < 0 {
        return Err(ConfigError::invalid(field, "must not be negative"));
    }
    Ok(())
}
