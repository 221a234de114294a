//! Store metrics.
//!
//! Enable the `metrics` feature to emit these through the `metrics` facade.
//! Without the feature every recording function compiles to nothing.
//!
//! ## Naming Pattern
//!
//! - `keybox_store_command_*` - individual store commands
//! - `keybox_store_connection_*` - connection establishment
//! - `keybox_store_{compress,decompress}_duration_seconds` - payload processing

use std::time::Duration;

#[cfg(feature = "metrics")]
use std::time::Instant;

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

/// Zero-cost timer for metrics collection.
///
/// When the `metrics` feature is enabled, this captures the start time.
/// When disabled, this is a zero-sized struct with no overhead.
pub struct Timer {
    #[cfg(feature = "metrics")]
    start: Instant,
}

impl Timer {
    #[inline]
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "metrics")]
            start: Instant::now(),
        }
    }

    /// Returns actual elapsed time when metrics enabled, Duration::ZERO otherwise.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        #[cfg(feature = "metrics")]
        {
            self.start.elapsed()
        }
        #[cfg(not(feature = "metrics"))]
        {
            Duration::ZERO
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "metrics")]
lazy_static! {
    /// Metric name for total store commands counter.
    pub static ref STORE_COMMAND_TOTAL: &'static str = {
        metrics::describe_counter!(
            "keybox_store_command_total",
            "Total number of store commands per store and command."
        );
        "keybox_store_command_total"
    };

    /// Metric name for store command duration histogram.
    pub static ref STORE_COMMAND_DURATION: &'static str = {
        metrics::describe_histogram!(
            "keybox_store_command_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of store commands in seconds."
        );
        "keybox_store_command_duration_seconds"
    };

    /// Metric name for store command errors counter.
    pub static ref STORE_COMMAND_ERRORS: &'static str = {
        metrics::describe_counter!(
            "keybox_store_command_errors_total",
            "Total number of failed store commands per fault kind."
        );
        "keybox_store_command_errors_total"
    };

    /// Metric name for connection attempts counter.
    pub static ref STORE_CONNECTION_ATTEMPTS: &'static str = {
        metrics::describe_counter!(
            "keybox_store_connection_attempts_total",
            "Total number of connection establishment attempts."
        );
        "keybox_store_connection_attempts_total"
    };

    /// Metric name for failed connections counter.
    pub static ref STORE_CONNECTION_FAILURES: &'static str = {
        metrics::describe_counter!(
            "keybox_store_connection_failures_total",
            "Total number of failed connection establishment attempts."
        );
        "keybox_store_connection_failures_total"
    };

    /// Metric name for compression duration histogram.
    pub static ref STORE_COMPRESS_DURATION: &'static str = {
        metrics::describe_histogram!(
            "keybox_store_compress_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of compression operations in seconds."
        );
        "keybox_store_compress_duration_seconds"
    };

    /// Metric name for decompression duration histogram.
    pub static ref STORE_DECOMPRESS_DURATION: &'static str = {
        metrics::describe_histogram!(
            "keybox_store_decompress_duration_seconds",
            metrics::Unit::Seconds,
            "Duration of decompression operations in seconds."
        );
        "keybox_store_decompress_duration_seconds"
    };
}

/// Record a store command with duration.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_command(store: &str, command: &'static str, duration: Duration) {
    metrics::counter!(*STORE_COMMAND_TOTAL, "store" => store.to_string(), "command" => command)
        .increment(1);
    metrics::histogram!(*STORE_COMMAND_DURATION, "store" => store.to_string(), "command" => command)
        .record(duration.as_secs_f64());
}

/// Record a store command (no-op when `metrics` feature disabled).
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_command(_store: &str, _command: &'static str, _duration: Duration) {}

/// Record a failed store command.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_command_error(store: &str, kind: crate::FaultKind) {
    metrics::counter!(*STORE_COMMAND_ERRORS, "store" => store.to_string(), "kind" => kind.to_string())
        .increment(1);
}

/// Record a failed store command (no-op when `metrics` feature disabled).
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_command_error(_store: &str, _kind: crate::FaultKind) {}

/// Record a connection attempt and whether it succeeded.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_connection_attempt(store: &str, success: bool) {
    metrics::counter!(*STORE_CONNECTION_ATTEMPTS, "store" => store.to_string()).increment(1);
    if !success {
        metrics::counter!(*STORE_CONNECTION_FAILURES, "store" => store.to_string()).increment(1);
    }
}

/// Record a connection attempt (no-op when `metrics` feature disabled).
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_connection_attempt(_store: &str, _success: bool) {}

/// Record compression duration.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_compress(duration: Duration) {
    metrics::histogram!(*STORE_COMPRESS_DURATION).record(duration.as_secs_f64());
}

/// Record compression duration (no-op when `metrics` feature disabled).
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_compress(_duration: Duration) {}

/// Record decompression duration.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_decompress(duration: Duration) {
    metrics::histogram!(*STORE_DECOMPRESS_DURATION).record(duration.as_secs_f64());
}

/// Record decompression duration (no-op when `metrics` feature disabled).
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_decompress(_duration: Duration) {}
