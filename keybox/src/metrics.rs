//! Metrics declaration and initialization.
//!
//! Store-level command metrics live in `keybox_backend::metrics`; this module
//! covers cache and rate-limit decisions.

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
lazy_static! {
    // Cache metrics

    /// Track number of cache hit events.
    pub static ref CACHE_HIT_COUNTER: &'static str = {
        metrics::describe_counter!(
            "keybox_cache_hit_total",
            "Total number of cache hit events."
        );
        "keybox_cache_hit_total"
    };
    /// Track number of cache miss events.
    pub static ref CACHE_MISS_COUNTER: &'static str = {
        metrics::describe_counter!(
            "keybox_cache_miss_total",
            "Total number of cache miss events, soft misses included."
        );
        "keybox_cache_miss_total"
    };
    /// Track cache writes.
    pub static ref CACHE_WRITES: &'static str = {
        metrics::describe_counter!(
            "keybox_cache_writes_total",
            "Total number of cache entries written."
        );
        "keybox_cache_writes_total"
    };
    /// Track bytes written to the store.
    pub static ref CACHE_BYTES_WRITTEN: &'static str = {
        metrics::describe_counter!(
            "keybox_cache_bytes_written_total",
            "Total payload bytes written to the store."
        );
        "keybox_cache_bytes_written_total"
    };
    /// Track cache failures per operation.
    pub static ref CACHE_ERRORS: &'static str = {
        metrics::describe_counter!(
            "keybox_cache_errors_total",
            "Total number of failed cache operations."
        );
        "keybox_cache_errors_total"
    };
    /// Track callers that waited on another caller's factory.
    pub static ref CACHE_SINGLE_FLIGHT_WAITS: &'static str = {
        metrics::describe_counter!(
            "keybox_cache_single_flight_waits_total",
            "Total number of get_or_set callers that waited for an in-flight factory."
        );
        "keybox_cache_single_flight_waits_total"
    };

    // Connection metrics

    /// Track retries of transient faults.
    pub static ref RETRY_COUNTER: &'static str = {
        metrics::describe_counter!(
            "keybox_retries_total",
            "Total number of retried store operations."
        );
        "keybox_retries_total"
    };

    // Rate limit metrics

    /// Track admission decisions.
    pub static ref RATE_LIMIT_DECISIONS: &'static str = {
        metrics::describe_counter!(
            "keybox_rate_limit_decisions_total",
            "Total number of rate limit decisions by outcome."
        );
        "keybox_rate_limit_decisions_total"
    };
    /// Track window entries removed by cleanup sweeps.
    pub static ref RATE_LIMIT_CLEANUP_REMOVED: &'static str = {
        metrics::describe_counter!(
            "keybox_rate_limit_cleanup_removed_total",
            "Total number of window entries removed by cleanup sweeps."
        );
        "keybox_rate_limit_cleanup_removed_total"
    };
}

/// Record a cache lookup outcome.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_lookup(hit: bool) {
    let counter = if hit {
        *CACHE_HIT_COUNTER
    } else {
        *CACHE_MISS_COUNTER
    };
    metrics::counter!(counter).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_lookup(_hit: bool) {}

/// Record a cache write.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_write(bytes: usize, compressed: bool) {
    let compressed = if compressed { "true" } else { "false" };
    metrics::counter!(*CACHE_WRITES, "compressed" => compressed).increment(1);
    metrics::counter!(*CACHE_BYTES_WRITTEN).increment(bytes as u64);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_write(_bytes: usize, _compressed: bool) {}

/// Record a failed cache operation.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_cache_error(operation: &'static str) {
    metrics::counter!(*CACHE_ERRORS, "operation" => operation).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_cache_error(_operation: &'static str) {}

/// Record a caller that waited for an in-flight factory.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_single_flight_wait() {
    metrics::counter!(*CACHE_SINGLE_FLIGHT_WAITS).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_single_flight_wait() {}

/// Record a retry of a transient fault.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_retry(store: &str) {
    metrics::counter!(*RETRY_COUNTER, "store" => store.to_string()).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_retry(_store: &str) {}

/// Record an admission decision.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_decision(allowed: bool, fail_closed: bool) {
    let outcome = match (allowed, fail_closed) {
        (true, _) => "allowed",
        (false, false) => "denied",
        (false, true) => "fail_closed",
    };
    metrics::counter!(*RATE_LIMIT_DECISIONS, "outcome" => outcome).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_decision(_allowed: bool, _fail_closed: bool) {}

/// Record window entries removed by a cleanup sweep.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_cleanup(removed: u64) {
    metrics::counter!(*RATE_LIMIT_CLEANUP_REMOVED).increment(removed);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_cleanup(_removed: u64) {}
