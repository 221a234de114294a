//! In-memory store capacity metrics.
//!
//! Enable the `metrics` feature to use these metrics.
//!
//! ## Metrics
//!
//! - `keybox_memory_entries` - Current number of keys per logical database (gauge)
//!
//! The gauge carries `store` and `db` labels to tell instances apart.

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
lazy_static! {
    /// Metric name for key count gauge.
    pub static ref MEMORY_ENTRIES: &'static str = {
        metrics::describe_gauge!(
            "keybox_memory_entries",
            "Current number of keys in an in-memory database."
        );
        "keybox_memory_entries"
    };
}

/// Record current key count of a database.
///
/// The count comes from Moka and may lag behind recent writes.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_capacity(store: &str, db: i64, entries: u64) {
    metrics::gauge!(*MEMORY_ENTRIES, "store" => store.to_string(), "db" => db.to_string())
        .set(entries as f64);
}

/// Record current key count (no-op when `metrics` feature disabled).
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_capacity(_store: &str, _db: i64, _entries: u64) {}
