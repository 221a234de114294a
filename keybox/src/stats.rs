//! Statistics snapshots.
//!
//! Counters are plain atomics updated with relaxed ordering; a snapshot is
//! computed on demand and is not a consistent cut across counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Connection health as seen by a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatistics {
    /// At least one database handle is established and the manager is live.
    pub is_connected: bool,
    /// Cached database handles.
    pub active_connections: u64,
    /// Remaining pool capacity.
    pub idle_connections: u64,
    /// Failed connection establishments.
    pub failed_connections: u64,
    /// Operations that succeeded after at least one retry.
    pub successful_retries: u64,
    /// Operation invocations, retries included.
    pub total_commands: u64,
    /// Connection establishments attempted.
    pub connection_attempts: u64,
}

/// Cache usage of a [`CacheService`](crate::CacheService).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    /// Lookups, including those made by `get_or_set`.
    pub gets: u64,
    /// Lookups that returned a value.
    pub hits: u64,
    /// Lookups that returned nothing, soft misses included.
    pub misses: u64,
    /// Entries written.
    pub sets: u64,
    /// Entries actually deleted.
    pub removes: u64,
    /// Store, encoding and decoding failures, whether surfaced or not.
    pub errors: u64,
    /// Payload bytes written, envelope included.
    pub bytes_written: u64,
    /// Writes whose payload was compressed.
    pub compressed_writes: u64,
    /// `hits / gets`, `0.0` before the first get.
    pub hit_ratio: f64,
}

/// Admission decisions of a [`RateLimiter`](crate::RateLimiter).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateLimitingStatistics {
    /// Admission checks.
    pub total_requests: u64,
    /// Checks that admitted the request.
    pub allowed_requests: u64,
    /// Checks that denied the request, fail-closed denials included.
    pub denied_requests: u64,
    /// `allowed / total`, `0.0` before the first request.
    pub allow_ratio: f64,
    /// Distinct clients seen, saturating at the tracking capacity.
    pub unique_clients: u64,
    /// Completed cleanup sweeps.
    pub cleanup_operations: u64,
    /// Window entries removed by cleanup sweeps.
    pub entries_removed: u64,
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub(crate) fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub(crate) struct ConnectionCounters {
    pub(crate) failed_connections: Counter,
    pub(crate) successful_retries: Counter,
    pub(crate) total_commands: Counter,
    pub(crate) connection_attempts: Counter,
}

impl ConnectionCounters {
    pub(crate) fn reset(&self) {
        self.failed_connections.reset();
        self.successful_retries.reset();
        self.total_commands.reset();
        self.connection_attempts.reset();
    }
}

#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub(crate) gets: Counter,
    pub(crate) hits: Counter,
    pub(crate) misses: Counter,
    pub(crate) sets: Counter,
    pub(crate) removes: Counter,
    pub(crate) errors: Counter,
    pub(crate) bytes_written: Counter,
    pub(crate) compressed_writes: Counter,
}

impl CacheCounters {
    pub(crate) fn snapshot(&self) -> CacheStatistics {
        let gets = self.gets.get();
        let hits = self.hits.get();
        CacheStatistics {
            gets,
            hits,
            misses: self.misses.get(),
            sets: self.sets.get(),
            removes: self.removes.get(),
            errors: self.errors.get(),
            bytes_written: self.bytes_written.get(),
            compressed_writes: self.compressed_writes.get(),
            hit_ratio: ratio(hits, gets),
        }
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.gets,
            &self.hits,
            &self.misses,
            &self.sets,
            &self.removes,
            &self.errors,
            &self.bytes_written,
            &self.compressed_writes,
        ] {
            counter.reset();
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct RateLimitCounters {
    pub(crate) total: Counter,
    pub(crate) allowed: Counter,
    pub(crate) denied: Counter,
    pub(crate) cleanup_operations: Counter,
    pub(crate) entries_removed: Counter,
}

impl RateLimitCounters {
    pub(crate) fn snapshot(&self, unique_clients: u64) -> RateLimitingStatistics {
        let total = self.total.get();
        let allowed = self.allowed.get();
        RateLimitingStatistics {
            total_requests: total,
            allowed_requests: allowed,
            denied_requests: self.denied.get(),
            allow_ratio: ratio(allowed, total),
            unique_clients,
            cleanup_operations: self.cleanup_operations.get(),
            entries_removed: self.entries_removed.get(),
        }
    }

    pub(crate) fn reset(&self) {
        self.total.reset();
        self.allowed.reset();
        self.denied.reset();
        self.cleanup_operations.reset();
        self.entries_removed.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_is_zero_without_gets() {
        let counters = CacheCounters::default();
        assert_eq!(counters.snapshot().hit_ratio, 0.0);

        counters.gets.add(4);
        counters.hits.add(3);
        assert_eq!(counters.snapshot().hit_ratio, 0.75);

        counters.reset();
        assert_eq!(counters.snapshot(), CacheStatistics::default());
    }

    #[test]
    fn allow_ratio_tracks_decisions() {
        let counters = RateLimitCounters::default();
        counters.total.add(5);
        counters.allowed.add(4);
        counters.denied.incr();
        let stats = counters.snapshot(2);
        assert_eq!(stats.allow_ratio, 0.8);
        assert_eq!(stats.unique_clients, 2);
    }
}
