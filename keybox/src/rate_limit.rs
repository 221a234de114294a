//! Sliding-window rate limiting over a [`ConnectionManager`].
//!
//! Each (client, resource) pair owns a sorted set in the store. Members are
//! `{timestamp_ms}:{cost}:{sequence}` scored by their timestamp, so the
//! current count is the summed cost of members whose score lies inside the
//! window ending now.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keybox_backend::{Connector, Namespace, ScoredMember, Store, StoreError};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::error::RateLimitError;
use crate::metrics;
use crate::stats::{RateLimitCounters, RateLimitingStatistics};

/// Extra lifetime of a window set past its window, leaving room for cleanup.
pub const WINDOW_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// Placeholder substituted by [`RateLimitPolicy::resolve`].
pub const CLIENT_ID_PLACEHOLDER: &str = "{client_id}";

/// Settings of a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterSettings {
    /// Key prefix and maximum key length.
    pub namespace: Namespace,
    /// Database holding window sets; the manager's default when `None`.
    pub database: Option<i64>,
    /// Window of status snapshots and record-only requests. Cleanup drops
    /// entries older than twice this window.
    pub default_window: Duration,
    /// Capacity of the distinct-client tracker.
    pub max_tracked_clients: u64,
    /// Period suggested for [`RateLimiter::spawn_cleanup`].
    pub cleanup_interval: Duration,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            namespace: Namespace::new("keybox"),
            database: Some(1),
            default_window: Duration::from_secs(60),
            max_tracked_clients: 100_000,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Named limit over a resource pattern.
///
/// ```
/// use std::time::Duration;
/// use keybox::RateLimitPolicy;
///
/// let policy = RateLimitPolicy::new("per-user-api", "api:{client_id}", 100, Duration::from_secs(60));
/// assert_eq!(policy.resolve("alice"), "api:alice");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitPolicy {
    /// Reported back in [`RateLimitResult::policy`].
    pub name: String,
    /// Resource, optionally containing `{client_id}`.
    pub resource_pattern: String,
    /// Admitted cost per window.
    pub limit: u64,
    /// Window length.
    pub window: Duration,
}

impl RateLimitPolicy {
    /// Creates a policy.
    pub fn new(
        name: impl Into<String>,
        resource_pattern: impl Into<String>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            resource_pattern: resource_pattern.into(),
            limit,
            window,
        }
    }

    /// Resource for `client_id`.
    pub fn resolve(&self, client_id: &str) -> String {
        self.resource_pattern.replace(CLIENT_ID_PLACEHOLDER, client_id)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Cost inside the window, this request included when admitted.
    pub current_count: u64,
    /// Limit the request was checked against.
    pub limit: u64,
    /// Cost still admissible inside the window.
    pub remaining: u64,
    /// When a denied request may succeed, measured from the decision.
    pub retry_after: Option<Duration>,
    /// When the oldest counted entry leaves the window.
    pub reset_at: DateTime<Utc>,
    /// Name of the policy that produced the decision, if any.
    pub policy: Option<String>,
}

impl RateLimitResult {
    fn fail_closed(limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            current_count: 0,
            limit,
            remaining: 0,
            retry_after: None,
            reset_at: now,
            policy: None,
        }
    }
}

/// Read-only view of a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    /// Cost inside the window.
    pub current_count: u64,
    /// Window the snapshot was taken over.
    pub window: Duration,
    /// Oldest entry inside the window.
    pub first_request: Option<DateTime<Utc>>,
    /// Newest entry inside the window.
    pub last_request: Option<DateTime<Utc>>,
}

struct Inner<C: Connector> {
    connection: ConnectionManager<C>,
    settings: RateLimiterSettings,
    counters: RateLimitCounters,
    clients: moka::sync::Cache<String, ()>,
    sequence: AtomicU64,
}

/// Sliding-window admission control.
///
/// The purge, count and append steps of a check are separate store calls,
/// so concurrent checks of the same pair may over-admit by up to the number
/// of concurrent callers minus one. Store failures during a check deny the
/// request.
pub struct RateLimiter<C: Connector> {
    inner: Arc<Inner<C>>,
    cancel: CancellationToken,
}

impl<C: Connector> Clone for RateLimiter<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            cancel: self.cancel.clone(),
        }
    }
}

impl<C: Connector> std::fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> RateLimiter<C> {
    /// Creates a limiter sharing `connection` with other services.
    pub fn new(connection: ConnectionManager<C>, settings: RateLimiterSettings) -> Self {
        let clients = moka::sync::Cache::new(settings.max_tracked_clients);
        Self {
            inner: Arc::new(Inner {
                connection,
                settings,
                counters: RateLimitCounters::default(),
                clients,
                sequence: AtomicU64::new(rand::random()),
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// View of this limiter whose store calls abort when `token` is cancelled.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            cancel: token,
        }
    }

    /// Settings the limiter was built with.
    pub fn settings(&self) -> &RateLimiterSettings {
        &self.inner.settings
    }

    /// Checks `client_id` against `limit` per `window` on `resource` and
    /// records the request when admitted.
    ///
    /// Only invalid arguments and cancellation are errors. Any other failure
    /// denies the request.
    pub async fn is_request_allowed(
        &self,
        client_id: &str,
        resource: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitResult, RateLimitError> {
        let key = self.window_key(client_id, resource)?;
        require_window(window)?;
        self.inner.counters.total.incr();
        self.track_client(client_id);

        let now = Utc::now();
        match self.decide(&key, limit, window, now).await {
            Ok(result) => {
                if result.allowed {
                    self.inner.counters.allowed.incr();
                    debug!(
                        client_id,
                        resource,
                        count = result.current_count,
                        limit,
                        "Request allowed"
                    );
                } else {
                    self.inner.counters.denied.incr();
                    debug!(
                        client_id,
                        resource,
                        count = result.current_count,
                        limit,
                        "Request denied"
                    );
                }
                metrics::record_decision(result.allowed, false);
                Ok(result)
            }
            Err(error) if error.is_cancelled() => Err(RateLimitError::Cancelled),
            Err(error) => {
                self.inner.counters.denied.incr();
                metrics::record_decision(false, true);
                error!(
                    client_id,
                    resource,
                    %error,
                    "Rate limit evaluation failed, denying request"
                );
                Ok(RateLimitResult::fail_closed(limit, now))
            }
        }
    }

    /// Checks `client_id` against `policy`.
    pub async fn check_rate_limit(
        &self,
        client_id: &str,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitResult, RateLimitError> {
        let resource = policy.resolve(client_id);
        let mut result = self
            .is_request_allowed(client_id, &resource, policy.limit, policy.window)
            .await?;
        result.policy = Some(policy.name.clone());
        Ok(result)
    }

    /// Appends a usage entry of `cost` without checking the limit.
    ///
    /// Returns `false` when the store could not be updated.
    pub async fn record_request(
        &self,
        client_id: &str,
        resource: &str,
        cost: u64,
    ) -> Result<bool, RateLimitError> {
        let key = self.window_key(client_id, resource)?;
        if cost == 0 {
            return Err(RateLimitError::Validation(StoreError::validation(
                "cost must be positive",
            )));
        }
        self.track_client(client_id);

        let window = self.inner.settings.default_window;
        let now_ms = Utc::now().timestamp_millis();
        let member = self.member(now_ms, cost);
        let (key_ref, member_ref) = (key.as_str(), member.as_str());
        let ttl = window_ttl(window);
        let result = self
            .execute(move |db| async move {
                db.sorted_add(key_ref, member_ref, now_ms as f64, ttl).await
            })
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(error) if error.is_cancelled() => Err(RateLimitError::Cancelled),
            Err(error) => {
                warn!(client_id, resource, cost, %error, "Failed to record request");
                Ok(false)
            }
        }
    }

    /// Snapshot of the default window. Does not purge or append.
    pub async fn get_rate_limit_status(
        &self,
        client_id: &str,
        resource: &str,
    ) -> Result<RateLimitStatus, RateLimitError> {
        let key = self.window_key(client_id, resource)?;
        let window = self.inner.settings.default_window;
        let key_ref = key.as_str();
        let members = self
            .execute(move |db| async move { db.sorted_range(key_ref).await })
            .await?;

        let cutoff = window_start(Utc::now().timestamp_millis(), window);
        let live: Vec<&ScoredMember> = members.iter().filter(|m| m.score >= cutoff).collect();
        Ok(RateLimitStatus {
            current_count: live.iter().map(|m| member_cost(&m.member)).sum(),
            window,
            first_request: live.first().and_then(|m| timestamp(m.score)),
            last_request: live.last().and_then(|m| timestamp(m.score)),
        })
    }

    /// Deletes the window of a (client, resource) pair.
    ///
    /// Returns `false` when there was nothing to delete or the store failed.
    pub async fn reset_rate_limit(
        &self,
        client_id: &str,
        resource: &str,
    ) -> Result<bool, RateLimitError> {
        let key = self.window_key(client_id, resource)?;
        let key_ref = key.as_str();
        match self
            .execute(move |db| async move { db.remove(key_ref).await })
            .await
        {
            Ok(status) => {
                info!(client_id, resource, "Rate limit reset");
                Ok(status.is_deleted())
            }
            Err(error) if error.is_cancelled() => Err(RateLimitError::Cancelled),
            Err(error) => {
                warn!(client_id, resource, %error, "Failed to reset rate limit");
                Ok(false)
            }
        }
    }

    /// Removes entries older than twice the default window from every
    /// window set and deletes sets left empty. Returns the entries removed.
    ///
    /// A failure on one key is logged and the sweep moves on.
    pub async fn cleanup_expired_entries(&self) -> Result<u64, RateLimitError> {
        let pattern = self.inner.settings.namespace.rate_limit_pattern();
        let pattern_ref = pattern.as_str();
        let keys = self
            .execute(move |db| async move { db.scan(pattern_ref).await })
            .await?;

        let horizon = self.inner.settings.default_window.saturating_mul(2);
        let cutoff = window_start(Utc::now().timestamp_millis(), horizon);
        let mut removed = 0u64;
        for key in &keys {
            match self.sweep(key, cutoff).await {
                Ok(count) => removed += count,
                Err(error) if error.is_cancelled() => return Err(RateLimitError::Cancelled),
                Err(error) => warn!(key, %error, "Rate limit cleanup failed for key"),
            }
        }

        self.inner.counters.cleanup_operations.incr();
        self.inner.counters.entries_removed.add(removed);
        metrics::record_cleanup(removed);
        info!(keys = keys.len(), removed, "Rate limit cleanup finished");
        Ok(removed)
    }

    /// Runs [`cleanup_expired_entries`](Self::cleanup_expired_entries) every
    /// `interval` on the current tokio runtime.
    ///
    /// The first sweep happens one interval after the call. Dropping the
    /// handle stops the task.
    pub fn spawn_cleanup(&self, interval: Duration) -> CleanupHandle {
        let shutdown = CancellationToken::new();
        let limiter = self.with_cancellation(shutdown.child_token());
        let stop = shutdown.clone();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match limiter.cleanup_expired_entries().await {
                    Ok(_) => {}
                    Err(RateLimitError::Cancelled) => break,
                    Err(error) => warn!(%error, "Scheduled rate limit cleanup failed"),
                }
            }
            debug!("Rate limit cleanup task stopped");
        });

        CleanupHandle {
            handle: Some(handle),
            shutdown,
        }
    }

    /// Snapshot of decision counters.
    pub fn statistics(&self) -> RateLimitingStatistics {
        self.inner.clients.run_pending_tasks();
        self.inner
            .counters
            .snapshot(self.inner.clients.entry_count())
    }

    /// Zeroes the counters and forgets tracked clients.
    pub fn reset_statistics(&self) {
        self.inner.counters.reset();
        self.inner.clients.invalidate_all();
    }

    async fn decide(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult, StoreError> {
        let now_ms = now.timestamp_millis();
        let cutoff = window_start(now_ms, window);

        let members = self
            .execute(move |db| async move {
                db.sorted_remove_range_by_score(key, f64::NEG_INFINITY, cutoff - 1.0)
                    .await?;
                db.sorted_range(key).await
            })
            .await?;
        let live: Vec<&ScoredMember> = members.iter().filter(|m| m.score >= cutoff).collect();
        let count: u64 = live.iter().map(|m| member_cost(&m.member)).sum();
        let oldest = live.first().map(|m| m.score as i64).unwrap_or(now_ms);
        let window_end = oldest.saturating_add(millis(window));
        let reset_at = timestamp(window_end as f64).unwrap_or(now);

        if count >= limit {
            let retry_after = if live.is_empty() {
                window
            } else {
                Duration::from_millis(window_end.saturating_sub(now_ms).max(1) as u64)
            };
            return Ok(RateLimitResult {
                allowed: false,
                current_count: count,
                limit,
                remaining: 0,
                retry_after: Some(retry_after),
                reset_at,
                policy: None,
            });
        }

        let member = self.member(now_ms, 1);
        let member_ref = member.as_str();
        let ttl = window_ttl(window);
        self.execute(move |db| async move {
            db.sorted_add(key, member_ref, now_ms as f64, ttl).await
        })
        .await?;

        let current_count = count + 1;
        Ok(RateLimitResult {
            allowed: true,
            current_count,
            limit,
            remaining: limit.saturating_sub(current_count),
            retry_after: None,
            reset_at,
            policy: None,
        })
    }

    async fn sweep(&self, key: &str, cutoff: f64) -> Result<u64, StoreError> {
        let removed = self
            .execute(move |db| async move {
                db.sorted_remove_range_by_score(key, f64::NEG_INFINITY, cutoff - 1.0)
                    .await
            })
            .await?;
        let remaining = self
            .execute(move |db| async move { db.sorted_range(key).await })
            .await?;
        // An append between the two calls keeps the key alive until the next sweep.
        if remaining.is_empty() {
            self.execute(move |db| async move { db.remove(key).await })
                .await?;
        }
        Ok(removed)
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

    fn window_key(&self, client_id: &str, resource: &str) -> Result<String, RateLimitError> {
        Ok(self
            .inner
            .settings
            .namespace
            .rate_limit_key(client_id, resource)?)
    }

    fn track_client(&self, client_id: &str) {
        if !self.inner.clients.contains_key(client_id) {
            self.inner.clients.insert(client_id.to_owned(), ());
        }
    }

    fn member(&self, now_ms: i64, cost: u64) -> String {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{now_ms}:{cost}:{sequence}")
    }
}

/// Handle of the task started by [`RateLimiter::spawn_cleanup`].
///
/// Dropping the handle stops the task after its current sweep.
#[derive(Debug)]
pub struct CleanupHandle {
    handle: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl CleanupHandle {
    /// Check if the task is finished.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stops the task and waits for it to exit.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            // A panicked or aborted task has already stopped.
            let _ = handle.await;
        }
    }

    /// Abort the task, interrupting a sweep in progress.
    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn require_window(window: Duration) -> Result<(), RateLimitError> {
    if window.is_zero() {
        return Err(RateLimitError::Validation(StoreError::validation(
            "window must be positive",
        )));
    }
    Ok(())
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Expiry of a window set, long enough for the sweeper to see it.
fn window_ttl(window: Duration) -> Duration {
    window.saturating_add(WINDOW_EXPIRY_BUFFER)
}

/// First score still inside a window ending at `now_ms`.
fn window_start(now_ms: i64, window: Duration) -> f64 {
    now_ms.saturating_sub(millis(window)) as f64
}

fn member_cost(member: &str) -> u64 {
    member
        .split(':')
        .nth(1)
        .and_then(|cost| cost.parse().ok())
        .unwrap_or(1)
}

fn timestamp(score: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(score as i64)
}
