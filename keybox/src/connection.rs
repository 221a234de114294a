//! Connection lifecycle and retried execution.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use keybox_backend::{
    Connector, FaultKind, Store, StoreError, StoreResult, metrics as store_metrics,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::retry::RetryPolicy;
use crate::stats::{ConnectionCounters, ConnectionStatistics};

/// Default cap on cached database handles.
pub const DEFAULT_MAX_POOL_SIZE: usize = 16;

/// Options of a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Database used when a caller does not name one.
    pub database: i64,
    /// Retry policy of [`execute_with_retry`](ConnectionManager::execute_with_retry).
    pub retry: RetryPolicy,
    /// Maximum number of cached database handles.
    pub max_pool_size: usize,
    /// Treat connection failures as fatal: no retry, no lazy re-establishment
    /// from [`connect`](ConnectionManager::connect).
    pub abort_on_connect_fail: bool,
    /// Allow administrative handles.
    pub allow_admin: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            database: 0,
            retry: RetryPolicy::default(),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            abort_on_connect_fail: false,
            allow_admin: false,
        }
    }
}

struct Inner<C: Connector> {
    connector: C,
    options: ConnectionOptions,
    handles: DashMap<i64, C::Database>,
    // Serializes establishment so concurrent first use connects once.
    connect_lock: Mutex<()>,
    server: Mutex<Option<C::Server>>,
    disposed: AtomicBool,
    counters: ConnectionCounters,
}

/// Owns the handles to a store and runs operations against them with retries.
///
/// Cloning is cheap; clones share handles and statistics. Construct one per
/// store at the composition root and hand clones to the services.
///
/// ```
/// # async fn run() -> Result<(), keybox_backend::StoreError> {
/// use keybox::{ConnectionManager, ConnectionOptions};
/// use keybox_backend::Store;
/// use keybox_memory::MemoryConnector;
/// use tokio_util::sync::CancellationToken;
///
/// let manager = ConnectionManager::new(MemoryConnector::default(), ConnectionOptions::default());
/// let exists = manager
///     .execute_with_retry(None, &CancellationToken::new(), |db| async move {
///         db.exists("app:user:1").await
///     })
///     .await?;
/// assert!(!exists);
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("store", &self.inner.connector.name())
            .field("options", &self.inner.options)
            .field("handles", &self.inner.handles.len())
            .field("disposed", &self.inner.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates a manager. Nothing is connected until first use or
    /// [`connect`](Self::connect).
    pub fn new(connector: C, options: ConnectionOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                options,
                handles: DashMap::new(),
                connect_lock: Mutex::new(()),
                server: Mutex::new(None),
                disposed: AtomicBool::new(false),
                counters: ConnectionCounters::default(),
            }),
        }
    }

    /// Options the manager was built with.
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// The underlying connector.
    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Eagerly establishes the default database.
    ///
    /// With `abort_on_connect_fail` unset a failure is logged and the handle
    /// is established lazily on next use instead.
    pub async fn connect(&self) -> StoreResult<()> {
        match self.database(None).await {
            Ok(_) => Ok(()),
            Err(error)
                if !self.inner.options.abort_on_connect_fail
                    && error.kind() == FaultKind::Transient =>
            {
                warn!(
                    store = %self.inner.connector.name(),
                    %error,
                    "Initial connection failed, will retry on first use"
                );
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Handle for database `db`, or the default database.
    ///
    /// Handles are cached. When absent, exactly one caller establishes it
    /// while concurrent callers wait for the result.
    pub async fn database(&self, db: Option<i64>) -> StoreResult<C::Database> {
        self.ensure_live()?;
        let db = db.unwrap_or(self.inner.options.database);
        if let Some(handle) = self.cached(db) {
            return Ok(handle);
        }

        let _guard = self.inner.connect_lock.lock().await;
        self.ensure_live()?;
        if let Some(handle) = self.cached(db) {
            return Ok(handle);
        }
        if self.inner.handles.len() >= self.inner.options.max_pool_size {
            return Err(StoreError::fatal(format!(
                "connection pool exhausted: {} database handles in use",
                self.inner.handles.len()
            )));
        }

        let handle = self.establish(db).await?;
        self.inner.handles.insert(db, handle.clone());
        Ok(handle)
    }

    /// Administrative handle. Requires `allow_admin`.
    pub async fn server(&self) -> StoreResult<C::Server> {
        self.ensure_live()?;
        if !self.inner.options.allow_admin {
            return Err(StoreError::validation(
                "administrative commands are disabled, enable allow_admin",
            ));
        }
        let mut server = self.inner.server.lock().await;
        if let Some(handle) = server.as_ref() {
            return Ok(handle.clone());
        }
        self.inner.counters.connection_attempts.incr();
        match self.inner.connector.server().await {
            Ok(handle) => {
                *server = Some(handle.clone());
                Ok(handle)
            }
            Err(error) => {
                self.inner.counters.failed_connections.incr();
                Err(self.connect_fault(error))
            }
        }
    }

    /// Dedicated publish/subscribe connection, never cached.
    pub async fn subscriber(&self) -> StoreResult<C::Subscriber> {
        self.ensure_live()?;
        self.inner.connector.subscriber().await
    }

    /// Runs `operation` against database `db`, retrying transient faults.
    ///
    /// The operation runs at most `max_retry_attempts + 1` times. Non
    /// transient faults are returned at once. A transient fault drops the
    /// cached handle so the next attempt reconnects. Both the operation and
    /// the backoff sleep race `cancel`.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        db: Option<i64>,
        cancel: &CancellationToken,
        operation: F,
    ) -> StoreResult<T>
    where
        F: Fn(C::Database) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let policy = &self.inner.options.retry;
        let store = self.inner.connector.name();
        let mut retry = 0u32;
        loop {
            let attempt = async {
                let handle = self.database(db).await?;
                self.inner.counters.total_commands.incr();
                operation(handle).await
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StoreError::cancelled()),
                result = attempt => result,
            };

            let error = match result {
                Ok(value) => {
                    if retry > 0 {
                        self.inner.counters.successful_retries.incr();
                        debug!(store, retry, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };
            if !error.is_transient() {
                return Err(error);
            }
            if retry >= policy.max_retry_attempts {
                error!(
                    store,
                    attempts = retry + 1,
                    %error,
                    "Retries exhausted"
                );
                return Err(error);
            }

            retry += 1;
            self.invalidate(db);
            let delay = policy.delay_for(retry);
            warn!(
                store,
                retry,
                max_retries = policy.max_retry_attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "Retrying after transient fault"
            );
            metrics::record_retry(store);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StoreError::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Liveness probe against the default database. Never fails.
    pub async fn test_connection(&self) -> bool {
        let handle = match self.database(None).await {
            Ok(handle) => handle,
            Err(error) => {
                debug!(%error, "Connection test could not get a handle");
                return false;
            }
        };
        match handle.ping().await {
            Ok(latency) => {
                debug!(latency_us = latency.as_micros() as u64, "Connection test passed");
                true
            }
            Err(error) => {
                debug!(%error, "Connection test failed");
                false
            }
        }
    }

    /// Snapshot of connection health counters.
    pub fn statistics(&self) -> ConnectionStatistics {
        let active = self.inner.handles.len() as u64;
        let capacity = self.inner.options.max_pool_size as u64;
        let counters = &self.inner.counters;
        ConnectionStatistics {
            is_connected: !self.is_disposed() && active > 0,
            active_connections: active,
            idle_connections: capacity.saturating_sub(active),
            failed_connections: counters.failed_connections.get(),
            successful_retries: counters.successful_retries.get(),
            total_commands: counters.total_commands.get(),
            connection_attempts: counters.connection_attempts.get(),
        }
    }

    /// Zeroes the cumulative counters.
    pub fn reset_statistics(&self) {
        self.inner.counters.reset();
    }

    /// `true` once [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Releases every handle. Idempotent; later calls fail with a fatal fault.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.inner.connect_lock.lock().await;
        self.inner.handles.clear();
        self.inner.server.lock().await.take();
        info!(store = %self.inner.connector.name(), "Connection manager disposed");
    }

    fn cached(&self, db: i64) -> Option<C::Database> {
        self.inner.handles.get(&db).map(|entry| entry.value().clone())
    }

    fn invalidate(&self, db: Option<i64>) {
        let db = db.unwrap_or(self.inner.options.database);
        if self.inner.handles.remove(&db).is_some() {
            debug!(store = %self.inner.connector.name(), db, "Dropped database handle");
        }
    }

    fn ensure_live(&self) -> StoreResult<()> {
        if self.is_disposed() {
            Err(StoreError::fatal("connection manager is disposed"))
        } else {
            Ok(())
        }
    }

    async fn establish(&self, db: i64) -> StoreResult<C::Database> {
        let store = self.inner.connector.name();
        self.inner.counters.connection_attempts.incr();
        match self.inner.connector.connect(db).await {
            Ok(handle) => {
                store_metrics::record_connection_attempt(store, true);
                info!(store, db, "Database connection established");
                Ok(handle)
            }
            Err(error) => {
                store_metrics::record_connection_attempt(store, false);
                self.inner.counters.failed_connections.incr();
                error!(store, db, %error, "Database connection failed");
                Err(self.connect_fault(error))
            }
        }
    }

    fn connect_fault(&self, error: StoreError) -> StoreError {
        if self.inner.options.abort_on_connect_fail && error.kind() == FaultKind::Transient {
            error.with_kind(FaultKind::Fatal)
        } else {
            error
        }
    }
}
