//! Redis connector.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use keybox_backend::{Connector, StoreResult};
use redis::Client;
use redis::aio::{MultiplexedConnection, PubSub};
use tracing::{debug, trace};

use crate::database::RedisDatabase;
use crate::error::Error;
use crate::server::RedisServer;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens Redis connections for the keybox connection manager.
///
/// The connector itself holds no connection; every call to
/// [`Connector::connect`] establishes a new multiplexed connection bound to the
/// requested logical database. Caching and reuse of those handles is the
/// connection manager's job.
#[derive(Clone)]
pub struct RedisConnector {
    client: Client,
    connect_timeout: Duration,
    command_timeout: Duration,
    name: String,
}

impl std::fmt::Debug for RedisConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnector")
            .field("name", &self.name)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisConnector {
    /// Creates new RedisConnector builder with default settings.
    #[must_use]
    pub fn builder() -> RedisConnectorBuilder {
        RedisConnectorBuilder::default()
    }

    /// Opens a multiplexed connection and selects `db` on it.
    ///
    /// The connection is never shared across databases, so the `SELECT`
    /// issued here stays valid for its whole lifetime.
    pub(crate) async fn open(&self, db: i64) -> Result<MultiplexedConnection, Error> {
        trace!(db, "Open multiplexed redis connection");
        let mut connection = with_timeout(
            "connect",
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await?;
        if db != 0 {
            with_timeout(
                "SELECT",
                self.command_timeout,
                redis::cmd("SELECT").arg(db).query_async::<()>(&mut connection),
            )
            .await?;
        }
        Ok(connection)
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Database = RedisDatabase;
    type Server = RedisServer;
    type Subscriber = PubSub;

    async fn connect(&self, db: i64) -> StoreResult<Self::Database> {
        let connection = self.open(db).await?;
        debug!(store = %self.name, db, "Redis database connected");
        Ok(RedisDatabase::new(
            connection,
            self.command_timeout,
            self.name.clone(),
        ))
    }

    async fn server(&self) -> StoreResult<Self::Server> {
        let connection = self.open(0).await?;
        Ok(RedisServer::new(self.clone(), connection))
    }

    async fn subscriber(&self) -> StoreResult<Self::Subscriber> {
        let pubsub = with_timeout(
            "connect",
            self.connect_timeout,
            self.client.get_async_pubsub(),
        )
        .await?;
        Ok(pubsub)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl RedisConnector {
    pub(crate) fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub(crate) fn label(&self) -> &str {
        &self.name
    }
}

/// Part of builder pattern implementation for RedisConnector.
pub struct RedisConnectorBuilder {
    connection_info: String,
    connect_timeout: Duration,
    command_timeout: Duration,
    name: String,
}

impl Default for RedisConnectorBuilder {
    fn default() -> Self {
        Self {
            connection_info: "redis://127.0.0.1/".to_owned(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            name: "redis".to_owned(),
        }
    }
}

impl RedisConnectorBuilder {
    /// Set connection info (host, port, credentials, etc.).
    ///
    /// A database number in the URL is ignored; the connection manager picks
    /// the database per handle.
    pub fn server(mut self, connection_info: impl Into<String>) -> Self {
        self.connection_info = connection_info.into();
        self
    }

    /// Upper bound for establishing a connection.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Upper bound for a single command or pipeline round trip.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set a custom name used in logs and metric labels.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Validates the connection info. No connection is opened here.
    pub fn build(self) -> Result<RedisConnector, Error> {
        Ok(RedisConnector {
            client: Client::open(self.connection_info)?,
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
            name: self.name,
        })
    }
}

pub(crate) async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    future: F,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, redis::RedisError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::Timeout { operation, timeout }),
    }
}
