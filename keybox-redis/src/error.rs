//! Error types for Redis store operations.
//!
//! All errors convert into [`StoreError`] with a [`FaultKind`] chosen from the
//! underlying [`RedisError`]: network level failures and timeouts are
//! transient, everything else is fatal.
//!
//! [`StoreError`]: keybox_backend::StoreError
//! [`FaultKind`]: keybox_backend::FaultKind

use std::time::Duration;

use keybox_backend::{FaultKind, StoreError};
use redis::RedisError;

/// Error type for Redis store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error from the underlying Redis client.
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// A command or connection attempt did not complete in time.
    #[error("Redis {operation} timed out after {timeout:?}")]
    Timeout {
        /// Command name, or `connect`.
        operation: &'static str,
        /// The limit that was exceeded.
        timeout: Duration,
    },

    /// The store returned a value keybox cannot interpret.
    #[error("unexpected Redis reply for {0}")]
    UnexpectedReply(&'static str),
}

impl Error {
    /// Fault classification used by the retry wrapper.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Error::Redis(err)
                if err.is_io_error()
                    || err.is_timeout()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal() =>
            {
                FaultKind::Transient
            }
            Error::Redis(_) => FaultKind::Fatal,
            Error::Timeout { .. } => FaultKind::Transient,
            Error::UnexpectedReply(_) => FaultKind::Fatal,
        }
    }
}

impl From<Error> for StoreError {
    fn from(error: Error) -> Self {
        StoreError::new(error.fault_kind(), error)
    }
}
