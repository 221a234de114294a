use keybox_backend::{BoxError, CompressionError, FaultKind, FormatError, StoreError};
use thiserror::Error;

/// Errors returned by [`CacheService`](crate::CacheService).
///
/// Read paths never surface store or decoding failures, they turn into
/// misses. Write paths do, so callers know when a write did not happen.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Store fault, including argument validation performed before dispatch.
    #[error(transparent)]
    Store(StoreError),

    /// Value could not be serialized.
    #[error("Cache value serialization failed: {0}")]
    Format(#[from] FormatError),

    /// Value could not be compressed.
    #[error("Cache value compression failed: {0}")]
    Compression(#[from] CompressionError),

    /// The `get_or_set` factory failed.
    #[error("Cache value factory failed: {0}")]
    Factory(BoxError),

    /// The operation was cancelled by its cancellation token.
    #[error("Cache operation cancelled")]
    Cancelled,
}

impl CacheError {
    /// `true` when the call was rejected before reaching the store.
    pub fn is_validation(&self) -> bool {
        matches!(self, CacheError::Store(error) if error.kind() == FaultKind::Validation)
    }

    /// `true` when the call was aborted by its cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled)
    }
}

impl From<StoreError> for CacheError {
    fn from(error: StoreError) -> Self {
        if error.is_cancelled() {
            CacheError::Cancelled
        } else {
            CacheError::Store(error)
        }
    }
}

/// Errors returned by [`RateLimiter`](crate::RateLimiter).
///
/// Admission checks never return store faults, a failing store means the
/// request is denied.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Client id, resource or window rejected before dispatch.
    #[error(transparent)]
    Validation(StoreError),

    /// Store fault on an inspection or maintenance call.
    #[error(transparent)]
    Store(StoreError),

    /// The operation was cancelled by its cancellation token.
    #[error("Rate limit operation cancelled")]
    Cancelled,
}

impl RateLimitError {
    /// `true` when the call was aborted by its cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RateLimitError::Cancelled)
    }
}

impl From<StoreError> for RateLimitError {
    fn from(error: StoreError) -> Self {
        match error.kind() {
            FaultKind::Cancelled => RateLimitError::Cancelled,
            FaultKind::Validation => RateLimitError::Validation(error),
            FaultKind::Transient | FaultKind::Fatal => RateLimitError::Store(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_store_faults_become_cancelled_errors() {
        assert!(CacheError::from(StoreError::cancelled()).is_cancelled());
        assert!(RateLimitError::from(StoreError::cancelled()).is_cancelled());
    }

    #[test]
    fn validation_is_preserved() {
        let error = CacheError::from(StoreError::validation("key must not be empty"));
        assert!(error.is_validation());
        assert!(matches!(
            RateLimitError::from(StoreError::validation("empty client id")),
            RateLimitError::Validation(_)
        ));
    }
}
