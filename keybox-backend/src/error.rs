//! Error types for store operations.
//!
//! Every failure that crosses the store boundary is a [`StoreError`] tagged
//! with a [`FaultKind`]. The retry machinery only ever looks at the kind, never
//! at the concrete source type.

use std::fmt;

use thiserror::Error;

use crate::compressor::CompressionError;
use crate::format::FormatError;

/// Boxed source error carried by [`StoreError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of a store fault.
///
/// | Kind | Retried | Typical cause |
/// |------|---------|---------------|
/// | [`Transient`](FaultKind::Transient) | yes | connection drop, timeout, server loading |
/// | [`Fatal`](FaultKind::Fatal) | no | protocol or type error, disposed manager |
/// | [`Validation`](FaultKind::Validation) | no | key too long, empty argument |
/// | [`Cancelled`](FaultKind::Cancelled) | no | caller's cancellation token fired |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Connection-level fault or timeout. Safe to retry.
    Transient,
    /// Anything that will fail again if retried.
    Fatal,
    /// The request was rejected before reaching the store.
    Validation,
    /// The operation was aborted by its caller.
    Cancelled,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::Transient => "transient",
            FaultKind::Fatal => "fatal",
            FaultKind::Validation => "validation",
            FaultKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Error type for store operations.
#[derive(Debug, Error)]
#[error("{kind} store fault: {source}")]
pub struct StoreError {
    kind: FaultKind,
    #[source]
    source: BoxError,
}

impl StoreError {
    /// Creates an error of the given kind from any error source.
    pub fn new(kind: FaultKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    /// Connection-level fault that the retry wrapper may retry.
    pub fn transient(source: impl Into<BoxError>) -> Self {
        Self::new(FaultKind::Transient, source)
    }

    /// Fault that must not be retried.
    pub fn fatal(source: impl Into<BoxError>) -> Self {
        Self::new(FaultKind::Fatal, source)
    }

    /// Argument rejected before any store call.
    pub fn validation(source: impl Into<BoxError>) -> Self {
        Self::new(FaultKind::Validation, source)
    }

    /// Operation aborted by a cancellation signal.
    pub fn cancelled() -> Self {
        Self::new(FaultKind::Cancelled, "operation cancelled")
    }

    /// Classification of this fault.
    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    /// Whether the retry wrapper should try again.
    pub fn is_transient(&self) -> bool {
        self.kind == FaultKind::Transient
    }

    /// Whether the fault came from a cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        self.kind == FaultKind::Cancelled
    }

    /// Re-tags the fault, keeping its source.
    pub fn with_kind(self, kind: FaultKind) -> Self {
        Self { kind, ..self }
    }

    /// Consumes the error and returns the underlying source.
    pub fn into_source(self) -> BoxError {
        self.source
    }
}

impl From<FormatError> for StoreError {
    fn from(error: FormatError) -> Self {
        Self::fatal(error)
    }
}

impl From<CompressionError> for StoreError {
    fn from(error: CompressionError) -> Self {
        Self::fatal(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_retagging() {
        let error = StoreError::transient("socket closed");
        assert!(error.is_transient());

        let error = error.with_kind(FaultKind::Fatal);
        assert_eq!(error.kind(), FaultKind::Fatal);
        assert_eq!(error.to_string(), "fatal store fault: socket closed");
    }

    #[test]
    fn cancelled_is_not_transient() {
        let error = StoreError::cancelled();
        assert!(error.is_cancelled());
        assert!(!error.is_transient());
    }
}
