//! Store traits and payload codecs for keybox.
//!
//! If you want to plug keybox into another key-value store, implement
//! [`Connector`], [`Store`] and [`Server`] from this crate.
pub mod compressor;
pub mod envelope;
mod error;
pub mod format;
mod key;
pub mod metrics;
mod store;

#[cfg(feature = "zstd")]
pub use compressor::ZstdCompressor;
pub use compressor::{
    CompressionError, CompressionMarker, Compressor, GzipCompressor, PassthroughCompressor,
};
pub use error::{BoxError, FaultKind, StoreError};
pub use format::{BincodeFormat, Format, FormatError, JsonFormat};
pub use key::{DEFAULT_MAX_KEY_LENGTH, Namespace};
pub use store::{
    BatchWrite, Connector, DeleteStatus, ScoredMember, Server, Store, StoreResult, StoredEntry,
};
