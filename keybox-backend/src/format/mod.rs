//! Value serialization formats.
//!
//! A [`Format`] turns a typed value into the bytes that are later wrapped in
//! an [envelope](crate::envelope) and written to the store.
//!
//! | Format | Size | Human readable |
//! |--------|------|----------------|
//! | [`JsonFormat`] | Larger | Yes |
//! | [`BincodeFormat`] | Compact | No |

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

mod bincode;
mod json;

pub use bincode::BincodeFormat;
pub use json::JsonFormat;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("serialization failed: {0}")]
    Serialize(Box<dyn std::error::Error + Send + Sync>),

    #[error("deserialization failed: {0}")]
    Deserialize(Box<dyn std::error::Error + Send + Sync>),
}

/// Unique identifier for format types, used in logs and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTypeId {
    Json,
    Bincode,
    /// For user-defined custom formats. The string should be a unique identifier.
    Custom(&'static str),
}

/// Serialization strategy for cached values.
pub trait Format: std::fmt::Debug + Clone + Send + Sync + 'static {
    /// Serializes a value to bytes.
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, FormatError>
    where
        T: Serialize + ?Sized;

    /// Deserializes bytes produced by [`Format::serialize`].
    fn deserialize<T>(&self, data: &[u8]) -> Result<T, FormatError>
    where
        T: DeserializeOwned;

    /// Returns a unique identifier for this format type.
    fn format_type_id(&self) -> FormatTypeId;
}
