use serde::{Serialize, de::DeserializeOwned};

use super::{Format, FormatError, FormatTypeId};

/// Compact binary format backed by bincode's serde bridge.
///
/// Field names are not stored, so a struct layout change makes previously
/// cached entries unreadable. Readers treat that as a soft miss.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeFormat;

impl Format for BincodeFormat {
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, FormatError>
    where
        T: Serialize + ?Sized,
    {
        ::bincode::serde::encode_to_vec(value, ::bincode::config::standard())
            .map_err(|err| FormatError::Serialize(Box::new(err)))
    }

    fn deserialize<T>(&self, data: &[u8]) -> Result<T, FormatError>
    where
        T: DeserializeOwned,
    {
        let (value, _read) =
            ::bincode::serde::decode_from_slice(data, ::bincode::config::standard())
                .map_err(|err| FormatError::Deserialize(Box::new(err)))?;
        Ok(value)
    }

    fn format_type_id(&self) -> FormatTypeId {
        FormatTypeId::Bincode
    }
}
