use serde::{Serialize, de::DeserializeOwned};

use super::{Format, FormatError, FormatTypeId};

/// JSON format (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl Format for JsonFormat {
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, FormatError>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_vec(value).map_err(|err| FormatError::Serialize(Box::new(err)))
    }

    fn deserialize<T>(&self, data: &[u8]) -> Result<T, FormatError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(data).map_err(|err| FormatError::Deserialize(Box::new(err)))
    }

    fn format_type_id(&self) -> FormatTypeId {
        FormatTypeId::Json
    }
}
