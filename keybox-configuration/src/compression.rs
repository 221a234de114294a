use std::sync::Arc;

use keybox_backend::{Compressor, GzipCompressor};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Codec used for values above the compression threshold.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Gzip,
    Zstd,
}

fn default_gzip_level() -> u32 {
    6
}

#[cfg(feature = "zstd")]
fn default_zstd_level() -> i32 {
    3
}

impl Compression {
    /// Convert the configured codec to a compressor. `level` falls back to
    /// the codec default.
    pub fn to_compressor(&self, level: Option<i32>) -> Result<Arc<dyn Compressor>, ConfigError> {
        match self {
            Compression::Gzip => {
                let level = match level {
                    Some(level) => u32::try_from(level).map_err(|_| {
                        ConfigError::invalid("CompressionLevel", "gzip level must be 0-9")
                    })?,
                    None => default_gzip_level(),
                };
                Ok(Arc::new(GzipCompressor::with_level(level)))
            }
            #[cfg(feature = "zstd")]
            Compression::Zstd => {
                use keybox_backend::ZstdCompressor;
                Ok(Arc::new(ZstdCompressor::with_level(
                    level.unwrap_or_else(default_zstd_level),
                )))
            }
            #[cfg(not(feature = "zstd"))]
            Compression::Zstd => Err(ConfigError::BackendNotAvailable(
                "Zstd compression requested but 'zstd' feature is not enabled".to_string(),
            )),
        }
    }
}
