//! Payload compression.
//!
//! Compressors are object safe so that the codec can be chosen at runtime from
//! configuration and shared as `Arc<dyn Compressor>`. Each compressor owns a
//! one-byte [`CompressionMarker`] written into the payload
//! [envelope](crate::envelope), which lets readers pick the right decoder
//! without knowing how the writer was configured.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    Compress(#[source] std::io::Error),

    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("unknown compression marker {0:#04x}")]
    UnknownMarker(u8),

    #[error("payload compressed with {0:?}, which is not enabled in this build")]
    Unsupported(CompressionMarker),
}

/// Codec identifier stored in the first byte of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionMarker {
    Plain = 0,
    Gzip = 1,
    Zstd = 2,
}

impl CompressionMarker {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CompressionMarker {
    type Error = CompressionError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(CompressionMarker::Plain),
            1 => Ok(CompressionMarker::Gzip),
            2 => Ok(CompressionMarker::Zstd),
            other => Err(CompressionError::UnknownMarker(other)),
        }
    }
}

pub trait Compressor: std::fmt::Debug + Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    fn marker(&self) -> CompressionMarker;
}

impl<C: Compressor + ?Sized> Compressor for std::sync::Arc<C> {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        (**self).compress(data)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        (**self).decompress(data)
    }

    fn marker(&self) -> CompressionMarker {
        (**self).marker()
    }
}

/// Leaves payloads untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCompressor;

impl Compressor for PassthroughCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }

    fn marker(&self) -> CompressionMarker {
        CompressionMarker::Plain
    }
}

/// Gzip compressor backed by `flate2`.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: u32,
}

impl GzipCompressor {
    /// Level is clamped to the 0-9 range accepted by gzip.
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::with_level(6)
    }
}

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(data).map_err(CompressionError::Compress)?;
        encoder.finish().map_err(CompressionError::Compress)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::with_capacity(data.len() * 2);
        decoder
            .read_to_end(&mut out)
            .map_err(CompressionError::Decompress)?;
        Ok(out)
    }

    fn marker(&self) -> CompressionMarker {
        CompressionMarker::Gzip
    }
}

/// Zstandard compressor, available with the `zstd` feature.
#[cfg(feature = "zstd")]
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

#[cfg(feature = "zstd")]
impl ZstdCompressor {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

#[cfg(feature = "zstd")]
impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::with_level(3)
    }
}

#[cfg(feature = "zstd")]
impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::encode_all(data, self.level).map_err(CompressionError::Compress)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::decode_all(data).map_err(CompressionError::Decompress)
    }

    fn marker(&self) -> CompressionMarker {
        CompressionMarker::Zstd
    }
}

/// Returns a decoder for payloads carrying `marker`.
pub fn decompressor_for(
    marker: CompressionMarker,
) -> Result<Box<dyn Compressor>, CompressionError> {
    match marker {
        CompressionMarker::Plain => Ok(Box::new(PassthroughCompressor)),
        CompressionMarker::Gzip => Ok(Box::new(GzipCompressor::default())),
        #[cfg(feature = "zstd")]
        CompressionMarker::Zstd => Ok(Box::new(ZstdCompressor::default())),
        #[cfg(not(feature = "zstd"))]
        CompressionMarker::Zstd => Err(CompressionError::Unsupported(marker)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_shrinks_repetitive_payloads() {
        let data = "newsletter ".repeat(500).into_bytes();
        let compressor = GzipCompressor::default();

        let compressed = compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len() / 4);
        assert_eq!(compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn gzip_rejects_garbage() {
        let result = GzipCompressor::default().decompress(b"definitely not gzip");
        assert!(matches!(result, Err(CompressionError::Decompress(_))));
    }

    #[test]
    fn unknown_marker_is_rejected() {
        assert!(matches!(
            CompressionMarker::try_from(0x7f),
            Err(CompressionError::UnknownMarker(0x7f))
        ));
    }
}
