//! Payload envelope with a compression marker.
//!
//! ## Format Layout
//!
//! ```text
//! [marker (1 byte)][body]
//! ```
//!
//! `marker` is a [`CompressionMarker`]; `body` is the serialized value,
//! compressed with the codec the marker names. An empty payload is invalid.

use crate::compressor::{CompressionError, CompressionMarker, Compressor, decompressor_for};

/// Length of the envelope header in bytes.
pub const HEADER_LEN: usize = 1;

/// Wraps `body` with `compressor`, prefixing the codec marker.
pub fn seal(body: &[u8], compressor: &dyn Compressor) -> Result<Vec<u8>, CompressionError> {
    let marker = compressor.marker();
    let compressed = match marker {
        CompressionMarker::Plain => None,
        _ => Some(compressor.compress(body)?),
    };
    let inner = compressed.as_deref().unwrap_or(body);

    let mut out = Vec::with_capacity(HEADER_LEN + inner.len());
    out.push(marker.as_byte());
    out.extend_from_slice(inner);
    Ok(out)
}

/// Reads the marker and returns the decompressed body.
pub fn open(payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let (&marker, body) = payload
        .split_first()
        .ok_or(CompressionError::UnknownMarker(0xff))?;
    match CompressionMarker::try_from(marker)? {
        CompressionMarker::Plain => Ok(body.to_vec()),
        other => decompressor_for(other)?.decompress(body),
    }
}

/// Returns the codec recorded in `payload`, if the header is readable.
pub fn marker_of(payload: &[u8]) -> Option<CompressionMarker> {
    payload
        .first()
        .and_then(|byte| CompressionMarker::try_from(*byte).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::{GzipCompressor, PassthroughCompressor};

    #[test]
    fn plain_payload_keeps_body_verbatim() {
        let sealed = seal(b"{\"id\":1}", &PassthroughCompressor).unwrap();
        assert_eq!(sealed[0], CompressionMarker::Plain.as_byte());
        assert_eq!(&sealed[HEADER_LEN..], b"{\"id\":1}");
        assert_eq!(open(&sealed).unwrap(), b"{\"id\":1}");
    }

    #[test]
    fn reader_detects_gzip_without_configuration() {
        let body = "event calendar ".repeat(200).into_bytes();
        let sealed = seal(&body, &GzipCompressor::with_level(9)).unwrap();

        assert_eq!(marker_of(&sealed), Some(CompressionMarker::Gzip));
        assert!(sealed.len() < body.len());
        assert_eq!(open(&sealed).unwrap(), body);
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(open(&[]).is_err());
    }
}
