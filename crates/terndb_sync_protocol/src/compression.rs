//! The body compression envelope.
//!
//! `{algorithm: 1 byte, flags: 1 byte, payload}`. Algorithm 0 is an
//! uncompressed passthrough, 1 is Deflate, 2 is LZFSE (recognized but
//! not supported; decoding it reports bad compression).

use crate::error::{ProtocolError, ProtocolResult};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Bodies smaller than this are sent uncompressed.
pub const COMPRESS_THRESHOLD: usize = 1024;

/// Decompressed bodies larger than this are rejected.
const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// Compression algorithms of the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionAlgorithm {
    /// Uncompressed payload.
    None = 0,
    /// RFC 1951 Deflate.
    Deflate = 1,
    /// LZFSE. Recognized for interoperability; not supported.
    Lzfse = 2,
}

impl CompressionAlgorithm {
    fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(Self::None),
            1 => Ok(Self::Deflate),
            2 => Ok(Self::Lzfse),
            _ => Err(ProtocolError::BadCompression {
                message: format!("unknown algorithm byte {byte}"),
            }),
        }
    }
}

/// Wraps a body in a compression envelope, deflating it when that
/// helps. Returns the envelope bytes.
///
/// # Errors
///
/// Fails if the deflate stream cannot be written.
pub fn compress_body(body: &[u8]) -> ProtocolResult<Vec<u8>> {
    if body.len() >= COMPRESS_THRESHOLD {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(body)
            .and_then(|()| encoder.finish())
            .map(|compressed| {
                if compressed.len() + 2 < body.len() {
                    let mut envelope = Vec::with_capacity(compressed.len() + 2);
                    envelope.push(CompressionAlgorithm::Deflate as u8);
                    envelope.push(0);
                    envelope.extend_from_slice(&compressed);
                    envelope
                } else {
                    passthrough(body)
                }
            })
            .map_err(|err| ProtocolError::BadCompression {
                message: err.to_string(),
            })
    } else {
        Ok(passthrough(body))
    }
}

fn passthrough(body: &[u8]) -> Vec<u8> {
    let mut envelope = Vec::with_capacity(body.len() + 2);
    envelope.push(CompressionAlgorithm::None as u8);
    envelope.push(0);
    envelope.extend_from_slice(body);
    envelope
}

/// Unwraps a compression envelope.
///
/// # Errors
///
/// Fails on an unknown or unsupported algorithm, a corrupt deflate
/// stream, or a body exceeding the size limit.
pub fn decompress_body(envelope: &[u8]) -> ProtocolResult<Vec<u8>> {
    if envelope.len() < 2 {
        return Err(ProtocolError::BadCompression {
            message: "envelope shorter than header".into(),
        });
    }
    let algorithm = CompressionAlgorithm::from_byte(envelope[0])?;
    let payload = &envelope[2..];
    match algorithm {
        CompressionAlgorithm::None => Ok(payload.to_vec()),
        CompressionAlgorithm::Deflate => {
            let mut decoder = DeflateDecoder::new(payload);
            let mut body = Vec::new();
            decoder
                .by_ref()
                .take(MAX_BODY_SIZE as u64 + 1)
                .read_to_end(&mut body)
                .map_err(|err| ProtocolError::BadCompression {
                    message: err.to_string(),
                })?;
            if body.len() > MAX_BODY_SIZE {
                return Err(ProtocolError::LimitsExceeded {
                    message: "decompressed body too large".into(),
                });
            }
            Ok(body)
        }
        CompressionAlgorithm::Lzfse => Err(ProtocolError::BadCompression {
            message: "LZFSE is not supported".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_body_passes_through() {
        let body = b"small body";
        let envelope = compress_body(body).unwrap();
        assert_eq!(envelope[0], CompressionAlgorithm::None as u8);
        assert_eq!(decompress_body(&envelope).unwrap(), body);
    }

    #[test]
    fn large_body_deflates() {
        let body = vec![7u8; 64 * 1024];
        let envelope = compress_body(&body).unwrap();
        assert_eq!(envelope[0], CompressionAlgorithm::Deflate as u8);
        assert!(envelope.len() < body.len());
        assert_eq!(decompress_body(&envelope).unwrap(), body);
    }

    #[test]
    fn incompressible_body_passes_through() {
        // High-entropy data stays uncompressed even above the threshold.
        let body: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let envelope = compress_body(&body).unwrap();
        assert_eq!(decompress_body(&envelope).unwrap(), body);
    }

    #[test]
    fn lzfse_rejected() {
        let envelope = [CompressionAlgorithm::Lzfse as u8, 0, 1, 2, 3];
        assert!(matches!(
            decompress_body(&envelope),
            Err(ProtocolError::BadCompression { .. })
        ));
    }

    #[test]
    fn unknown_algorithm_rejected() {
        let envelope = [9u8, 0, 1];
        assert!(decompress_body(&envelope).is_err());
    }

    #[test]
    fn truncated_envelope_rejected() {
        assert!(decompress_body(&[0]).is_err());
    }
}
