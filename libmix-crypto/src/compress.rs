//! zlib compression of message bodies.
//!
//! Payloads are compressed at level 9 so every stream starts with the
//! `0x78 0xDA` header that receivers check for.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Expected first two bytes of a compressed payload
pub const ZLIB_MAGIC: [u8; 2] = [0x78, 0xDA];

/// Error types for compression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressError {
    /// zlib stream could not be produced or parsed
    Zlib(String),
    /// Missing `0x78 0xDA` header
    BadMagic,
    /// Output grew past the caller's bound
    TooLarge {
        /// Bound in bytes
        limit: usize,
    },
}

impl std::fmt::Display for CompressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressError::Zlib(msg) => write!(f, "zlib error: {}", msg),
            CompressError::BadMagic => write!(f, "Compressed data has no zlib level-9 header"),
            CompressError::TooLarge { limit } => {
                write!(f, "Decompressed data exceeds {} bytes", limit)
            }
        }
    }
}

impl std::error::Error for CompressError {}

/// Compress with zlib at the best compression level
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| CompressError::Zlib(e.to_string()))?;
    encoder.finish().map_err(|e| CompressError::Zlib(e.to_string()))
}

/// Decompress a zlib stream, refusing output longer than `limit`
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CompressError> {
    if !data.starts_with(&ZLIB_MAGIC) {
        return Err(CompressError::BadMagic);
    }
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CompressError::Zlib(e.to_string()))?;
    if out.len() > limit {
        return Err(CompressError::TooLarge { limit });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_magic() {
        let text = b"From: nobody\n\nthe quick brown fox ".repeat(40);
        let packed = compress(&text).unwrap();
        assert_eq!(packed[..2], ZLIB_MAGIC);
        assert!(packed.len() < text.len());
        assert_eq!(decompress(&packed, text.len()).unwrap(), text);
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let packed = compress(b"payload").unwrap();
        let mut padded = packed.clone();
        padded.extend_from_slice(&[0xAB; 64]);
        assert_eq!(decompress(&padded, 100).unwrap(), b"payload");
    }

    #[test]
    fn test_limit_enforced() {
        let packed = compress(&[0u8; 10_000]).unwrap();
        assert_eq!(
            decompress(&packed, 9_999),
            Err(CompressError::TooLarge { limit: 9_999 })
        );
    }

    #[test]
    fn test_bad_magic() {
        assert_eq!(decompress(b"plain text", 100), Err(CompressError::BadMagic));
    }
}
