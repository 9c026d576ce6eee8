//! Batch payload compression codecs.
//!
//! Producers compress each batch payload before framing; readers decompress
//! after dedup. The codec choice travels in client/worker configuration, not
//! on the wire: both ends of one shuffle are configured identically.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RssError};

/// Payload compression codec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    /// No compression; integrity metadata batches are still framed.
    None,
    /// LZ4 block format with a length prefix.
    Lz4,
    /// Zstd at the default level.
    Zstd,
}

impl Default for CompressionCodec {
    fn default() -> Self {
        Self::Lz4
    }
}

impl CompressionCodec {
    /// Compress one payload.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionCodec::None => Ok(data.to_vec()),
            CompressionCodec::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            CompressionCodec::Zstd => zstd::encode_all(data, 0)
                .map_err(|e| RssError::Io(std::io::Error::other(format!("zstd encode: {e}")))),
        }
    }

    /// Decompress one payload.
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionCodec::None => Ok(data.to_vec()),
            CompressionCodec::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| RssError::FetchFail(format!("lz4 decompress failed: {e}"))),
            CompressionCodec::Zstd => zstd::decode_all(data)
                .map_err(|e| RssError::FetchFail(format!("zstd decompress failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_round_trips() {
        let data = vec![7u8; 4096];
        let codec = CompressionCodec::Lz4;
        let compressed = codec.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(codec.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn zstd_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let codec = CompressionCodec::Zstd;
        let compressed = codec.compress(&data).unwrap();
        assert_eq!(codec.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn corrupt_input_is_a_fetch_failure() {
        let err = CompressionCodec::Lz4.decompress(&[0xFF; 3]).unwrap_err();
        assert!(matches!(err, RssError::FetchFail(_)));
    }
}
