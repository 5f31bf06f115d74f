//! Payload compression for durable pages.
//!
//! Pages are zstd-compressed before they reach the backend when that makes
//! them smaller; incompressible pages are stored raw. The caller records which
//! form was written so reads can reverse it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Decompressed length {actual} does not match recorded length {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Compression settings for the durable tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Compress payloads with zstd before writing.
    pub enabled: bool,
    /// zstd level (1 = fastest).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            zstd_level: 3,
        }
    }
}

/// Output of [`Compressor::compress`].
#[derive(Debug)]
pub struct Encoded {
    pub data: Vec<u8>,
    pub compressed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Encode a payload for storage.
    pub fn compress(&self, data: &[u8]) -> Result<Encoded, CompressionError> {
        if self.config.enabled && !data.is_empty() {
            let compressed = zstd::encode_all(data, self.config.zstd_level)?;
            if compressed.len() < data.len() {
                return Ok(Encoded {
                    data: compressed,
                    compressed: true,
                });
            }
        }
        Ok(Encoded {
            data: data.to_vec(),
            compressed: false,
        })
    }

    /// Reverse [`Compressor::compress`], checking the result against the
    /// recorded raw length.
    pub fn decompress(
        &self,
        data: &[u8],
        compressed: bool,
        raw_len: usize,
    ) -> Result<Vec<u8>, CompressionError> {
        let out = if compressed {
            zstd::decode_all(data)?
        } else {
            data.to_vec()
        };
        if out.len() != raw_len {
            return Err(CompressionError::LengthMismatch {
                expected: raw_len,
                actual: out.len(),
            });
        }
        Ok(out)
    }
}
