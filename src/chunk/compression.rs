//! LZ4 compression for stored chunks
//!
//! Restores are latency bound, so LZ4 is used for its decode speed. A chunk
//! is kept in compressed form only when that form is strictly smaller.

use crate::error::{Error, Result};

/// When to attempt compression on a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub enabled: bool,
    /// Chunks smaller than this are stored raw
    pub min_size: usize,
}

impl CompressionPolicy {
    pub fn new(enabled: bool, min_size: usize) -> Self {
        CompressionPolicy { enabled, min_size }
    }

    pub fn disabled() -> Self {
        CompressionPolicy {
            enabled: false,
            min_size: usize::MAX,
        }
    }

    /// Stored form of `data` and whether it is compressed
    pub fn apply(&self, data: &[u8]) -> (Vec<u8>, bool) {
        if !self.enabled || data.len() < self.min_size {
            return (data.to_vec(), false);
        }

        let packed = lz4_flex::compress_prepend_size(data);
        if packed.len() < data.len() {
            (packed, true)
        } else {
            (data.to_vec(), false)
        }
    }
}

/// Inverse of [`CompressionPolicy::apply`] for a compressed chunk
pub fn unpack(stored: &[u8]) -> Result<Vec<u8>> {
    lz4_flex::decompress_size_prepended(stored)
        .map_err(|e| Error::Compression(format!("lz4 frame rejected: {}", e)))
}
