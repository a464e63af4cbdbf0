//! Chunk management module
//!
//! Handles splitting files into chunks, content addressing, compression
//! and deduplication.

mod chunker;
mod compression;

pub use chunker::{content_hash, Chunk, ChunkId, Chunker, DedupTracker};
pub use compression::{unpack, CompressionPolicy};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Reference to a chunk stored in the object store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRef {
    /// BLAKE3 hash of the raw bytes, checked on restore
    pub content_hash: ChunkId,
    /// BLAKE3 hash of the stored bytes, used as the object-store key
    pub object_key: ChunkId,
    /// Offset within the file this chunk represents
    pub offset: u64,
    /// Raw size in bytes
    pub size: u64,
    /// Stored size in bytes
    pub compressed_size: u64,
    /// Whether compression was applied
    pub compressed: bool,
}

impl ChunkRef {
    /// Build a ref for a chunk whose stored form is `stored`
    pub fn stored(chunk: &Chunk, stored: &[u8], compressed: bool) -> Self {
        ChunkRef {
            content_hash: chunk.content_hash.clone(),
            object_key: content_hash(stored),
            offset: chunk.offset,
            size: chunk.size(),
            compressed_size: stored.len() as u64,
            compressed,
        }
    }

    /// Same stored chunk placed at another offset
    pub fn with_offset(&self, offset: u64) -> Self {
        ChunkRef {
            offset,
            ..self.clone()
        }
    }
}

/// Encode a chunk for storage, returning the stored bytes and its ref
pub fn encode(chunk: &Chunk, compression_enabled: bool, threshold: usize) -> (Vec<u8>, ChunkRef) {
    let (stored, compressed) = CompressionPolicy::new(compression_enabled, threshold).apply(&chunk.data);
    let chunk_ref = ChunkRef::stored(chunk, &stored, compressed);
    (stored, chunk_ref)
}

/// Decode stored bytes and verify them against the ref's content hash
pub fn decode(chunk_ref: &ChunkRef, stored: &[u8]) -> Result<Vec<u8>> {
    let data = if chunk_ref.compressed {
        unpack(stored)?
    } else {
        stored.to_vec()
    };

    let actual = content_hash(&data);
    if actual != chunk_ref.content_hash {
        return Err(Error::SnapshotIntegrity {
            path: chunk_ref.object_key.clone(),
            reason: format!(
                "chunk hash mismatch: expected {}, got {}",
                chunk_ref.content_hash, actual
            ),
        });
    }

    Ok(data)
}
