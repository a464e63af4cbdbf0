//! File chunking with content-based deduplication
//!
//! Uses BLAKE3 for content hashing. Chunks are identified by their content
//! hash, so a chunk already referenced by a base manifest is never uploaded
//! again.

use super::ChunkRef;
use crate::config::SnapshotConfig;
use crate::error::Result;
use crate::fs::InstanceFs;
use std::collections::HashMap;

/// Content-based chunk identifier (BLAKE3 hex digest)
pub type ChunkId = String;

/// Hash raw bytes into a chunk identifier
pub fn content_hash(data: &[u8]) -> ChunkId {
    blake3::hash(data).to_hex().to_string()
}

/// A chunk of file data read from the source tree
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Hash of the raw bytes
    pub content_hash: ChunkId,
    /// Offset in the file
    pub offset: u64,
    /// Raw data
    pub data: Vec<u8>,
}

impl Chunk {
    /// Create a new chunk from data
    pub fn new(data: Vec<u8>, offset: u64) -> Self {
        Chunk {
            content_hash: content_hash(&data),
            offset,
            data,
        }
    }

    /// Raw size in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Chunker for splitting files into fixed-size chunks
///
/// Files no larger than the chunk size come out as a single whole unit.
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    /// Create a new chunker with the given configuration
    pub fn new(config: &SnapshotConfig) -> Self {
        Chunker {
            chunk_size: config.chunk_size.max(1),
        }
    }

    /// Create a chunker with a specific chunk size
    pub fn with_size(chunk_size: usize) -> Self {
        Chunker {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Get the configured chunk size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Read the chunk of `path` starting at `offset`
    ///
    /// `None` once `offset` is at or past the end of the file. A chunk
    /// shorter than the chunk size is the last one.
    pub async fn read_chunk(
        &self,
        fs: &dyn InstanceFs,
        path: &str,
        offset: u64,
    ) -> Result<Option<Chunk>> {
        let data = fs.read_range(path, offset, self.chunk_size as u64).await?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(Chunk::new(data.to_vec(), offset)))
    }

    /// Whether `chunk` filled a whole chunk, so more may follow
    pub fn is_full(&self, chunk: &Chunk) -> bool {
        chunk.data.len() == self.chunk_size
    }
}

/// Deduplication tracker
///
/// Seeded with the chunk refs of a base manifest; a chunk whose hash is
/// already known is referenced instead of uploaded.
#[derive(Default)]
pub struct DedupTracker {
    known_chunks: HashMap<ChunkId, ChunkRef>,
}

impl DedupTracker {
    /// Create a new dedup tracker
    pub fn new() -> Self {
        DedupTracker {
            known_chunks: HashMap::new(),
        }
    }

    /// Seed the tracker from existing chunk refs
    pub fn from_refs<'a>(refs: impl IntoIterator<Item = &'a ChunkRef>) -> Self {
        let mut tracker = Self::new();
        for chunk_ref in refs {
            tracker.register(chunk_ref.clone());
        }
        tracker
    }

    /// Look up a known chunk by content hash
    pub fn lookup(&self, content_hash: &str) -> Option<&ChunkRef> {
        self.known_chunks.get(content_hash)
    }

    /// Check if a chunk is already known
    pub fn is_known(&self, content_hash: &str) -> bool {
        self.known_chunks.contains_key(content_hash)
    }

    /// Register a chunk as known
    pub fn register(&mut self, chunk_ref: ChunkRef) {
        self.known_chunks
            .entry(chunk_ref.content_hash.clone())
            .or_insert(chunk_ref);
    }

    /// Get the number of known chunks
    pub fn len(&self) -> usize {
        self.known_chunks.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.known_chunks.is_empty()
    }
}
