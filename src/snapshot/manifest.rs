//! Snapshot manifests
//!
//! A manifest lists every file of a point-in-time tree with the chunks that
//! make it up. Incremental manifests name their base; chunks they share with
//! it are referenced, not stored again.

use crate::chunk::ChunkRef;
use crate::fs::FileMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One file in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub modified: DateTime<Utc>,
    /// Chunks ordered by offset
    pub chunks: Vec<ChunkRef>,
}

impl FileRecord {
    pub fn meta(&self) -> FileMeta {
        FileMeta {
            mode: self.mode,
            modified: self.modified,
        }
    }
}

/// Point-in-time description of a tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotManifest {
    pub id: Uuid,
    /// Owning association, `None` for ad-hoc snapshots
    pub association_id: Option<Uuid>,
    /// Manifest this one is incremental against
    pub base_manifest_id: Option<Uuid>,
    /// Instance (or directory) the tree was read from
    pub source_instance: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<FileRecord>,
    /// Raw bytes described
    pub total_size: u64,
    /// Stored bytes referenced
    pub stored_size: u64,
    /// Stored bytes uploaded while creating this manifest
    pub uploaded_bytes: u64,
}

impl SnapshotManifest {
    /// Full manifests have no base
    pub fn is_full(&self) -> bool {
        self.base_manifest_id.is_none()
    }

    /// Every chunk reference in file order
    pub fn chunk_list(&self) -> impl Iterator<Item = &ChunkRef> {
        self.files.iter().flat_map(|f| f.chunks.iter())
    }

    pub fn chunk_count(&self) -> usize {
        self.files.iter().map(|f| f.chunks.len()).sum()
    }

    pub fn file(&self, path: &str) -> Option<&FileRecord> {
        self.files
            .binary_search_by(|f| f.path.as_str().cmp(path))
            .ok()
            .map(|idx| &self.files[idx])
    }

    /// Find a reference to the same content stored under another key
    pub fn find_copy(&self, content_hash: &str, exclude_key: &str) -> Option<&ChunkRef> {
        self.chunk_list()
            .find(|c| c.content_hash == content_hash && c.object_key != exclude_key)
    }
}
