//! Instance filesystem access
//!
//! The replication engine and snapshot pipeline never touch a transfer
//! mechanism directly. They talk to an [`InstanceFs`] obtained from an
//! [`FsConnector`], so the backend is swappable and mockable.

mod exclude;
mod local;
mod memory;

pub use exclude::ExclusionSet;
pub use local::{LocalConnector, LocalFs};
pub use memory::{MemoryConnector, MemoryFs};

use crate::error::{Error, Result};
use crate::provider::Instance;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Prefix of staging files written before the final rename
pub const TEMP_PREFIX: &str = ".spotstandby-tmp-";

/// Metadata preserved across sync and restore
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMeta {
    /// Unix permission bits
    pub mode: u32,
    /// Modification time
    pub modified: DateTime<Utc>,
}

/// A regular file in an instance tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the tree root, `/`-separated
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub mode: u32,
}

impl FileEntry {
    pub fn meta(&self) -> FileMeta {
        FileMeta {
            mode: self.mode,
            modified: self.modified,
        }
    }

    /// Whether size and mtime match, at millisecond resolution
    pub fn same_stat(&self, other: &FileEntry) -> bool {
        self.size == other.size
            && self.modified.timestamp_millis() == other.modified.timestamp_millis()
    }
}

/// File-level access to one instance's data tree
///
/// Large files move in bounded pieces: readers take ranges, writers append
/// to a staging file that is renamed into place on commit. A destination
/// path therefore holds either the old contents or the complete new ones.
#[async_trait]
pub trait InstanceFs: Send + Sync {
    /// All regular files, sorted by path
    async fn list(&self) -> Result<Vec<FileEntry>>;

    /// Up to `len` bytes from `offset`; shorter only at end of file
    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Append to staging file `stage` of `path`, creating it on first use
    async fn append_staged(&self, path: &str, stage: &str, data: Bytes) -> Result<()>;

    /// Apply `meta` to the staged file and rename it over `path`
    ///
    /// A stage that never received data commits as an empty file.
    async fn commit_staged(&self, path: &str, stage: &str, meta: FileMeta) -> Result<()>;

    /// Drop a staging file; a missing stage is not an error
    async fn discard_staged(&self, path: &str, stage: &str) -> Result<()>;

    /// Remove a file; missing files are not an error
    async fn remove(&self, path: &str) -> Result<()>;

    /// Delete staging files left behind by interrupted writes
    async fn sweep_staged(&self) -> Result<usize>;

    /// Write a whole buffer through a staging file
    async fn write_atomic(&self, path: &str, data: Bytes, meta: FileMeta) -> Result<()> {
        let stage = new_stage();
        let written = match self.append_staged(path, &stage, data).await {
            Ok(()) => self.commit_staged(path, &stage, meta).await,
            Err(e) => Err(e),
        };
        if written.is_err() {
            let _ = self.discard_staged(path, &stage).await;
        }
        written
    }
}

/// Fresh staging id
pub fn new_stage() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Copy one file between trees, `piece` bytes at a time
///
/// Returns the bytes copied. The destination is untouched unless the copy
/// completes.
pub async fn copy_file(
    source: &dyn InstanceFs,
    dest: &dyn InstanceFs,
    entry: &FileEntry,
    piece: u64,
) -> Result<u64> {
    let piece = piece.max(1);
    let stage = new_stage();
    let copied = async {
        let mut offset = 0u64;
        loop {
            let data = source.read_range(&entry.path, offset, piece).await?;
            let len = data.len() as u64;
            if len > 0 {
                dest.append_staged(&entry.path, &stage, data).await?;
                offset += len;
            }
            if len < piece {
                break;
            }
        }
        dest.commit_staged(&entry.path, &stage, entry.meta()).await?;
        Ok::<u64, Error>(offset)
    }
    .await;

    if copied.is_err() {
        if let Err(e) = dest.discard_staged(&entry.path, &stage).await {
            debug!(path = %entry.path, "staging file not discarded: {}", e);
        }
    }
    copied
}

/// BLAKE3 of a file's contents, read `piece` bytes at a time
pub async fn hash_file(fs: &dyn InstanceFs, path: &str, piece: u64) -> Result<String> {
    let piece = piece.max(1);
    let mut hasher = blake3::Hasher::new();
    let mut offset = 0u64;
    loop {
        let data = fs.read_range(path, offset, piece).await?;
        hasher.update(&data);
        offset += data.len() as u64;
        if (data.len() as u64) < piece {
            break;
        }
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Resolves an instance to its filesystem
pub trait FsConnector: Send + Sync {
    fn connect(&self, instance: &Instance) -> Result<Arc<dyn InstanceFs>>;
}

/// File name of a staging file
pub(crate) fn stage_name(stage: &str) -> String {
    format!("{}{}", TEMP_PREFIX, stage)
}

/// Reject absolute paths and parent traversal
pub(crate) fn validate_relative(path: &str) -> Result<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|c| c == ".." || c.is_empty())
    {
        return Err(Error::Internal(format!(
            "invalid relative path {:?}",
            path
        )));
    }
    Ok(())
}
