//! One-way tree mirroring
//!
//! Copies changed files from source to destination, mirrors deletions and
//! leaves excluded paths alone on both sides. Files are streamed in pieces
//! through a staging file, so a destination file is either the old version
//! or the new one and memory use does not grow with file size.

use crate::error::{Error, Result};
use crate::fs::{copy_file, hash_file, ExclusionSet, FileEntry, InstanceFs};
use crate::transfer::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Bytes moved per read while copying or hashing
const COPY_PIECE: u64 = 8 * 1024 * 1024;

/// What one mirror pass did
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReport {
    pub files_copied: usize,
    pub files_deleted: usize,
    pub files_unchanged: usize,
    pub files_excluded: usize,
    pub bytes_copied: u64,
    /// Paths that could not be copied or removed, with the reason
    pub failed: Vec<(String, String)>,
    /// The pass stopped early at a file boundary
    pub interrupted: bool,
}

impl SyncReport {
    /// Entries the pass considered
    pub fn total(&self) -> usize {
        self.files_copied + self.files_deleted + self.files_unchanged + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }

    /// `SyncPartialFailure` when any entry failed
    pub fn into_result(self) -> Result<SyncReport> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(Error::SyncPartialFailure {
                failed: self.failed.len(),
                total: self.total(),
            })
        }
    }
}

/// Mirror `source` onto `dest`
///
/// A file is copied when its size, mtime or mode differ from the destination
/// copy, or when `compare_hashes` is set and the contents differ. `stop` is
/// checked before each file.
pub async fn sync(
    source: &dyn InstanceFs,
    dest: &dyn InstanceFs,
    exclusions: &ExclusionSet,
    compare_hashes: bool,
    stop: &CancelToken,
) -> Result<SyncReport> {
    let source_entries = source.list().await?;
    let dest_entries: HashMap<String, FileEntry> = dest
        .list()
        .await?
        .into_iter()
        .map(|e| (e.path.clone(), e))
        .collect();

    let mut report = SyncReport::default();
    let mut seen = HashSet::with_capacity(source_entries.len());

    for entry in source_entries {
        if stop.is_cancelled() {
            report.interrupted = true;
            return Ok(report);
        }
        if exclusions.is_excluded(&entry.path) {
            report.files_excluded += 1;
            continue;
        }
        seen.insert(entry.path.clone());

        let existing = dest_entries.get(&entry.path);
        let stat_matches = existing
            .map(|d| d.same_stat(&entry) && d.mode == entry.mode)
            .unwrap_or(false);
        if stat_matches && !compare_hashes {
            report.files_unchanged += 1;
            continue;
        }

        if stat_matches {
            let source_hash = match hash_file(source, &entry.path, COPY_PIECE).await {
                Ok(hash) => hash,
                Err(Error::FileNotFound(_)) => {
                    debug!(path = %entry.path, "source file vanished during sync");
                    continue;
                }
                Err(e) => {
                    warn!(path = %entry.path, "reading source failed: {}", e);
                    report.failed.push((entry.path, e.to_string()));
                    continue;
                }
            };
            let dest_hash = hash_file(dest, &entry.path, COPY_PIECE).await.ok();
            if dest_hash.as_deref() == Some(source_hash.as_str()) {
                report.files_unchanged += 1;
                continue;
            }
        }

        match copy_file(source, dest, &entry, COPY_PIECE).await {
            Ok(len) => {
                report.files_copied += 1;
                report.bytes_copied += len;
            }
            Err(Error::FileNotFound(_)) => {
                debug!(path = %entry.path, "source file vanished during sync");
            }
            Err(e) => {
                warn!(path = %entry.path, "copying file failed: {}", e);
                report.failed.push((entry.path, e.to_string()));
            }
        }
    }

    for path in dest_entries.keys() {
        if seen.contains(path) || exclusions.is_excluded(path) {
            continue;
        }
        if stop.is_cancelled() {
            report.interrupted = true;
            return Ok(report);
        }
        match dest.remove(path).await {
            Ok(()) => report.files_deleted += 1,
            Err(e) => {
                warn!(path = %path, "removing destination file failed: {}", e);
                report.failed.push((path.clone(), e.to_string()));
            }
        }
    }

    Ok(report)
}
