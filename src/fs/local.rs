//! Directory-rooted filesystem backend

use super::{stage_name, validate_relative, FileEntry, FileMeta, FsConnector, InstanceFs, TEMP_PREFIX};
use crate::error::{Error, Result};
use crate::provider::Instance;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// Filesystem rooted at a local directory
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        LocalFs {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        validate_relative(path)?;
        Ok(self.root.join(path))
    }

    /// Final path and staging sibling for `path`
    fn staged_path(&self, path: &str, stage: &str) -> Result<(PathBuf, PathBuf)> {
        let target = self.full_path(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| Error::Internal(format!("no parent for {:?}", target)))?;
        let staged = parent.join(stage_name(stage));
        Ok((target, staged))
    }
}

fn walk(root: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    if !root.exists() {
        return Ok(entries);
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();

            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }

            let metadata = entry.metadata()?;
            let relative = path
                .strip_prefix(root)
                .map_err(|e| Error::Internal(e.to_string()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");

            entries.push(FileEntry {
                path: relative,
                size: metadata.len(),
                modified: DateTime::<Utc>::from(metadata.modified()?),
                mode: metadata.permissions().mode() & 0o7777,
            });
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Remove every staging file under `root`
fn sweep_blocking(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Ok(removed)
}

fn commit_blocking(staged: &Path, target: &Path, meta: FileMeta) -> Result<()> {
    let file = std::fs::File::options()
        .create(true)
        .append(true)
        .open(staged)?;
    file.set_modified(SystemTime::from(meta.modified))?;
    file.sync_all()?;
    drop(file);
    std::fs::set_permissions(staged, std::fs::Permissions::from_mode(meta.mode))?;
    std::fs::rename(staged, target)?;
    Ok(())
}

#[async_trait]
impl InstanceFs for LocalFs {
    async fn list(&self) -> Result<Vec<FileEntry>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk(&root))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        let full = self.full_path(path)?;
        let mut file = match tokio::fs::File::open(&full).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset)).await?;

        let mut data = Vec::new();
        file.take(len).read_to_end(&mut data).await?;
        Ok(Bytes::from(data))
    }

    async fn append_staged(&self, path: &str, stage: &str, data: Bytes) -> Result<()> {
        let (_, staged) = self.staged_path(path, stage)?;
        if let Some(parent) = staged.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&staged)
            .await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn commit_staged(&self, path: &str, stage: &str, meta: FileMeta) -> Result<()> {
        let (target, staged) = self.staged_path(path, stage)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(path, "committing staged file");
        tokio::task::spawn_blocking(move || {
            let result = commit_blocking(&staged, &target, meta);
            if result.is_err() {
                let _ = std::fs::remove_file(&staged);
            }
            result
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn discard_staged(&self, path: &str, stage: &str) -> Result<()> {
        let (_, staged) = self.staged_path(path, stage)?;
        match tokio::fs::remove_file(&staged).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn sweep_staged(&self) -> Result<usize> {
        let root = self.root.clone();
        let removed = tokio::task::spawn_blocking(move || sweep_blocking(&root))
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;
        if removed > 0 {
            info!(root = ?self.root, removed, "removed leftover staging files");
        }
        Ok(removed)
    }
}

/// Maps each instance to `{root}/{instance id}`
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        LocalConnector {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl FsConnector for LocalConnector {
    fn connect(&self, instance: &Instance) -> Result<Arc<dyn InstanceFs>> {
        Ok(Arc::new(LocalFs::new(self.root.join(&instance.id))))
    }
}
