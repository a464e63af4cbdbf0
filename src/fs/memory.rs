//! In-memory filesystem backend for tests and dry runs

use super::{validate_relative, FileEntry, FileMeta, FsConnector, InstanceFs};
use crate::error::{Error, Result};
use crate::provider::Instance;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory tree with counters and failure injection
#[derive(Default)]
pub struct MemoryFs {
    files: RwLock<BTreeMap<String, (Bytes, FileMeta)>>,
    /// Staging buffers keyed by (path, stage)
    staged: Mutex<HashMap<(String, String), Vec<u8>>>,
    failing_writes: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    list_delay_ms: AtomicU64,
    writes: AtomicUsize,
    removes: AtomicUsize,
    reads: AtomicUsize,
    bytes_written: AtomicU64,
    largest_read: AtomicU64,
    largest_append: AtomicU64,
    active_lists: AtomicUsize,
    max_active_lists: AtomicUsize,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file directly, bypassing counters
    pub fn insert(&self, path: &str, data: impl Into<Bytes>, modified: DateTime<Utc>) {
        self.files.write().insert(
            path.to_string(),
            (data.into(), FileMeta { mode: 0o644, modified }),
        );
    }

    /// Seed a file with explicit permissions
    pub fn insert_with_mode(&self, path: &str, data: impl Into<Bytes>, meta: FileMeta) {
        self.files.write().insert(path.to_string(), (data.into(), meta));
    }

    /// Delete a file directly, bypassing counters
    pub fn delete(&self, path: &str) {
        self.files.write().remove(path);
    }

    pub fn contents(&self, path: &str) -> Option<Bytes> {
        self.files.read().get(path).map(|(data, _)| data.clone())
    }

    pub fn meta(&self, path: &str) -> Option<FileMeta> {
        self.files.read().get(path).map(|(_, meta)| *meta)
    }

    /// Snapshot of the whole tree for equality checks
    pub fn snapshot(&self) -> BTreeMap<String, (Bytes, FileMeta)> {
        self.files.read().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    /// Make writes to `path` fail
    pub fn fail_writes_to(&self, path: &str) {
        self.failing_writes.lock().insert(path.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_writes.lock().clear();
    }

    /// Make every call fail as if the instance were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Hold each `list` call open for the given time
    pub fn set_list_delay(&self, delay: Duration) {
        self.list_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    /// Largest single `read_range` result so far
    pub fn largest_read(&self) -> u64 {
        self.largest_read.load(Ordering::SeqCst)
    }

    /// Largest single `append_staged` payload so far
    pub fn largest_append(&self) -> u64 {
        self.largest_append.load(Ordering::SeqCst)
    }

    /// Stages neither committed nor discarded
    pub fn open_stages(&self) -> usize {
        self.staged.lock().len()
    }

    /// Highest number of `list` calls that ran at the same time
    pub fn max_concurrent_lists(&self) -> usize {
        self.max_active_lists.load(Ordering::SeqCst)
    }

    fn check_writable(&self, path: &str) -> Result<()> {
        if self.failing_writes.lock().contains(path) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("injected write failure for {}", path),
            )));
        }
        Ok(())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::TransientProvider("instance unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceFs for MemoryFs {
    async fn list(&self) -> Result<Vec<FileEntry>> {
        self.check_available()?;

        let active = self.active_lists.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_lists.fetch_max(active, Ordering::SeqCst);

        let delay = self.list_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let entries = self
            .files
            .read()
            .iter()
            .map(|(path, (data, meta))| FileEntry {
                path: path.clone(),
                size: data.len() as u64,
                modified: meta.modified,
                mode: meta.mode,
            })
            .collect();

        self.active_lists.fetch_sub(1, Ordering::SeqCst);
        Ok(entries)
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let data = self
            .contents(path)
            .ok_or_else(|| Error::FileNotFound(path.to_string()))?;

        let start = (offset.min(data.len() as u64)) as usize;
        let end = (offset.saturating_add(len).min(data.len() as u64)) as usize;
        self.largest_read
            .fetch_max((end - start) as u64, Ordering::SeqCst);
        Ok(data.slice(start..end))
    }

    async fn append_staged(&self, path: &str, stage: &str, data: Bytes) -> Result<()> {
        self.check_available()?;
        validate_relative(path)?;
        self.check_writable(path)?;

        self.largest_append
            .fetch_max(data.len() as u64, Ordering::SeqCst);
        self.staged
            .lock()
            .entry((path.to_string(), stage.to_string()))
            .or_default()
            .extend_from_slice(&data);
        Ok(())
    }

    async fn commit_staged(&self, path: &str, stage: &str, meta: FileMeta) -> Result<()> {
        self.check_available()?;
        validate_relative(path)?;
        let key = (path.to_string(), stage.to_string());
        if let Err(e) = self.check_writable(path) {
            self.staged.lock().remove(&key);
            return Err(e);
        }

        let data = self.staged.lock().remove(&key).unwrap_or_default();
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::SeqCst);
        self.files
            .write()
            .insert(path.to_string(), (Bytes::from(data), meta));
        Ok(())
    }

    async fn discard_staged(&self, path: &str, stage: &str) -> Result<()> {
        self.staged
            .lock()
            .remove(&(path.to_string(), stage.to_string()));
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.check_available()?;
        if self.files.write().remove(path).is_some() {
            self.removes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn sweep_staged(&self) -> Result<usize> {
        let mut staged = self.staged.lock();
        let removed = staged.len();
        staged.clear();
        Ok(removed)
    }
}

/// Hands out one [`MemoryFs`] per instance id, created on first use
#[derive(Default)]
pub struct MemoryConnector {
    trees: DashMap<String, Arc<MemoryFs>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The tree for an instance id
    pub fn tree(&self, instance_id: &str) -> Arc<MemoryFs> {
        self.trees
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(MemoryFs::new()))
            .clone()
    }
}

impl FsConnector for MemoryConnector {
    fn connect(&self, instance: &Instance) -> Result<Arc<dyn InstanceFs>> {
        Ok(self.tree(&instance.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_write_failure() {
        let fs = MemoryFs::new();
        fs.fail_writes_to("bad.bin");
        let meta = FileMeta {
            mode: 0o644,
            modified: Utc::now(),
        };

        assert!(fs.write_atomic("bad.bin", Bytes::from_static(b"x"), meta).await.is_err());
        assert!(fs.write_atomic("good.bin", Bytes::from_static(b"x"), meta).await.is_ok());
        assert_eq!(fs.paths(), vec!["good.bin".to_string()]);
        assert_eq!(fs.open_stages(), 0);
    }

    #[tokio::test]
    async fn test_ranges_and_stages() {
        let fs = MemoryFs::new();
        fs.insert("log.txt", b"0123456789".to_vec(), Utc::now());
        assert_eq!(fs.read_range("log.txt", 8, 5).await.unwrap().as_ref(), b"89");
        assert!(fs.read_range("log.txt", 20, 5).await.unwrap().is_empty());

        fs.append_staged("out.bin", "a", Bytes::from_static(b"ab")).await.unwrap();
        fs.append_staged("left.bin", "b", Bytes::from_static(b"zz")).await.unwrap();
        assert!(fs.contents("out.bin").is_none());
        fs.commit_staged(
            "out.bin",
            "a",
            FileMeta {
                mode: 0o600,
                modified: Utc::now(),
            },
        )
        .await
        .unwrap();
        assert_eq!(fs.contents("out.bin").unwrap().as_ref(), b"ab");
        assert_eq!(fs.sweep_staged().await.unwrap(), 1);
        assert_eq!(fs.open_stages(), 0);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let fs = MemoryFs::new();
        fs.set_unavailable(true);
        assert!(matches!(fs.list().await, Err(Error::TransientProvider(_))));
    }
}
