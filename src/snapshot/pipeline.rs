//! Snapshot creation and restore
//!
//! Creation reads the source tree, chunks and hashes changed files, uploads
//! new chunks through the shared [`TransferPool`] and commits the manifest
//! last. Restore fetches chunks in parallel, verifies every chunk hash and
//! isolates failures to the file they belong to.

use super::{FileRecord, ManifestCatalog, SnapshotManifest};
use crate::chunk::{self, ChunkRef, Chunker, DedupTracker};
use crate::clock::Clock;
use crate::config::SnapshotConfig;
use crate::error::{Error, Result};
use crate::fs::{new_stage, ExclusionSet, InstanceFs};
use crate::store::ObjectStore;
use crate::transfer::{CancelToken, TransferPool};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on chunk bytes held in memory before a flush
const MAX_PENDING_BYTES: u64 = 256 * 1024 * 1024;

/// Chunks of one file fetched ahead of the write cursor during restore
const RESTORE_WINDOW: usize = 4;

/// Where a snapshot reads its tree from
pub struct SnapshotSource<'a> {
    pub fs: &'a dyn InstanceFs,
    /// Instance id or directory recorded in the manifest
    pub instance_ref: &'a str,
    pub association_id: Option<Uuid>,
}

/// Overall outcome of a restore
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RestoreStatus {
    /// Every file restored
    Complete,
    /// Some files restored, some failed
    Partial,
    /// Nothing could be restored
    Failed,
}

/// A file that could not be restored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    pub manifest_id: Uuid,
    pub status: RestoreStatus,
    pub files_restored: usize,
    pub bytes_restored: u64,
    /// Chunks read from a copy recorded by an ancestor manifest
    pub chunks_from_ancestors: usize,
    pub failed: Vec<FailedFile>,
}

impl RestoreResult {
    pub fn is_complete(&self) -> bool {
        self.status == RestoreStatus::Complete
    }
}

#[derive(Clone)]
struct PendingUpload {
    key: String,
    data: Bytes,
}

enum FileOutcome {
    Restored { bytes: u64, from_ancestors: usize },
    Failed(FailedFile),
    Skipped,
}

pub struct SnapshotPipeline {
    store: Arc<dyn ObjectStore>,
    catalog: ManifestCatalog,
    pool: Arc<TransferPool>,
    chunker: Chunker,
    config: SnapshotConfig,
    exclusions: ExclusionSet,
    clock: Arc<dyn Clock>,
    /// Creates hold it shared, garbage collection exclusively, so GC never
    /// sees uploaded-but-uncommitted chunks
    gc_lock: RwLock<()>,
}

impl SnapshotPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        catalog: ManifestCatalog,
        pool: Arc<TransferPool>,
        config: &SnapshotConfig,
        exclusions: ExclusionSet,
        clock: Arc<dyn Clock>,
    ) -> Self {
        SnapshotPipeline {
            store,
            catalog,
            pool,
            chunker: Chunker::new(config),
            config: config.clone(),
            exclusions,
            clock,
            gc_lock: RwLock::new(()),
        }
    }

    pub fn catalog(&self) -> &ManifestCatalog {
        &self.catalog
    }

    /// Build and commit a manifest of `source`, incremental against `base`
    pub async fn create(
        &self,
        source: SnapshotSource<'_>,
        base: Option<&SnapshotManifest>,
        cancel: &CancelToken,
    ) -> Result<SnapshotManifest> {
        let _guard = self.gc_lock.read().await;
        let started = std::time::Instant::now();

        let entries = source.fs.list().await?;
        let base_files: HashMap<&str, &FileRecord> = base
            .map(|b| b.files.iter().map(|f| (f.path.as_str(), f)).collect())
            .unwrap_or_default();
        let mut dedup = base
            .map(|b| DedupTracker::from_refs(b.chunk_list()))
            .unwrap_or_default();

        let mut queued: HashSet<String> = HashSet::new();
        let mut pending: Vec<PendingUpload> = Vec::new();
        let mut pending_bytes = 0u64;
        let mut uploaded_bytes = 0u64;
        let mut reused_files = 0usize;
        let mut files = Vec::with_capacity(entries.len());
        let flush_count = self.pool.max_concurrent() * 4;

        for entry in entries {
            cancel.check()?;
            if self.exclusions.is_excluded(&entry.path) {
                continue;
            }

            if let Some(previous) = base_files.get(entry.path.as_str()) {
                if previous.size == entry.size
                    && previous.mode == entry.mode
                    && previous.modified.timestamp_millis() == entry.modified.timestamp_millis()
                {
                    files.push((*previous).clone());
                    reused_files += 1;
                    continue;
                }
            }

            let mut chunks = Vec::new();
            let mut size = 0u64;
            let mut vanished = false;
            loop {
                let piece = match self.chunker.read_chunk(source.fs, &entry.path, size).await {
                    Ok(Some(piece)) => piece,
                    Ok(None) => break,
                    Err(Error::FileNotFound(_)) => {
                        vanished = true;
                        break;
                    }
                    Err(e) => return Err(e),
                };
                let full = self.chunker.is_full(&piece);
                size += piece.size();

                if let Some(known) = dedup.lookup(&piece.content_hash) {
                    chunks.push(known.with_offset(piece.offset));
                } else {
                    let (stored, chunk_ref) = chunk::encode(
                        &piece,
                        self.config.compression_enabled,
                        self.config.compression_threshold,
                    );
                    if queued.insert(chunk_ref.object_key.clone()) {
                        pending_bytes += stored.len() as u64;
                        pending.push(PendingUpload {
                            key: chunk_ref.object_key.clone(),
                            data: Bytes::from(stored),
                        });
                    }
                    dedup.register(chunk_ref.clone());
                    chunks.push(chunk_ref);
                }

                if pending.len() >= flush_count || pending_bytes >= MAX_PENDING_BYTES {
                    uploaded_bytes += self.flush(&mut pending, cancel).await?;
                    pending_bytes = 0;
                }
                if !full {
                    break;
                }
            }
            if vanished {
                debug!(path = %entry.path, "file vanished while it was read");
                continue;
            }

            files.push(FileRecord {
                path: entry.path,
                size,
                mode: entry.mode,
                modified: entry.modified,
                chunks,
            });
        }
        uploaded_bytes += self.flush(&mut pending, cancel).await?;

        let manifest = SnapshotManifest {
            id: Uuid::new_v4(),
            association_id: source.association_id,
            base_manifest_id: base.map(|b| b.id),
            source_instance: source.instance_ref.to_string(),
            created_at: self.clock.now(),
            total_size: files.iter().map(|f| f.size).sum(),
            stored_size: files
                .iter()
                .flat_map(|f| f.chunks.iter())
                .map(|c| c.compressed_size)
                .sum(),
            files,
            uploaded_bytes,
        };

        // single commit point: everything above is invisible until this succeeds
        self.catalog.commit(&manifest)?;

        info!(
            manifest = %manifest.id,
            base = ?manifest.base_manifest_id,
            files = manifest.files.len(),
            reused_files,
            uploaded_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "snapshot committed"
        );
        Ok(manifest)
    }

    /// Upload queued chunks, skipping keys the store already holds
    async fn flush(&self, pending: &mut Vec<PendingUpload>, cancel: &CancelToken) -> Result<u64> {
        if pending.is_empty() {
            return Ok(0);
        }

        let batch = std::mem::take(pending);
        let store = &self.store;
        let results = self
            .pool
            .run_all(batch, cancel, |upload| async move {
                if store.head(&upload.key).await? {
                    return Ok(0u64);
                }
                let len = upload.data.len() as u64;
                store.put(&upload.key, upload.data).await?;
                Ok(len)
            })
            .await;

        let mut uploaded = 0u64;
        for result in results {
            uploaded += result?;
        }
        Ok(uploaded)
    }

    /// Restore a manifest into `target`
    ///
    /// A file whose chunks fail verification or cannot be found is reported
    /// in the result; the remaining files are still restored.
    pub async fn restore(
        &self,
        manifest_id: Uuid,
        target: &dyn InstanceFs,
        cancel: &CancelToken,
    ) -> Result<RestoreResult> {
        let manifest = self.catalog.get(manifest_id)?;
        let mut chain = vec![manifest];
        match self.catalog.ancestors(manifest_id) {
            Ok(ancestors) => chain.extend(ancestors),
            Err(e) => warn!(manifest = %manifest_id, "ancestor chain unavailable: {}", e),
        }
        let chain = &chain;

        // each file keeps up to RESTORE_WINDOW transfers in flight
        let file_parallelism = (self.pool.max_concurrent() / RESTORE_WINDOW).max(1);
        let restores: Vec<_> = chain[0]
            .files
            .iter()
            .map(|record| self.restore_file(record, chain, target, cancel))
            .collect();
        let outcomes: Vec<FileOutcome> = stream::iter(restores)
            .buffer_unordered(file_parallelism)
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut result = RestoreResult {
            manifest_id,
            status: RestoreStatus::Complete,
            files_restored: 0,
            bytes_restored: 0,
            chunks_from_ancestors: 0,
            failed: Vec::new(),
        };
        for outcome in outcomes {
            match outcome {
                FileOutcome::Restored {
                    bytes,
                    from_ancestors,
                } => {
                    result.files_restored += 1;
                    result.bytes_restored += bytes;
                    result.chunks_from_ancestors += from_ancestors;
                }
                FileOutcome::Failed(failed) => result.failed.push(failed),
                FileOutcome::Skipped => {}
            }
        }
        result.failed.sort_by(|a, b| a.path.cmp(&b.path));

        result.status = if result.failed.is_empty() {
            RestoreStatus::Complete
        } else if result.files_restored > 0 {
            RestoreStatus::Partial
        } else {
            RestoreStatus::Failed
        };

        info!(
            manifest = %manifest_id,
            status = ?result.status,
            restored = result.files_restored,
            failed = result.failed.len(),
            bytes = result.bytes_restored,
            "restore finished"
        );
        Ok(result)
    }

    async fn restore_file(
        &self,
        record: &FileRecord,
        chain: &[SnapshotManifest],
        target: &dyn InstanceFs,
        cancel: &CancelToken,
    ) -> FileOutcome {
        if cancel.is_cancelled() {
            return FileOutcome::Skipped;
        }

        let stage = new_stage();
        match self.stream_into(record, chain, target, &stage, cancel).await {
            Ok(from_ancestors) => FileOutcome::Restored {
                bytes: record.size,
                from_ancestors,
            },
            Err(e) => {
                if let Err(discard) = target.discard_staged(&record.path, &stage).await {
                    debug!(path = %record.path, "staged copy not discarded: {}", discard);
                }
                if matches!(e, Error::Cancelled) {
                    return FileOutcome::Skipped;
                }
                warn!(path = %record.path, "restore of file failed: {}", e);
                FileOutcome::Failed(FailedFile {
                    path: record.path.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Fetch and verify the chunks of one file a window at a time, append
    /// them to a staged copy and commit it once the size checks out
    ///
    /// Returns how many chunks came from an ancestor's copy.
    async fn stream_into(
        &self,
        record: &FileRecord,
        chain: &[SnapshotManifest],
        target: &dyn InstanceFs,
        stage: &str,
        cancel: &CancelToken,
    ) -> Result<usize> {
        let store = &self.store;
        let mut written = 0u64;
        let mut from_ancestors = 0;

        for window in record.chunks.chunks(RESTORE_WINDOW) {
            let pieces = self
                .pool
                .run_all(window.to_vec(), cancel, |chunk_ref| async move {
                    fetch_chunk(store.as_ref(), chain, &chunk_ref).await
                })
                .await;

            for (chunk_ref, piece) in window.iter().zip(pieces) {
                let (bytes, from_ancestor) = piece.map_err(|e| match e {
                    Error::SnapshotIntegrity { reason, .. } => Error::SnapshotIntegrity {
                        path: record.path.clone(),
                        reason,
                    },
                    other => other,
                })?;
                if chunk_ref.offset != written {
                    return Err(Error::SnapshotIntegrity {
                        path: record.path.clone(),
                        reason: format!("chunk at offset {} out of sequence", chunk_ref.offset),
                    });
                }
                written += bytes.len() as u64;
                target
                    .append_staged(&record.path, stage, Bytes::from(bytes))
                    .await?;
                if from_ancestor {
                    from_ancestors += 1;
                }
            }
        }

        if written != record.size {
            return Err(Error::SnapshotIntegrity {
                path: record.path.clone(),
                reason: format!("expected {} bytes, assembled {}", record.size, written),
            });
        }

        target.commit_staged(&record.path, stage, record.meta()).await?;
        Ok(from_ancestors)
    }

    /// Base for the next snapshot when `latest` is the newest one
    ///
    /// Once the chain ending at `latest` holds `max_snapshots` manifests
    /// the next snapshot is full, so pruning can release the old chain.
    pub fn choose_base(
        &self,
        latest: Option<SnapshotManifest>,
    ) -> Result<Option<SnapshotManifest>> {
        let Some(latest) = latest else {
            return Ok(None);
        };
        if self.config.max_snapshots == 0 {
            return Ok(Some(latest));
        }

        let depth = match self.catalog.ancestors(latest.id) {
            Ok(ancestors) => 1 + ancestors.len(),
            Err(e) => {
                warn!(manifest = %latest.id, "ancestor chain unavailable, taking a full snapshot: {}", e);
                return Ok(None);
            }
        };
        if depth >= self.config.max_snapshots {
            debug!(manifest = %latest.id, depth, "chain at retention limit, taking a full snapshot");
            return Ok(None);
        }
        Ok(Some(latest))
    }

    /// Drop manifests beyond the retention count, then collect garbage
    pub async fn prune(&self, association_id: Option<Uuid>) -> Result<usize> {
        let removed = self
            .catalog
            .prune(association_id, self.config.max_snapshots)?;
        if removed.is_empty() {
            return Ok(0);
        }
        self.collect_garbage().await
    }

    /// Delete objects no stored manifest references
    pub async fn collect_garbage(&self) -> Result<usize> {
        let _guard = self.gc_lock.write().await;
        let referenced = self.catalog.referenced_keys()?;

        let mut removed = 0;
        for key in self.store.list().await? {
            if !referenced.contains(&key) {
                self.store.delete(&key).await?;
                removed += 1;
            }
        }

        info!(removed, retained = referenced.len(), "garbage collection finished");
        Ok(removed)
    }
}

/// Read one chunk, falling back to copies recorded along the manifest chain
async fn fetch_chunk(
    store: &dyn ObjectStore,
    chain: &[SnapshotManifest],
    chunk_ref: &ChunkRef,
) -> Result<(Vec<u8>, bool)> {
    if let Some(stored) = store.get(&chunk_ref.object_key).await? {
        return Ok((chunk::decode(chunk_ref, &stored)?, false));
    }

    for manifest in chain {
        if let Some(copy) = manifest.find_copy(&chunk_ref.content_hash, &chunk_ref.object_key) {
            if let Some(stored) = store.get(&copy.object_key).await? {
                debug!(
                    missing = %chunk_ref.object_key,
                    found = %copy.object_key,
                    manifest = %manifest.id,
                    "chunk resolved through manifest chain"
                );
                return Ok((chunk::decode(copy, &stored)?, true));
            }
        }
    }

    Err(Error::ChunkNotFound(chunk_ref.object_key.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fs::MemoryFs;
    use crate::store::MemoryObjectStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct Harness {
        store: Arc<MemoryObjectStore>,
        catalog: ManifestCatalog,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new() -> Self {
            let db = sled::Config::new().temporary(true).open().unwrap();
            Harness {
                store: Arc::new(MemoryObjectStore::new()),
                catalog: ManifestCatalog::open(&db).unwrap(),
                clock: Arc::new(ManualClock::new()),
            }
        }

        fn pipeline(&self, config: SnapshotConfig) -> SnapshotPipeline {
            self.pipeline_with_store(config, self.store.clone())
        }

        fn pipeline_with_store(
            &self,
            config: SnapshotConfig,
            store: Arc<dyn ObjectStore>,
        ) -> SnapshotPipeline {
            let pool = Arc::new(TransferPool::new(&config, self.clock.clone()));
            SnapshotPipeline::new(
                store,
                self.catalog.clone(),
                pool,
                &config,
                ExclusionSet::new(&[".git"]).unwrap(),
                self.clock.clone(),
            )
        }
    }

    fn small_chunks() -> SnapshotConfig {
        SnapshotConfig {
            chunk_size: 1024,
            max_concurrent_transfers: 8,
            retry_attempts: 0,
            ..SnapshotConfig::default()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn pseudo_random(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    fn source<'a>(fs: &'a MemoryFs) -> SnapshotSource<'a> {
        SnapshotSource {
            fs,
            instance_ref: "backup-1",
            association_id: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip_is_byte_identical() {
        let harness = Harness::new();
        let pipeline = harness.pipeline(small_chunks());

        let tree = MemoryFs::new();
        tree.insert("empty", Bytes::new(), at(1));
        tree.insert("small.txt", b"hello".to_vec(), at(2));
        tree.insert("data/big.bin", pseudo_random(5000, 7), at(3));
        tree.insert("data/zeros.bin", vec![0u8; 4096], at(4));
        tree.insert_with_mode(
            "bin/run.sh",
            b"#!/bin/sh\nexec python train.py\n".to_vec(),
            crate::fs::FileMeta {
                mode: 0o755,
                modified: at(5),
            },
        );

        let manifest = pipeline.create(source(&tree), None, &CancelToken::new()).await.unwrap();
        assert!(manifest.is_full());
        assert_eq!(manifest.file("data/big.bin").unwrap().chunks.len(), 5);

        let target = MemoryFs::new();
        let result = pipeline
            .restore(manifest.id, &target, &CancelToken::new())
            .await
            .unwrap();

        assert!(result.is_complete());
        assert_eq!(result.files_restored, 5);
        assert_eq!(target.snapshot(), tree.snapshot());
    }

    #[tokio::test]
    async fn test_excluded_paths_are_skipped() {
        let harness = Harness::new();
        let pipeline = harness.pipeline(small_chunks());
        let tree = MemoryFs::new();
        tree.insert(".git/HEAD", b"ref: refs/heads/main".to_vec(), at(1));
        tree.insert("model.pt", b"weights".to_vec(), at(1));

        let manifest = pipeline.create(source(&tree), None, &CancelToken::new()).await.unwrap();
        let paths: Vec<_> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["model.pt"]);
    }

    #[tokio::test]
    async fn test_incremental_uploads_only_changed_bytes() {
        let harness = Harness::new();
        let pipeline = harness.pipeline(SnapshotConfig {
            compression_enabled: false,
            ..small_chunks()
        });
        let tree = MemoryFs::new();
        for i in 0..20 {
            tree.insert(&format!("shard-{:02}.bin", i), pseudo_random(4096, i), at(100));
        }

        let full = pipeline.create(source(&tree), None, &CancelToken::new()).await.unwrap();
        let full_upload = harness.store.bytes_written();
        assert_eq!(full.uploaded_bytes as usize, full_upload);
        let reads_after_full = tree.read_count();

        // rewrite two files; one keeps its first chunk
        let mut changed = pseudo_random(4096, 3);
        changed[3000] ^= 0xff;
        tree.insert("shard-03.bin", changed, at(200));
        tree.insert("shard-11.bin", pseudo_random(4096, 999), at(200));

        let incremental = pipeline
            .create(source(&tree), Some(&full), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(incremental.base_manifest_id, Some(full.id));
        // four chunks and the end-of-file read for each changed file
        assert_eq!(tree.read_count() - reads_after_full, 10);
        // one changed chunk of shard-03 plus four of shard-11
        assert_eq!(incremental.uploaded_bytes, 5 * 1024);
        assert!(incremental.uploaded_bytes < full.uploaded_bytes / 4);

        let target = MemoryFs::new();
        let result = pipeline
            .restore(incremental.id, &target, &CancelToken::new())
            .await
            .unwrap();
        assert!(result.is_complete());
        assert_eq!(target.snapshot(), tree.snapshot());
    }

    #[tokio::test]
    async fn test_corrupted_chunk_fails_only_its_file() {
        let harness = Harness::new();
        let pipeline = harness.pipeline(small_chunks());
        let tree = MemoryFs::new();
        for i in 0..10 {
            tree.insert(&format!("part-{}.bin", i), pseudo_random(900, 100 + i), at(10));
        }

        let manifest = pipeline.create(source(&tree), None, &CancelToken::new()).await.unwrap();
        assert_eq!(manifest.chunk_count(), 10);

        let victim = manifest.file("part-4.bin").unwrap().chunks[0].object_key.clone();
        assert!(harness.store.corrupt(&victim));

        let target = MemoryFs::new();
        let result = pipeline
            .restore(manifest.id, &target, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RestoreStatus::Partial);
        assert_eq!(result.files_restored, 9);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].path, "part-4.bin");
        assert!(target.contents("part-4.bin").is_none());
        assert_eq!(target.open_stages(), 0);
        assert_eq!(target.contents("part-5.bin"), tree.contents("part-5.bin"));
    }

    #[tokio::test]
    async fn test_missing_chunk_resolved_from_ancestor_copy() {
        let harness = Harness::new();
        let raw = harness.pipeline(SnapshotConfig {
            compression_enabled: false,
            ..small_chunks()
        });
        let compressed = harness.pipeline(small_chunks());

        let tree = MemoryFs::new();
        let payload = vec![b'a'; 800];
        tree.insert("config.yaml", payload.clone(), at(1));
        tree.insert("keep.txt", b"stable".to_vec(), at(1));
        let full = raw.create(source(&tree), None, &CancelToken::new()).await.unwrap();

        tree.delete("config.yaml");
        let inc1 = raw
            .create(source(&tree), Some(&full), &CancelToken::new())
            .await
            .unwrap();

        tree.insert("config.yaml", payload.clone(), at(3));
        let inc2 = compressed
            .create(source(&tree), Some(&inc1), &CancelToken::new())
            .await
            .unwrap();

        let new_ref = &inc2.file("config.yaml").unwrap().chunks[0];
        let old_ref = &full.file("config.yaml").unwrap().chunks[0];
        assert!(new_ref.compressed);
        assert_ne!(new_ref.object_key, old_ref.object_key);
        assert!(harness.store.lose(&new_ref.object_key));

        let target = MemoryFs::new();
        let result = compressed
            .restore(inc2.id, &target, &CancelToken::new())
            .await
            .unwrap();

        assert!(result.is_complete());
        assert_eq!(result.chunks_from_ancestors, 1);
        assert_eq!(target.contents("config.yaml").unwrap(), Bytes::from(payload));
    }

    #[tokio::test]
    async fn test_unresolvable_chunk_reports_file() {
        let harness = Harness::new();
        let pipeline = harness.pipeline(small_chunks());
        let tree = MemoryFs::new();
        tree.insert("a.bin", pseudo_random(100, 1), at(1));
        tree.insert("b.bin", pseudo_random(100, 2), at(1));
        let manifest = pipeline.create(source(&tree), None, &CancelToken::new()).await.unwrap();

        harness
            .store
            .lose(&manifest.file("a.bin").unwrap().chunks[0].object_key);
        harness
            .store
            .lose(&manifest.file("b.bin").unwrap().chunks[0].object_key);

        let result = pipeline
            .restore(manifest.id, &MemoryFs::new(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, RestoreStatus::Failed);
        assert_eq!(result.failed.len(), 2);
        assert!(result.failed[0].reason.contains("Chunk not found"));
    }

    struct RefusingStore;

    #[async_trait]
    impl ObjectStore for RefusingStore {
        async fn put(&self, _key: &str, _data: Bytes) -> Result<()> {
            Err(Error::PermanentProvider("bucket is read-only".into()))
        }
        async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
            Ok(None)
        }
        async fn head(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn list(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_failed_upload_commits_nothing() {
        let harness = Harness::new();
        let pipeline = harness.pipeline_with_store(small_chunks(), Arc::new(RefusingStore));
        let tree = MemoryFs::new();
        tree.insert("a.bin", pseudo_random(3000, 1), at(1));

        let err = pipeline
            .create(source(&tree), None, &CancelToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PermanentProvider(_)));
        assert!(harness.catalog.list_for(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_create_commits_nothing() {
        let harness = Harness::new();
        let pipeline = harness.pipeline(small_chunks());
        let tree = MemoryFs::new();
        tree.insert("a.bin", pseudo_random(3000, 1), at(1));
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = pipeline.create(source(&tree), None, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(harness.catalog.list_for(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_collects_unreferenced_objects() {
        let harness = Harness::new();
        let pipeline = harness.pipeline(SnapshotConfig {
            max_snapshots: 1,
            ..small_chunks()
        });
        let tree = MemoryFs::new();
        tree.insert("a.bin", pseudo_random(500, 1), at(1));
        let first = pipeline.create(source(&tree), None, &CancelToken::new()).await.unwrap();

        tree.insert("a.bin", pseudo_random(500, 2), at(2));
        let second = pipeline.create(source(&tree), None, &CancelToken::new()).await.unwrap();
        assert_eq!(harness.store.len(), 2);

        let removed = pipeline.prune(None).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(harness.store.len(), 1);
        assert!(harness.catalog.get(first.id).is_err());
        assert!(harness.catalog.get(second.id).is_ok());
    }

    #[tokio::test]
    async fn test_restore_streams_chunk_sized_pieces() {
        let harness = Harness::new();
        let pipeline = harness.pipeline(small_chunks());
        let tree = MemoryFs::new();
        tree.insert("checkpoint.bin", pseudo_random(10 * 1024 + 5, 42), at(1));

        let manifest = pipeline.create(source(&tree), None, &CancelToken::new()).await.unwrap();
        assert_eq!(tree.largest_read(), 1024);

        let target = MemoryFs::new();
        let result = pipeline
            .restore(manifest.id, &target, &CancelToken::new())
            .await
            .unwrap();

        assert!(result.is_complete());
        assert_eq!(target.largest_append(), 1024);
        assert_eq!(target.open_stages(), 0);
        assert_eq!(target.contents("checkpoint.bin"), tree.contents("checkpoint.bin"));
    }

    #[tokio::test]
    async fn test_full_snapshot_taken_at_retention_limit() {
        let harness = Harness::new();
        let pipeline = harness.pipeline(SnapshotConfig {
            max_snapshots: 2,
            compression_enabled: false,
            ..small_chunks()
        });
        let tree = MemoryFs::new();

        let mut taken = Vec::new();
        for i in 0..6u32 {
            tree.insert("model.pt", pseudo_random(2048, i), at(i as i64 + 1));
            let latest = harness.catalog.latest_for(None).unwrap();
            let base = pipeline.choose_base(latest).unwrap();
            let manifest = pipeline
                .create(source(&tree), base.as_ref(), &CancelToken::new())
                .await
                .unwrap();
            taken.push(manifest);
        }
        let full: Vec<bool> = taken.iter().map(|m| m.is_full()).collect();
        assert_eq!(full, vec![true, false, true, false, true, false]);
        assert_eq!(harness.store.len(), 12);

        let removed = pipeline.prune(None).await.unwrap();
        assert_eq!(removed, 8);
        assert_eq!(harness.store.len(), 4);
        let kept: Vec<Uuid> = harness
            .catalog
            .list_for(None)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(kept, vec![taken[4].id, taken[5].id]);

        let target = MemoryFs::new();
        let result = pipeline
            .restore(taken[5].id, &target, &CancelToken::new())
            .await
            .unwrap();
        assert!(result.is_complete());
        assert_eq!(target.snapshot(), tree.snapshot());
    }

    #[tokio::test]
    async fn test_unlimited_retention_keeps_chaining() {
        let harness = Harness::new();
        let pipeline = harness.pipeline(SnapshotConfig {
            max_snapshots: 0,
            ..small_chunks()
        });
        let tree = MemoryFs::new();
        tree.insert("a.bin", pseudo_random(100, 1), at(1));
        let first = pipeline.create(source(&tree), None, &CancelToken::new()).await.unwrap();
        let second = pipeline
            .create(source(&tree), Some(&first), &CancelToken::new())
            .await
            .unwrap();

        let base = pipeline.choose_base(Some(second.clone())).unwrap();
        assert_eq!(base.map(|m| m.id), Some(second.id));
        assert!(pipeline.choose_base(None).unwrap().is_none());
    }
}
