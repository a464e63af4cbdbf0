//! Immutable manifest table
//!
//! Manifests are inserted once and never rewritten. Retention removes whole
//! rows, and only rows no retained manifest depends on through its base chain.

use super::SnapshotManifest;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

const MANIFESTS_TREE: &str = "manifests";
const INDEX_TREE: &str = "manifests_by_association";

/// sled-backed manifest store
///
/// The per-association index is keyed by owner plus a monotonic sequence
/// number, so listing order is commit order.
#[derive(Clone)]
pub struct ManifestCatalog {
    db: sled::Db,
    manifests: sled::Tree,
    index: sled::Tree,
}

fn index_key(owner: Uuid, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(owner.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn parse_id(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

impl ManifestCatalog {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(ManifestCatalog {
            db: db.clone(),
            manifests: db.open_tree(MANIFESTS_TREE)?,
            index: db.open_tree(INDEX_TREE)?,
        })
    }

    /// Insert a manifest; committing the same id twice is an error
    pub fn commit(&self, manifest: &SnapshotManifest) -> Result<()> {
        let bytes = bincode::serialize(manifest)?;
        self.manifests
            .compare_and_swap(manifest.id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
            .map_err(|_| Error::Internal(format!("manifest {} already committed", manifest.id)))?;
        let owner = manifest.association_id.unwrap_or_else(Uuid::nil);
        let seq = self.db.generate_id()?;
        self.index
            .insert(index_key(owner, seq), manifest.id.as_bytes().to_vec())?;
        self.manifests.flush()?;
        debug!(manifest = %manifest.id, files = manifest.files.len(), "manifest committed");
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<SnapshotManifest> {
        let bytes = self
            .manifests
            .get(id.as_bytes())?
            .ok_or(Error::ManifestNotFound(id))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn contains(&self, id: Uuid) -> Result<bool> {
        Ok(self.manifests.contains_key(id.as_bytes())?)
    }

    /// Manifests of one association, oldest first
    pub fn list_for(&self, association_id: Option<Uuid>) -> Result<Vec<SnapshotManifest>> {
        let owner = association_id.unwrap_or_else(Uuid::nil);
        let mut manifests = Vec::new();
        for entry in self.index.scan_prefix(owner.as_bytes()) {
            let (_, value) = entry?;
            manifests.push(self.get(parse_id(&value)?)?);
        }
        Ok(manifests)
    }

    pub fn latest_for(&self, association_id: Option<Uuid>) -> Result<Option<SnapshotManifest>> {
        Ok(self.list_for(association_id)?.pop())
    }

    /// Base chain of a manifest, nearest ancestor first
    pub fn ancestors(&self, id: Uuid) -> Result<Vec<SnapshotManifest>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut next = self.get(id)?.base_manifest_id;

        while let Some(base_id) = next {
            if !seen.insert(base_id) {
                return Err(Error::Internal(format!("manifest chain cycle at {}", base_id)));
            }
            let base = self.get(base_id)?;
            next = base.base_manifest_id;
            chain.push(base);
        }

        Ok(chain)
    }

    /// Keep the newest `keep` manifests of an association plus every
    /// ancestor they depend on; delete the rest. Returns removed ids.
    pub fn prune(&self, association_id: Option<Uuid>, keep: usize) -> Result<Vec<Uuid>> {
        if keep == 0 {
            return Ok(Vec::new());
        }

        let all = self.list_for(association_id)?;
        if all.len() <= keep {
            return Ok(Vec::new());
        }

        let by_id: HashMap<Uuid, &SnapshotManifest> = all.iter().map(|m| (m.id, m)).collect();
        let mut retained = HashSet::new();
        for manifest in all.iter().rev().take(keep) {
            let mut cursor = Some(manifest.id);
            while let Some(id) = cursor {
                if !retained.insert(id) {
                    break;
                }
                cursor = by_id.get(&id).and_then(|m| m.base_manifest_id);
            }
        }

        let owner = association_id.unwrap_or_else(Uuid::nil);
        let mut removed = Vec::new();
        for entry in self.index.scan_prefix(owner.as_bytes()) {
            let (key, value) = entry?;
            let id = parse_id(&value)?;
            if retained.contains(&id) {
                continue;
            }
            self.index.remove(key)?;
            self.manifests.remove(id.as_bytes())?;
            removed.push(id);
        }

        if !removed.is_empty() {
            info!(
                association = ?association_id,
                removed = removed.len(),
                retained = retained.len(),
                "pruned manifests"
            );
        }
        Ok(removed)
    }

    /// Object keys referenced by any stored manifest
    pub fn referenced_keys(&self) -> Result<HashSet<String>> {
        let mut keys = HashSet::new();
        for entry in self.manifests.iter() {
            let (_, bytes) = entry?;
            let manifest: SnapshotManifest = bincode::deserialize(&bytes)?;
            keys.extend(manifest.chunk_list().map(|c| c.object_key.clone()));
        }
        Ok(keys)
    }
}
