//! Directory-backed object store
//!
//! Objects live at `{root}/{key[0..2]}/{key}`. Writes go to a unique
//! temporary file that is renamed into place, so a reader never sees a
//! partially written object.

use super::ObjectStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(FileObjectStore { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.len() < 3 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Internal(format!("invalid object key {:?}", key)));
        }
        Ok(self.root.join(&key[0..2]).join(key))
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.object_path(key)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp_path, &data).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(key, size = data.len(), "stored object to file");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut fanout = tokio::fs::read_dir(&self.root).await?;
        while let Some(dir) = fanout.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                // temp files carry an extension
                if !name.contains('.') {
                    keys.push(name);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::content_hash;

    #[tokio::test]
    async fn test_put_get_head() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::open(dir.path()).unwrap();
        let key = content_hash(b"object body");

        assert!(!store.head(&key).await.unwrap());
        store.put(&key, Bytes::from_static(b"object body")).await.unwrap();
        store.put(&key, Bytes::from_static(b"object body")).await.unwrap();

        assert!(store.head(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().unwrap(), Bytes::from_static(b"object body"));
        assert_eq!(store.list().await.unwrap(), vec![key.clone()]);

        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::open(dir.path()).unwrap();
        assert!(store.get("../etc/passwd").await.is_err());
    }
}
