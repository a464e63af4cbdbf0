//! In-memory object store

use super::ObjectStore;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// In-memory object store backed by a `RwLock<HashMap>`
///
/// Counts puts so tests can assert how many bytes a snapshot moved, and
/// exposes hooks to corrupt or drop objects.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Bytes>>,
    puts: AtomicUsize,
    bytes_written: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of puts that stored new content
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Bytes stored by puts of new content
    pub fn bytes_written(&self) -> usize {
        self.bytes_written.load(Ordering::SeqCst)
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Overwrite an object in place, bypassing content addressing
    pub fn corrupt(&self, key: &str) -> bool {
        let mut objects = self.objects.write();
        match objects.get_mut(key) {
            Some(data) => {
                let mut bytes = data.to_vec();
                if let Some(first) = bytes.first_mut() {
                    *first ^= 0xff;
                } else {
                    bytes.push(0xff);
                }
                *data = Bytes::from(bytes);
                true
            }
            None => false,
        }
    }

    /// Drop an object without going through garbage collection
    pub fn lose(&self, key: &str) -> bool {
        self.objects.write().remove(key).is_some()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let mut objects = self.objects.write();
        if objects.contains_key(key) {
            return Ok(());
        }
        debug!(key, size = data.len(), "storing object in memory");
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
        objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn head(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_put_is_deduplicated() {
        let store = MemoryObjectStore::new();
        store.put("abcd", Bytes::from_static(b"x")).await.unwrap();
        store.put("abcd", Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(store.put_count(), 1);
        assert!(store.head("abcd").await.unwrap());
        assert!(!store.head("ffff").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_and_lose() {
        let store = MemoryObjectStore::new();
        store.put("k", Bytes::from_static(b"hello")).await.unwrap();

        assert!(store.corrupt("k"));
        assert_ne!(store.get("k").await.unwrap().unwrap(), Bytes::from_static(b"hello"));

        assert!(store.lose("k"));
        assert!(store.get("k").await.unwrap().is_none());
    }
}
