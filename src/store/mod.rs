//! Content-addressed object storage
//!
//! Every key is the BLAKE3 hash of the stored bytes, so writers from
//! different associations can share one store: identical content lands on
//! the same key and different content never collides.

mod file;
mod memory;

pub use file::FileObjectStore;
pub use memory::MemoryObjectStore;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Content-addressed blob store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under their hash; writing an existing key is a no-op
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fetch bytes by hash, `None` when absent
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Whether a key is present
    async fn head(&self, key: &str) -> Result<bool>;

    /// Remove a key (garbage collection only)
    async fn delete(&self, key: &str) -> Result<()>;

    /// All stored keys
    async fn list(&self) -> Result<Vec<String>>;
}
