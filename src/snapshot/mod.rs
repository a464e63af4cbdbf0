//! Snapshot management
//!
//! Content-addressed, incremental snapshots of an instance tree. Manifests
//! live in sled and are never rewritten; chunk bytes live in an
//! [`ObjectStore`](crate::store::ObjectStore).

mod catalog;
mod manifest;
mod pipeline;

pub use catalog::ManifestCatalog;
pub use manifest::{FileRecord, SnapshotManifest};
pub use pipeline::{FailedFile, RestoreResult, RestoreStatus, SnapshotPipeline, SnapshotSource};
