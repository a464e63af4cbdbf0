//! Live primary to backup replication
//!
//! The engine keeps the backup's filesystem a recent mirror of the primary,
//! either on a fixed interval or driven by change notifications. Sync
//! failures are recorded in [`SyncStatus`] and retried on the next tick;
//! they never touch association health.

mod engine;
mod mirror;
mod status;

pub use engine::{Endpoints, ReplicationEngine, TriggerOutcome};
pub use mirror::{sync, SyncReport};
pub use status::SyncStatus;
