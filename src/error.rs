//! Error types for spotstandby
//!
//! The first block of variants mirrors how failures are handled by the
//! orchestrator: transient provider errors are retried, permanent ones are
//! surfaced, sync and snapshot errors stay local to one run or one file, and
//! recovery exhaustion becomes durable association status.

use thiserror::Error;
use uuid::Uuid;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    /// Provider call failed but may succeed if retried
    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    /// Provider refused the request; operator action required
    #[error("Permanent provider error: {0}")]
    PermanentProvider(String),

    /// Some entries of a sync run failed; retried on the next tick
    #[error("Sync partially failed: {failed} of {total} entries")]
    SyncPartialFailure { failed: usize, total: usize },

    /// Liveness probe did not answer in time
    #[error("Health probe timed out after {0} ms")]
    HealthProbeTimeout(u64),

    /// Chunk content did not match its recorded hash
    #[error("Snapshot integrity error for {path}: {reason}")]
    SnapshotIntegrity { path: String, reason: String },

    /// Recovery retries were used up
    #[error("Recovery exhausted after {attempts} attempts: {reason}")]
    RecoveryExhausted { attempts: u32, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Association not found: {0}")]
    AssociationNotFound(Uuid),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Manifest not found: {0}")]
    ManifestNotFound(Uuid),

    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Association {0} can only be destroyed by explicit user action")]
    DestroyRefused(Uuid),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry loop may try the failed operation again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientProvider(_)
                | Error::HealthProbeTimeout(_)
                | Error::SyncPartialFailure { .. }
                | Error::Io(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::TransientProvider("capacity".into()).is_transient());
        assert!(Error::HealthProbeTimeout(3000).is_transient());
        assert!(!Error::PermanentProvider("quota".into()).is_transient());
        assert!(!Error::RecoveryExhausted {
            attempts: 3,
            reason: "no capacity".into()
        }
        .is_transient());
    }

    #[test]
    fn test_display() {
        let err = Error::SyncPartialFailure { failed: 2, total: 10 };
        assert_eq!(err.to_string(), "Sync partially failed: 2 of 10 entries");
    }
}
