//! Association events for the access layer
//!
//! Events are fanned out on a tokio broadcast channel. Nothing in the core
//! waits on a subscriber; a lagging or absent subscriber only loses events.

use crate::association::AssociationState;
use crate::provider::Instance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Where a recovered primary got its data from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RestoreSource {
    /// Copied from the backup's live filesystem
    LiveBackup { files: usize, bytes: u64 },
    /// Restored from a stored manifest
    Manifest { manifest_id: Uuid },
    /// Nothing to restore: no data was ever replicated or snapshotted
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StandbyEvent {
    StateChanged {
        association_id: Uuid,
        from: AssociationState,
        to: AssociationState,
        at: DateTime<Utc>,
    },
    /// The backup is now the active endpoint; sessions should be redirected
    FailoverOccurred {
        association_id: Uuid,
        failed_primary: String,
        active: Instance,
        at: DateTime<Utc>,
    },
    RecoveryStarted {
        association_id: Uuid,
        at: DateTime<Utc>,
    },
    RecoveryAttemptFailed {
        association_id: Uuid,
        attempt: u32,
        error: String,
    },
    RecoveryCompleted {
        association_id: Uuid,
        new_primary: Instance,
        source: RestoreSource,
        attempts: u32,
    },
    RecoveryExhausted {
        association_id: Uuid,
        attempts: u32,
        reason: String,
    },
    SnapshotCommitted {
        association_id: Uuid,
        manifest_id: Uuid,
        uploaded_bytes: u64,
    },
    SyncCompleted {
        association_id: Uuid,
        files_copied: usize,
        bytes_copied: u64,
        at: DateTime<Utc>,
    },
}

impl StandbyEvent {
    pub fn association_id(&self) -> Uuid {
        match self {
            StandbyEvent::StateChanged { association_id, .. }
            | StandbyEvent::FailoverOccurred { association_id, .. }
            | StandbyEvent::RecoveryStarted { association_id, .. }
            | StandbyEvent::RecoveryAttemptFailed { association_id, .. }
            | StandbyEvent::RecoveryCompleted { association_id, .. }
            | StandbyEvent::RecoveryExhausted { association_id, .. }
            | StandbyEvent::SnapshotCommitted { association_id, .. }
            | StandbyEvent::SyncCompleted { association_id, .. } => *association_id,
        }
    }
}

/// Cloneable sending side of the event channel
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StandbyEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StandbyEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: StandbyEvent) {
        trace!(?event, "emitting event");
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        bus.emit(StandbyEvent::RecoveryStarted {
            association_id: id,
            at: Utc::now(),
        });

        let mut rx = bus.subscribe();
        bus.emit(StandbyEvent::RecoveryAttemptFailed {
            association_id: id,
            attempt: 1,
            error: "no capacity".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.association_id(), id);
        assert!(matches!(event, StandbyEvent::RecoveryAttemptFailed { attempt: 1, .. }));
    }
}
