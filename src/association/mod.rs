//! Primary/backup associations
//!
//! An [`Association`] is the single source of truth for one managed pair.
//! Its state only changes through [`Association::transition`], which
//! enforces the legal transition table.

mod table;

pub use table::AssociationTable;

pub use crate::config::SyncMode;

use crate::error::{Error, Result};
use crate::health::HealthSummary;
use crate::provider::{Instance, InstanceRole};
use crate::replication::SyncStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of an association
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AssociationState {
    /// Backup created, first sync not yet done
    Provisioning,
    /// Steady state
    Syncing,
    /// Sub-threshold probe failures; behaves like `Syncing`
    Degraded,
    /// Backup is the active endpoint, replication frozen
    FailedOver,
    /// Replacement primary being provisioned and restored
    Recovering,
    /// Terminal, explicit user action only
    Destroyed,
}

impl AssociationState {
    pub fn can_transition_to(self, to: AssociationState) -> bool {
        use AssociationState::*;
        match (self, to) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Provisioning, Syncing) | (Provisioning, FailedOver) => true,
            (Syncing, Degraded) | (Syncing, FailedOver) => true,
            (Degraded, Syncing) | (Degraded, FailedOver) => true,
            (FailedOver, Recovering) => true,
            (Recovering, Syncing) | (Recovering, FailedOver) => true,
            _ => false,
        }
    }

    /// The primary is not serving normally
    pub fn is_degraded(self) -> bool {
        matches!(
            self,
            AssociationState::Degraded | AssociationState::FailedOver | AssociationState::Recovering
        )
    }

    pub fn is_terminal(self) -> bool {
        self == AssociationState::Destroyed
    }
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssociationState::Provisioning => "PROVISIONING",
            AssociationState::Syncing => "SYNCING",
            AssociationState::Degraded => "DEGRADED",
            AssociationState::FailedOver => "FAILED_OVER",
            AssociationState::Recovering => "RECOVERING",
            AssociationState::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlertKind {
    RecoveryExhausted,
}

/// Persistent operator alert, cleared only by a completed recovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DestroyReason {
    User,
    Failure,
}

/// Options for a new association
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssociationConfig {
    /// Defaults to the replication config's mode
    pub sync_mode: Option<SyncMode>,
    /// Free-form region hint for the backup, resolved against the
    /// provider's regions; defaults to the primary's region
    pub region: Option<String>,
    /// Regions raced when provisioning a replacement primary
    pub candidate_regions: Vec<String>,
    pub machine_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Association {
    pub id: Uuid,
    pub primary: Instance,
    pub backup: Instance,
    pub active_endpoint: InstanceRole,
    pub state: AssociationState,
    pub sync_mode: SyncMode,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub region: String,
    pub candidate_regions: Vec<String>,
    pub machine_type: Option<String>,
    pub last_manifest_id: Option<Uuid>,
    pub alert: Option<Alert>,
    pub recovery_attempts: u32,
    pub destroy_reason: Option<DestroyReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Association {
    pub fn new(
        primary: Instance,
        backup: Instance,
        sync_mode: SyncMode,
        region: String,
        config: &AssociationConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Association {
            id: Uuid::new_v4(),
            primary,
            backup,
            active_endpoint: InstanceRole::Primary,
            state: AssociationState::Provisioning,
            sync_mode,
            last_sync_at: None,
            last_healthy_at: None,
            consecutive_failures: 0,
            region,
            candidate_regions: config.candidate_regions.clone(),
            machine_type: config.machine_type.clone(),
            last_manifest_id: None,
            alert: None,
            recovery_attempts: 0,
            destroy_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to` if the table allows it
    pub fn transition(&mut self, to: AssociationState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    /// Instance currently serving the workload
    pub fn active_instance(&self) -> &Instance {
        match self.active_endpoint {
            InstanceRole::Primary => &self.primary,
            InstanceRole::Backup => &self.backup,
        }
    }

    /// Regions to race when replacing the primary
    pub fn recovery_regions(&self) -> Vec<String> {
        if self.candidate_regions.is_empty() {
            vec![self.region.clone()]
        } else {
            self.candidate_regions.clone()
        }
    }
}

/// Read-only view of an association for the access layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssociationStatus {
    pub id: Uuid,
    pub state: AssociationState,
    /// Bounds possible data loss while degraded
    pub last_sync_at: Option<DateTime<Utc>>,
    pub region: String,
    pub health: HealthSummary,
    pub replication: SyncStatus,
    pub primary_id: String,
    pub backup_id: String,
    pub active_endpoint: Instance,
    pub alert: Option<Alert>,
    pub degraded: bool,
}

impl AssociationStatus {
    pub fn new(association: &Association, health: HealthSummary, replication: SyncStatus) -> Self {
        AssociationStatus {
            id: association.id,
            state: association.state,
            last_sync_at: association.last_sync_at,
            region: association.region.clone(),
            health,
            replication,
            primary_id: association.primary.id.clone(),
            backup_id: association.backup.id.clone(),
            active_endpoint: association.active_instance().clone(),
            alert: association.alert.clone(),
            degraded: association.state.is_degraded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InstanceStatus;
    use AssociationState::*;

    fn instance(id: &str, role: InstanceRole) -> Instance {
        Instance {
            id: id.to_string(),
            provider: "mem".into(),
            role,
            address: "10.0.0.2".into(),
            region: "us-east-1".into(),
            status: InstanceStatus::Running,
        }
    }

    #[test]
    fn test_transition_table() {
        assert!(Provisioning.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(FailedOver));
        assert!(FailedOver.can_transition_to(Recovering));
        assert!(Recovering.can_transition_to(Syncing));
        assert!(Recovering.can_transition_to(FailedOver));

        assert!(!FailedOver.can_transition_to(Syncing));
        assert!(!FailedOver.can_transition_to(FailedOver));
        assert!(!Syncing.can_transition_to(Recovering));
        assert!(!Destroyed.can_transition_to(Syncing));
        assert!(!Destroyed.can_transition_to(Destroyed));

        for state in [Provisioning, Syncing, Degraded, FailedOver, Recovering] {
            assert!(state.can_transition_to(Destroyed));
        }
    }

    #[test]
    fn test_transition_rejects_illegal_move() {
        let mut association = Association::new(
            instance("p", InstanceRole::Primary),
            instance("b", InstanceRole::Backup),
            SyncMode::Periodic,
            "us-east-1".into(),
            &AssociationConfig::default(),
            Utc::now(),
        );

        let err = association.transition(Recovering, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(err.to_string(), "Invalid state transition from PROVISIONING to RECOVERING");
        assert_eq!(association.state, Provisioning);

        association.transition(Syncing, Utc::now()).unwrap();
        assert_eq!(association.recovery_regions(), vec!["us-east-1".to_string()]);
        assert_eq!(association.active_instance().id, "p");
    }
}
