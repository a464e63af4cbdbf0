//! Association state machine
//!
//! Every state change of an association goes through the
//! [`FailoverController`], which validates it, persists the row and emits
//! the matching event. Callers serialize access per association by holding
//! its mutex while calling in.

use crate::association::{Association, AssociationState, AssociationTable, DestroyReason};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::events::{EventBus, StandbyEvent};
use crate::health::ProbeVerdict;
use crate::provider::InstanceRole;
use crate::replication::ReplicationEngine;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a health verdict did to the association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    None,
    /// Entered `DEGRADED`
    Degraded,
    /// Left `DEGRADED` for `SYNCING`
    Restored,
    /// Entered `FAILED_OVER`
    FailedOver,
    /// Already failed over; nothing changed
    AlreadyFailedOver,
}

pub struct FailoverController {
    table: AssociationTable,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl FailoverController {
    pub fn new(table: AssociationTable, events: EventBus, clock: Arc<dyn Clock>) -> Self {
        FailoverController {
            table,
            events,
            clock,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persist non-state changes
    pub fn save(&self, association: &mut Association) -> Result<()> {
        association.updated_at = self.clock.now();
        self.table.put(association)
    }

    /// Validated, persisted state change
    pub fn transition(&self, association: &mut Association, to: AssociationState) -> Result<()> {
        let from = association.state;
        let at = self.clock.now();
        association.transition(to, at)?;
        self.table.put(association)?;

        info!(association = %association.id, %from, %to, "state transition");
        self.events.emit(StandbyEvent::StateChanged {
            association_id: association.id,
            from,
            to,
            at,
        });
        Ok(())
    }

    /// Apply a health verdict
    pub async fn observe(
        &self,
        association: &mut Association,
        verdict: ProbeVerdict,
        engine: &ReplicationEngine,
    ) -> Result<FailoverAction> {
        if association.state.is_terminal() {
            return Ok(FailoverAction::None);
        }

        match verdict {
            ProbeVerdict::Healthy => {
                association.consecutive_failures = 0;
                association.last_healthy_at = Some(self.clock.now());
                if association.state == AssociationState::Degraded {
                    self.transition(association, AssociationState::Syncing)?;
                    return Ok(FailoverAction::Restored);
                }
                self.save(association)?;
                Ok(FailoverAction::None)
            }
            ProbeVerdict::Degraded {
                consecutive_failures,
            } => {
                association.consecutive_failures = consecutive_failures;
                if association.state == AssociationState::Syncing {
                    self.transition(association, AssociationState::Degraded)?;
                    return Ok(FailoverAction::Degraded);
                }
                self.save(association)?;
                Ok(FailoverAction::None)
            }
            ProbeVerdict::Stale => Ok(FailoverAction::None),
            ProbeVerdict::FailureDetected => {
                if self.fail_over(association, engine).await? {
                    Ok(FailoverAction::FailedOver)
                } else {
                    Ok(FailoverAction::AlreadyFailedOver)
                }
            }
            ProbeVerdict::Suppressed => match association.state {
                AssociationState::FailedOver | AssociationState::Recovering => {
                    Ok(FailoverAction::AlreadyFailedOver)
                }
                _ => Ok(FailoverAction::None),
            },
        }
    }

    /// Promote the backup; a no-op when already failed over
    ///
    /// Replication is stopped first, then the backup becomes the active
    /// endpoint, then `FailoverOccurred` is emitted.
    pub async fn fail_over(
        &self,
        association: &mut Association,
        engine: &ReplicationEngine,
    ) -> Result<bool> {
        match association.state {
            AssociationState::FailedOver | AssociationState::Recovering => {
                debug!(association = %association.id, "already failed over");
                return Ok(false);
            }
            AssociationState::Destroyed => {
                return Err(Error::InvalidTransition {
                    from: association.state.to_string(),
                    to: AssociationState::FailedOver.to_string(),
                });
            }
            _ => {}
        }

        engine.stop().await;
        association.active_endpoint = InstanceRole::Backup;
        self.transition(association, AssociationState::FailedOver)?;

        warn!(
            association = %association.id,
            failed_primary = %association.primary.id,
            active = %association.backup.id,
            last_sync = ?association.last_sync_at,
            "failed over to backup"
        );
        self.events.emit(StandbyEvent::FailoverOccurred {
            association_id: association.id,
            failed_primary: association.primary.id.clone(),
            active: association.backup.clone(),
            at: self.clock.now(),
        });
        Ok(true)
    }

    /// Record a successful sync; the first one leaves `PROVISIONING`
    pub fn mark_synced(&self, association: &mut Association, at: DateTime<Utc>) -> Result<bool> {
        association.last_sync_at = Some(at);
        if association.state == AssociationState::Provisioning {
            self.transition(association, AssociationState::Syncing)?;
            return Ok(true);
        }
        if !association.state.is_terminal() {
            self.save(association)?;
        }
        Ok(false)
    }

    /// Destroy on explicit user action; refused for failure-driven requests
    pub async fn destroy(
        &self,
        association: &mut Association,
        reason: DestroyReason,
        engine: &ReplicationEngine,
    ) -> Result<bool> {
        if reason == DestroyReason::Failure {
            warn!(association = %association.id, "refusing failure-driven destroy");
            return Err(Error::DestroyRefused(association.id));
        }
        if association.state.is_terminal() {
            return Ok(false);
        }

        engine.stop().await;
        association.destroy_reason = Some(reason);
        self.transition(association, AssociationState::Destroyed)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{AssociationConfig, SyncMode};
    use crate::clock::ManualClock;
    use crate::config::ReplicationConfig;
    use crate::fs::MemoryFs;
    use crate::provider::{Instance, InstanceStatus};
    use crate::replication::{Endpoints, TriggerOutcome};
    use tokio::sync::broadcast;

    struct Fixture {
        controller: FailoverController,
        engine: ReplicationEngine,
        association: Association,
        events: broadcast::Receiver<StandbyEvent>,
        table: AssociationTable,
    }

    fn instance(id: &str, role: InstanceRole) -> Instance {
        Instance {
            id: id.to_string(),
            provider: "mem".into(),
            role,
            address: "10.0.0.9".into(),
            region: "us-east-1".into(),
            status: InstanceStatus::Running,
        }
    }

    fn fixture() -> Fixture {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let table = AssociationTable::open(&db).unwrap();
        let clock = Arc::new(ManualClock::new());
        let bus = EventBus::new();
        let events = bus.subscribe();
        let association = Association::new(
            instance("p-1", InstanceRole::Primary),
            instance("b-1", InstanceRole::Backup),
            SyncMode::Periodic,
            "us-east-1".into(),
            &AssociationConfig::default(),
            clock.now(),
        );
        let engine = ReplicationEngine::new(
            association.id,
            Endpoints {
                source: Arc::new(MemoryFs::new()),
                dest: Arc::new(MemoryFs::new()),
            },
            SyncMode::Periodic,
            &ReplicationConfig::default(),
            clock.clone(),
        )
        .unwrap();
        Fixture {
            controller: FailoverController::new(table.clone(), bus, clock),
            engine,
            association,
            events,
            table,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<StandbyEvent>) -> Vec<StandbyEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_first_sync_leaves_provisioning() {
        let mut f = fixture();
        let now = f.controller.now();

        assert!(f.controller.mark_synced(&mut f.association, now).unwrap());
        assert!(!f.controller.mark_synced(&mut f.association, now).unwrap());
        assert_eq!(f.association.state, AssociationState::Syncing);
        assert_eq!(f.table.get(f.association.id).unwrap().last_sync_at, Some(now));
    }

    #[tokio::test]
    async fn test_failover_sequence_and_idempotence() {
        let mut f = fixture();
        let now = f.controller.now();
        f.controller.mark_synced(&mut f.association, now).unwrap();
        drain(&mut f.events);

        let action = f
            .controller
            .observe(&mut f.association, ProbeVerdict::FailureDetected, &f.engine)
            .await
            .unwrap();
        assert_eq!(action, FailoverAction::FailedOver);
        assert_eq!(f.association.state, AssociationState::FailedOver);
        assert_eq!(f.association.active_instance().id, "b-1");
        assert_eq!(f.engine.trigger().await.unwrap(), TriggerOutcome::Stopped);

        let events = drain(&mut f.events);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            StandbyEvent::StateChanged {
                to: AssociationState::FailedOver,
                ..
            }
        ));
        assert!(matches!(events[1], StandbyEvent::FailoverOccurred { .. }));

        // repeated detection while failed over changes nothing
        let before = f.association.clone();
        let action = f
            .controller
            .observe(&mut f.association, ProbeVerdict::FailureDetected, &f.engine)
            .await
            .unwrap();
        assert_eq!(action, FailoverAction::AlreadyFailedOver);
        assert!(!f.controller.fail_over(&mut f.association, &f.engine).await.unwrap());
        assert_eq!(f.association.state, before.state);
        assert_eq!(f.association.updated_at, before.updated_at);
        assert!(drain(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn test_degraded_is_observability_only() {
        let mut f = fixture();
        let now = f.controller.now();
        f.controller.mark_synced(&mut f.association, now).unwrap();

        let action = f
            .controller
            .observe(
                &mut f.association,
                ProbeVerdict::Degraded {
                    consecutive_failures: 1,
                },
                &f.engine,
            )
            .await
            .unwrap();
        assert_eq!(action, FailoverAction::Degraded);
        assert_eq!(f.association.state, AssociationState::Degraded);
        assert!(!f.engine.is_stopped());

        let action = f
            .controller
            .observe(&mut f.association, ProbeVerdict::Healthy, &f.engine)
            .await
            .unwrap();
        assert_eq!(action, FailoverAction::Restored);
        assert_eq!(f.association.state, AssociationState::Syncing);
        assert_eq!(f.association.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_health_counters_are_persisted_without_transition() {
        let mut f = fixture();

        let action = f
            .controller
            .observe(
                &mut f.association,
                ProbeVerdict::Degraded {
                    consecutive_failures: 2,
                },
                &f.engine,
            )
            .await
            .unwrap();
        assert_eq!(action, FailoverAction::None);
        assert_eq!(f.association.state, AssociationState::Provisioning);
        assert_eq!(f.table.get(f.association.id).unwrap().consecutive_failures, 2);

        f.controller
            .observe(&mut f.association, ProbeVerdict::Healthy, &f.engine)
            .await
            .unwrap();
        let stored = f.table.get(f.association.id).unwrap();
        assert_eq!(stored.consecutive_failures, 0);
        assert_eq!(stored.last_healthy_at, Some(f.controller.now()));

        let before = f.table.get(f.association.id).unwrap();
        f.controller
            .observe(&mut f.association, ProbeVerdict::Stale, &f.engine)
            .await
            .unwrap();
        assert_eq!(f.table.get(f.association.id).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failure_during_provisioning_fails_over() {
        let mut f = fixture();
        let failed = f
            .controller
            .fail_over(&mut f.association, &f.engine)
            .await
            .unwrap();
        assert!(failed);
        assert_eq!(f.association.state, AssociationState::FailedOver);
    }

    #[tokio::test]
    async fn test_destroy_rules() {
        let mut f = fixture();
        let err = f
            .controller
            .destroy(&mut f.association, DestroyReason::Failure, &f.engine)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DestroyRefused(_)));
        assert_eq!(f.association.state, AssociationState::Provisioning);

        f.controller.fail_over(&mut f.association, &f.engine).await.unwrap();
        assert!(f
            .controller
            .destroy(&mut f.association, DestroyReason::User, &f.engine)
            .await
            .unwrap());
        assert_eq!(f.association.state, AssociationState::Destroyed);
        assert!(!f
            .controller
            .destroy(&mut f.association, DestroyReason::User, &f.engine)
            .await
            .unwrap());
        assert!(f.controller.fail_over(&mut f.association, &f.engine).await.is_err());
    }
}
