//! Replacement of a failed primary
//!
//! Recovery races candidate regions for a new primary, waits for it to
//! answer, restores its data (live from the backup when reachable, from the
//! newest manifest otherwise), catches up with writes the backup took in the
//! meantime, resumes replication and only then returns the association to
//! `SYNCING`. Exhausting the attempt budget freezes the
//! association in `FAILED_OVER` with a persistent alert.

use crate::association::{Alert, AlertKind, Association, AssociationState};
use crate::clock::Clock;
use crate::config::RecoveryConfig;
use crate::error::{Error, Result};
use crate::events::{RestoreSource, StandbyEvent};
use crate::failover::FailoverController;
use crate::fs::{ExclusionSet, FsConnector, InstanceFs};
use crate::health::HealthMonitor;
use crate::provider::{ComputeProvider, Instance, InstanceRole, InstanceSpec, Prober};
use crate::replication::{self, Endpoints, ReplicationEngine, SyncReport};
use crate::snapshot::SnapshotPipeline;
use crate::transfer::{CancelToken, ExponentialBackoff};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A finished recovery
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub new_primary: Instance,
    pub source: RestoreSource,
    pub attempts: u32,
}

/// A provisioned and restored replacement, not yet committed
struct Restored {
    primary: Instance,
    primary_fs: Arc<dyn InstanceFs>,
    backup_fs: Arc<dyn InstanceFs>,
    source: RestoreSource,
}

pub struct RecoveryController {
    provider: Arc<dyn ComputeProvider>,
    prober: Arc<dyn Prober>,
    connector: Arc<dyn FsConnector>,
    pipeline: Arc<SnapshotPipeline>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
    exclusions: ExclusionSet,
}

impl RecoveryController {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        prober: Arc<dyn Prober>,
        connector: Arc<dyn FsConnector>,
        pipeline: Arc<SnapshotPipeline>,
        clock: Arc<dyn Clock>,
        config: &RecoveryConfig,
        exclusions: ExclusionSet,
    ) -> Self {
        RecoveryController {
            provider,
            prober,
            connector,
            pipeline,
            clock,
            config: config.clone(),
            exclusions,
        }
    }

    /// Recover a `FAILED_OVER` association
    ///
    /// The association lock is held only while its state changes, so status
    /// queries and health probes proceed during provisioning and restore.
    pub async fn recover(
        &self,
        association: &Mutex<Association>,
        engine: &ReplicationEngine,
        monitor: &HealthMonitor,
        failover: &FailoverController,
    ) -> Result<RecoveryOutcome> {
        let snapshot = {
            let mut guard = association.lock().await;
            if guard.state != AssociationState::FailedOver {
                return Err(Error::InvalidTransition {
                    from: guard.state.to_string(),
                    to: AssociationState::Recovering.to_string(),
                });
            }
            failover.transition(&mut guard, AssociationState::Recovering)?;
            failover.events().emit(StandbyEvent::RecoveryStarted {
                association_id: guard.id,
                at: self.clock.now(),
            });
            guard.clone()
        };
        info!(association = %snapshot.id, regions = ?snapshot.recovery_regions(), "recovery started");

        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = ExponentialBackoff::new(self.config.base_delay_ms, max_attempts)
            .with_max_delay(Duration::from_millis(self.config.max_delay_ms));
        let mut attempt = 0u32;

        let result = loop {
            attempt += 1;
            match self.attempt(&snapshot).await {
                Ok(restored) => break Ok(restored),
                Err(e) => {
                    warn!(association = %snapshot.id, attempt, "recovery attempt failed: {}", e);
                    failover.events().emit(StandbyEvent::RecoveryAttemptFailed {
                        association_id: snapshot.id,
                        attempt,
                        error: e.to_string(),
                    });
                    if attempt >= max_attempts || matches!(e, Error::PermanentProvider(_)) {
                        break Err(e);
                    }
                    if let Some(delay) = backoff.next_delay() {
                        self.clock.sleep(delay).await;
                    }
                }
            }
        };

        let mut guard = association.lock().await;
        match result {
            Ok(restored) => {
                self.complete(&mut guard, restored, attempt, engine, monitor, failover)
                    .await
            }
            Err(e) => self.exhaust(&mut guard, attempt, e, failover),
        }
    }

    async fn attempt(&self, association: &Association) -> Result<Restored> {
        let primary = self.provision(association).await?;
        match self.restore_into(association, &primary).await {
            Ok((primary_fs, backup_fs, source)) => Ok(Restored {
                primary,
                primary_fs,
                backup_fs,
                source,
            }),
            Err(e) => {
                self.release(&primary).await;
                Err(e)
            }
        }
    }

    /// Create one candidate per region and keep the first to answer
    async fn provision(&self, association: &Association) -> Result<Instance> {
        let timeout = Duration::from_secs(self.config.provision_timeout_secs);
        let specs: Vec<InstanceSpec> = association
            .recovery_regions()
            .into_iter()
            .map(|region| {
                let spec = InstanceSpec::new(InstanceRole::Primary, region);
                match &association.machine_type {
                    Some(machine_type) => spec.with_machine_type(machine_type.clone()),
                    None => spec,
                }
            })
            .collect();

        let created = join_all(specs.iter().map(|spec| async move {
            match tokio::time::timeout(timeout, self.provider.create(spec)).await {
                Ok(result) => result,
                Err(_) => Err(Error::TransientProvider(format!(
                    "create in {} timed out",
                    spec.region
                ))),
            }
        }))
        .await;

        let mut candidates = Vec::new();
        let mut errors = Vec::new();
        for result in created {
            match result {
                Ok(instance) => candidates.push(instance),
                Err(e) => errors.push(e),
            }
        }
        if candidates.is_empty() {
            // a transient cause keeps the attempt retryable
            let idx = errors.iter().position(|e| e.is_transient()).unwrap_or(0);
            return Err(if errors.is_empty() {
                Error::Internal("no candidate regions".to_string())
            } else {
                errors.swap_remove(idx)
            });
        }

        let mut racing: FuturesUnordered<_> = candidates
            .iter()
            .map(|instance| async move { (instance, self.wait_until_live(instance).await) })
            .collect();
        let mut winner: Option<Instance> = None;
        while let Some((instance, live)) = racing.next().await {
            match live {
                Ok(()) => {
                    winner = Some(instance.clone());
                    break;
                }
                Err(e) => debug!(instance = %instance.id, "candidate lost: {}", e),
            }
        }
        drop(racing);

        for candidate in &candidates {
            if winner.as_ref().map(|w| &w.id) != Some(&candidate.id) {
                self.release(candidate).await;
            }
        }

        let winner = winner.ok_or_else(|| {
            Error::TransientProvider("no replacement primary became reachable".to_string())
        })?;
        info!(instance = %winner.id, region = %winner.region, "replacement primary is live");
        Ok(winner)
    }

    async fn wait_until_live(&self, instance: &Instance) -> Result<()> {
        let deadline =
            self.clock.now() + chrono::Duration::seconds(self.config.liveness_timeout_secs as i64);
        let poll = Duration::from_secs(self.config.liveness_poll_interval_secs);

        loop {
            if self.prober.probe(instance).await.is_ok() {
                return Ok(());
            }
            if self.clock.now() >= deadline {
                return Err(Error::TransientProvider(format!(
                    "{} did not become reachable",
                    instance.id
                )));
            }
            self.clock.sleep(poll).await;
        }
    }

    /// Copy data onto the new primary, preferring the live backup
    async fn restore_into(
        &self,
        association: &Association,
        primary: &Instance,
    ) -> Result<(Arc<dyn InstanceFs>, Arc<dyn InstanceFs>, RestoreSource)> {
        let target = self.connector.connect(primary)?;
        let backup_fs = self.connector.connect(&association.backup)?;
        let cancel = CancelToken::new();

        if self.prober.probe(&association.backup).await.is_ok() {
            let copied = replication::sync(
                backup_fs.as_ref(),
                target.as_ref(),
                &self.exclusions,
                false,
                &cancel,
            )
            .await
            .and_then(SyncReport::into_result);
            match copied {
                Ok(report) => {
                    info!(
                        association = %association.id,
                        files = report.files_copied,
                        bytes = report.bytes_copied,
                        "restored from live backup"
                    );
                    let source = RestoreSource::LiveBackup {
                        files: report.files_copied,
                        bytes: report.bytes_copied,
                    };
                    return Ok((target, backup_fs, source));
                }
                Err(e) => warn!(association = %association.id, "live restore failed, trying manifest: {}", e),
            }
        } else {
            warn!(association = %association.id, "backup unreachable, restoring from manifest");
        }

        match self.pipeline.catalog().latest_for(Some(association.id))? {
            Some(manifest) => {
                let result = self
                    .pipeline
                    .restore(manifest.id, target.as_ref(), &cancel)
                    .await?;
                if !result.is_complete() {
                    return Err(Error::SnapshotIntegrity {
                        path: result
                            .failed
                            .first()
                            .map(|f| f.path.clone())
                            .unwrap_or_default(),
                        reason: format!("{} files failed to restore", result.failed.len()),
                    });
                }
                Ok((
                    target,
                    backup_fs,
                    RestoreSource::Manifest {
                        manifest_id: manifest.id,
                    },
                ))
            }
            None if association.last_sync_at.is_none() => Ok((target, backup_fs, RestoreSource::Empty)),
            None => Err(Error::TransientProvider(
                "backup unreachable and no manifest to restore".to_string(),
            )),
        }
    }

    async fn complete(
        &self,
        association: &mut Association,
        restored: Restored,
        attempts: u32,
        engine: &ReplicationEngine,
        monitor: &HealthMonitor,
        failover: &FailoverController,
    ) -> Result<RecoveryOutcome> {
        if association.state != AssociationState::Recovering {
            // destroyed while recovering
            self.release(&restored.primary).await;
            return Err(Error::InvalidTransition {
                from: association.state.to_string(),
                to: AssociationState::Syncing.to_string(),
            });
        }

        if let Err(e) = self.catch_up(association, &restored).await {
            self.release(&restored.primary).await;
            return self.exhaust(association, attempts, e, failover);
        }

        engine
            .resume(Endpoints {
                source: restored.primary_fs,
                dest: restored.backup_fs,
            })
            .await;

        let old_primary = std::mem::replace(&mut association.primary, restored.primary.clone());
        association.active_endpoint = InstanceRole::Primary;
        association.alert = None;
        association.recovery_attempts = attempts;
        association.consecutive_failures = 0;
        monitor.clear_episode();
        failover.transition(association, AssociationState::Syncing)?;

        info!(
            association = %association.id,
            new_primary = %restored.primary.id,
            attempts,
            source = ?restored.source,
            "recovery completed"
        );
        failover.events().emit(StandbyEvent::RecoveryCompleted {
            association_id: association.id,
            new_primary: restored.primary.clone(),
            source: restored.source.clone(),
            attempts,
        });

        // the old primary must never come back as active
        if let Err(e) = self.provider.delete(&old_primary.id).await {
            debug!(instance = %old_primary.id, "old primary not deleted: {}", e);
        }

        Ok(RecoveryOutcome {
            new_primary: restored.primary,
            source: restored.source,
            attempts,
        })
    }

    /// Final backup to new-primary pass, run with the association locked
    ///
    /// The backup stays the active endpoint until the swap, so anything
    /// written to it during provisioning and restore is copied here.
    async fn catch_up(&self, association: &Association, restored: &Restored) -> Result<()> {
        if self.prober.probe(&association.backup).await.is_err() {
            warn!(association = %association.id, "backup unreachable, skipping catch-up");
            return Ok(());
        }

        let report = replication::sync(
            restored.backup_fs.as_ref(),
            restored.primary_fs.as_ref(),
            &self.exclusions,
            false,
            &CancelToken::new(),
        )
        .await
        .and_then(SyncReport::into_result)?;
        info!(
            association = %association.id,
            copied = report.files_copied,
            deleted = report.files_deleted,
            "caught up with backup"
        );
        Ok(())
    }

    fn exhaust(
        &self,
        association: &mut Association,
        attempts: u32,
        cause: Error,
        failover: &FailoverController,
    ) -> Result<RecoveryOutcome> {
        let reason = cause.to_string();
        if association.state == AssociationState::Recovering {
            association.alert = Some(Alert {
                kind: AlertKind::RecoveryExhausted,
                message: format!("recovery failed after {} attempts: {}", attempts, reason),
                raised_at: self.clock.now(),
            });
            association.recovery_attempts = attempts;
            failover.transition(association, AssociationState::FailedOver)?;
        }

        error!(association = %association.id, attempts, "recovery exhausted: {}", reason);
        failover.events().emit(StandbyEvent::RecoveryExhausted {
            association_id: association.id,
            attempts,
            reason: reason.clone(),
        });
        Err(Error::RecoveryExhausted { attempts, reason })
    }

    async fn release(&self, instance: &Instance) {
        if let Err(e) = self.provider.delete(&instance.id).await {
            warn!(instance = %instance.id, "failed to delete unused instance: {}", e);
        }
    }
}
