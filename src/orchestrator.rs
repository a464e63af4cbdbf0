//! Top-level owner of associations
//!
//! A [`StandbyOrchestrator`] is constructed with its dependencies injected
//! and owns every association it creates or reloads. Each association gets
//! its own mutex, health monitor and replication engine; associations never
//! share state beyond the object store and the transfer pool.

use crate::association::{
    Association, AssociationConfig, AssociationState, AssociationStatus, AssociationTable,
    DestroyReason,
};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, StandbyEvent};
use crate::failover::{FailoverAction, FailoverController};
use crate::fs::{ExclusionSet, FsConnector};
use crate::health::HealthMonitor;
use crate::provider::{ComputeProvider, Instance, InstanceRole, InstanceSpec, Prober};
use crate::recovery::{RecoveryController, RecoveryOutcome};
use crate::region::resolve_region;
use crate::replication::{Endpoints, ReplicationEngine, SyncReport, TriggerOutcome};
use crate::snapshot::{ManifestCatalog, RestoreResult, SnapshotManifest, SnapshotPipeline, SnapshotSource};
use crate::store::ObjectStore;
use crate::transfer::{CancelToken, ExponentialBackoff, TransferPool};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Injected capabilities
#[derive(Clone)]
pub struct Deps {
    pub provider: Arc<dyn ComputeProvider>,
    pub prober: Arc<dyn Prober>,
    pub fs: Arc<dyn FsConnector>,
    pub store: Arc<dyn ObjectStore>,
    pub clock: Arc<dyn Clock>,
}

/// Runtime state of one association
struct Handle {
    id: Uuid,
    association: Mutex<Association>,
    monitor: HealthMonitor,
    engine: Arc<ReplicationEngine>,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    recovering: AtomicBool,
}

struct Inner {
    deps: Deps,
    config: Config,
    db: sled::Db,
    table: AssociationTable,
    events: EventBus,
    failover: FailoverController,
    pipeline: Arc<SnapshotPipeline>,
    recovery: RecoveryController,
    handles: DashMap<Uuid, Arc<Handle>>,
    /// Primary ids with an association being created
    creating: DashMap<String, ()>,
}

/// Exclusive right to create an association for one primary
///
/// Released on drop; by then the row is either committed or abandoned.
struct CreateClaim<'a> {
    creating: &'a DashMap<String, ()>,
    instance_id: String,
}

impl<'a> CreateClaim<'a> {
    fn acquire(creating: &'a DashMap<String, ()>, instance_id: &str) -> Option<Self> {
        match creating.entry(instance_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(CreateClaim {
                    creating,
                    instance_id: instance_id.to_string(),
                })
            }
        }
    }
}

impl Drop for CreateClaim<'_> {
    fn drop(&mut self) {
        self.creating.remove(&self.instance_id);
    }
}

/// Cheap to clone; clones share the same associations
#[derive(Clone)]
pub struct StandbyOrchestrator {
    inner: Arc<Inner>,
}

impl StandbyOrchestrator {
    /// Open the state database under `config.data_dir`
    pub fn new(deps: Deps, config: Config) -> Result<Self> {
        config.validate()?;
        config.ensure_directories()?;
        let db = sled::open(config.state_db_path())?;
        Self::with_db(deps, config, db)
    }

    /// Use an already opened database
    pub fn with_db(deps: Deps, config: Config, db: sled::Db) -> Result<Self> {
        let exclusions = ExclusionSet::new(&config.replication.exclusions)?;
        let table = AssociationTable::open(&db)?;
        let catalog = ManifestCatalog::open(&db)?;
        let events = EventBus::new();

        let pool = Arc::new(TransferPool::new(&config.snapshot, deps.clock.clone()));
        let pipeline = Arc::new(SnapshotPipeline::new(
            deps.store.clone(),
            catalog,
            pool,
            &config.snapshot,
            exclusions.clone(),
            deps.clock.clone(),
        ));
        let failover = FailoverController::new(table.clone(), events.clone(), deps.clock.clone());
        let recovery = RecoveryController::new(
            deps.provider.clone(),
            deps.prober.clone(),
            deps.fs.clone(),
            pipeline.clone(),
            deps.clock.clone(),
            &config.recovery,
            exclusions,
        );

        Ok(StandbyOrchestrator {
            inner: Arc::new(Inner {
                deps,
                config,
                db,
                table,
                events,
                failover,
                pipeline,
                recovery,
                handles: DashMap::new(),
                creating: DashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Event stream for the access layer
    pub fn subscribe(&self) -> broadcast::Receiver<StandbyEvent> {
        self.inner.events.subscribe()
    }

    fn handle(&self, id: Uuid) -> Result<Arc<Handle>> {
        self.inner
            .handles
            .get(&id)
            .map(|h| h.value().clone())
            .ok_or(Error::AssociationNotFound(id))
    }

    fn attach(&self, association: Association) -> Result<Arc<Handle>> {
        let fs = &self.inner.deps.fs;
        let endpoints = Endpoints {
            source: fs.connect(&association.primary)?,
            dest: fs.connect(&association.backup)?,
        };
        let engine = ReplicationEngine::new(
            association.id,
            endpoints,
            association.sync_mode,
            &self.inner.config.replication,
            self.inner.deps.clock.clone(),
        )?;
        let (shutdown, _) = watch::channel(false);

        let handle = Arc::new(Handle {
            id: association.id,
            association: Mutex::new(association),
            monitor: HealthMonitor::new(&self.inner.config.health),
            engine: Arc::new(engine),
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
            recovering: AtomicBool::new(false),
        });
        self.inner.handles.insert(handle.id, handle.clone());
        Ok(handle)
    }

    /// Create a backup for `primary_instance_id` and start managing the pair
    ///
    /// The association starts in `PROVISIONING`; the first successful sync
    /// moves it to `SYNCING`.
    pub async fn create_association(
        &self,
        primary_instance_id: &str,
        config: AssociationConfig,
    ) -> Result<Association> {
        let provider = &self.inner.deps.provider;
        let primary = provider.describe(primary_instance_id).await?;

        let in_use = || {
            Error::InvalidConfig(format!(
                "instance {} already belongs to an association",
                primary.id
            ))
        };
        // claim before the table check so a concurrent create sees one or the other
        let _claim = CreateClaim::acquire(&self.inner.creating, &primary.id).ok_or_else(in_use)?;
        let taken = self.inner.table.list()?.into_iter().any(|a| {
            !a.state.is_terminal()
                && (a.primary.id == primary.id || a.backup.id == primary.id)
        });
        if taken {
            return Err(in_use());
        }

        let region = match &config.region {
            Some(hint) => {
                let known = provider.list_regions().await?;
                resolve_region(hint, &known, &primary.region)
            }
            None => primary.region.clone(),
        };
        let mut spec = InstanceSpec::new(InstanceRole::Backup, region.clone());
        if let Some(machine_type) = &config.machine_type {
            spec = spec.with_machine_type(machine_type.clone());
        }

        let backup = self.create_with_retry(&spec).await?;
        let mode = config.sync_mode.unwrap_or(self.inner.config.replication.mode);
        let association = Association::new(
            primary,
            backup,
            mode,
            region,
            &config,
            self.inner.deps.clock.now(),
        );

        let handle = match self.attach(association.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(del) = provider.delete(&association.backup.id).await {
                    warn!(instance = %association.backup.id, "failed to delete backup: {}", del);
                }
                return Err(e);
            }
        };
        if let Err(e) = self.inner.table.put(&association) {
            self.inner.handles.remove(&handle.id);
            return Err(e);
        }

        info!(
            association = %association.id,
            primary = %association.primary.id,
            backup = %association.backup.id,
            region = %association.region,
            mode = ?association.sync_mode,
            "association created"
        );
        Ok(association)
    }

    async fn create_with_retry(&self, spec: &InstanceSpec) -> Result<Instance> {
        let recovery = &self.inner.config.recovery;
        let mut backoff = ExponentialBackoff::new(recovery.base_delay_ms, recovery.max_attempts)
            .with_max_delay(Duration::from_millis(recovery.max_delay_ms));

        loop {
            match self.inner.deps.provider.create(spec).await {
                Ok(instance) => return Ok(instance),
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(region = %spec.region, "backup creation failed, retrying in {:?}: {}", delay, e);
                        self.inner.deps.clock.sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Status view of one association
    pub async fn get_association(&self, id: Uuid) -> Result<AssociationStatus> {
        let handle = self.handle(id)?;
        let association = handle.association.lock().await.clone();
        Ok(AssociationStatus::new(
            &association,
            handle.monitor.summary(),
            handle.engine.status(),
        ))
    }

    pub async fn list_associations(&self) -> Vec<AssociationStatus> {
        let handles: Vec<Arc<Handle>> = self
            .inner
            .handles
            .iter()
            .map(|h| h.value().clone())
            .collect();

        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            let association = handle.association.lock().await.clone();
            statuses.push(AssociationStatus::new(
                &association,
                handle.monitor.summary(),
                handle.engine.status(),
            ));
        }
        statuses.sort_by_key(|s| s.id);
        statuses
    }

    /// Manual failover; same rules as a detected failure
    ///
    /// Returns false when the association was already failed over.
    pub async fn trigger_failover(&self, id: Uuid) -> Result<bool> {
        let handle = self.handle(id)?;
        let failed = {
            let mut association = handle.association.lock().await;
            let failed = self
                .inner
                .failover
                .fail_over(&mut association, &handle.engine)
                .await?;
            handle.monitor.open_episode();
            failed
        };

        if failed {
            info!(association = %id, "manual failover");
            self.maybe_recover(&handle);
        }
        Ok(failed)
    }

    /// Destroy on user request
    ///
    /// The backup is deleted unless it is serving as the active endpoint.
    /// The row stays readable in `DESTROYED`.
    pub async fn destroy_association(&self, id: Uuid, reason: DestroyReason) -> Result<bool> {
        let handle = self.handle(id)?;
        let mut association = handle.association.lock().await;
        let destroyed = self
            .inner
            .failover
            .destroy(&mut association, reason, &handle.engine)
            .await?;
        if !destroyed {
            return Ok(false);
        }

        handle.shutdown.send_replace(true);
        if association.active_endpoint == InstanceRole::Primary {
            let backup = association.backup.id.clone();
            if let Err(e) = self.inner.deps.provider.delete(&backup).await {
                warn!(instance = %backup, "failed to delete backup: {}", e);
            }
        }
        info!(association = %id, "association destroyed");
        Ok(true)
    }

    /// Committed manifests of an association, oldest first
    pub fn list_snapshots(&self, association_id: Uuid) -> Result<Vec<SnapshotManifest>> {
        self.handle(association_id)?;
        self.inner.pipeline.catalog().list_for(Some(association_id))
    }

    /// Snapshot the backup's tree, incremental against the latest manifest
    pub async fn create_snapshot(&self, association_id: Uuid) -> Result<SnapshotManifest> {
        let handle = self.handle(association_id)?;
        let backup = {
            let association = handle.association.lock().await;
            if association.state.is_terminal() {
                return Err(Error::InvalidConfig(format!(
                    "association {} is destroyed",
                    association_id
                )));
            }
            association.backup.clone()
        };

        let fs = self.inner.deps.fs.connect(&backup)?;
        let pipeline = &self.inner.pipeline;
        let latest = pipeline.catalog().latest_for(Some(association_id))?;
        let base = pipeline.choose_base(latest)?;
        let manifest = pipeline
            .create(
                SnapshotSource {
                    fs: fs.as_ref(),
                    instance_ref: &backup.id,
                    association_id: Some(association_id),
                },
                base.as_ref(),
                &CancelToken::new(),
            )
            .await?;

        {
            let mut association = handle.association.lock().await;
            association.last_manifest_id = Some(manifest.id);
            if !association.state.is_terminal() {
                self.inner.failover.save(&mut association)?;
            }
        }
        self.inner.events.emit(StandbyEvent::SnapshotCommitted {
            association_id,
            manifest_id: manifest.id,
            uploaded_bytes: manifest.uploaded_bytes,
        });

        if let Err(e) = pipeline.prune(Some(association_id)).await {
            warn!(association = %association_id, "snapshot pruning failed: {}", e);
        }
        Ok(manifest)
    }

    /// Restore a manifest onto any instance the provider knows
    pub async fn restore_snapshot(
        &self,
        manifest_id: Uuid,
        target_instance_id: &str,
    ) -> Result<RestoreResult> {
        let target = self.inner.deps.provider.describe(target_instance_id).await?;
        let fs = self.inner.deps.fs.connect(&target)?;
        self.inner
            .pipeline
            .restore(manifest_id, fs.as_ref(), &CancelToken::new())
            .await
    }

    /// Run recovery now
    pub async fn recover(&self, id: Uuid) -> Result<RecoveryOutcome> {
        let handle = self.handle(id)?;
        self.run_recovery(&handle).await
    }

    async fn run_recovery(&self, handle: &Handle) -> Result<RecoveryOutcome> {
        self.inner
            .recovery
            .recover(
                &handle.association,
                &handle.engine,
                &handle.monitor,
                &self.inner.failover,
            )
            .await
    }

    fn maybe_recover(&self, handle: &Arc<Handle>) {
        if !self.inner.config.recovery.auto_recover {
            return;
        }
        if handle.recovering.swap(true, Ordering::SeqCst) {
            debug!(association = %handle.id, "recovery already running");
            return;
        }

        let this = self.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_recovery(&handle).await {
                error!(association = %handle.id, "automatic recovery failed: {}", e);
            }
            handle.recovering.store(false, Ordering::SeqCst);
        });
    }

    /// Probe the primary once and apply the verdict
    pub async fn probe_now(&self, id: Uuid) -> Result<FailoverAction> {
        let handle = self.handle(id)?;
        self.probe(&handle).await
    }

    async fn probe(&self, handle: &Arc<Handle>) -> Result<FailoverAction> {
        let primary = {
            let association = handle.association.lock().await;
            if association.state.is_terminal() {
                return Ok(FailoverAction::None);
            }
            association.primary.clone()
        };

        let verdict = handle
            .monitor
            .probe_once(
                self.inner.deps.prober.as_ref(),
                &primary,
                self.inner.deps.clock.as_ref(),
            )
            .await;

        let action = {
            let mut association = handle.association.lock().await;
            if association.primary.id != primary.id {
                // replaced while the probe was in flight
                return Ok(FailoverAction::None);
            }
            self.inner
                .failover
                .observe(&mut association, verdict, &handle.engine)
                .await?
        };

        if action == FailoverAction::FailedOver {
            self.maybe_recover(handle);
        }
        Ok(action)
    }

    /// Run or coalesce a sync now
    pub async fn sync_now(&self, id: Uuid) -> Result<TriggerOutcome> {
        let handle = self.handle(id)?;
        let outcome = handle.engine.trigger().await;
        match &outcome {
            Ok(TriggerOutcome::Ran(report)) => self.apply_sync(&handle, Ok(report.clone())).await,
            Err(e) => debug!(association = %id, "sync failed: {}", e),
            _ => {}
        }
        outcome
    }

    /// Record a filesystem change on the primary (realtime mode)
    pub fn notify_change(&self, id: Uuid) -> Result<()> {
        self.handle(id)?.engine.notify_change();
        Ok(())
    }

    async fn apply_sync(&self, handle: &Handle, result: Result<SyncReport>) {
        let report = match result {
            Ok(report) if !report.interrupted => report,
            Ok(_) => return,
            // failed syncs are retried on the next tick and never touch health
            Err(_) => return,
        };

        let at = self.inner.deps.clock.now();
        {
            let mut association = handle.association.lock().await;
            if association.active_endpoint != InstanceRole::Primary {
                return;
            }
            if let Err(e) = self.inner.failover.mark_synced(&mut association, at) {
                warn!(association = %handle.id, "failed to record sync: {}", e);
                return;
            }
        }

        self.inner.events.emit(StandbyEvent::SyncCompleted {
            association_id: handle.id,
            files_copied: report.files_copied,
            bytes_copied: report.bytes_copied,
            at,
        });
    }

    /// Spawn the health, replication and snapshot loops
    pub async fn start(&self, id: Uuid) -> Result<()> {
        let handle = self.handle(id)?;
        if handle.association.lock().await.state.is_terminal() {
            return Ok(());
        }

        let mut tasks = handle.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        handle.shutdown.send_replace(false);

        let this = self.clone();
        let h = handle.clone();
        let shutdown = handle.shutdown.subscribe();
        tasks.push(tokio::spawn(async move { this.health_loop(h, shutdown).await }));

        let this = self.clone();
        let h = handle.clone();
        let engine = handle.engine.clone();
        let shutdown = handle.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            engine
                .run(shutdown, move |result| {
                    let this = this.clone();
                    let h = h.clone();
                    async move { this.apply_sync(&h, result).await }
                })
                .await
        }));

        if self.inner.config.snapshot.auto_snapshot_interval_secs > 0 {
            let this = self.clone();
            let shutdown = handle.shutdown.subscribe();
            tasks.push(tokio::spawn(async move { this.snapshot_loop(id, shutdown).await }));
        }

        info!(association = %id, "association loops started");
        Ok(())
    }

    /// Start loops for every live association
    pub async fn start_all(&self) -> Result<()> {
        let ids: Vec<Uuid> = self.inner.handles.iter().map(|h| *h.key()).collect();
        for id in ids {
            self.start(id).await?;
        }
        Ok(())
    }

    async fn health_loop(self, handle: Arc<Handle>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.inner.config.health.probe_interval_secs);
        let clock = self.inner.deps.clock.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = clock.sleep(interval) => {}
            }

            if let Err(e) = self.probe(&handle).await {
                warn!(association = %handle.id, "health check failed: {}", e);
            }
        }
        debug!(association = %handle.id, "health loop stopped");
    }

    async fn snapshot_loop(self, id: Uuid, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.inner.config.snapshot.auto_snapshot_interval_secs);
        let clock = self.inner.deps.clock.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = clock.sleep(interval) => {}
            }

            match self.create_snapshot(id).await {
                Ok(manifest) => debug!(association = %id, manifest = %manifest.id, "automatic snapshot"),
                Err(e) => warn!(association = %id, "automatic snapshot failed: {}", e),
            }
        }
    }

    /// Stop every loop and flush state
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<Arc<Handle>> = self
            .inner
            .handles
            .iter()
            .map(|h| h.value().clone())
            .collect();

        for handle in &handles {
            handle.shutdown.send_replace(true);
        }
        for handle in &handles {
            let tasks: Vec<JoinHandle<()>> = handle.tasks.lock().drain(..).collect();
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(association = %handle.id, "loop ended abnormally: {}", e);
                }
            }
        }

        self.inner.db.flush_async().await?;
        info!("orchestrator stopped");
        Ok(())
    }

    /// Reattach persisted associations after a restart
    ///
    /// An interrupted recovery goes back to `FAILED_OVER`. Failed-over and
    /// destroyed rows come back with replication frozen.
    pub async fn reload(&self) -> Result<usize> {
        let mut loaded = 0;
        for mut association in self.inner.table.list()? {
            if self.inner.handles.contains_key(&association.id) {
                continue;
            }

            if association.state == AssociationState::Recovering {
                warn!(association = %association.id, "recovery was interrupted, back to FAILED_OVER");
                self.inner
                    .failover
                    .transition(&mut association, AssociationState::FailedOver)?;
            }
            let frozen = matches!(
                association.state,
                AssociationState::FailedOver | AssociationState::Destroyed
            );
            let failed_over = association.state == AssociationState::FailedOver;
            if association.state != AssociationState::Destroyed {
                self.sweep_staging(&association).await;
            }

            let handle = self.attach(association)?;
            if frozen {
                handle.engine.stop().await;
            }
            if failed_over {
                handle.monitor.open_episode();
            }
            loaded += 1;
        }

        info!(associations = loaded, "associations reloaded");
        Ok(loaded)
    }

    /// Drop staging files an interrupted copy left on either instance
    async fn sweep_staging(&self, association: &Association) {
        for instance in [&association.primary, &association.backup] {
            let swept = match self.inner.deps.fs.connect(instance) {
                Ok(fs) => fs.sweep_staged().await,
                Err(e) => Err(e),
            };
            if let Err(e) = swept {
                warn!(instance = %instance.id, "staging sweep failed: {}", e);
            }
        }
    }
}
