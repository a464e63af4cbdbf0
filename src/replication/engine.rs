//! Per-association replication engine
//!
//! At most one sync runs per engine. A trigger that arrives while a sync is
//! in flight sets a pending flag and returns; the running sync picks the flag
//! up and performs exactly one follow-up pass, however many triggers arrived.

use super::{mirror, SyncReport, SyncStatus};
use crate::clock::Clock;
use crate::config::{ReplicationConfig, SyncMode};
use crate::error::Result;
use crate::fs::{ExclusionSet, InstanceFs};
use crate::transfer::CancelToken;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Source and destination of replication
#[derive(Clone)]
pub struct Endpoints {
    pub source: Arc<dyn InstanceFs>,
    pub dest: Arc<dyn InstanceFs>,
}

/// Result of a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// This call ran the sync; carries the report of the last pass
    Ran(SyncReport),
    /// A sync was already in flight and will run once more
    Coalesced,
    /// Replication is frozen
    Stopped,
}

pub struct ReplicationEngine {
    association_id: Uuid,
    endpoints: RwLock<Endpoints>,
    exclusions: ExclusionSet,
    mode: SyncMode,
    interval: Duration,
    debounce: Duration,
    compare_hashes: bool,
    clock: Arc<dyn Clock>,
    run_lock: tokio::sync::Mutex<()>,
    pending: AtomicBool,
    stopped: AtomicBool,
    stop_token: Mutex<CancelToken>,
    changed: Notify,
    status: RwLock<SyncStatus>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl ReplicationEngine {
    pub fn new(
        association_id: Uuid,
        endpoints: Endpoints,
        mode: SyncMode,
        config: &ReplicationConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(ReplicationEngine {
            association_id,
            endpoints: RwLock::new(endpoints),
            exclusions: ExclusionSet::new(&config.exclusions)?,
            mode,
            interval: Duration::from_secs(config.interval_secs),
            debounce: Duration::from_millis(config.debounce_ms),
            compare_hashes: config.compare_hashes,
            clock,
            run_lock: tokio::sync::Mutex::new(()),
            pending: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_token: Mutex::new(CancelToken::new()),
            changed: Notify::new(),
            status: RwLock::new(SyncStatus::new()),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
        })
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn status(&self) -> SyncStatus {
        let mut status = self.status.read().clone();
        status.stopped = self.is_stopped();
        status
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Highest number of syncs ever observed running at once
    pub fn peak_concurrent_runs(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    /// Record a filesystem change for realtime mode
    pub fn notify_change(&self) {
        self.changed.notify_one();
    }

    /// Request a sync
    pub async fn trigger(&self) -> Result<TriggerOutcome> {
        if self.is_stopped() {
            return Ok(TriggerOutcome::Stopped);
        }

        // set before try_lock so a running sync cannot miss this request
        self.pending.store(true, Ordering::SeqCst);
        let mut outcome = TriggerOutcome::Coalesced;

        loop {
            let guard = match self.run_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(association = %self.association_id, "sync in flight, coalescing trigger");
                    return Ok(outcome);
                }
            };

            while self.pending.swap(false, Ordering::SeqCst) {
                if self.is_stopped() {
                    return Ok(TriggerOutcome::Stopped);
                }
                outcome = TriggerOutcome::Ran(self.run_once().await?);
            }

            drop(guard);
            if !self.pending.load(Ordering::SeqCst) {
                return Ok(outcome);
            }
        }
    }

    async fn run_once(&self) -> Result<SyncReport> {
        let endpoints = self.endpoints.read().clone();
        let stop = self.stop_token.lock().clone();

        let active = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(active, Ordering::SeqCst);
        let started = std::time::Instant::now();

        let result = mirror::sync(
            endpoints.source.as_ref(),
            endpoints.dest.as_ref(),
            &self.exclusions,
            self.compare_hashes,
            &stop,
        )
        .await
        .and_then(SyncReport::into_result);

        self.running.fetch_sub(1, Ordering::SeqCst);
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut status = self.status.write();
        match &result {
            Ok(report) if report.interrupted => {
                info!(
                    association = %self.association_id,
                    copied = report.files_copied,
                    "sync stopped at a file boundary"
                );
            }
            Ok(report) => {
                status.mark_success(self.clock.now(), report, duration_ms);
                debug!(
                    association = %self.association_id,
                    copied = report.files_copied,
                    deleted = report.files_deleted,
                    bytes = report.bytes_copied,
                    duration_ms,
                    "sync completed"
                );
            }
            Err(e) => {
                status.mark_error(e.to_string());
                warn!(association = %self.association_id, "sync failed, retrying next tick: {}", e);
            }
        }
        drop(status);

        result
    }

    /// Freeze replication, waiting for an in-flight sync to reach a file
    /// boundary
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_token.lock().cancel();
        let _idle = self.run_lock.lock().await;
        info!(association = %self.association_id, "replication stopped");
    }

    /// Resume replication between new endpoints
    pub async fn resume(&self, endpoints: Endpoints) {
        let _idle = self.run_lock.lock().await;
        *self.endpoints.write() = endpoints;
        *self.stop_token.lock() = CancelToken::new();
        self.stopped.store(false, Ordering::SeqCst);
        info!(association = %self.association_id, "replication resumed");
    }

    async fn wait_for_tick(&self) {
        match self.mode {
            SyncMode::Periodic => self.clock.sleep(self.interval).await,
            SyncMode::Realtime => {
                tokio::select! {
                    _ = self.changed.notified() => self.clock.sleep(self.debounce).await,
                    _ = self.clock.sleep(self.interval) => {}
                }
            }
        }
    }

    /// Scheduling loop; runs until `shutdown` turns true
    ///
    /// Realtime mode waits for a change notification, then for the debounce
    /// window, so a burst of changes becomes one sync. A full pass still runs
    /// every interval as a fallback.
    pub async fn run<F, Fut>(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, on_sync: F)
    where
        F: Fn(Result<SyncReport>) -> Fut,
        Fut: Future<Output = ()>,
    {
        info!(association = %self.association_id, mode = ?self.mode, "replication loop started");

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
                _ = self.wait_for_tick() => {}
            }

            match self.trigger().await {
                Ok(TriggerOutcome::Ran(report)) => on_sync(Ok(report)).await,
                Ok(_) => {}
                Err(e) => on_sync(Err(e)).await,
            }
        }

        info!(association = %self.association_id, "replication loop stopped");
    }
}
