//! End-to-end scenarios against the public orchestrator API

use chrono::{DateTime, Utc};
use spotstandby::association::{AlertKind, AssociationConfig, AssociationState, AssociationTable};
use spotstandby::clock::ManualClock;
use spotstandby::events::StandbyEvent;
use spotstandby::failover::FailoverAction;
use spotstandby::fs::MemoryConnector;
use spotstandby::provider::{
    ComputeProvider, CreateFailure, Instance, InstanceRole, InstanceSpec, MemoryProvider,
};
use spotstandby::replication::TriggerOutcome;
use spotstandby::snapshot::RestoreStatus;
use spotstandby::store::MemoryObjectStore;
use spotstandby::{Config, Deps, Error, StandbyOrchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Harness {
    orchestrator: StandbyOrchestrator,
    deps: Deps,
    config: Config,
    db: sled::Db,
    provider: Arc<MemoryProvider>,
    connector: Arc<MemoryConnector>,
    store: Arc<MemoryObjectStore>,
    primary: Instance,
    _dir: tempfile::TempDir,
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

async fn harness(configure: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MemoryProvider::new("mem", &["us-east-1", "us-west-2"]));
    let connector = Arc::new(MemoryConnector::new());
    let store = Arc::new(MemoryObjectStore::new());

    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.snapshot.chunk_size = 4096;
    config.snapshot.retry_attempts = 0;
    config.recovery.auto_recover = false;
    configure(&mut config);

    let primary = provider
        .create(&InstanceSpec::new(InstanceRole::Primary, "us-east-1"))
        .await
        .unwrap();

    let deps = Deps {
        provider: provider.clone(),
        prober: provider.clone(),
        fs: connector.clone(),
        store: store.clone(),
        clock: Arc::new(ManualClock::new()),
    };
    let db = sled::open(dir.path().join("state.db")).unwrap();
    let orchestrator = StandbyOrchestrator::with_db(deps.clone(), config.clone(), db.clone()).unwrap();

    Harness {
        orchestrator,
        deps,
        config,
        db,
        provider,
        connector,
        store,
        primary,
        _dir: dir,
    }
}

impl Harness {
    fn write_primary(&self, path: &str, data: Vec<u8>, secs: i64) {
        self.connector.tree(&self.primary.id).insert(path, data, at(secs));
    }

    /// Create an association and bring it to SYNCING
    async fn synced_association(&self) -> uuid::Uuid {
        let association = self
            .orchestrator
            .create_association(&self.primary.id, AssociationConfig::default())
            .await
            .unwrap();
        let outcome = self.orchestrator.sync_now(association.id).await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Ran(_)));
        association.id
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
async fn scenario_a_only_consecutive_failures_fail_over() {
    let h = harness(|c| c.health.failure_threshold = 3).await;
    h.write_primary("train.py", b"print('hi')".to_vec(), 1);
    let id = h.synced_association().await;
    let mut rx = h.orchestrator.subscribe();

    h.provider
        .script_probes(&h.primary.id, &[false, false, true, false, false, false]);
    let mut actions = Vec::new();
    for _ in 0..6 {
        actions.push(h.orchestrator.probe_now(id).await.unwrap());
    }

    assert_eq!(
        actions,
        vec![
            FailoverAction::Degraded,
            FailoverAction::None,
            FailoverAction::Restored,
            FailoverAction::Degraded,
            FailoverAction::None,
            FailoverAction::FailedOver,
        ]
    );

    let failovers = drain(&mut rx)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                StandbyEvent::StateChanged {
                    to: AssociationState::FailedOver,
                    ..
                }
            )
        })
        .count();
    assert_eq!(failovers, 1);

    // further failures and even a reachable primary change nothing
    h.provider.script_probes(&h.primary.id, &[false, true]);
    assert_eq!(
        h.orchestrator.probe_now(id).await.unwrap(),
        FailoverAction::AlreadyFailedOver
    );
    assert_eq!(
        h.orchestrator.probe_now(id).await.unwrap(),
        FailoverAction::AlreadyFailedOver
    );
    let status = h.orchestrator.get_association(id).await.unwrap();
    assert_eq!(status.state, AssociationState::FailedOver);
    assert!(status.degraded);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn scenario_a_alternating_failures_never_fail_over() {
    let h = harness(|c| c.health.failure_threshold = 3).await;
    let id = h.synced_association().await;

    let pattern: Vec<bool> = (0..40).map(|i| i % 3 == 2).collect();
    h.provider.script_probes(&h.primary.id, &pattern);
    for _ in 0..pattern.len() {
        let action = h.orchestrator.probe_now(id).await.unwrap();
        assert_ne!(action, FailoverAction::FailedOver);
    }

    let status = h.orchestrator.get_association(id).await.unwrap();
    assert_ne!(status.state, AssociationState::FailedOver);
}

#[tokio::test]
async fn scenario_b_sync_moves_only_changed_bytes() {
    let h = harness(|_| {}).await;
    for i in 0..10 {
        h.write_primary(&format!("shard-{}.bin", i), vec![i as u8; 64 * 1024], 1);
    }
    let association = h
        .orchestrator
        .create_association(&h.primary.id, AssociationConfig::default())
        .await
        .unwrap();

    let first = match h.orchestrator.sync_now(association.id).await.unwrap() {
        TriggerOutcome::Ran(report) => report,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(first.bytes_copied, 10 * 64 * 1024);

    h.write_primary("shard-4.bin", vec![0xAB; 64 * 1024], 31);
    let second = match h.orchestrator.sync_now(association.id).await.unwrap() {
        TriggerOutcome::Ran(report) => report,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(second.files_copied, 1);
    assert_eq!(second.files_unchanged, 9);
    assert_eq!(second.bytes_copied, 64 * 1024);

    let backup = h.connector.tree(&association.backup.id);
    assert_eq!(
        backup.contents("shard-4.bin"),
        Some(vec![0xABu8; 64 * 1024].into())
    );
}

#[tokio::test]
async fn scenario_c_corrupt_chunk_gives_partial_restore() {
    let h = harness(|_| {}).await;
    for i in 0..10 {
        let data: Vec<u8> = (0..1000).map(|b| (b as u8).wrapping_mul(i + 1)).collect();
        h.write_primary(&format!("file-{}.dat", i), data, 1);
    }
    let id = h.synced_association().await;

    let manifest = h.orchestrator.create_snapshot(id).await.unwrap();
    assert_eq!(manifest.chunk_count(), 10);
    let victim = manifest.files[3].chunks[0].object_key.clone();
    assert!(h.store.corrupt(&victim));

    let target = h
        .provider
        .create(&InstanceSpec::new(InstanceRole::Primary, "us-east-1"))
        .await
        .unwrap();
    let result = h
        .orchestrator
        .restore_snapshot(manifest.id, &target.id)
        .await
        .unwrap();

    assert_eq!(result.status, RestoreStatus::Partial);
    assert_eq!(result.files_restored, 9);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].path, manifest.files[3].path);

    let restored = h.connector.tree(&target.id);
    assert_eq!(restored.paths().len(), 9);
    assert!(restored.contents(&manifest.files[3].path).is_none());
}

#[tokio::test]
async fn scenario_d_recovery_exhaustion_freezes_association() {
    let h = harness(|_| {}).await;
    h.write_primary("model.pt", vec![9u8; 5000], 1);
    let id = h.synced_association().await;
    let mut rx = h.orchestrator.subscribe();

    assert!(h.orchestrator.trigger_failover(id).await.unwrap());
    h.provider.fail_next_creates(10, CreateFailure::Transient);
    let creates_before = h.provider.create_calls();

    let err = h.orchestrator.recover(id).await.unwrap_err();
    assert!(matches!(err, Error::RecoveryExhausted { attempts: 3, .. }));
    assert_eq!(h.provider.create_calls() - creates_before, 3);

    let status = h.orchestrator.get_association(id).await.unwrap();
    assert_eq!(status.state, AssociationState::FailedOver);
    assert_eq!(status.active_endpoint.role, InstanceRole::Backup);
    assert!(status.last_sync_at.is_some());
    let alert = status.alert.expect("alert raised");
    assert_eq!(alert.kind, AlertKind::RecoveryExhausted);

    let events = drain(&mut rx);
    let attempts_failed = events
        .iter()
        .filter(|e| matches!(e, StandbyEvent::RecoveryAttemptFailed { .. }))
        .count();
    let exhausted = events
        .iter()
        .filter(|e| matches!(e, StandbyEvent::RecoveryExhausted { .. }))
        .count();
    assert_eq!(attempts_failed, 3);
    assert_eq!(exhausted, 1);

    // the alert is durable
    let row = AssociationTable::open(&h.db).unwrap().get(id).unwrap();
    assert_eq!(row.alert.map(|a| a.kind), Some(AlertKind::RecoveryExhausted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn automatic_recovery_after_detected_failure() {
    let h = harness(|c| c.recovery.auto_recover = true).await;
    h.write_primary("checkpoints/step-100.pt", vec![3u8; 12_000], 1);
    h.write_primary("config.yaml", b"lr: 0.001".to_vec(), 1);
    let id = h.synced_association().await;
    let backup_id = h.orchestrator.get_association(id).await.unwrap().backup_id;
    let mut rx = h.orchestrator.subscribe();

    h.provider.set_reachable(&h.primary.id, false);
    let mut last = FailoverAction::None;
    for _ in 0..3 {
        last = h.orchestrator.probe_now(id).await.unwrap();
    }
    assert_eq!(last, FailoverAction::FailedOver);

    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(StandbyEvent::RecoveryCompleted { new_primary, .. }) => return new_primary,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("recovery completes");

    let status = h.orchestrator.get_association(id).await.unwrap();
    assert_eq!(status.state, AssociationState::Syncing);
    assert_eq!(status.primary_id, completed.id);
    assert_eq!(status.backup_id, backup_id);
    assert_eq!(status.active_endpoint.role, InstanceRole::Primary);
    assert!(h.provider.instance(&h.primary.id).is_none());

    let new_tree = h.connector.tree(&completed.id);
    assert_eq!(
        new_tree.contents("config.yaml"),
        Some(b"lr: 0.001".to_vec().into())
    );

    // replication and health now follow the new primary
    assert_eq!(h.orchestrator.probe_now(id).await.unwrap(), FailoverAction::None);
    assert!(!h.orchestrator.get_association(id).await.unwrap().health.episode_open);
    new_tree.insert("notes.md", b"resumed".to_vec(), at(500));
    match h.orchestrator.sync_now(id).await.unwrap() {
        TriggerOutcome::Ran(report) => assert_eq!(report.files_copied, 1),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(h.connector.tree(&backup_id).contents("notes.md").is_some());
}

#[tokio::test]
async fn loops_replicate_until_shutdown() {
    let h = harness(|_| {}).await;
    h.write_primary("data.bin", vec![1u8; 2048], 1);
    let association = h
        .orchestrator
        .create_association(&h.primary.id, AssociationConfig::default())
        .await
        .unwrap();
    let mut rx = h.orchestrator.subscribe();

    h.orchestrator.start(association.id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(StandbyEvent::SyncCompleted { .. }) = rx.recv().await {
                break;
            }
        }
    })
    .await
    .expect("a sync completes");

    h.orchestrator.shutdown().await.unwrap();

    let status = h.orchestrator.get_association(association.id).await.unwrap();
    assert_eq!(status.state, AssociationState::Syncing);
    assert!(h
        .connector
        .tree(&association.backup.id)
        .contents("data.bin")
        .is_some());
}

#[tokio::test]
async fn reload_restores_persisted_state() {
    let h = harness(|_| {}).await;
    h.write_primary("a.txt", b"alpha".to_vec(), 1);
    let failed = h.synced_association().await;
    h.orchestrator.trigger_failover(failed).await.unwrap();

    let other_primary = h
        .provider
        .create(&InstanceSpec::new(InstanceRole::Primary, "us-west-2"))
        .await
        .unwrap();
    let interrupted = h
        .orchestrator
        .create_association(&other_primary.id, AssociationConfig::default())
        .await
        .unwrap()
        .id;
    let table = AssociationTable::open(&h.db).unwrap();
    let mut row = table.get(interrupted).unwrap();
    row.state = AssociationState::Recovering;
    table.put(&row).unwrap();

    let reloaded =
        StandbyOrchestrator::with_db(h.deps.clone(), h.config.clone(), h.db.clone()).unwrap();
    assert_eq!(reloaded.reload().await.unwrap(), 2);

    let status = reloaded.get_association(failed).await.unwrap();
    assert_eq!(status.state, AssociationState::FailedOver);
    assert!(status.health.episode_open);
    assert!(matches!(
        reloaded.sync_now(failed).await.unwrap(),
        TriggerOutcome::Stopped
    ));

    let status = reloaded.get_association(interrupted).await.unwrap();
    assert_eq!(status.state, AssociationState::FailedOver);
    assert_eq!(reloaded.reload().await.unwrap(), 0);
}
