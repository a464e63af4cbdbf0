//! In-memory compute provider
//!
//! Simulates a vendor control plane and liveness endpoint, with knobs to
//! script probe results and inject provisioning failures.

use super::{ComputeProvider, Instance, InstanceSpec, InstanceStatus, Prober};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// How `create` should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFailure {
    Transient,
    Permanent,
}

pub struct MemoryProvider {
    name: String,
    regions: Vec<String>,
    instances: DashMap<String, Instance>,
    unreachable: Mutex<HashSet<String>>,
    probe_scripts: Mutex<HashMap<String, VecDeque<bool>>>,
    probe_delay: Mutex<Option<Duration>>,
    create_failures: Mutex<VecDeque<CreateFailure>>,
    failing_regions: Mutex<HashSet<String>>,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    probe_calls: AtomicUsize,
}

impl MemoryProvider {
    pub fn new(name: impl Into<String>, regions: &[&str]) -> Self {
        MemoryProvider {
            name: name.into(),
            regions: regions.iter().map(|r| r.to_string()).collect(),
            instances: DashMap::new(),
            unreachable: Mutex::new(HashSet::new()),
            probe_scripts: Mutex::new(HashMap::new()),
            probe_delay: Mutex::new(None),
            create_failures: Mutex::new(VecDeque::new()),
            failing_regions: Mutex::new(HashSet::new()),
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
        }
    }

    /// Register an instance that already exists (e.g. a user's primary)
    pub fn add_instance(&self, instance: Instance) {
        self.instances.insert(instance.id.clone(), instance);
    }

    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.instances.get(instance_id).map(|i| i.clone())
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn set_reachable(&self, instance_id: &str, reachable: bool) {
        let mut unreachable = self.unreachable.lock();
        if reachable {
            unreachable.remove(instance_id);
        } else {
            unreachable.insert(instance_id.to_string());
        }
    }

    /// Queue probe outcomes for an instance; consumed before reachability
    pub fn script_probes(&self, instance_id: &str, outcomes: &[bool]) {
        self.probe_scripts
            .lock()
            .entry(instance_id.to_string())
            .or_default()
            .extend(outcomes.iter().copied());
    }

    /// Delay every probe answer
    pub fn set_probe_delay(&self, delay: Option<Duration>) {
        *self.probe_delay.lock() = delay;
    }

    /// Fail the next `count` create calls
    pub fn fail_next_creates(&self, count: usize, kind: CreateFailure) {
        let mut failures = self.create_failures.lock();
        for _ in 0..count {
            failures.push_back(kind);
        }
    }

    /// Fail every create in a region
    pub fn fail_region(&self, region: &str) {
        self.failing_regions.lock().insert(region.to_string());
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    fn not_found(instance_id: &str) -> Error {
        Error::InstanceNotFound(instance_id.to_string())
    }
}

#[async_trait]
impl ComputeProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<Instance> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(kind) = self.create_failures.lock().pop_front() {
            return Err(match kind {
                CreateFailure::Transient => {
                    Error::TransientProvider(format!("no spot capacity in {}", spec.region))
                }
                CreateFailure::Permanent => {
                    Error::PermanentProvider(format!("quota exceeded in {}", spec.region))
                }
            });
        }
        if self.failing_regions.lock().contains(&spec.region) {
            return Err(Error::TransientProvider(format!(
                "no spot capacity in {}",
                spec.region
            )));
        }
        if !self.regions.is_empty() && !self.regions.contains(&spec.region) {
            return Err(Error::PermanentProvider(format!(
                "unknown region {}",
                spec.region
            )));
        }

        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", self.name, &short[..12]);
        let instance = Instance {
            id: id.clone(),
            provider: self.name.clone(),
            role: spec.role,
            address: format!("10.0.0.{}", self.instances.len() % 250 + 2),
            region: spec.region.clone(),
            status: InstanceStatus::Running,
        };
        debug!(instance = %id, region = %spec.region, "created instance");
        self.instances.insert(id, instance.clone());
        Ok(instance)
    }

    async fn delete(&self, instance_id: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.instances
            .remove(instance_id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(instance_id))
    }

    async fn start(&self, instance_id: &str) -> Result<()> {
        let mut instance = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Self::not_found(instance_id))?;
        instance.status = InstanceStatus::Running;
        Ok(())
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        let mut instance = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Self::not_found(instance_id))?;
        instance.status = InstanceStatus::Stopped;
        Ok(())
    }

    async fn describe(&self, instance_id: &str) -> Result<Instance> {
        self.instance(instance_id)
            .ok_or_else(|| Self::not_found(instance_id))
    }

    async fn list_regions(&self) -> Result<Vec<String>> {
        Ok(self.regions.clone())
    }
}

#[async_trait]
impl Prober for MemoryProvider {
    async fn probe(&self, instance: &Instance) -> Result<()> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.probe_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .probe_scripts
            .lock()
            .get_mut(&instance.id)
            .and_then(|q| q.pop_front());
        let alive = match scripted {
            Some(outcome) => outcome,
            None => {
                !self.unreachable.lock().contains(&instance.id)
                    && self
                        .instances
                        .get(&instance.id)
                        .map(|i| i.status == InstanceStatus::Running)
                        .unwrap_or(false)
            }
        };

        if alive {
            Ok(())
        } else {
            Err(Error::TransientProvider(format!("{} unreachable", instance.id)))
        }
    }
}
