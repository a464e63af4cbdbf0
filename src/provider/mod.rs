//! Compute provider capability
//!
//! The orchestrator holds non-owning [`Instance`] records and changes remote
//! state only through a [`ComputeProvider`]. Liveness is answered by a
//! [`Prober`], kept separate so health checks can use a different channel
//! than the vendor control plane.

mod memory;

pub use memory::{CreateFailure, MemoryProvider};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role an instance plays in an association
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    Primary,
    Backup,
}

/// Provider-reported lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopped,
    Terminated,
}

/// Instance record as last described by the provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub provider: String,
    pub role: InstanceRole,
    pub address: String,
    pub region: String,
    pub status: InstanceStatus,
}

/// Request for a new instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceSpec {
    pub role: InstanceRole,
    pub region: String,
    /// Vendor machine type, e.g. a GPU SKU
    pub machine_type: Option<String>,
}

impl InstanceSpec {
    pub fn new(role: InstanceRole, region: impl Into<String>) -> Self {
        InstanceSpec {
            role,
            region: region.into(),
            machine_type: None,
        }
    }

    pub fn with_machine_type(mut self, machine_type: impl Into<String>) -> Self {
        self.machine_type = Some(machine_type.into());
        self
    }
}

/// Vendor control plane
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Provider name used in instance records
    fn name(&self) -> &str;

    async fn create(&self, spec: &InstanceSpec) -> Result<Instance>;

    async fn delete(&self, instance_id: &str) -> Result<()>;

    async fn start(&self, instance_id: &str) -> Result<()>;

    async fn stop(&self, instance_id: &str) -> Result<()>;

    async fn describe(&self, instance_id: &str) -> Result<Instance>;

    async fn list_regions(&self) -> Result<Vec<String>>;
}

/// Liveness check against a running instance
#[async_trait]
pub trait Prober: Send + Sync {
    /// `Ok` when the instance answered; an error means unreachable
    async fn probe(&self, instance: &Instance) -> Result<()>;
}
