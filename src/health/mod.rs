//! Primary liveness probing
//!
//! Failure detection is edge-triggered over consecutive probe failures.

mod monitor;

pub use monitor::{HealthMonitor, HealthSample, HealthSummary, ProbeVerdict};
