//! spotstandby - Failover orchestration for spot-market GPU instances
//!
//! Each managed primary gets a continuously replicated backup. A health
//! monitor watches the primary; when it stops answering, the backup is
//! promoted and a replacement primary is provisioned and restored, either
//! from the live backup or from chunked, content-addressed snapshots.

pub mod association;
pub mod chunk;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod failover;
pub mod fs;
pub mod health;
pub mod orchestrator;
pub mod provider;
pub mod recovery;
pub mod region;
pub mod replication;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod transfer;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{Deps, StandbyOrchestrator};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::association::{AssociationConfig, AssociationState, AssociationStatus};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::events::StandbyEvent;
    pub use crate::orchestrator::{Deps, StandbyOrchestrator};
}
