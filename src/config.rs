//! Configuration management for spotstandby

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default chunk size: 64MB
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Default number of concurrent chunk transfers
pub const DEFAULT_MAX_TRANSFERS: usize = 32;

/// Default periodic sync interval
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// Default consecutive probe failures before failover
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Health probing
    pub health: HealthConfig,

    /// Primary to backup replication
    pub replication: ReplicationConfig,

    /// Chunked snapshots
    pub snapshot: SnapshotConfig,

    /// Recovery after failover
    pub recovery: RecoveryConfig,

    /// Path to the data directory
    pub data_dir: PathBuf,
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between probes in seconds
    pub probe_interval_secs: u64,

    /// Per-probe timeout in milliseconds
    pub probe_timeout_ms: u64,

    /// Consecutive failures that declare an outage
    pub failure_threshold: u32,

    /// Number of samples kept for reporting
    pub window_size: usize,
}

/// How replication is driven
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Full tree diff on a fixed interval
    Periodic,
    /// Change notifications, debounced
    Realtime,
}

/// Replication engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Default mode for new associations
    pub mode: SyncMode,

    /// Periodic sync interval in seconds
    pub interval_secs: u64,

    /// Debounce window for realtime mode (ms)
    pub debounce_ms: u64,

    /// Glob patterns never replicated
    pub exclusions: Vec<String>,

    /// Compare content hashes instead of size/mtime
    pub compare_hashes: bool,
}

/// Snapshot pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Chunk size in bytes
    pub chunk_size: usize,

    /// Enable compression
    pub compression_enabled: bool,

    /// Minimum size to compress (bytes)
    pub compression_threshold: usize,

    /// Maximum concurrent chunk transfers
    pub max_concurrent_transfers: usize,

    /// Retry attempts per chunk transfer
    pub retry_attempts: u32,

    /// Base delay for exponential backoff (ms)
    pub retry_base_delay_ms: u64,

    /// Manifests kept per association (0 = unlimited)
    pub max_snapshots: usize,

    /// Automatic snapshot interval in seconds (0 = disabled)
    pub auto_snapshot_interval_secs: u64,
}

/// Recovery controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Bounded number of recovery attempts
    pub max_attempts: u32,

    /// Base delay between attempts (ms)
    pub base_delay_ms: u64,

    /// Ceiling for the backoff delay (ms)
    pub max_delay_ms: u64,

    /// Timeout for one provisioning race (seconds)
    pub provision_timeout_secs: u64,

    /// Interval between liveness polls of a new instance (seconds)
    pub liveness_poll_interval_secs: u64,

    /// Give up waiting for a new instance after this long (seconds)
    pub liveness_timeout_secs: u64,

    /// Start recovery automatically after failover
    pub auto_recover: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("spotstandby");

        Config {
            health: HealthConfig::default(),
            replication: ReplicationConfig::default(),
            snapshot: SnapshotConfig::default(),
            recovery: RecoveryConfig::default(),
            data_dir,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            probe_interval_secs: 10,
            probe_timeout_ms: 3000,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            window_size: 32,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            mode: SyncMode::Periodic,
            interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            debounce_ms: 1000,
            exclusions: vec![
                ".git".to_string(),
                ".hg".to_string(),
                ".svn".to_string(),
                "__pycache__".to_string(),
                ".cache".to_string(),
                "node_modules".to_string(),
                "*.pyc".to_string(),
                "*.tmp".to_string(),
            ],
            compare_hashes: false,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression_enabled: true,
            compression_threshold: 1024, // Only compress if > 1KB
            max_concurrent_transfers: DEFAULT_MAX_TRANSFERS,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            max_snapshots: 10,
            auto_snapshot_interval_secs: 0,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 60_000,
            provision_timeout_secs: 600,
            liveness_poll_interval_secs: 5,
            liveness_timeout_secs: 300,
            auto_recover: true,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("SPOTSTANDBY_DATA_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(threshold) = std::env::var("SPOTSTANDBY_FAILURE_THRESHOLD") {
            if let Ok(n) = threshold.trim().parse::<u32>() {
                self.health.failure_threshold = n;
            }
        }

        if let Ok(interval) = std::env::var("SPOTSTANDBY_SYNC_INTERVAL") {
            if let Ok(secs) = interval.trim().parse::<u64>() {
                self.replication.interval_secs = secs;
            }
        }

        if let Ok(chunk_size) = std::env::var("SPOTSTANDBY_CHUNK_SIZE") {
            if let Ok(size) = chunk_size.trim().parse::<usize>() {
                self.snapshot.chunk_size = size;
            }
        }

        if let Ok(transfers) = std::env::var("SPOTSTANDBY_MAX_TRANSFERS") {
            if let Ok(n) = transfers.trim().parse::<usize>() {
                self.snapshot.max_concurrent_transfers = n;
            }
        }
    }

    /// Create a config from defaults and environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.health.failure_threshold == 0 {
            return Err(Error::InvalidConfig(
                "Failure threshold must be greater than 0".to_string(),
            ));
        }

        if self.health.probe_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "Probe interval must be greater than 0".to_string(),
            ));
        }

        if self.health.probe_timeout_ms >= self.health.probe_interval_secs * 1000 {
            return Err(Error::InvalidConfig(
                "Probe timeout must be shorter than the probe interval".to_string(),
            ));
        }

        if self.replication.interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "Sync interval must be greater than 0".to_string(),
            ));
        }

        if self.snapshot.chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "Chunk size must be greater than 0".to_string(),
            ));
        }

        if self.snapshot.max_concurrent_transfers == 0 {
            return Err(Error::InvalidConfig(
                "Transfer concurrency must be greater than 0".to_string(),
            ));
        }

        if self.recovery.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "Recovery attempts must be greater than 0".to_string(),
            ));
        }

        for pattern in &self.replication.exclusions {
            glob::Pattern::new(pattern).map_err(|e| {
                Error::InvalidConfig(format!("Bad exclusion pattern {:?}: {}", pattern, e))
            })?;
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.objects_dir())?;
        Ok(())
    }

    /// Location of the sled state database
    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    /// Location of the directory-backed object store
    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }
}
