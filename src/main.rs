//! spotstandby - local operation of the snapshot and replication engines
//!
//! Usage:
//!   spotstandby init                        - Write a default configuration
//!   spotstandby status                      - Show configuration and stored state
//!   spotstandby snapshot <dir>              - Snapshot a directory
//!   spotstandby snapshots                   - List snapshots
//!   spotstandby restore <manifest> <dir>    - Restore a snapshot into a directory
//!   spotstandby sync <source> <dest>        - Mirror one directory onto another

use clap::{Parser, Subcommand};
use spotstandby::{
    association::AssociationTable,
    clock::{Clock, SystemClock},
    config::Config,
    fs::{ExclusionSet, InstanceFs, LocalFs},
    replication,
    snapshot::{ManifestCatalog, RestoreStatus, SnapshotPipeline, SnapshotSource},
    store::{FileObjectStore, ObjectStore},
    telemetry,
    transfer::{CancelToken, TransferPool},
    Error, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "spotstandby")]
#[command(author = "spotstandby Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Failover orchestration for spot-market GPU instances")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/spotstandby/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and create the data directory
    Init {
        /// Data directory (defaults to the platform data dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Show configuration and stored state
    Status,

    /// Snapshot a directory into the object store
    Snapshot {
        /// Directory to snapshot
        dir: PathBuf,

        /// Ignore earlier snapshots of the same directory
        #[arg(long)]
        full: bool,
    },

    /// List snapshots
    Snapshots,

    /// Restore a snapshot into a directory
    Restore {
        /// Manifest ID
        manifest: String,

        /// Target directory
        dir: PathBuf,
    },

    /// Mirror one directory onto another
    Sync {
        /// Source directory
        source: PathBuf,

        /// Destination directory
        dest: PathBuf,

        /// Compare content hashes instead of size and mtime
        #[arg(long)]
        hashes: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init_logging(cli.verbose) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    let command = match command {
        Commands::Init { data_dir } => return cmd_init(config_path, data_dir),
        other => other,
    };

    let config = load_config(config_path)?;
    let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;

    runtime.block_on(async {
        match command {
            Commands::Init { .. } => Ok(()),
            Commands::Status => cmd_status(config_path, &config).await,
            Commands::Snapshot { dir, full } => cmd_snapshot(&config, &dir, full).await,
            Commands::Snapshots => cmd_list_snapshots(&config),
            Commands::Restore { manifest, dir } => cmd_restore(&config, &manifest, &dir).await,
            Commands::Sync {
                source,
                dest,
                hashes,
            } => cmd_sync(&config, &source, &dest, hashes).await,
        }
    })
}

/// Load the config file, or defaults when it does not exist yet
fn load_config(config_path: &Path) -> Result<Config> {
    let config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        Config::from_env()?
    };
    config.ensure_directories()?;
    Ok(config)
}

/// Snapshot pipeline over the directory-backed store
fn open_pipeline(config: &Config) -> Result<(SnapshotPipeline, sled::Db)> {
    let db = sled::open(config.state_db_path())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(FileObjectStore::open(config.objects_dir())?);
    let pool = Arc::new(TransferPool::new(&config.snapshot, clock.clone()));
    let pipeline = SnapshotPipeline::new(
        store,
        ManifestCatalog::open(&db)?,
        pool,
        &config.snapshot,
        ExclusionSet::new(&config.replication.exclusions)?,
        clock,
    );
    Ok((pipeline, db))
}

fn cmd_init(config_path: &Path, data_dir: Option<PathBuf>) -> Result<()> {
    info!("Initializing spotstandby...");

    let mut config = Config::default();
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    config.validate()?;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;
    config.ensure_directories()?;

    info!("Configuration saved to {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);
    Ok(())
}

async fn cmd_status(config_path: &Path, config: &Config) -> Result<()> {
    let (pipeline, db) = open_pipeline(config)?;
    let store = FileObjectStore::open(config.objects_dir())?;
    let associations = AssociationTable::open(&db)?.list()?;

    println!("spotstandby Status");
    println!("==================");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Data directory: {:?}", config.data_dir);
    println!("Chunk size: {} MB", config.snapshot.chunk_size / 1024 / 1024);
    println!("Transfer concurrency: {}", config.snapshot.max_concurrent_transfers);
    println!("Compression: {}", if config.snapshot.compression_enabled { "enabled" } else { "disabled" });
    println!("Sync mode: {:?}, every {}s", config.replication.mode, config.replication.interval_secs);
    println!(
        "Failover after {} consecutive failed probes ({}s interval)",
        config.health.failure_threshold, config.health.probe_interval_secs
    );
    println!();
    println!("Snapshots (local): {}", pipeline.catalog().list_for(None)?.len());
    println!("Stored objects: {}", store.list().await?.len());
    println!("Associations: {}", associations.len());
    for association in associations {
        println!(
            "  {}  {}  primary={} backup={} last_sync={}",
            association.id,
            association.state,
            association.primary.id,
            association.backup.id,
            association
                .last_sync_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        );
    }

    Ok(())
}

async fn cmd_snapshot(config: &Config, dir: &Path, full: bool) -> Result<()> {
    let source = std::fs::canonicalize(dir)?;
    let source_ref = source.to_string_lossy().to_string();
    info!("Snapshotting {}...", source_ref);

    let (pipeline, _db) = open_pipeline(config)?;
    let base = if full {
        None
    } else {
        let latest = pipeline
            .catalog()
            .list_for(None)?
            .into_iter()
            .rev()
            .find(|m| m.source_instance == source_ref);
        pipeline.choose_base(latest)?
    };

    let fs = LocalFs::new(&source);
    let manifest = pipeline
        .create(
            SnapshotSource {
                fs: &fs,
                instance_ref: &source_ref,
                association_id: None,
            },
            base.as_ref(),
            &CancelToken::new(),
        )
        .await?;
    let pruned = pipeline.prune(None).await?;

    println!("Snapshot: {}", manifest.id);
    println!("Base: {}", manifest.base_manifest_id.map(|b| b.to_string()).unwrap_or_else(|| "(full)".to_string()));
    println!("Files: {}", manifest.files.len());
    println!("Chunks: {}", manifest.chunk_count());
    println!("Size: {} bytes ({} stored)", manifest.total_size, manifest.stored_size);
    println!("Uploaded: {} bytes", manifest.uploaded_bytes);
    if pruned > 0 {
        println!("Pruned: {} unreferenced chunks", pruned);
    }
    Ok(())
}

fn cmd_list_snapshots(config: &Config) -> Result<()> {
    let (pipeline, _db) = open_pipeline(config)?;
    let manifests = pipeline.catalog().list_for(None)?;

    println!("Snapshots:");
    println!("==========");
    if manifests.is_empty() {
        println!("(none)");
    }
    for manifest in manifests {
        println!(
            "{}  {}  {} files  {} bytes  {}  {}",
            manifest.id,
            manifest.created_at.to_rfc3339(),
            manifest.files.len(),
            manifest.total_size,
            if manifest.is_full() { "full" } else { "incremental" },
            manifest.source_instance
        );
    }
    Ok(())
}

async fn cmd_restore(config: &Config, manifest: &str, dir: &Path) -> Result<()> {
    let manifest_id = Uuid::parse_str(manifest)
        .map_err(|e| Error::Config(format!("Bad manifest id {:?}: {}", manifest, e)))?;
    info!("Restoring {} into {:?}...", manifest_id, dir);

    std::fs::create_dir_all(dir)?;
    let (pipeline, _db) = open_pipeline(config)?;
    let target = LocalFs::new(dir);
    target.sweep_staged().await?;
    let result = pipeline
        .restore(manifest_id, &target, &CancelToken::new())
        .await?;

    println!("Status: {:?}", result.status);
    println!("Files restored: {}", result.files_restored);
    println!("Bytes restored: {}", result.bytes_restored);
    if result.chunks_from_ancestors > 0 {
        println!("Chunks read via ancestors: {}", result.chunks_from_ancestors);
    }
    for failed in &result.failed {
        println!("FAILED {}: {}", failed.path, failed.reason);
    }

    match result.status {
        RestoreStatus::Complete => Ok(()),
        _ => Err(Error::SnapshotIntegrity {
            path: dir.to_string_lossy().to_string(),
            reason: format!("{} files failed to restore", result.failed.len()),
        }),
    }
}

async fn cmd_sync(config: &Config, source: &Path, dest: &Path, hashes: bool) -> Result<()> {
    info!("Syncing {:?} -> {:?}...", source, dest);

    std::fs::create_dir_all(dest)?;
    let exclusions = ExclusionSet::new(&config.replication.exclusions)?;
    let target = LocalFs::new(dest);
    target.sweep_staged().await?;
    let report = replication::sync(
        &LocalFs::new(source),
        &target,
        &exclusions,
        hashes || config.replication.compare_hashes,
        &CancelToken::new(),
    )
    .await?;

    println!("Copied: {} files ({} bytes)", report.files_copied, report.bytes_copied);
    println!("Deleted: {}", report.files_deleted);
    println!("Unchanged: {}", report.files_unchanged);
    println!("Excluded: {}", report.files_excluded);
    for (path, reason) in &report.failed {
        println!("FAILED {}: {}", path, reason);
    }
    report.into_result().map(|_| ())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
