//! fleetsync CLI - Operator interface for the sync platform.
//!
//! This tool runs the platform services in the foreground and exposes the
//! manual operations (sync, prune, view refresh, conflict handling).
//! Structured results are printed to stdout as JSON; logs go to stderr.
//!
//! On a disconnected node `run` holds a lock file in the data directory for
//! as long as it runs. The one-shot commands refuse to start while that file
//! exists; stop `run` first. A lock left behind by a killed process has to be
//! removed by hand.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fleetsync_sync::{
    ChannelBroadcaster, ConflictResolver, LogBroadcaster, Platform, PlatformConfig, Resolution,
    ResolutionStrategy, Side,
};

/// Identity stamped on conflicts settled from the command line.
const OPERATOR: &str = "operator";

/// Lock file held by `run` in the data directory.
const RUN_LOCK_FILE: &str = "fleetsync.run.lock";

#[derive(Parser)]
#[command(name = "fleetsync")]
#[command(about = "fleetsync - Dual-mode persistence and sync for fleet nodes")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON config file. Environment variables override its values.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every service and run until interrupted.
    Run,

    /// Run one sync pass now.
    Sync,

    /// Run one pruning pass now.
    Prune,

    /// Refresh every materialized view now.
    RefreshViews,

    /// Show service and queue status.
    Status,

    /// Inspect or settle recorded conflicts.
    Conflicts {
        #[command(subcommand)]
        action: ConflictAction,
    },
}

#[derive(Subcommand)]
enum ConflictAction {
    /// List unresolved conflicts.
    List {
        /// Maximum number of conflicts to show.
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Resolve pending conflicts with the configured strategy.
    Resolve,

    /// Settle one conflict by hand.
    Settle {
        /// Conflict id.
        #[arg(short, long)]
        id: String,

        /// Winning side: "local" or "remote".
        #[arg(short, long)]
        winner: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = PlatformConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Sync => cmd_sync(config).await,
        Commands::Prune => cmd_prune(config).await,
        Commands::RefreshViews => cmd_refresh_views(config).await,
        Commands::Status => cmd_status(config).await,
        Commands::Conflicts { action } => match action {
            ConflictAction::List { limit } => cmd_conflicts_list(config, limit).await,
            ConflictAction::Resolve => cmd_conflicts_resolve(config).await,
            ConflictAction::Settle { id, winner } => cmd_conflicts_settle(config, &id, &winner).await,
        },
    }
}

/// Exclusive claim of a data directory by `run`. Released on drop.
struct RunLock {
    path: PathBuf,
}

impl RunLock {
    fn acquire(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;
        let path = data_dir.join(RUN_LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                anyhow::bail!(
                    "fleetsync is already running on {} (remove {} if that process is gone)",
                    data_dir.display(),
                    path.display()
                )
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to create {}", path.display())),
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

/// Refuse to touch a data directory that `run` currently holds.
fn ensure_not_running(data_dir: &Path) -> Result<()> {
    let path = data_dir.join(RUN_LOCK_FILE);
    if path.exists() {
        anyhow::bail!(
            "fleetsync run is active on {}; stop it first (remove {} if that process is gone)",
            data_dir.display(),
            path.display()
        );
    }
    Ok(())
}

/// Bootstrap for a one-shot command. Services are built but not started.
async fn open_platform(config: PlatformConfig) -> Result<Platform> {
    if config.storage.mode.is_disconnected() {
        ensure_not_running(&config.storage.data_dir)?;
    }
    Platform::bootstrap(config, Arc::new(LogBroadcaster))
        .await
        .context("Failed to initialize storage")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run every service until Ctrl-C.
async fn cmd_run(config: PlatformConfig) -> Result<()> {
    let _lock = if config.storage.mode.is_disconnected() {
        Some(RunLock::acquire(&config.storage.data_dir)?)
    } else {
        None
    };
    let broadcaster = Arc::new(ChannelBroadcaster::new(1024));
    let platform = Platform::bootstrap(config, broadcaster)
        .await
        .context("Failed to initialize storage")?;

    platform.start_all().await;
    info!("fleetsync running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    platform.stop_all().await;
    Ok(())
}

async fn cmd_sync(config: PlatformConfig) -> Result<()> {
    let platform = open_platform(config).await?;
    let result = platform.sync().manual_sync().await;
    platform.context().close().await;

    print_json(&result)?;
    if !result.success {
        anyhow::bail!("Sync pass failed");
    }
    Ok(())
}

async fn cmd_prune(config: PlatformConfig) -> Result<()> {
    let platform = open_platform(config).await?;
    let result = platform.pruning().manual_prune().await;
    platform.context().close().await;

    print_json(&result)?;
    if !result.success {
        anyhow::bail!("Pruning pass failed");
    }
    Ok(())
}

async fn cmd_refresh_views(config: PlatformConfig) -> Result<()> {
    let platform = open_platform(config).await?;
    let result = platform.views().refresh_all().await;
    platform.context().close().await;

    let report = result.context("View refresh unavailable")?;
    print_json(&report)?;
    if report.failed() > 0 {
        anyhow::bail!("{} view(s) failed to refresh", report.failed());
    }
    Ok(())
}

async fn cmd_status(config: PlatformConfig) -> Result<()> {
    let platform = open_platform(config).await?;
    let status = platform.status().await;
    platform.context().close().await;

    print_json(&status)
}

async fn cmd_conflicts_list(config: PlatformConfig, limit: usize) -> Result<()> {
    let platform = open_platform(config).await?;
    let result = platform.sync().resolver().log().fetch_unresolved(limit).await;
    platform.context().close().await;

    print_json(&result.context("Failed to read conflicts")?)
}

async fn cmd_conflicts_resolve(config: PlatformConfig) -> Result<()> {
    let platform = open_platform(config).await?;
    let sync_config = platform.sync().config();
    let resolver = ConflictResolver::new(platform.context().store(), sync_config.conflict_strategy)
        .with_batch_limit(sync_config.conflict_batch_limit)
        .with_resolver_id(OPERATOR);
    let result = resolver.resolve_pending().await;
    platform.context().close().await;

    print_json(&result.context("Conflict resolution failed")?)
}

async fn cmd_conflicts_settle(config: PlatformConfig, id: &str, winner: &str) -> Result<()> {
    let winning_side = Side::parse(winner).context("Winner must be 'local' or 'remote'")?;

    let platform = open_platform(config).await?;
    let resolution = Resolution {
        strategy: ResolutionStrategy::Manual,
        winning_side,
        resolved_by: OPERATOR.to_string(),
        resolved_at: Utc::now(),
    };
    let result = platform
        .sync()
        .resolver()
        .log()
        .mark_resolved(id, &resolution)
        .await;
    platform.context().close().await;

    if !result.context("Failed to settle conflict")? {
        warn!(conflict = id, "Conflict not found or already resolved");
        anyhow::bail!("No unresolved conflict with id {}", id);
    }
    println!("Conflict {} settled in favor of {}", id, winning_side.as_str());
    Ok(())
}
