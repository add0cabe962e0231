//! cellgridd — the cellgrid daemon.
//!
//! Runs every cellgrid component in one process against a local state
//! store:
//! - State store (redb)
//! - Cell agent
//! - Auctioneer, behind the auctioneer lease
//! - Converger, behind the converger lease
//!
//! # Usage
//!
//! ```text
//! cellgridd standalone --data-dir /var/lib/cellgrid --memory-mb 4096 --disk-mb 8192
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use cellgrid_auction::AuctioneerConfig;
use cellgrid_cell::{CellConfig, TracingLogSink};
use cellgrid_converger::ConvergerConfig;
use cellgrid_core::CellgridConfig;
use cellgrid_state::StateStore;
use cellgridd::{DesiredFile, seed_desired, spawn_auctioneer, spawn_cell, spawn_converger};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cellgridd", about = "cellgrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single-node cluster (all components in one process).
    Standalone {
        /// Path to cellgrid.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Cell identifier.
        #[arg(long)]
        cell_id: Option<String>,

        /// Stack this cell can run.
        #[arg(long)]
        stack: Option<String>,

        /// Memory capacity in MB.
        #[arg(long, allow_hyphen_values = true)]
        memory_mb: Option<i64>,

        /// Disk capacity in MB.
        #[arg(long, allow_hyphen_values = true)]
        disk_mb: Option<i64>,

        /// File descriptors shared by all containers.
        #[arg(long)]
        file_descriptors: Option<u64>,

        /// Maximum concurrent containers.
        #[arg(long)]
        max_containers: Option<u32>,

        /// Root directory for container sandboxes.
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// JSON file of desired LRPs and tasks to create at startup.
        #[arg(long)]
        desired: Option<PathBuf>,
    },

    /// Parse a config file and print the resolved timings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cellgrid=debug"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Standalone {
            config,
            data_dir,
            cell_id,
            stack,
            memory_mb,
            disk_mb,
            file_descriptors,
            max_containers,
            work_dir,
            desired,
        } => {
            let file = match &config {
                Some(path) => CellgridConfig::from_file(path)?,
                None => CellgridConfig::default(),
            };
            let overrides = Overrides {
                data_dir,
                cell_id,
                stack,
                memory_mb,
                disk_mb,
                file_descriptors,
                max_containers,
                work_dir,
            };
            run_standalone(file, overrides, desired).await
        }
        Command::CheckConfig { config } => {
            let settings = CellgridConfig::from_file(&config)?.settings()?;
            println!("{settings:#?}");
            Ok(())
        }
    }
}

/// Command-line values that take precedence over the config file.
struct Overrides {
    data_dir: Option<PathBuf>,
    cell_id: Option<String>,
    stack: Option<String>,
    memory_mb: Option<i64>,
    disk_mb: Option<i64>,
    file_descriptors: Option<u64>,
    max_containers: Option<u32>,
    work_dir: Option<PathBuf>,
}

async fn run_standalone(
    file: CellgridConfig,
    overrides: Overrides,
    desired: Option<PathBuf>,
) -> anyhow::Result<()> {
    let settings = file.settings()?;
    let section = file.cell.clone().unwrap_or_default();
    let data_dir = overrides
        .data_dir
        .or_else(|| file.store.clone().and_then(|s| s.data_dir))
        .unwrap_or_else(|| PathBuf::from("/var/lib/cellgrid"));
    let work_dir = overrides
        .work_dir
        .or(section.work_dir)
        .unwrap_or_else(|| data_dir.join("containers"));

    let mut cell_config = CellConfig::new(
        overrides
            .cell_id
            .or(section.id)
            .unwrap_or_else(|| "cell-0".to_string()),
        overrides
            .stack
            .or(section.stack)
            .unwrap_or_else(|| "linux".to_string()),
        overrides.memory_mb.or(section.memory_mb).unwrap_or(0),
        overrides.disk_mb.or(section.disk_mb).unwrap_or(0),
    );
    if let Some(max) = overrides.max_containers.or(section.max_containers) {
        cell_config.max_containers = max;
    }
    if let Some(fds) = overrides.file_descriptors.or(section.file_descriptors) {
        cell_config.file_descriptors = fds;
    }
    cell_config.heartbeat_interval = settings.heartbeat_interval;
    cell_config.validate()?;

    info!("cellgrid daemon starting in standalone mode");

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("failed to create {}", work_dir.display()))?;
    let db_path = data_dir.join("cellgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    if let Some(path) = desired {
        let created = seed_desired(&store, DesiredFile::from_file(&path)?)?;
        info!(path = ?path, created, "desired state seeded");
    }

    let owner = format!("{}-{}", cell_config.cell_id, std::process::id());
    let cell = spawn_cell(
        store.clone(),
        cell_config,
        &work_dir,
        Arc::new(TracingLogSink),
    )?;
    let auctioneer = spawn_auctioneer(
        store.clone(),
        &owner,
        AuctioneerConfig {
            interval: settings.auctioneer_interval,
            cell_ttl: settings.cell_ttl,
        },
        settings.lease_ttl,
    )?;
    let converger = spawn_converger(
        store.clone(),
        &owner,
        ConvergerConfig {
            interval: settings.converger_interval,
            cell_ttl: settings.cell_ttl,
            task_retention: settings.task_retention,
        },
        settings.lease_ttl,
    )?;
    info!(?settings, "all components started");

    // ── Shutdown ───────────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");

    auctioneer.stop().await;
    converger.stop().await;
    cell.stop().await;

    info!("cellgrid daemon stopped");
    Ok(())
}
