//! ccdeployd: the rolling deployment daemon.
//!
//! Wires the record store, the scheduler client and the deployment
//! updater together, then drives the control loop on a fixed timer.
//!
//! # Usage
//!
//! ```text
//! ccdeployd --config /etc/ccdeploy/ccdeployd.toml run
//! ccdeployd --data-dir /var/lib/ccdeploy tick
//! ccdeployd deploy <app-id> --droplet <droplet-id>
//! ccdeployd cancel <deployment-id>
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ccdeploy_instances::{HttpInstancesClient, InstancesReporter};
use ccdeploy_state::{LockTable, StateStore};
use ccdeploy_updater::{DeploymentActions, DeploymentUpdater};

use config::{ConfigOverrides, DaemonConfig, LogFormat};

const DEFAULT_FILTER: &str = "info,ccdeployd=debug,ccdeploy=debug";

#[derive(Parser)]
#[command(name = "ccdeployd", about = "Rolling deployment daemon")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for persistent state.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Workload scheduler address (host:port).
    #[arg(long, global = true)]
    scheduler_address: Option<String>,

    /// Seconds between control loop ticks.
    #[arg(long, global = true)]
    interval: Option<u64>,

    /// Deployments stepped concurrently per tick.
    #[arg(long, global = true)]
    max_workers: Option<usize>,

    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop until interrupted.
    Run,
    /// Run a single tick and print its summary as JSON.
    Tick,
    /// Start a rolling deployment for an app.
    Deploy {
        app_id: String,

        /// Droplet to roll onto; defaults to the app's current droplet.
        #[arg(long)]
        droplet: Option<String>,
    },
    /// Request cancellation of an in-flight deployment.
    Cancel { deployment_id: String },
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            data_dir: self.data_dir.clone(),
            scheduler_address: self.scheduler_address.clone(),
            update_frequency_secs: self.interval,
            max_workers: self.max_workers,
            log_format: self.log_format,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load(cli.config.as_deref(), cli.overrides())?;

    init_tracing(config.log_format);

    let store = open_store(&config)?;
    let locks = LockTable::new();

    match cli.command {
        Command::Run => run(config, store, locks).await,
        Command::Tick => {
            let updater = build_updater(&config, store, locks);
            let summary = updater.update().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Deploy { app_id, droplet } => {
            let actions = DeploymentActions::new(store, locks);
            let deployment = actions.create(&app_id, droplet.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&deployment)?);
            Ok(())
        }
        Command::Cancel { deployment_id } => {
            let actions = DeploymentActions::new(store, locks);
            let deployment = actions.request_cancel(&deployment_id).await?;
            println!("{}", serde_json::to_string_pretty(&deployment)?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn open_store(config: &DaemonConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

fn build_updater(config: &DaemonConfig, store: StateStore, locks: LockTable) -> DeploymentUpdater {
    let client = HttpInstancesClient::new(
        config.scheduler_address.clone(),
        config.scheduler_timeout(),
    );
    info!(scheduler = %client.address(), "scheduler client initialized");
    let reporter = InstancesReporter::new(Arc::new(client));
    DeploymentUpdater::new(store, locks, reporter, config.updater())
}

async fn run(config: DaemonConfig, store: StateStore, locks: LockTable) -> anyhow::Result<()> {
    info!(
        interval = config.update_frequency_secs,
        max_workers = config.max_workers,
        "ccdeploy daemon starting"
    );

    let updater = build_updater(&config, store, locks);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = config.update_interval();

    let updater_handle = tokio::spawn(async move {
        updater.run(interval, shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("installing CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // The in-flight tick, if any, drains before the loop observes shutdown.
    updater_handle.await?;

    info!("ccdeploy daemon stopped");
    Ok(())
}
