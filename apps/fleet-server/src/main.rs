//! Fleet daemon binary.
//!
//! Loads the master inventory, starts the application front door as a
//! background task, and runs the single-writer daemon loop with the dealer
//! hooked into its cycle. Terminates on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use fleet_appserver::{AppServer, AppServerConfig};
use fleet_daemon::{AppEventBus, Daemon, DaemonConfig, ShutdownController};
use fleet_dealer::{
    CopyRequestsConfig, CopyRequestsHandler, Dealer, QuotaPolicy, RequestRegistry,
};
use fleet_inventory::{FsInventoryStore, Inventory, InventoryConfig, LoadFilters};
use fleet_master::MasterServer;

#[derive(Parser)]
#[command(name = "fleet-server", about = "Data-management daemon for the storage fleet")]
struct Cli {
    /// Server configuration file (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Override the configured listen port
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    inventory: InventoryConfig,
    registry_dir: PathBuf,
    requests_dir: PathBuf,
    spool_dir: PathBuf,
    #[serde(default)]
    port: Option<u16>,
    dealer: DealerSection,
}

#[derive(Debug, Deserialize)]
struct DealerSection {
    partition: String,
    max_size_tb: f64,
    block_request_max: f64,
    #[serde(default)]
    overwritten_groups: Vec<String>,
    #[serde(default = "default_dealer_cycle")]
    cycle_seconds: u64,
}

fn default_dealer_cycle() -> u64 {
    30
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config.display()))?;
    let config: ServerConfig = serde_json::from_str(&raw).context("parsing config file")?;

    let master = Arc::new(MasterServer::open(&config.registry_dir)?);

    let mut store = FsInventoryStore::open(&config.inventory.data_dir)?;
    store.set_retry_policy(
        config.inventory.persistence_max_retries,
        config.inventory.persistence_retry_delay_ms,
    );
    let mut inventory = Inventory::new();
    inventory.attach_store(store);
    inventory.load(&config.inventory.partitions, &LoadFilters::default())?;

    let events = AppEventBus::new();
    let shutdown = Arc::new(ShutdownController::new());

    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            tracing::info!("Termination signal received.");
            shutdown.trigger();
        });
    }

    let port = cli
        .port
        .or(config.port)
        .unwrap_or_else(AppServerConfig::port_from_env);
    let app_server = Arc::new(AppServer::new(
        Arc::clone(&master),
        events.clone(),
        AppServerConfig {
            port,
            workarea_root: config.spool_dir.clone(),
        },
    ));
    let listener = app_server.bind().await?;
    tracing::info!("Application server listening on port {}", port);
    tokio::spawn(app_server.serve(listener, shutdown.subscribe()));

    let mut dealer_config = CopyRequestsConfig::new(
        config.dealer.max_size_tb,
        config.dealer.block_request_max,
    );
    dealer_config.overwritten_groups = config.dealer.overwritten_groups.clone();
    let mut dealer = Dealer::new(
        RequestRegistry::open(&config.requests_dir)?,
        CopyRequestsHandler::new(dealer_config),
        Box::new(QuotaPolicy::new(config.dealer.partition.clone())),
    );

    let dealer_interval = Duration::from_secs(config.dealer.cycle_seconds);
    let mut last_cycle = Instant::now() - dealer_interval;
    let hook_master = Arc::clone(&master);

    let mut daemon = Daemon::new(
        Arc::clone(&master),
        inventory,
        events,
        shutdown.subscribe(),
        DaemonConfig::default(),
    );
    daemon.set_cycle_hook(Box::new(move |inventory: &mut Inventory| {
        if last_cycle.elapsed() < dealer_interval {
            return;
        }
        last_cycle = Instant::now();

        let lock = hook_master.write_lock();
        if !lock.lock("dealer") {
            tracing::warn!("Skipping dealer cycle; another writer is active.");
            return;
        }
        let proposals = dealer.run_cycle(inventory);
        for proposal in &proposals {
            tracing::info!(
                "Proposing {} ({} blocks) to {}",
                proposal.dataset,
                proposal
                    .blocks
                    .as_ref()
                    .map_or("all".to_owned(), |b| b.len().to_string()),
                proposal.destination.as_deref().unwrap_or("?"),
            );
        }
        // hand-off to the transfer back end happens out of process; the
        // accepted placements queue their active-copy rows here
        dealer.postprocess(&proposals);
        lock.unlock("dealer");
    }));

    daemon.run().await;
    Ok(())
}
