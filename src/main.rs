//! statsreaper service
//!
//! Runs one reaper (scheduler/sweeper pair) per configured stats table,
//! plus the cleanup consumers that turn published close events into row
//! deletions.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use common::config::Configuration;
use common::events::InMemoryEventBus;
use common::liveness::{ClusterVerifier, InMemoryCluster, LivenessVerifier, PresenceRegistry};
use common::stats::{NodeId, StatsStore};
use reaper::{CleanupConsumer, ReaperRegistry, TableBinding, TableId};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "statsreaper.toml")]
    config: String,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = if std::path::Path::new(&args.config).exists() {
        Configuration::load_from_path(std::path::Path::new(&args.config))
            .context("Failed to load configuration")?
    } else {
        log::info!("Configuration file not found, using defaults");
        Configuration::default()
    };

    log::info!(
        "Starting statsreaper on node {} (interval {:?}, gc timeout {:?})",
        config.node.name,
        config.sweep.interval,
        config.sweep.gc_timeout
    );

    // Local presence plus the in-process cluster transport; remote nodes
    // join the same transport in clustered deployments.
    let presence = Arc::new(PresenceRegistry::new(NodeId::new(config.node.name.clone())));
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.join(presence.clone());
    let verifier: Arc<dyn LivenessVerifier> =
        Arc::new(ClusterVerifier::new(presence.clone(), cluster));

    let bus = Arc::new(InMemoryEventBus::new());
    let registry = ReaperRegistry::new();
    let mut consumers = Vec::new();

    for name in &config.sweep.tables {
        // A binding typo must fail startup, not silently leak stats
        let table: TableId = name
            .parse()
            .with_context(|| format!("Invalid sweep.tables entry {name:?}"))?;

        let store = Arc::new(StatsStore::new(config.sweep.interval));

        consumers.push(
            CleanupConsumer::new(table.event_kind(), store.clone(), bus.subscribe()).spawn(),
        );

        let reaper_id = registry
            .start(
                TableBinding {
                    table,
                    index: store.clone(),
                    stats: store,
                    verifier: verifier.clone(),
                    bus: bus.clone(),
                },
                &config.sweep,
                &config.liveness,
            )
            .with_context(|| format!("Failed to start reaper for table {table}"))?;

        log::info!(
            "Reaper for table {} registered with ID: {}",
            table,
            reaper_id
        );
    }

    log::info!("statsreaper running, waiting for shutdown signal");
    wait_for_shutdown_signal().await?;

    log::info!("Received shutdown signal, stopping reapers");
    registry.shutdown();
    for consumer in consumers {
        consumer.abort();
    }

    log::info!("statsreaper stopped");

    Ok(())
}
