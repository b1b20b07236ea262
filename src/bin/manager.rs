//! shardlog Manager Binary
//!
//! Runs the cluster scheduler: assigns replicas to cache slots, evicts expired
//! replicas and reclaims slots from nodes that stopped heart-beating.

use shardlog::clock::BoundedClock;
use shardlog::config::ComponentFactory;
use shardlog::metadata::EntityStore;
use shardlog::scheduler::{ClusterScheduler, SchedulerConfig};
use shardlog::telemetry::Telemetry;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// shardlog Manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serving slots each live replica should be bound to
    #[arg(long, env = "SHARDLOG_REPLICATION_FACTOR")]
    replication_factor: usize,

    /// Seconds a bound slot may go without an update before it is reset
    #[arg(long, env = "SHARDLOG_STALENESS_THRESHOLD_SECS")]
    staleness_threshold_secs: u64,

    /// Reconciliation interval in seconds
    #[arg(long, default_value = "15")]
    reconcile_interval_secs: u64,

    /// Tolerated clock skew between nodes in seconds
    #[arg(long, default_value = "30")]
    max_clock_skew_secs: u64,

    /// Metadata operation timeout in seconds
    #[arg(long, default_value = "30")]
    metadata_timeout_secs: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init_for_component("shardlog-manager", &args.log_level)?;

    info!("Starting shardlog manager");

    let object_store = ComponentFactory::create_object_store().await?;
    let metadata = ComponentFactory::create_metadata_store(object_store).await?;
    let op_timeout = Duration::from_secs(args.metadata_timeout_secs);

    let mut config = SchedulerConfig::new(
        args.replication_factor,
        Duration::from_secs(args.staleness_threshold_secs),
    )?;
    config.reconcile_interval = Duration::from_secs(args.reconcile_interval_secs.max(1));

    let scheduler = ClusterScheduler::new(
        config,
        EntityStore::new(metadata.clone(), op_timeout),
        EntityStore::new(metadata, op_timeout),
        Arc::new(BoundedClock::new(Duration::from_secs(args.max_clock_skew_secs))),
    );

    info!(
        replication_factor = args.replication_factor,
        staleness_threshold_secs = args.staleness_threshold_secs,
        reconcile_interval_secs = args.reconcile_interval_secs,
        "Manager ready"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    scheduler.run(shutdown).await?;

    info!("Manager stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
