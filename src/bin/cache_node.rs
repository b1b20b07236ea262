//! shardlog Cache Node Binary
//!
//! Registers this host's cache slots and loads or evicts replicas as the
//! scheduler assigns them.

use shardlog::blob::{BlobStore, BlobStoreConfig};
use shardlog::cache::{CacheNode, CacheNodeConfig, LocalDiskDataPlane};
use shardlog::clock::BoundedClock;
use shardlog::config::ComponentFactory;
use shardlog::metadata::{EntityStore, IndexType};
use shardlog::telemetry::Telemetry;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// shardlog Cache Node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Hostname used as the partition of this node's slot records
    #[arg(long, env = "HOSTNAME")]
    hostname: String,

    /// Number of cache slots to expose
    #[arg(long, env = "SHARDLOG_SLOTS_PER_NODE", default_value = "4")]
    slots_per_node: usize,

    /// Index formats this node can serve (repeatable)
    #[arg(long = "index-type", default_value = "LOGS_LUCENE9")]
    index_types: Vec<IndexType>,

    /// Directory for downloaded snapshots
    #[arg(long, env = "SHARDLOG_CACHE_DIR", default_value = "/var/lib/shardlog/cache")]
    cache_dir: PathBuf,

    /// Snapshot download timeout in seconds
    #[arg(long, default_value = "300")]
    download_timeout_secs: u64,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "10")]
    heartbeat_interval_secs: u64,

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

    let _telemetry = Telemetry::init_for_component("shardlog-cache-node", &args.log_level)?;

    info!("Starting shardlog cache node");

    let object_store = ComponentFactory::create_object_store().await?;
    let metadata = ComponentFactory::create_metadata_store(object_store.clone()).await?;
    let op_timeout = Duration::from_secs(args.metadata_timeout_secs);

    let config = CacheNodeConfig {
        hostname: args.hostname.clone(),
        slots_per_node: args.slots_per_node,
        supported_index_types: args.index_types.clone(),
        download_timeout: Duration::from_secs(args.download_timeout_secs),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs.max(1)),
        ..Default::default()
    };

    let node = Arc::new(CacheNode::new(
        config,
        EntityStore::new(metadata.clone(), op_timeout),
        EntityStore::new(metadata.clone(), op_timeout),
        EntityStore::new(metadata, op_timeout),
        BlobStore::new(object_store, BlobStoreConfig::default()),
        Arc::new(LocalDiskDataPlane::new(&args.cache_dir)),
        Arc::new(BoundedClock::default()),
    )?);

    let slots = node.register().await?;
    info!(
        hostname = %args.hostname,
        slots = slots.len(),
        cache_dir = %args.cache_dir.display(),
        "Cache node ready"
    );

    let shutdown = CancellationToken::new();
    let runner = {
        let node = Arc::clone(&node);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { node.run(shutdown).await })
    };

    shutdown_signal().await;
    info!("Cache node shutting down");

    // Hand live slots back before stopping
    match node.drain().await {
        Ok(requested) => info!(slots = requested, "Requested eviction of live slots"),
        Err(e) => error!(error = %e, "Drain failed"),
    }
    if let Err(e) = node.reconcile_once().await {
        error!(error = %e, "Final reconciliation failed");
    }

    shutdown.cancel();
    runner.await??;

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
