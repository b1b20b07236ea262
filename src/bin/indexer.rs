//! shardlog Indexer Binary
//!
//! Reads JSON log messages from stdin, one per line, into a chunk manager that
//! seals, uploads and publishes chunks as they roll over.

use shardlog::blob::{BlobStore, BlobStoreConfig};
use shardlog::chunk::{ChunkManager, ChunkManagerConfig, LogMessage, ReplicaPolicy};
use shardlog::clock::BoundedClock;
use shardlog::config::ComponentFactory;
use shardlog::metadata::{EntityStore, IndexType};
use shardlog::rollover::RolloverPolicy;
use shardlog::telemetry::Telemetry;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// shardlog Indexer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory for active and unpublished chunks
    #[arg(long, env = "SHARDLOG_DATA_DIR", default_value = "/var/lib/shardlog/chunks")]
    data_dir: PathBuf,

    /// Index format of written chunks
    #[arg(long, env = "SHARDLOG_INDEX_TYPE", default_value = "LOGS_LUCENE9")]
    index_type: IndexType,

    /// Roll over once the chunk holds this many bytes (<= 0 disables)
    #[arg(long, default_value = "1073741824")]
    max_bytes: i64,

    /// Roll over once the chunk holds this many messages (<= 0 disables)
    #[arg(long, default_value = "5000000")]
    max_messages: i64,

    /// Roll over chunks older than this many seconds (0 disables)
    #[arg(long, default_value = "0")]
    max_age_secs: u64,

    /// Replica records published per snapshot
    #[arg(long, env = "SHARDLOG_REPLICAS_PER_SNAPSHOT")]
    replicas_per_snapshot: usize,

    /// Replica lifespan after the snapshot's end time; omit for no expiry
    #[arg(long, env = "SHARDLOG_REPLICA_LIFESPAN_SECS")]
    replica_lifespan_secs: Option<u64>,

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

    let _telemetry = Telemetry::init_for_component("shardlog-indexer", &args.log_level)?;

    info!("Starting shardlog indexer");

    let object_store = ComponentFactory::create_object_store().await?;
    let metadata = ComponentFactory::create_metadata_store(object_store.clone()).await?;
    let op_timeout = Duration::from_secs(args.metadata_timeout_secs);

    let rollover = if args.max_age_secs > 0 {
        RolloverPolicy::DiskMessageCountOrAge {
            max_bytes: args.max_bytes,
            max_messages: args.max_messages,
            max_age: Duration::from_secs(args.max_age_secs),
        }
    } else {
        RolloverPolicy::disk_or_message_count(args.max_bytes, args.max_messages)
    };
    let config = ChunkManagerConfig {
        data_dir: args.data_dir.clone(),
        index_type: args.index_type,
        rollover,
        ..Default::default()
    };
    let replica_policy = ReplicaPolicy::new(
        args.replicas_per_snapshot,
        args.replica_lifespan_secs.map(Duration::from_secs),
    )?;

    let manager = Arc::new(ChunkManager::new(
        config,
        replica_policy,
        BlobStore::new(object_store, BlobStoreConfig::default()),
        EntityStore::new(metadata.clone(), op_timeout),
        EntityStore::new(metadata, op_timeout),
        Arc::new(BoundedClock::default()),
    )?);

    // Corruption found while resuming aborts startup
    let report = manager.start().await?;
    info!(
        data_dir = %args.data_dir.display(),
        index_type = %args.index_type,
        resumed = report.resumed,
        failed = report.failed,
        "Indexer ready"
    );

    let shutdown = CancellationToken::new();
    let age_task = (args.max_age_secs > 0).then(|| {
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        let period = Duration::from_secs(args.max_age_secs.clamp(1, 60));
        tokio::spawn(async move { run_age_checks(manager, period, shutdown).await })
    });

    tokio::select! {
        result = read_stdin(&manager) => result?,
        _ = shutdown_signal() => {},
    }
    shutdown.cancel();
    if let Some(task) = age_task {
        let _ = task.await;
    }

    info!("Indexer shutting down");
    if let Some(snapshot) = manager.close().await? {
        info!(snapshot = %snapshot.name, "Published final chunk");
    }

    Ok(())
}

async fn read_stdin(manager: &ChunkManager) -> shardlog::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let message: LogMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping malformed log line");
                continue;
            }
        };
        manager.index(&message).await?;
    }
    info!(lines = line_number, "Reached end of input");
    Ok(())
}

async fn run_age_checks(manager: Arc<ChunkManager>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match manager.check_age().await {
                    Ok(Some(snapshot)) => info!(snapshot = %snapshot.name, "Rolled over aged chunk"),
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "Age-based rollover failed"),
                }
            }
        }
    }
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
