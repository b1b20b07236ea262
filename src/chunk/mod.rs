//! Chunk lifecycle management for the indexer
//!
//! The manager owns the single mutable chunk of an indexing process:
//! - Appending records and tracking rollover statistics
//! - Sealing the chunk once the rollover policy fires
//! - Uploading the sealed segment to blob storage under its content hash
//! - Publishing the Snapshot record, then one Replica record per copy
//! - Resuming sealed-but-unpublished chunks after a restart

mod segment;
mod store;

pub use segment::{
    content_hash, decode_segment, recover_segment, IndexWriter, LogMessage, SealedSegment,
    SegmentWriter,
};
pub use store::{ChunkManifest, LocalChunkStore, ManifestState, SEGMENT_FILE};

use crate::blob::BlobStore;
use crate::clock::Clock;
use crate::metadata::{
    EntityStore, IndexType, PartitionedMetadata, ReplicaMetadata, SnapshotMetadata,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::rollover::{RolloverPolicy, RolloverStats};
use crate::{Error, Result};

use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Per-chunk lifecycle state. `Sealed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkState {
    Active,
    Rolling,
    Sealed,
    Failed,
}

/// Configuration for the chunk manager
#[derive(Debug, Clone)]
pub struct ChunkManagerConfig {
    /// Directory holding one subdirectory per chunk
    pub data_dir: PathBuf,
    /// Index format of every chunk this manager writes
    pub index_type: IndexType,
    /// When to seal the active chunk
    pub rollover: RolloverPolicy,
    /// Retry budget for blob uploads
    pub upload_retry: RetryPolicy,
    /// Retry budget for metadata publication
    pub publish_retry: RetryPolicy,
}

impl Default for ChunkManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/shardlog/chunks"),
            index_type: IndexType::LogsLucene9,
            rollover: RolloverPolicy::disk_or_message_count(
                1024 * 1024 * 1024, // 1GiB
                5_000_000,
            ),
            upload_retry: RetryPolicy::default(),
            publish_retry: RetryPolicy::default(),
        }
    }
}

/// How many replicas each snapshot gets and how long they live.
///
/// No `Default`: both values come from deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaPolicy {
    pub replicas_per_snapshot: usize,
    /// `None` publishes replicas that never expire
    pub lifespan: Option<Duration>,
}

impl ReplicaPolicy {
    pub fn new(replicas_per_snapshot: usize, lifespan: Option<Duration>) -> Result<Self> {
        if replicas_per_snapshot == 0 {
            return Err(Error::Config(
                "replicas_per_snapshot must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            replicas_per_snapshot,
            lifespan,
        })
    }

    /// Expiry for replicas of a snapshot ending at `end_time_epoch_ms`.
    pub fn expire_after(&self, end_time_epoch_ms: i64) -> i64 {
        match self.lifespan {
            Some(lifespan) => {
                let millis = i64::try_from(lifespan.as_millis()).unwrap_or(i64::MAX);
                end_time_epoch_ms.saturating_add(millis)
            }
            None => 0,
        }
    }
}

/// Outcome of startup recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Chunks brought to a published state
    pub resumed: usize,
    /// Chunks whose publication failed again
    pub failed: usize,
}

struct ActiveChunk {
    manifest: ChunkManifest,
    writer: Box<dyn IndexWriter>,
    stats: RolloverStats,
}

/// A sealed chunk on its way to blob storage and the metadata store.
struct PendingPublish {
    manifest: ChunkManifest,
    bytes: Bytes,
}

pub struct ChunkManager {
    config: ChunkManagerConfig,
    replica_policy: ReplicaPolicy,
    store: LocalChunkStore,
    blobs: BlobStore,
    snapshots: EntityStore<SnapshotMetadata>,
    replicas: EntityStore<ReplicaMetadata>,
    clock: Arc<dyn Clock>,
    /// Serializes every mutation of the active chunk
    active: Mutex<Option<ActiveChunk>>,
    states: DashMap<String, ChunkState>,
    closed: AtomicBool,
}

impl ChunkManager {
    pub fn new(
        config: ChunkManagerConfig,
        replica_policy: ReplicaPolicy,
        blobs: BlobStore,
        snapshots: EntityStore<SnapshotMetadata>,
        replicas: EntityStore<ReplicaMetadata>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if !config.index_type.is_recognized() {
            return Err(Error::Config("chunk index type must be recognized".to_string()));
        }
        if replica_policy.replicas_per_snapshot == 0 {
            return Err(Error::Config(
                "replicas_per_snapshot must be at least 1".to_string(),
            ));
        }
        let store = LocalChunkStore::new(&config.data_dir);
        Ok(Self {
            config,
            replica_policy,
            store,
            blobs,
            snapshots,
            replicas,
            clock,
            active: Mutex::new(None),
            states: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Prepare the data directory and resume any chunk a previous process
    /// left unpublished.
    pub async fn start(&self) -> Result<RecoveryReport> {
        self.store.init().await?;
        self.recover().await
    }

    /// Append one record to the active chunk, rolling it over first if the
    /// policy fires. The caller waits for the rollover; other callers move on
    /// to the next chunk as soon as this one is sealed.
    pub async fn index(&self, message: &LogMessage) -> Result<()> {
        let pending = {
            let mut guard = self.active.lock().await;
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ChunkClosed("chunk manager is closed".to_string()));
            }
            if guard.is_none() {
                *guard = Some(self.open_chunk().await?);
            }
            let chunk = guard
                .as_mut()
                .ok_or_else(|| Error::Internal("active chunk missing after open".to_string()))?;
            let chunk_id = &chunk.manifest.chunk_id;
            if self.chunk_state(chunk_id) != Some(ChunkState::Active) {
                return Err(Error::ChunkClosed(chunk_id.clone()));
            }

            let bytes = chunk.writer.append(message).await?;
            chunk.stats.record(bytes);
            counter!(
                "shardlog_indexed_messages_total",
                "service" => crate::telemetry::service()
            )
            .increment(1);

            let age = self.chunk_age(&chunk.manifest);
            if !self.config.rollover.should_rollover_stats(&chunk.stats, age) {
                return Ok(());
            }
            match guard.take() {
                Some(chunk) => self.seal(chunk).await?,
                None => return Ok(()),
            }
        };

        // Failure is recorded on the chunk and surfaced via failed_chunks();
        // the record itself is durable in the sealed segment.
        if let Err(e) = self.publish(pending).await {
            error!(error = %e, "Rollover did not complete");
        }
        Ok(())
    }

    /// Seal and publish the active chunk now, if it holds any records.
    pub async fn rollover(&self) -> Result<Option<SnapshotMetadata>> {
        match self.take_for_rollover(|_| true).await? {
            Some(pending) => self.publish(pending).await.map(Some),
            None => Ok(None),
        }
    }

    /// Roll the active chunk over if the policy's age limit has passed.
    /// Driven by a timer so an idle chunk does not stay open forever.
    pub async fn check_age(&self) -> Result<Option<SnapshotMetadata>> {
        if self.config.rollover.max_age().is_none() {
            return Ok(None);
        }
        let policy = self.config.rollover;
        let pending = self
            .take_for_rollover(|chunk| {
                policy.should_rollover_stats(&chunk.stats, self.chunk_age(&chunk.manifest))
            })
            .await?;
        match pending {
            Some(pending) => self.publish(pending).await.map(Some),
            None => Ok(None),
        }
    }

    /// Stop accepting records and roll over whatever is buffered.
    pub async fn close(&self) -> Result<Option<SnapshotMetadata>> {
        let pending = {
            let mut guard = self.active.lock().await;
            self.closed.store(true, Ordering::Release);
            match guard.take() {
                Some(chunk) if chunk.stats.message_count > 0 => Some(self.seal(chunk).await?),
                Some(chunk) => {
                    // Nothing indexed: leave the live sentinel for recovery to settle
                    debug!(chunk_id = %chunk.manifest.chunk_id, "Closing empty chunk");
                    None
                }
                None => None,
            }
        };
        info!("Chunk manager closed");
        match pending {
            Some(pending) => self.publish(pending).await.map(Some),
            None => Ok(None),
        }
    }

    pub fn chunk_state(&self, chunk_id: &str) -> Option<ChunkState> {
        self.states.get(chunk_id).map(|state| *state)
    }

    /// Chunks whose rollover exhausted its retries, sorted by id.
    pub fn failed_chunks(&self) -> Vec<String> {
        let mut failed: Vec<String> = self
            .states
            .iter()
            .filter(|entry| *entry.value() == ChunkState::Failed)
            .map(|entry| entry.key().clone())
            .collect();
        failed.sort();
        failed
    }

    pub async fn active_chunk_id(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|chunk| chunk.manifest.chunk_id.clone())
    }

    pub async fn active_stats(&self) -> Option<RolloverStats> {
        self.active.lock().await.as_ref().map(|chunk| chunk.stats)
    }

    /// Resume every chunk that did not reach `Published`.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for mut manifest in self.store.list_manifests().await? {
            let chunk_id = manifest.chunk_id.clone();
            let bytes = match (manifest.state, manifest.content_hash.is_some()) {
                (ManifestState::Published, _) => {
                    self.states.insert(chunk_id, ChunkState::Sealed);
                    continue;
                }
                // Never sealed: either still active at crash time or the seal itself failed
                (ManifestState::Active, _) | (ManifestState::Failed, false) => {
                    let segment_path = self.store.segment_path(&chunk_id);
                    if !segment_path.exists() {
                        warn!(chunk_id = %chunk_id, "Chunk has no segment file, skipping");
                        continue;
                    }
                    warn!(chunk_id = %chunk_id, "Sealing chunk left open by a previous process");
                    let sealed = recover_segment(&segment_path).await?;
                    self.apply_seal(&mut manifest, &sealed);
                    self.store.write_manifest(&manifest).await?;
                    sealed.bytes
                }
                (ManifestState::Sealed | ManifestState::Uploaded | ManifestState::Failed, _) => {
                    self.store.read_sealed(&manifest).await?
                }
            };

            info!(chunk_id = %chunk_id, state = ?manifest.state, "Resuming unpublished chunk");
            match self.publish(PendingPublish { manifest, bytes }).await {
                Ok(_) => report.resumed += 1,
                Err(e) => {
                    error!(chunk_id = %chunk_id, error = %e, "Recovered chunk failed to publish");
                    report.failed += 1;
                }
            }
        }
        if report.resumed > 0 || report.failed > 0 {
            info!(resumed = report.resumed, failed = report.failed, "Chunk recovery complete");
        }
        Ok(report)
    }

    async fn take_for_rollover<F>(&self, due: F) -> Result<Option<PendingPublish>>
    where
        F: Fn(&ActiveChunk) -> bool,
    {
        let mut guard = self.active.lock().await;
        let ready = guard
            .as_ref()
            .map(|chunk| chunk.stats.message_count > 0 && due(chunk))
            .unwrap_or(false);
        if !ready {
            return Ok(None);
        }
        match guard.take() {
            Some(chunk) => self.seal(chunk).await.map(Some),
            None => Ok(None),
        }
    }

    async fn open_chunk(&self) -> Result<ActiveChunk> {
        let chunk_id = uuid::Uuid::new_v4().to_string();
        let start = self.clock.now_millis();
        let manifest = ChunkManifest::active(&chunk_id, self.config.index_type, start);
        let segment_path = self.store.create_chunk(&manifest).await?;
        let writer = SegmentWriter::create(segment_path).await?;
        self.states.insert(chunk_id.clone(), ChunkState::Active);

        // The sentinel lets readers see that this time range is being indexed
        match SnapshotMetadata::live(&chunk_id, start, self.config.index_type) {
            Ok(live) => {
                if let Err(e) = self.snapshots.create_if_absent(&live).await {
                    warn!(chunk_id = %chunk_id, error = %e, "Failed to publish live snapshot");
                }
            }
            Err(e) => warn!(chunk_id = %chunk_id, error = %e, "Invalid live snapshot"),
        }

        info!(chunk_id = %chunk_id, start_time_epoch_ms = start, "Opened chunk");
        Ok(ActiveChunk {
            manifest,
            writer: Box::new(writer),
            stats: RolloverStats::default(),
        })
    }

    fn chunk_age(&self, manifest: &ChunkManifest) -> Duration {
        let elapsed = self.clock.now_millis() - manifest.start_time_epoch_ms;
        Duration::from_millis(elapsed.max(0) as u64)
    }

    fn apply_seal(&self, manifest: &mut ChunkManifest, sealed: &SealedSegment) {
        manifest.state = ManifestState::Sealed;
        manifest.end_time_epoch_ms = Some(self.clock.now_millis().max(manifest.start_time_epoch_ms));
        manifest.content_hash = Some(sealed.content_hash.clone());
        manifest.size_bytes = sealed.size_bytes;
        manifest.message_count = sealed.message_count;
    }

    /// ACTIVE -> ROLLING: close the segment and persist the sealed manifest.
    async fn seal(&self, mut chunk: ActiveChunk) -> Result<PendingPublish> {
        let chunk_id = chunk.manifest.chunk_id.clone();
        self.states.insert(chunk_id.clone(), ChunkState::Rolling);
        debug!(
            chunk_id = %chunk_id,
            bytes = chunk.stats.bytes_written,
            messages = chunk.stats.message_count,
            "Sealing chunk"
        );

        let sealed = match chunk.writer.seal().await {
            Ok(sealed) => sealed,
            Err(e) => {
                self.mark_failed(&mut chunk.manifest, &e).await;
                return Err(e);
            }
        };
        let mut manifest = chunk.manifest;
        self.apply_seal(&mut manifest, &sealed);
        if let Err(e) = self.store.write_manifest(&manifest).await {
            self.mark_failed(&mut manifest, &e).await;
            return Err(e);
        }
        Ok(PendingPublish {
            manifest,
            bytes: sealed.bytes,
        })
    }

    /// Upload, publish the snapshot, publish replicas, then ROLLING -> SEALED.
    async fn publish(&self, pending: PendingPublish) -> Result<SnapshotMetadata> {
        let PendingPublish {
            mut manifest,
            bytes,
        } = pending;
        let chunk_id = manifest.chunk_id.clone();
        self.states.insert(chunk_id.clone(), ChunkState::Rolling);

        match self.publish_inner(&mut manifest, bytes).await {
            Ok(snapshot) => {
                manifest.state = ManifestState::Published;
                self.store.write_manifest(&manifest).await?;
                self.states.insert(chunk_id.clone(), ChunkState::Sealed);
                counter!(
                    "shardlog_chunk_rollovers_total",
                    "service" => crate::telemetry::service(),
                    "result" => "ok"
                )
                .increment(1);
                info!(
                    chunk_id = %chunk_id,
                    blob_path = %snapshot.blob_path,
                    size_bytes = snapshot.size_bytes,
                    messages = manifest.message_count,
                    replicas = self.replica_policy.replicas_per_snapshot,
                    "Chunk rolled over"
                );
                Ok(snapshot)
            }
            Err(e) => {
                self.mark_failed(&mut manifest, &e).await;
                Err(e)
            }
        }
    }

    async fn publish_inner(&self, manifest: &mut ChunkManifest, bytes: Bytes) -> Result<SnapshotMetadata> {
        let blob_key = manifest.blob_key().ok_or_else(|| {
            Error::Internal(format!("chunk {} sealed without a hash", manifest.chunk_id))
        })?;
        let end = manifest.end_time_epoch_ms.ok_or_else(|| {
            Error::Internal(format!("chunk {} sealed without an end time", manifest.chunk_id))
        })?;

        if manifest.state != ManifestState::Uploaded {
            with_retry(&self.config.upload_retry, "snapshot upload", || {
                self.blobs.put(&blob_key, bytes.clone())
            })
            .await?;
            manifest.state = ManifestState::Uploaded;
            self.store.write_manifest(manifest).await?;
        }

        // Snapshot strictly before replicas: a replica must never reference
        // a snapshot that is not yet durable.
        let snapshot = SnapshotMetadata::new(
            &manifest.chunk_id,
            blob_key,
            manifest.start_time_epoch_ms,
            end,
            manifest.size_bytes,
            manifest.index_type,
        )?;
        with_retry(&self.config.publish_retry, "snapshot publish", || {
            self.publish_snapshot(&snapshot)
        })
        .await?;

        let created = self.clock.now_millis();
        let expire = self.replica_policy.expire_after(end);
        for i in 0..self.replica_policy.replicas_per_snapshot {
            let replica = ReplicaMetadata::new(
                format!("{}_{}", manifest.chunk_id, i),
                &manifest.chunk_id,
                created,
                expire,
                false,
                manifest.index_type,
            )?;
            with_retry(&self.config.publish_retry, "replica publish", || {
                self.replicas.create_if_absent(&replica)
            })
            .await?;
        }
        Ok(snapshot)
    }

    /// Replace the live sentinel with the sealed record, or create it.
    async fn publish_snapshot(&self, sealed: &SnapshotMetadata) -> Result<()> {
        match self.snapshots.get(&sealed.partition(), &sealed.name).await? {
            None => {
                self.snapshots.create_if_absent(sealed).await?;
            }
            Some(existing) if existing.value == *sealed => {}
            Some(existing) if existing.value.is_live() => {
                self.snapshots.update(&existing, sealed).await?;
            }
            Some(existing) => {
                return Err(Error::Validation(format!(
                    "snapshot {} already published at {}",
                    sealed.name, existing.value.blob_path
                )));
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, manifest: &mut ChunkManifest, cause: &Error) {
        let chunk_id = manifest.chunk_id.clone();
        self.states.insert(chunk_id.clone(), ChunkState::Failed);
        counter!(
            "shardlog_chunk_rollovers_total",
            "service" => crate::telemetry::service(),
            "result" => "failed"
        )
        .increment(1);
        error!(
            chunk_id = %chunk_id,
            error = %cause,
            data_dir = %self.store.chunk_dir(&chunk_id).display(),
            "Chunk rollover failed; local data kept for recovery"
        );
        // Uploaded chunks keep their state so a retry skips the upload
        if manifest.state != ManifestState::Uploaded {
            manifest.state = ManifestState::Failed;
        }
        if let Err(e) = self.store.write_manifest(manifest).await {
            warn!(chunk_id = %chunk_id, error = %e, "Failed to record chunk failure in manifest");
        }
    }
}
