//! Cache node: the slot-owning side of the slot state machine
//!
//! A node registers its slots as FREE records, then drives every slot the
//! scheduler touches through the node-owned transitions:
//! - ASSIGNED -> LOADING -> LIVE, or LOADING -> FREE when the download fails
//! - EVICT -> EVICTING -> FREE
//!
//! Slot records are written only through compare-and-set. A background
//! heartbeat refreshes the update time of every owned slot: bound slots stay
//! clear of the scheduler's staleness sweep, and fresh FREE slots mark the host
//! as alive. Transitions re-read the record on a version conflict so
//! heartbeats and transitions never lose each other.

mod data_plane;

pub use data_plane::{LocalDiskDataPlane, SlotDataPlane};

use crate::blob::BlobStore;
use crate::clock::Clock;
use crate::metadata::{
    drain_pending, next_watch_event, CacheSlotMetadata, CacheSlotState, EntityStore, IndexType,
    PartitionedMetadata, ReplicaMetadata, SlotActor, SnapshotMetadata, Versioned,
};
use crate::retry::{with_retry, with_timeout, RetryPolicy};
use crate::{Error, Result};

use futures::future::join_all;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for a cache node
#[derive(Debug, Clone)]
pub struct CacheNodeConfig {
    /// Partition key of this node's slot records
    pub hostname: String,
    pub slots_per_node: usize,
    pub supported_index_types: Vec<IndexType>,
    /// Bound on a single snapshot download
    pub download_timeout: Duration,
    pub download_retry: RetryPolicy,
    pub heartbeat_interval: Duration,
    /// Backstop reconciliation when no watch events arrive
    pub reconcile_interval: Duration,
    /// Backoff for re-establishing a closed watch
    pub watch_retry: RetryPolicy,
}

impl Default for CacheNodeConfig {
    fn default() -> Self {
        Self {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            slots_per_node: 4,
            supported_index_types: vec![IndexType::LogsLucene9],
            download_timeout: Duration::from_secs(300),
            download_retry: RetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(30),
            watch_retry: RetryPolicy::default(),
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeReport {
    pub loaded: usize,
    pub load_failures: usize,
    pub evicted: usize,
}

enum SlotOutcome {
    Loaded,
    LoadFailed,
    Evicted,
    Skipped,
}

pub struct CacheNode {
    config: CacheNodeConfig,
    slots: EntityStore<CacheSlotMetadata>,
    replicas: EntityStore<ReplicaMetadata>,
    snapshots: EntityStore<SnapshotMetadata>,
    blobs: BlobStore,
    data_plane: Arc<dyn SlotDataPlane>,
    clock: Arc<dyn Clock>,
}

impl CacheNode {
    pub fn new(
        config: CacheNodeConfig,
        slots: EntityStore<CacheSlotMetadata>,
        replicas: EntityStore<ReplicaMetadata>,
        snapshots: EntityStore<SnapshotMetadata>,
        blobs: BlobStore,
        data_plane: Arc<dyn SlotDataPlane>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.hostname.is_empty() {
            return Err(Error::Config("cache node hostname must not be empty".to_string()));
        }
        if config.slots_per_node == 0 {
            return Err(Error::Config("slots_per_node must be at least 1".to_string()));
        }
        if config.supported_index_types.is_empty() {
            return Err(Error::Config(
                "cache node must support at least one index type".to_string(),
            ));
        }
        Ok(Self {
            config,
            slots,
            replicas,
            snapshots,
            blobs,
            data_plane,
            clock,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn slot_name(&self, index: usize) -> String {
        format!("{}-{}", self.config.hostname, index)
    }

    /// Publish this node's slots as FREE.
    ///
    /// A restarted node holds nothing locally, so any record left over from a
    /// previous run is reset; the scheduler re-places its replica.
    pub async fn register(&self) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(self.config.slots_per_node);
        for index in 0..self.config.slots_per_node {
            let name = self.slot_name(index);
            self.data_plane.detach(&name).await?;
            let fresh = CacheSlotMetadata::free(
                &name,
                &self.config.hostname,
                self.config.supported_index_types.clone(),
                self.clock.now_millis(),
            )?;
            match self.slots.get(&self.config.hostname, &name).await? {
                None => {
                    self.slots.create_if_absent(&fresh).await?;
                }
                Some(existing) => {
                    let unchanged = existing.value.cache_slot_state == CacheSlotState::Free
                        && existing.value.supported_index_types == fresh.supported_index_types;
                    if !unchanged {
                        if existing.value.cache_slot_state != CacheSlotState::Free {
                            warn!(
                                slot = %name,
                                state = %existing.value.cache_slot_state,
                                replica = %existing.value.replica_id,
                                "Resetting slot left bound by a previous run"
                            );
                        }
                        let fresh = CacheSlotMetadata {
                            updated_time_epoch_ms: fresh
                                .updated_time_epoch_ms
                                .max(existing.value.updated_time_epoch_ms + 1),
                            ..fresh
                        };
                        self.slots.update(&existing, &fresh).await?;
                    } else {
                        // Announce liveness before the first heartbeat
                        let touched = existing.value.touch(self.clock.now_millis());
                        self.slots.update(&existing, &touched).await?;
                    }
                }
            }
            names.push(name);
        }
        info!(
            hostname = %self.config.hostname,
            slots = names.len(),
            index_types = ?self.config.supported_index_types,
            "Registered cache slots"
        );
        Ok(names)
    }

    /// This node's slot records.
    pub async fn owned_slots(&self) -> Result<Vec<Versioned<CacheSlotMetadata>>> {
        self.slots.list_partition(&self.config.hostname).await
    }

    /// Handle every owned slot that is waiting on the node.
    pub async fn reconcile_once(&self) -> Result<NodeReport> {
        let slots = self.owned_slots().await?;
        let work: Vec<_> = slots
            .into_iter()
            .filter(|slot| {
                !matches!(
                    slot.value.cache_slot_state,
                    CacheSlotState::Free | CacheSlotState::Live
                )
            })
            .map(|slot| self.handle_slot(slot))
            .collect();

        let mut report = NodeReport::default();
        for outcome in join_all(work).await {
            match outcome {
                SlotOutcome::Loaded => report.loaded += 1,
                SlotOutcome::LoadFailed => report.load_failures += 1,
                SlotOutcome::Evicted => report.evicted += 1,
                SlotOutcome::Skipped => {}
            }
        }
        if report != NodeReport::default() {
            info!(
                loaded = report.loaded,
                load_failures = report.load_failures,
                evicted = report.evicted,
                "Cache node reconciliation pass"
            );
        }
        Ok(report)
    }

    /// Refresh the update time of every owned slot, FREE ones included, so
    /// the scheduler can tell this host is alive. Returns slots touched.
    pub async fn heartbeat(&self) -> Result<usize> {
        let mut touched = 0;
        for slot in self.owned_slots().await? {
            let next = slot.value.touch(self.clock.now_millis());
            match self.slots.update(&slot, &next).await {
                Ok(_) => touched += 1,
                Err(e) if e.is_conflict() => {
                    debug!(slot = %slot.value.name, "Heartbeat raced a transition, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(touched)
    }

    /// Ask for every LIVE slot to be evicted, ahead of shutdown. Returns the
    /// number of slots moved to EVICT; the next pass releases them.
    pub async fn drain(&self) -> Result<usize> {
        let mut requested = 0;
        for slot in self.owned_slots().await? {
            if slot.value.cache_slot_state != CacheSlotState::Live {
                continue;
            }
            if self
                .transition(&slot.value.name, CacheSlotState::Live, CacheSlotState::Evict)
                .await?
                .is_some()
            {
                requested += 1;
            }
        }
        info!(hostname = %self.config.hostname, slots = requested, "Draining cache node");
        Ok(requested)
    }

    /// Run until cancelled: reconcile on watch events and on an interval,
    /// heartbeat in the background.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let heartbeat = {
            let node = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { node.run_heartbeat(shutdown).await })
        };

        let own_prefix = format!("{}/{}/", CacheSlotMetadata::ROOT, self.config.hostname);
        let mut watch = self.slots.watch_with_retry(&self.config.watch_retry).await;
        let mut interval = tokio::time::interval(self.config.reconcile_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Cache node shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if watch.is_none() {
                        watch = self.slots.watch_with_retry(&self.config.watch_retry).await;
                    }
                }
                event = next_watch_event(&mut watch) => match event {
                    Some(event) if event.path().starts_with(&own_prefix) => {
                        drain_pending(&mut watch);
                    }
                    Some(_) => continue,
                    None => {
                        warn!("Slot watch closed, re-subscribing");
                        watch = self.slots.watch_with_retry(&self.config.watch_retry).await;
                    }
                },
            }
            if let Err(e) = self.reconcile_once().await {
                error!(error = %e, "Cache node reconciliation failed");
            }
        }

        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
        Ok(())
    }

    async fn run_heartbeat(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    }

    /// Move `slot` from `from` to `to` as the node, re-reading on conflicts
    /// caused by heartbeats. `None` when someone else moved the slot first.
    async fn transition(
        &self,
        slot: &str,
        from: CacheSlotState,
        to: CacheSlotState,
    ) -> Result<Option<Versioned<CacheSlotMetadata>>> {
        loop {
            let Some(current) = self.slots.get(&self.config.hostname, slot).await? else {
                return Ok(None);
            };
            if current.value.cache_slot_state != from {
                debug!(
                    slot,
                    expected = %from,
                    actual = %current.value.cache_slot_state,
                    "Slot moved underneath the node"
                );
                return Ok(None);
            }
            let next = current
                .value
                .transition(to, None, SlotActor::Node, self.clock.now_millis())?;
            match self.slots.update(&current, &next).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_slot(&self, slot: Versioned<CacheSlotMetadata>) -> SlotOutcome {
        let name = slot.value.name.clone();
        let result = match slot.value.cache_slot_state {
            CacheSlotState::Assigned | CacheSlotState::Loading => self.load(slot).await,
            CacheSlotState::Evict | CacheSlotState::Evicting => self.evict(slot).await,
            CacheSlotState::Free | CacheSlotState::Live => Ok(SlotOutcome::Skipped),
        };
        result.unwrap_or_else(|e| {
            error!(slot = %name, error = %e, "Slot handling aborted");
            SlotOutcome::Skipped
        })
    }

    async fn load(&self, slot: Versioned<CacheSlotMetadata>) -> Result<SlotOutcome> {
        let name = slot.value.name.clone();
        if slot.value.cache_slot_state == CacheSlotState::Assigned
            && self
                .transition(&name, CacheSlotState::Assigned, CacheSlotState::Loading)
                .await?
                .is_none()
        {
            return Ok(SlotOutcome::Skipped);
        }

        let replica_id = slot.value.replica_id.clone();
        match self.fetch_and_attach(&name, &replica_id).await {
            Ok(snapshot) => {
                if self
                    .transition(&name, CacheSlotState::Loading, CacheSlotState::Live)
                    .await?
                    .is_none()
                {
                    // Evicted while downloading: the evict path detaches
                    return Ok(SlotOutcome::Skipped);
                }
                counter!(
                    "shardlog_slot_loads_total",
                    "service" => crate::telemetry::service(),
                    "result" => "ok"
                )
                .increment(1);
                info!(slot = %name, replica = %replica_id, snapshot = %snapshot, "Slot live");
                Ok(SlotOutcome::Loaded)
            }
            Err(e) => {
                counter!(
                    "shardlog_slot_loads_total",
                    "service" => crate::telemetry::service(),
                    "result" => "failed"
                )
                .increment(1);
                warn!(slot = %name, replica = %replica_id, error = %e, "Slot load failed, releasing");
                if let Err(detach) = self.data_plane.detach(&name).await {
                    warn!(slot = %name, error = %detach, "Detach after failed load failed");
                }
                self.transition(&name, CacheSlotState::Loading, CacheSlotState::Free)
                    .await?;
                Ok(SlotOutcome::LoadFailed)
            }
        }
    }

    /// Resolve replica -> snapshot, download the blob, hand it to the data plane.
    async fn fetch_and_attach(&self, slot: &str, replica_id: &str) -> Result<String> {
        let replica = self
            .replicas
            .find(replica_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("replica {}", replica_id)))?;
        let snapshot = self
            .snapshots
            .find(&replica.value.snapshot_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", replica.value.snapshot_id)))?
            .value;
        if snapshot.is_live() {
            return Err(Error::Validation(format!(
                "snapshot {} is still being indexed",
                snapshot.name
            )));
        }
        if !self.config.supported_index_types.contains(&snapshot.index_type) {
            return Err(Error::Validation(format!(
                "slot {} cannot serve index type {}",
                slot, snapshot.index_type
            )));
        }

        let bytes = with_retry(&self.config.download_retry, "snapshot download", || {
            with_timeout(
                self.config.download_timeout,
                "snapshot download",
                self.blobs.get(&snapshot.blob_path),
            )
        })
        .await?;
        self.data_plane.attach(slot, &snapshot, bytes).await?;
        Ok(snapshot.name)
    }

    async fn evict(&self, slot: Versioned<CacheSlotMetadata>) -> Result<SlotOutcome> {
        let name = slot.value.name.clone();
        if slot.value.cache_slot_state == CacheSlotState::Evict
            && self
                .transition(&name, CacheSlotState::Evict, CacheSlotState::Evicting)
                .await?
                .is_none()
        {
            return Ok(SlotOutcome::Skipped);
        }
        // A detach failure leaves the slot EVICTING; the next pass retries it
        self.data_plane.detach(&name).await?;
        if self
            .transition(&name, CacheSlotState::Evicting, CacheSlotState::Free)
            .await?
            .is_none()
        {
            return Ok(SlotOutcome::Skipped);
        }
        info!(slot = %name, replica = %slot.value.replica_id, "Slot evicted");
        Ok(SlotOutcome::Evicted)
    }
}
