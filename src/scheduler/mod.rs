//! Cluster scheduler
//!
//! Keeps every non-expired replica bound to at least `replication_factor`
//! slots in ASSIGNED, LOADING or LIVE. A pass reads all slots and replicas
//! and then, in order:
//! 1. resets slots whose owner stopped updating them back to FREE
//! 2. moves slots serving expired (or vanished) replicas to EVICT
//! 3. deletes expired replicas that no slot references any more
//! 4. pairs pending replicas with FREE slots
//!
//! FREE slots are only handed out on hosts that are still heartbeating, and
//! never in the same pass that reset them.
//!
//! Every write is a compare-and-set against the version read at the start of
//! the pass. A lost race is counted and left for the next pass, so running a
//! pass against unchanged state writes nothing. Any other failed write is
//! counted as an error and the pass carries on with the remaining records.

mod assignment;

pub use assignment::{
    host_load, live_hosts, pending_replicas, plan_assignments, Assignment, PendingReplica,
};

use crate::clock::Clock;
use crate::metadata::{
    drain_pending, next_watch_event, CacheSlotMetadata, CacheSlotState, EntityStore,
    ReplicaMetadata, SlotActor, Versioned,
};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scheduler configuration
///
/// `replication_factor` and `staleness_threshold` are deployment policy and
/// must be supplied; only the loop timings have defaults.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub replication_factor: usize,
    /// Bound slots not updated for this long are presumed abandoned
    pub staleness_threshold: Duration,
    /// Backstop pass interval when no watch events arrive
    pub reconcile_interval: Duration,
    /// Backoff for re-establishing a closed watch
    pub watch_retry: RetryPolicy,
}

impl SchedulerConfig {
    pub fn new(replication_factor: usize, staleness_threshold: Duration) -> Result<Self> {
        if replication_factor == 0 {
            return Err(Error::Config("replication_factor must be at least 1".to_string()));
        }
        if staleness_threshold.is_zero() {
            return Err(Error::Config("staleness_threshold must be positive".to_string()));
        }
        Ok(Self {
            replication_factor,
            staleness_threshold,
            reconcile_interval: Duration::from_secs(15),
            watch_retry: RetryPolicy::default(),
        })
    }
}

/// Writes made by one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// FREE -> ASSIGNED
    pub assigned: usize,
    /// Serving slot -> EVICT
    pub evicted: usize,
    /// Stale slot -> FREE
    pub reset: usize,
    /// Expired replica records removed
    pub deleted: usize,
    /// Replicas flagged as restored after losing their last serving slot
    pub restored: usize,
    /// Compare-and-set races lost; retried next pass
    pub conflicts: usize,
    /// Writes that failed for any other reason; retried next pass
    pub errors: usize,
}

impl PassReport {
    pub fn writes(&self) -> usize {
        self.assigned + self.evicted + self.reset + self.deleted + self.restored
    }

    fn record_failure(&mut self, step: &'static str, record: &str, error: &Error) {
        if error.is_conflict() {
            self.conflicts += 1;
        } else {
            warn!(step, record, error = %error, "Scheduler write failed");
            self.errors += 1;
        }
    }
}

pub struct ClusterScheduler {
    config: SchedulerConfig,
    slots: EntityStore<CacheSlotMetadata>,
    replicas: EntityStore<ReplicaMetadata>,
    clock: Arc<dyn Clock>,
}

impl ClusterScheduler {
    pub fn new(
        config: SchedulerConfig,
        slots: EntityStore<CacheSlotMetadata>,
        replicas: EntityStore<ReplicaMetadata>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            slots,
            replicas,
            clock,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// One reconciliation pass.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let mut report = PassReport::default();
        let now = self.clock.now_millis();
        let cutoff = self.clock.cutoff_millis(self.config.staleness_threshold);
        let mut slots = self.slots.list().await?;
        let listing = self.replicas.list_all().await?;
        let undecodable: HashSet<String> = listing.undecodable.into_iter().collect();
        let mut replicas: HashMap<String, Versioned<ReplicaMetadata>> = listing
            .records
            .into_iter()
            .map(|r| (r.value.name.clone(), r))
            .collect();

        let slot_values: Vec<CacheSlotMetadata> = slots.iter().map(|s| s.value.clone()).collect();
        let live = live_hosts(&slot_values, cutoff);

        let reset = self.reset_stale_slots(&mut slots, cutoff, now, &mut report).await?;
        let reset_replicas: Vec<String> = reset.iter().map(|(_, replica)| replica.clone()).collect();
        self.flag_restored(&reset_replicas, &slots, &mut replicas, &mut report)
            .await;
        self.evict_expired(&mut slots, &replicas, &undecodable, now, &mut report)
            .await?;
        self.delete_expired(&slots, &mut replicas, now, &mut report)
            .await;
        let excluded: HashSet<&str> = reset.iter().map(|(slot, _)| slot.as_str()).collect();
        self.assign_pending(&mut slots, &replicas, &live, &excluded, now, &mut report)
            .await?;

        if report.writes() > 0 || report.conflicts > 0 || report.errors > 0 {
            counter!(
                "shardlog_scheduler_writes_total",
                "service" => crate::telemetry::service()
            )
            .increment(report.writes() as u64);
            counter!(
                "shardlog_scheduler_conflicts_total",
                "service" => crate::telemetry::service()
            )
            .increment(report.conflicts as u64);
            counter!(
                "shardlog_scheduler_errors_total",
                "service" => crate::telemetry::service()
            )
            .increment(report.errors as u64);
            info!(
                assigned = report.assigned,
                evicted = report.evicted,
                reset = report.reset,
                deleted = report.deleted,
                restored = report.restored,
                conflicts = report.conflicts,
                errors = report.errors,
                "Scheduler pass"
            );
        } else {
            debug!(slots = slots.len(), replicas = replicas.len(), "Scheduler pass, no changes");
        }
        Ok(report)
    }

    /// Run passes on watch events and on an interval until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let retry = &self.config.watch_retry;
        let mut slot_watch = self.slots.watch_with_retry(retry).await;
        let mut replica_watch = self.replicas.watch_with_retry(retry).await;
        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        info!(
            replication_factor = self.config.replication_factor,
            staleness_threshold_ms = self.config.staleness_threshold.as_millis() as u64,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if slot_watch.is_none() {
                        slot_watch = self.slots.watch_with_retry(retry).await;
                    }
                    if replica_watch.is_none() {
                        replica_watch = self.replicas.watch_with_retry(retry).await;
                    }
                }
                event = next_watch_event(&mut slot_watch) => {
                    if event.is_none() {
                        warn!("Slot watch closed, re-subscribing");
                        slot_watch = self.slots.watch_with_retry(retry).await;
                    }
                }
                event = next_watch_event(&mut replica_watch) => {
                    if event.is_none() {
                        warn!("Replica watch closed, re-subscribing");
                        replica_watch = self.replicas.watch_with_retry(retry).await;
                    }
                }
            }
            // One pass covers every change queued so far
            drain_pending(&mut slot_watch);
            drain_pending(&mut replica_watch);

            if let Err(e) = self.run_pass().await {
                error!(error = %e, "Scheduler pass failed");
            }
        }
        Ok(())
    }

    /// Force bound slots that missed the staleness window back to FREE.
    /// Returns `(slot name, replica id)` for each slot reset.
    async fn reset_stale_slots(
        &self,
        slots: &mut [Versioned<CacheSlotMetadata>],
        cutoff: i64,
        now: i64,
        report: &mut PassReport,
    ) -> Result<Vec<(String, String)>> {
        let mut reset = Vec::new();
        for slot in slots.iter_mut() {
            let Err(stale) = slot.value.check_fresh(cutoff) else {
                continue;
            };
            let next = slot
                .value
                .transition(CacheSlotState::Free, None, SlotActor::Reaper, now)?;
            match self.slots.update(slot, &next).await {
                Ok(updated) => {
                    warn!(
                        error = %stale,
                        hostname = %slot.value.hostname,
                        state = %slot.value.cache_slot_state,
                        replica = %slot.value.replica_id,
                        "Reset stale slot"
                    );
                    reset.push((slot.value.name.clone(), slot.value.replica_id.clone()));
                    *slot = updated;
                    report.reset += 1;
                }
                Err(e) => report.record_failure("reset", &slot.value.name, &e),
            }
        }
        Ok(reset)
    }

    /// A replica whose snapshot has no serving slot left is being recovered,
    /// not freshly indexed.
    async fn flag_restored(
        &self,
        reset: &[String],
        slots: &[Versioned<CacheSlotMetadata>],
        replicas: &mut HashMap<String, Versioned<ReplicaMetadata>>,
        report: &mut PassReport,
    ) {
        if reset.is_empty() {
            return;
        }
        let served_snapshots: HashSet<&str> = slots
            .iter()
            .filter(|s| s.value.cache_slot_state.is_serving())
            .filter_map(|s| replicas.get(&s.value.replica_id))
            .map(|r| r.value.snapshot_id.as_str())
            .collect();
        let to_flag: Vec<String> = reset
            .iter()
            .filter_map(|id| replicas.get(id))
            .filter(|r| !r.value.is_restored)
            .filter(|r| !served_snapshots.contains(r.value.snapshot_id.as_str()))
            .map(|r| r.value.name.clone())
            .collect();

        for name in to_flag {
            let Some(current) = replicas.get(&name) else {
                continue;
            };
            match self.replicas.update(current, &current.value.restored()).await {
                Ok(updated) => {
                    info!(replica = %name, snapshot = %updated.value.snapshot_id, "Replica marked restored");
                    replicas.insert(name, updated);
                    report.restored += 1;
                }
                Err(e) => report.record_failure("restore", &name, &e),
            }
        }
    }

    /// Serving slots whose replica expired or no longer exists -> EVICT.
    /// A replica whose record exists but failed to decode is left alone.
    async fn evict_expired(
        &self,
        slots: &mut [Versioned<CacheSlotMetadata>],
        replicas: &HashMap<String, Versioned<ReplicaMetadata>>,
        undecodable: &HashSet<String>,
        now: i64,
        report: &mut PassReport,
    ) -> Result<()> {
        for slot in slots.iter_mut() {
            if !slot.value.cache_slot_state.is_serving() {
                continue;
            }
            let expired = match replicas.get(&slot.value.replica_id) {
                Some(replica) => replica.value.is_expired(now),
                None => !undecodable.contains(&slot.value.replica_id),
            };
            if !expired {
                continue;
            }
            let next = slot
                .value
                .transition(CacheSlotState::Evict, None, SlotActor::Scheduler, now)?;
            match self.slots.update(slot, &next).await {
                Ok(updated) => {
                    debug!(slot = %slot.value.name, replica = %slot.value.replica_id, "Evicting slot");
                    *slot = updated;
                    report.evicted += 1;
                }
                Err(e) => report.record_failure("evict", &slot.value.name, &e),
            }
        }
        Ok(())
    }

    /// Remove expired replicas once no slot references them.
    async fn delete_expired(
        &self,
        slots: &[Versioned<CacheSlotMetadata>],
        replicas: &mut HashMap<String, Versioned<ReplicaMetadata>>,
        now: i64,
        report: &mut PassReport,
    ) {
        let referenced: HashSet<&str> = slots
            .iter()
            .filter(|s| s.value.cache_slot_state.is_bound())
            .map(|s| s.value.replica_id.as_str())
            .collect();
        let mut deletable: Vec<String> = replicas
            .values()
            .filter(|r| r.value.is_expired(now))
            .filter(|r| !referenced.contains(r.value.name.as_str()))
            .map(|r| r.value.name.clone())
            .collect();
        deletable.sort();

        for name in deletable {
            let Some(replica) = replicas.get(&name) else {
                continue;
            };
            match self.replicas.delete(replica).await {
                Ok(()) => {
                    info!(replica = %name, "Deleted expired replica");
                    replicas.remove(&name);
                    report.deleted += 1;
                }
                // Already gone: another scheduler won the race
                Err(Error::NotFound(_)) => report.conflicts += 1,
                Err(e) => report.record_failure("delete", &name, &e),
            }
        }
    }

    /// Pair pending replicas with FREE slots on `live` hosts, skipping the
    /// slots named in `excluded`.
    async fn assign_pending(
        &self,
        slots: &mut [Versioned<CacheSlotMetadata>],
        replicas: &HashMap<String, Versioned<ReplicaMetadata>>,
        live: &HashSet<String>,
        excluded: &HashSet<&str>,
        now: i64,
        report: &mut PassReport,
    ) -> Result<()> {
        let slot_values: Vec<CacheSlotMetadata> = slots.iter().map(|s| s.value.clone()).collect();
        let candidates: Vec<CacheSlotMetadata> = slot_values
            .iter()
            .filter(|s| {
                s.cache_slot_state != CacheSlotState::Free
                    || (live.contains(&s.hostname) && !excluded.contains(s.name.as_str()))
            })
            .cloned()
            .collect();
        let mut replica_values: Vec<ReplicaMetadata> =
            replicas.values().map(|r| r.value.clone()).collect();
        replica_values.sort_by(|a, b| a.name.cmp(&b.name));

        let pending = pending_replicas(
            &replica_values,
            &slot_values,
            self.config.replication_factor,
            now,
        );
        if pending.is_empty() {
            return Ok(());
        }
        let plan = plan_assignments(&pending, &candidates);
        let unplaced: usize = pending.iter().map(|p| p.missing).sum::<usize>() - plan.len();
        if unplaced > 0 {
            debug!(unplaced, "Not enough matching free slots for pending replicas");
        }

        for assignment in plan {
            let Some(slot) = slots.iter_mut().find(|s| {
                s.value.name == assignment.slot_name && s.value.hostname == assignment.hostname
            }) else {
                continue;
            };
            let next = slot.value.transition(
                CacheSlotState::Assigned,
                Some(&assignment.replica_id),
                SlotActor::Scheduler,
                now,
            )?;
            match self.slots.update(slot, &next).await {
                Ok(updated) => {
                    debug!(
                        slot = %assignment.slot_name,
                        hostname = %assignment.hostname,
                        replica = %assignment.replica_id,
                        "Assigned replica"
                    );
                    *slot = updated;
                    report.assigned += 1;
                }
                Err(e) => report.record_failure("assign", &assignment.slot_name, &e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metadata::{
        IndexType, LocalMetadataStore, MetadataStore, StoredValue, Version, WatchReceiver,
    };
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Local store whose updates time out for paths under `failing_prefix`.
    struct FailingUpdates {
        inner: LocalMetadataStore,
        failing_prefix: String,
    }

    #[async_trait]
    impl MetadataStore for FailingUpdates {
        async fn create(&self, path: &str, value: Bytes) -> Result<Version> {
            self.inner.create(path, value).await
        }

        async fn update(&self, path: &str, expected: &Version, value: Bytes) -> Result<Version> {
            if path.starts_with(&self.failing_prefix) {
                return Err(Error::Timeout(format!("update {}", path)));
            }
            self.inner.update(path, expected, value).await
        }

        async fn delete(&self, path: &str, expected: &Version) -> Result<()> {
            self.inner.delete(path, expected).await
        }

        async fn get(&self, path: &str) -> Result<Option<StoredValue>> {
            self.inner.get(path).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<(String, StoredValue)>> {
            self.inner.list(prefix).await
        }

        async fn watch(&self, prefix: &str) -> Result<WatchReceiver> {
            self.inner.watch(prefix).await
        }
    }

    #[test]
    fn test_config_requires_policy_parameters() {
        assert!(SchedulerConfig::new(0, Duration::from_secs(60)).is_err());
        assert!(SchedulerConfig::new(1, Duration::ZERO).is_err());
        let config = SchedulerConfig::new(2, Duration::from_secs(60)).unwrap();
        assert_eq!(config.replication_factor, 2);
    }

    #[tokio::test]
    async fn test_empty_cluster_pass_writes_nothing() {
        let meta: Arc<dyn MetadataStore> = Arc::new(LocalMetadataStore::new());
        let scheduler = ClusterScheduler::new(
            SchedulerConfig::new(1, Duration::from_secs(60)).unwrap(),
            EntityStore::new(Arc::clone(&meta), Duration::from_secs(5)),
            EntityStore::new(Arc::clone(&meta), Duration::from_secs(5)),
            Arc::new(ManualClock::new(1_000_000)),
        );
        assert_eq!(scheduler.run_pass().await.unwrap(), PassReport::default());
    }

    #[tokio::test]
    async fn test_orphaned_slot_is_evicted() {
        let meta: Arc<dyn MetadataStore> = Arc::new(LocalMetadataStore::new());
        let slots: EntityStore<CacheSlotMetadata> =
            EntityStore::new(Arc::clone(&meta), Duration::from_secs(5));
        let slot = CacheSlotMetadata::new(
            "h-0",
            CacheSlotState::Live,
            "gone",
            1_000_000,
            vec![IndexType::LogsLucene9],
            "h",
        )
        .unwrap();
        slots.create(&slot).await.unwrap();

        let scheduler = ClusterScheduler::new(
            SchedulerConfig::new(1, Duration::from_secs(60)).unwrap(),
            slots.clone(),
            EntityStore::new(Arc::clone(&meta), Duration::from_secs(5)),
            Arc::new(ManualClock::new(1_000_000)),
        );
        let report = scheduler.run_pass().await.unwrap();
        assert_eq!(report.evicted, 1);
        let slot = slots.get("h", "h-0").await.unwrap().unwrap();
        assert_eq!(slot.value.cache_slot_state, CacheSlotState::Evict);
    }

    #[tokio::test]
    async fn test_failed_write_does_not_stop_the_pass() {
        let now = 10_000_000;
        let meta: Arc<dyn MetadataStore> = Arc::new(FailingUpdates {
            inner: LocalMetadataStore::new(),
            failing_prefix: "cache_slot/h/".to_string(),
        });
        let slots: EntityStore<CacheSlotMetadata> =
            EntityStore::new(Arc::clone(&meta), Duration::from_secs(5));
        let replicas: EntityStore<ReplicaMetadata> =
            EntityStore::new(Arc::clone(&meta), Duration::from_secs(5));
        let lucene = || vec![IndexType::LogsLucene9];
        // h stopped heartbeating and its slot cannot be written
        let stale =
            CacheSlotMetadata::new("h-0", CacheSlotState::Live, "r0", now - 120_000, lucene(), "h")
                .unwrap();
        slots.create(&stale).await.unwrap();
        let free = CacheSlotMetadata::free("g-0", "g", lucene(), now).unwrap();
        slots.create(&free).await.unwrap();
        for (name, created) in [("r0", now - 200_000), ("r1", now - 100_000)] {
            let replica =
                ReplicaMetadata::new(name, name, created, 0, false, IndexType::LogsLucene9).unwrap();
            replicas.create(&replica).await.unwrap();
        }

        let scheduler = ClusterScheduler::new(
            SchedulerConfig::new(1, Duration::from_secs(60)).unwrap(),
            slots.clone(),
            replicas,
            Arc::new(ManualClock::new(now)),
        );
        let report = scheduler.run_pass().await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.reset, 0);
        assert_eq!(report.assigned, 1);
        let g0 = slots.get("g", "g-0").await.unwrap().unwrap();
        assert_eq!(g0.value.cache_slot_state, CacheSlotState::Assigned);
        assert_eq!(g0.value.replica_id, "r1");
    }

    #[tokio::test]
    async fn test_undecodable_replica_keeps_its_slot() {
        let meta: Arc<dyn MetadataStore> = Arc::new(LocalMetadataStore::new());
        let slots: EntityStore<CacheSlotMetadata> =
            EntityStore::new(Arc::clone(&meta), Duration::from_secs(5));
        let slot = CacheSlotMetadata::new(
            "h-0",
            CacheSlotState::Live,
            "r-next",
            1_000_000,
            vec![IndexType::LogsLucene9],
            "h",
        )
        .unwrap();
        slots.create(&slot).await.unwrap();
        // Written by a build that knows an index type this one does not
        let record = serde_json::json!({
            "name": "r-next",
            "snapshot_id": "s",
            "created_time_epoch_ms": 900_000,
            "expire_after_epoch_ms": 0,
            "is_restored": false,
            "index_type": "LOGS_NEXT",
        });
        meta.create(
            "replica/0_0/r-next",
            Bytes::from(serde_json::to_vec(&record).unwrap()),
        )
        .await
        .unwrap();

        let scheduler = ClusterScheduler::new(
            SchedulerConfig::new(1, Duration::from_secs(60)).unwrap(),
            slots.clone(),
            EntityStore::new(Arc::clone(&meta), Duration::from_secs(5)),
            Arc::new(ManualClock::new(1_000_000)),
        );
        let report = scheduler.run_pass().await.unwrap();
        assert_eq!(report.evicted, 0);
        assert_eq!(report.writes(), 0);
        let slot = slots.get("h", "h-0").await.unwrap().unwrap();
        assert_eq!(slot.value.cache_slot_state, CacheSlotState::Live);
        assert!(meta.get("replica/0_0/r-next").await.unwrap().is_some());
    }
}
