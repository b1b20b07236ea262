//! Integration tests for the cluster scheduler
//!
//! These tests verify the scheduler's reconciliation guarantees against a
//! shared in-process metadata store:
//! - A pass against converged state writes nothing
//! - Slots that stop heart-beating are reset and their replica re-placed on a
//!   host that is still alive
//! - Expired replicas are evicted first and deleted once unreferenced
//! - Competing schedulers never bind a slot twice

use shardlog::clock::{Clock, ManualClock};
use shardlog::metadata::{
    CacheSlotMetadata, CacheSlotState, EntityStore, IndexType, LocalMetadataStore, MetadataStore,
    ReplicaMetadata, SlotActor,
};
use shardlog::scheduler::{ClusterScheduler, PassReport, SchedulerConfig};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const T0: i64 = 1_705_323_600_000;

struct Harness {
    local: Arc<LocalMetadataStore>,
    slots: EntityStore<CacheSlotMetadata>,
    replicas: EntityStore<ReplicaMetadata>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        let local = Arc::new(LocalMetadataStore::new());
        let meta: Arc<dyn MetadataStore> = local.clone();
        Self {
            local,
            slots: EntityStore::new(Arc::clone(&meta), Duration::from_secs(5)),
            replicas: EntityStore::new(meta, Duration::from_secs(5)),
            clock: Arc::new(ManualClock::new(T0)),
        }
    }

    fn scheduler(&self, replication_factor: usize) -> ClusterScheduler {
        ClusterScheduler::new(
            SchedulerConfig::new(replication_factor, Duration::from_secs(60)).unwrap(),
            self.slots.clone(),
            self.replicas.clone(),
            self.clock.clone(),
        )
    }

    async fn add_free_slots(&self, host: &str, count: usize, types: Vec<IndexType>) {
        for i in 0..count {
            let slot =
                CacheSlotMetadata::free(format!("{}-{}", host, i), host, types.clone(), T0).unwrap();
            self.slots.create(&slot).await.unwrap();
        }
    }

    async fn add_replica(&self, name: &str, created: i64, expire: i64, index_type: IndexType) {
        let replica = ReplicaMetadata::new(name, "snap", created, expire, false, index_type).unwrap();
        self.replicas.create(&replica).await.unwrap();
    }

    async fn add_slot(&self, host: &str, name: &str, state: CacheSlotState, replica: &str, updated: i64) {
        let slot =
            CacheSlotMetadata::new(name, state, replica, updated, vec![IndexType::LogsLucene9], host)
                .unwrap();
        self.slots.create(&slot).await.unwrap();
    }

    /// Refresh every slot of `host`, as its node's heartbeat would.
    async fn heartbeat(&self, host: &str) {
        for slot in self.slots.list_partition(host).await.unwrap() {
            let next = slot.value.touch(self.clock.now_millis());
            self.slots.update(&slot, &next).await.unwrap();
        }
    }

    /// Serving slot count per replica id.
    async fn serving(&self) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for slot in self.slots.list().await.unwrap() {
            if slot.value.cache_slot_state.is_serving() {
                out.entry(slot.value.replica_id.clone())
                    .or_default()
                    .push(slot.value.hostname.clone());
            }
        }
        out
    }

    /// Drive one slot through the node-side transitions.
    async fn node_moves(&self, host: &str, slot: &str, states: &[CacheSlotState]) {
        for &to in states {
            let current = self.slots.get(host, slot).await.unwrap().unwrap();
            let next = current
                .value
                .transition(to, None, SlotActor::Node, self.clock.now_millis())
                .unwrap();
            self.slots.update(&current, &next).await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_converged_pass_writes_nothing() {
    let h = Harness::new();
    h.add_free_slots("host-a", 2, vec![IndexType::LogsLucene9]).await;
    h.add_free_slots("host-b", 2, vec![IndexType::LogsLucene9]).await;
    h.add_replica("r1", T0, 0, IndexType::LogsLucene9).await;
    h.add_replica("r2", T0 + 1, 0, IndexType::LogsLucene9).await;
    h.add_replica("r3", T0 + 2, 0, IndexType::LogsLucene9).await;

    let scheduler = h.scheduler(1);
    let first = scheduler.run_pass().await.unwrap();
    assert_eq!(first.assigned, 3);
    assert_eq!(first.conflicts, 0);

    let serving = h.serving().await;
    assert_eq!(serving.len(), 3);
    assert!(serving.values().all(|hosts| hosts.len() == 1));

    let mutations = h.local.mutation_count();
    let second = scheduler.run_pass().await.unwrap();
    assert_eq!(second, PassReport::default());
    assert_eq!(h.local.mutation_count(), mutations);
}

#[tokio::test]
async fn test_replication_factor_spreads_across_hosts() {
    let h = Harness::new();
    h.add_free_slots("host-a", 2, vec![IndexType::LogsLucene9]).await;
    h.add_free_slots("host-b", 2, vec![IndexType::LogsLucene9]).await;
    h.add_replica("r1", T0, 0, IndexType::LogsLucene9).await;
    h.add_replica("r2", T0, 0, IndexType::LogsLucene9).await;

    let report = h.scheduler(2).run_pass().await.unwrap();
    assert_eq!(report.assigned, 4);
    for (replica, mut hosts) in h.serving().await {
        hosts.sort();
        assert_eq!(hosts, vec!["host-a", "host-b"], "replica {}", replica);
    }
}

#[tokio::test]
async fn test_unsupported_index_type_stays_pending() {
    let h = Harness::new();
    h.add_free_slots("host-a", 2, vec![IndexType::LogsLucene9]).await;
    h.add_replica("tantivy", T0, 0, IndexType::LogsTantivy).await;

    let report = h.scheduler(1).run_pass().await.unwrap();
    assert_eq!(report.assigned, 0);
    assert!(h.serving().await.is_empty());

    h.add_free_slots("host-t", 1, vec![IndexType::LogsTantivy]).await;
    let report = h.scheduler(1).run_pass().await.unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(h.serving().await["tantivy"], vec!["host-t"]);
}

#[tokio::test]
async fn test_stale_loading_slot_is_reset_and_replaced() {
    let h = Harness::new();
    h.add_free_slots("host-a", 1, vec![IndexType::LogsLucene9]).await;
    h.add_free_slots("host-b", 1, vec![IndexType::LogsLucene9]).await;
    h.add_replica("r1", T0, 0, IndexType::LogsLucene9).await;

    let scheduler = h.scheduler(1);
    assert_eq!(scheduler.run_pass().await.unwrap().assigned, 1);
    assert_eq!(h.serving().await["r1"], vec!["host-a"]);
    h.node_moves("host-a", "host-a-0", &[CacheSlotState::Loading]).await;

    // host-a dies mid-download; host-b keeps heartbeating
    h.clock.advance(Duration::from_secs(61));
    h.heartbeat("host-b").await;
    let report = scheduler.run_pass().await.unwrap();
    assert_eq!(report.reset, 1);
    assert_eq!(report.restored, 1);
    assert_eq!(report.assigned, 1);

    let replica = h.replicas.find("r1").await.unwrap().unwrap().value;
    assert!(replica.is_restored);
    let dead = h.slots.get("host-a", "host-a-0").await.unwrap().unwrap().value;
    assert_eq!(dead.cache_slot_state, CacheSlotState::Free);
    let replaced = h.slots.get("host-b", "host-b-0").await.unwrap().unwrap().value;
    assert_eq!(replaced.cache_slot_state, CacheSlotState::Assigned);
    assert_eq!(replaced.replica_id, "r1");
    assert_eq!(h.serving().await["r1"], vec!["host-b"]);
}

#[tokio::test]
async fn test_dead_host_slots_are_not_reassigned() {
    let h = Harness::new();
    let now = h.clock.now_millis();
    h.add_replica("r", T0 - 300_000, 0, IndexType::LogsLucene9).await;
    h.add_replica("x", T0 - 300_000, 0, IndexType::LogsLucene9).await;
    // a stopped heartbeating two minutes ago, its slot still claims r
    h.add_slot("a", "a-0", CacheSlotState::Live, "r", now - 120_000).await;
    h.add_slot("b", "b-0", CacheSlotState::Live, "x", now).await;
    h.add_slot("b", "b-1", CacheSlotState::Free, "", now).await;

    let report = h.scheduler(1).run_pass().await.unwrap();
    assert_eq!(report.reset, 1);
    assert_eq!(report.assigned, 1);

    let a0 = h.slots.get("a", "a-0").await.unwrap().unwrap().value;
    assert_eq!(a0.cache_slot_state, CacheSlotState::Free);
    let b1 = h.slots.get("b", "b-1").await.unwrap().unwrap().value;
    assert_eq!(b1.cache_slot_state, CacheSlotState::Assigned);
    assert_eq!(b1.replica_id, "r");

    // Still dead on the next pass: r stays put and a-0 stays FREE
    let report = h.scheduler(1).run_pass().await.unwrap();
    assert_eq!(report, PassReport::default());
}

#[tokio::test]
async fn test_fresh_slots_are_not_reset() {
    let h = Harness::new();
    h.add_free_slots("host-a", 1, vec![IndexType::LogsLucene9]).await;
    h.add_replica("r1", T0, 0, IndexType::LogsLucene9).await;
    let scheduler = h.scheduler(1);
    scheduler.run_pass().await.unwrap();
    h.node_moves("host-a", "host-a-0", &[CacheSlotState::Loading, CacheSlotState::Live])
        .await;

    // Free slots never go stale, bound ones only past the threshold
    h.clock.advance(Duration::from_secs(59));
    assert_eq!(scheduler.run_pass().await.unwrap(), PassReport::default());
}

#[tokio::test]
async fn test_expired_replica_evicted_then_deleted() {
    let h = Harness::new();
    h.add_free_slots("host-a", 1, vec![IndexType::LogsLucene9]).await;
    h.add_replica("short", T0, T0 + 1_000, IndexType::LogsLucene9).await;

    let scheduler = h.scheduler(1);
    assert_eq!(scheduler.run_pass().await.unwrap().assigned, 1);
    h.node_moves("host-a", "host-a-0", &[CacheSlotState::Loading, CacheSlotState::Live])
        .await;

    h.clock.advance(Duration::from_secs(2));
    let report = scheduler.run_pass().await.unwrap();
    assert_eq!(report.evicted, 1);
    assert_eq!(report.deleted, 0, "still referenced by the evicting slot");
    assert!(h.replicas.find("short").await.unwrap().is_some());

    h.node_moves("host-a", "host-a-0", &[CacheSlotState::Evicting, CacheSlotState::Free])
        .await;
    let report = scheduler.run_pass().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.assigned, 0);
    assert!(h.replicas.find("short").await.unwrap().is_none());
}

#[tokio::test]
async fn test_competing_schedulers_bind_each_slot_once() {
    let h = Harness::new();
    h.add_free_slots("host-a", 3, vec![IndexType::LogsLucene9]).await;
    h.add_free_slots("host-b", 3, vec![IndexType::LogsLucene9]).await;
    for i in 0..4 {
        h.add_replica(&format!("r{}", i), T0 + i, 0, IndexType::LogsLucene9).await;
    }

    let a = h.scheduler(1);
    let b = h.scheduler(1);
    let (ra, rb) = tokio::join!(a.run_pass(), b.run_pass());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.assigned + rb.assigned, 4);

    let serving = h.serving().await;
    assert_eq!(serving.len(), 4);
    assert!(serving.values().all(|hosts| hosts.len() == 1));
}

#[tokio::test]
async fn test_run_loop_reacts_to_new_replicas() {
    let h = Harness::new();
    h.add_free_slots("host-a", 1, vec![IndexType::LogsLucene9]).await;
    let scheduler = Arc::new(h.scheduler(1));
    let shutdown = CancellationToken::new();
    let task = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    h.add_replica("r1", T0, 0, IndexType::LogsLucene9).await;
    let assigned = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let slot = h.slots.get("host-a", "host-a-0").await.unwrap().unwrap();
            if slot.value.cache_slot_state == CacheSlotState::Assigned {
                return slot.value.replica_id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(assigned, "r1");

    shutdown.cancel();
    task.await.unwrap().unwrap();
}
