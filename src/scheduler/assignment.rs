//! Pure replica-to-slot planning
//!
//! No I/O: the scheduler snapshots slots and replicas, plans here, then writes
//! each pairing with compare-and-set.

use crate::metadata::{CacheSlotMetadata, CacheSlotState, ReplicaMetadata};

use std::collections::{HashMap, HashSet};

/// One planned FREE -> ASSIGNED write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub replica_id: String,
    pub slot_name: String,
    pub hostname: String,
}

/// A replica short of its target number of serving slots.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReplica {
    pub replica: ReplicaMetadata,
    /// Serving slots still needed
    pub missing: usize,
}

/// Replicas that are not expired and are bound to fewer than
/// `replication_factor` slots in ASSIGNED, LOADING or LIVE, newest first
/// (ties by name).
pub fn pending_replicas(
    replicas: &[ReplicaMetadata],
    slots: &[CacheSlotMetadata],
    replication_factor: usize,
    now_ms: i64,
) -> Vec<PendingReplica> {
    let mut bound: HashMap<&str, usize> = HashMap::new();
    for slot in slots.iter().filter(|s| s.cache_slot_state.is_serving()) {
        *bound.entry(slot.replica_id.as_str()).or_default() += 1;
    }

    let mut pending: Vec<PendingReplica> = replicas
        .iter()
        .filter(|r| !r.is_expired(now_ms))
        .filter_map(|r| {
            let have = bound.get(r.name.as_str()).copied().unwrap_or(0);
            let missing = replication_factor.saturating_sub(have);
            (missing > 0).then(|| PendingReplica {
                replica: r.clone(),
                missing,
            })
        })
        .collect();
    pending.sort_by(|a, b| {
        b.replica
            .created_time_epoch_ms
            .cmp(&a.replica.created_time_epoch_ms)
            .then_with(|| a.replica.name.cmp(&b.replica.name))
    });
    pending
}

/// Serving slots per host, the load measure used to spread assignments.
pub fn host_load(slots: &[CacheSlotMetadata]) -> HashMap<String, usize> {
    let mut load = HashMap::new();
    for slot in slots {
        let entry = load.entry(slot.hostname.clone()).or_insert(0);
        if slot.cache_slot_state.is_serving() {
            *entry += 1;
        }
    }
    load
}

/// Hosts with at least one slot refreshed at or after `cutoff_ms`.
///
/// Nodes heartbeat every slot they own, FREE ones included, so a host missing
/// from this set has stopped heartbeating.
pub fn live_hosts(slots: &[CacheSlotMetadata], cutoff_ms: i64) -> HashSet<String> {
    slots
        .iter()
        .filter(|s| s.updated_time_epoch_ms >= cutoff_ms)
        .map(|s| s.hostname.clone())
        .collect()
}

/// Greedily pair pending replicas with capability-matched FREE slots.
///
/// Each pick takes the host with the fewest serving slots (counting picks made
/// earlier in this plan), ties broken by the lowest slot name. Callers drop
/// FREE slots of dead hosts from `slots` before planning.
pub fn plan_assignments(pending: &[PendingReplica], slots: &[CacheSlotMetadata]) -> Vec<Assignment> {
    let mut load = host_load(slots);
    let mut free: Vec<&CacheSlotMetadata> = slots
        .iter()
        .filter(|s| s.cache_slot_state == CacheSlotState::Free)
        .collect();
    free.sort_by(|a, b| a.name.cmp(&b.name));

    let mut plan = Vec::new();
    for entry in pending {
        for _ in 0..entry.missing {
            let best = free
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.supports(entry.replica.index_type))
                .min_by_key(|(_, slot)| {
                    (load.get(&slot.hostname).copied().unwrap_or(0), slot.name.as_str())
                })
                .map(|(i, _)| i);
            let Some(index) = best else {
                break;
            };
            let slot = free.remove(index);
            *load.entry(slot.hostname.clone()).or_insert(0) += 1;
            plan.push(Assignment {
                replica_id: entry.replica.name.clone(),
                slot_name: slot.name.clone(),
                hostname: slot.hostname.clone(),
            });
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::IndexType;

    fn replica(name: &str, created: i64, expire: i64, index_type: IndexType) -> ReplicaMetadata {
        ReplicaMetadata::new(name, "snap", created, expire, false, index_type).unwrap()
    }

    fn slot(name: &str, host: &str, state: CacheSlotState, replica: &str, types: Vec<IndexType>) -> CacheSlotMetadata {
        CacheSlotMetadata::new(name, state, replica, 1, types, host).unwrap()
    }

    fn free(name: &str, host: &str) -> CacheSlotMetadata {
        slot(name, host, CacheSlotState::Free, "", vec![IndexType::LogsLucene9])
    }

    #[test]
    fn test_pending_excludes_expired_and_satisfied() {
        let replicas = vec![
            replica("served", 10, 0, IndexType::LogsLucene9),
            replica("expired", 10, 50, IndexType::LogsLucene9),
            replica("waiting", 10, 0, IndexType::LogsLucene9),
        ];
        let slots = vec![slot(
            "h-0",
            "h",
            CacheSlotState::Loading,
            "served",
            vec![IndexType::LogsLucene9],
        )];
        let pending = pending_replicas(&replicas, &slots, 1, 100);
        let names: Vec<_> = pending.iter().map(|p| p.replica.name.as_str()).collect();
        assert_eq!(names, vec!["waiting"]);
    }

    #[test]
    fn test_evicting_slots_do_not_count_as_serving() {
        let replicas = vec![replica("r", 10, 0, IndexType::LogsLucene9)];
        let slots = vec![slot("h-0", "h", CacheSlotState::Evict, "r", vec![IndexType::LogsLucene9])];
        assert_eq!(pending_replicas(&replicas, &slots, 1, 100).len(), 1);
    }

    #[test]
    fn test_newest_replicas_first_then_name() {
        let replicas = vec![
            replica("b", 10, 0, IndexType::LogsLucene9),
            replica("a", 10, 0, IndexType::LogsLucene9),
            replica("c", 20, 0, IndexType::LogsLucene9),
        ];
        let pending = pending_replicas(&replicas, &[], 1, 100);
        let names: Vec<_> = pending.iter().map(|p| p.replica.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_prefers_least_loaded_host_then_slot_name() {
        let slots = vec![
            slot("a-0", "a", CacheSlotState::Live, "x", vec![IndexType::LogsLucene9]),
            free("a-1", "a"),
            free("b-1", "b"),
            free("b-0", "b"),
        ];
        let replicas = vec![
            replica("r1", 20, 0, IndexType::LogsLucene9),
            replica("r2", 10, 0, IndexType::LogsLucene9),
            replica("x", 5, 0, IndexType::LogsLucene9),
        ];
        let pending = pending_replicas(&replicas, &slots, 1, 100);
        let plan = plan_assignments(&pending, &slots);
        assert_eq!(
            plan,
            vec![
                Assignment {
                    replica_id: "r1".into(),
                    slot_name: "b-0".into(),
                    hostname: "b".into()
                },
                // a and b now tie on load; a-1 sorts first
                Assignment {
                    replica_id: "r2".into(),
                    slot_name: "a-1".into(),
                    hostname: "a".into()
                },
            ]
        );
    }

    #[test]
    fn test_capability_mismatch_leaves_replica_pending() {
        let slots = vec![free("a-0", "a")];
        let replicas = vec![replica("t", 10, 0, IndexType::LogsTantivy)];
        let pending = pending_replicas(&replicas, &slots, 1, 100);
        assert!(plan_assignments(&pending, &slots).is_empty());
    }

    #[test]
    fn test_extra_copy_goes_to_least_loaded_host() {
        // a already serves r but carries less load than b
        let slots = vec![
            slot("a-0", "a", CacheSlotState::Live, "r", vec![IndexType::LogsLucene9]),
            free("a-1", "a"),
            slot("b-0", "b", CacheSlotState::Live, "x", vec![IndexType::LogsLucene9]),
            slot("b-1", "b", CacheSlotState::Live, "y", vec![IndexType::LogsLucene9]),
            slot("b-2", "b", CacheSlotState::Loading, "z", vec![IndexType::LogsLucene9]),
            free("b-9", "b"),
        ];
        let replicas = vec![replica("r", 10, 0, IndexType::LogsLucene9)];
        let pending = pending_replicas(&replicas, &slots, 2, 100);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].missing, 1);
        let plan = plan_assignments(&pending, &slots);
        assert_eq!(
            plan,
            vec![Assignment {
                replica_id: "r".into(),
                slot_name: "a-1".into(),
                hostname: "a".into()
            }]
        );
    }

    #[test]
    fn test_copies_fill_by_load_then_name() {
        let slots = vec![free("a-0", "a"), free("a-1", "a"), free("b-0", "b")];
        let replicas = vec![replica("r", 10, 0, IndexType::LogsLucene9)];
        let pending = pending_replicas(&replicas, &slots, 2, 100);
        let plan = plan_assignments(&pending, &slots);
        let picked: Vec<_> = plan.iter().map(|a| a.slot_name.as_str()).collect();
        assert_eq!(picked, vec!["a-0", "b-0"]);
    }

    #[test]
    fn test_live_hosts_by_latest_refresh() {
        let mut stale = free("a-0", "a");
        stale.updated_time_epoch_ms = 10;
        let mut fresh = free("b-0", "b");
        fresh.updated_time_epoch_ms = 100;
        let mut old_b = free("b-1", "b");
        old_b.updated_time_epoch_ms = 10;
        let live = live_hosts(&[stale, fresh, old_b], 50);
        assert_eq!(live, HashSet::from(["b".to_string()]));
    }

    #[test]
    fn test_each_free_slot_used_once() {
        let slots = vec![free("a-0", "a")];
        let replicas = vec![
            replica("r1", 20, 0, IndexType::LogsLucene9),
            replica("r2", 10, 0, IndexType::LogsLucene9),
        ];
        let pending = pending_replicas(&replicas, &slots, 1, 100);
        let plan = plan_assignments(&pending, &slots);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].replica_id, "r1");
    }
}
