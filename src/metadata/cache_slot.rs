//! Cache slot metadata and the slot state machine
//!
//! A slot is a unit of cache-node capacity that holds at most one replica.
//! Every state change goes through [`CacheSlotMetadata::transition`], which
//! consults a single transition table keyed by (from, to, actor).

use super::{require_non_empty, IndexType, PartitionedMetadata};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheSlotState {
    Free,
    Assigned,
    Loading,
    Live,
    Evict,
    Evicting,
}

impl CacheSlotState {
    /// States in which the slot is bound to a replica.
    pub fn is_bound(&self) -> bool {
        !matches!(self, CacheSlotState::Free)
    }

    /// States that count towards a replica being served or about to be.
    pub fn is_serving(&self) -> bool {
        matches!(
            self,
            CacheSlotState::Assigned | CacheSlotState::Loading | CacheSlotState::Live
        )
    }
}

impl fmt::Display for CacheSlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheSlotState::Free => "FREE",
            CacheSlotState::Assigned => "ASSIGNED",
            CacheSlotState::Loading => "LOADING",
            CacheSlotState::Live => "LIVE",
            CacheSlotState::Evict => "EVICT",
            CacheSlotState::Evicting => "EVICTING",
        };
        f.write_str(s)
    }
}

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotActor {
    /// Cluster scheduler placing or revoking replicas
    Scheduler,
    /// Cache node that owns the slot
    Node,
    /// Scheduler's staleness sweep reclaiming an abandoned slot
    Reaper,
}

use CacheSlotState::*;

/// Legal (from, to, actor) transitions. Reaper transitions are handled
/// separately: any bound state may be forced back to FREE.
const TRANSITIONS: &[(CacheSlotState, CacheSlotState, SlotActor)] = &[
    (Free, Assigned, SlotActor::Scheduler),
    (Assigned, Loading, SlotActor::Node),
    (Loading, Live, SlotActor::Node),
    (Loading, Free, SlotActor::Node),
    (Live, Evict, SlotActor::Scheduler),
    (Live, Evict, SlotActor::Node),
    (Assigned, Evict, SlotActor::Scheduler),
    (Loading, Evict, SlotActor::Scheduler),
    (Evict, Evicting, SlotActor::Node),
    (Evicting, Free, SlotActor::Node),
];

/// Whether `actor` may move a slot from `from` to `to`.
pub fn is_legal_transition(from: CacheSlotState, to: CacheSlotState, actor: SlotActor) -> bool {
    if actor == SlotActor::Reaper {
        return from.is_bound() && to == Free;
    }
    TRANSITIONS
        .iter()
        .any(|&(f, t, a)| f == from && t == to && a == actor)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheSlotMetadata {
    pub name: String,
    pub cache_slot_state: CacheSlotState,
    /// Empty exactly when the slot is FREE
    pub replica_id: String,
    pub updated_time_epoch_ms: i64,
    pub supported_index_types: Vec<IndexType>,
    pub hostname: String,
}

impl CacheSlotMetadata {
    pub fn new(
        name: impl Into<String>,
        cache_slot_state: CacheSlotState,
        replica_id: impl Into<String>,
        updated_time_epoch_ms: i64,
        supported_index_types: Vec<IndexType>,
        hostname: impl Into<String>,
    ) -> Result<Self> {
        let slot = Self {
            name: name.into(),
            cache_slot_state,
            replica_id: replica_id.into(),
            updated_time_epoch_ms,
            supported_index_types,
            hostname: hostname.into(),
        };
        slot.validate()?;
        Ok(slot)
    }

    /// A fresh FREE slot as a node registers it.
    pub fn free(
        name: impl Into<String>,
        hostname: impl Into<String>,
        supported_index_types: Vec<IndexType>,
        now_ms: i64,
    ) -> Result<Self> {
        Self::new(name, Free, "", now_ms, supported_index_types, hostname)
    }

    pub fn supports(&self, index_type: IndexType) -> bool {
        self.supported_index_types.contains(&index_type)
    }

    /// Produce the next record for `to`, checked against the transition table.
    ///
    /// `replica_id` is required when entering ASSIGNED and ignored otherwise;
    /// entering FREE clears it. The update time never moves backwards. A
    /// Reaper reset advances it by one millisecond only, so the slot keeps
    /// reading as abandoned and its host as dead until the node writes again.
    pub fn transition(
        &self,
        to: CacheSlotState,
        replica_id: Option<&str>,
        actor: SlotActor,
        now_ms: i64,
    ) -> Result<Self> {
        if !is_legal_transition(self.cache_slot_state, to, actor) {
            return Err(Error::IllegalTransition {
                slot: self.name.clone(),
                from: self.cache_slot_state,
                to,
                actor,
            });
        }
        let replica_id = match to {
            Free => String::new(),
            Assigned => match replica_id {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    return Err(Error::Validation(format!(
                        "assigning slot {} requires a replica id",
                        self.name
                    )))
                }
            },
            _ => self.replica_id.clone(),
        };
        let updated_time_epoch_ms = match actor {
            SlotActor::Reaper => self.updated_time_epoch_ms.saturating_add(1),
            _ => self.next_update_time(now_ms),
        };
        let next = Self {
            cache_slot_state: to,
            replica_id,
            updated_time_epoch_ms,
            ..self.clone()
        };
        next.validate()?;
        Ok(next)
    }

    /// Heartbeat: same state, refreshed update time.
    pub fn touch(&self, now_ms: i64) -> Self {
        Self {
            updated_time_epoch_ms: self.next_update_time(now_ms),
            ..self.clone()
        }
    }

    /// `Stale` if a bound slot has not been updated since `cutoff_ms`.
    pub fn check_fresh(&self, cutoff_ms: i64) -> Result<()> {
        if self.cache_slot_state.is_bound() && self.updated_time_epoch_ms < cutoff_ms {
            return Err(Error::Stale {
                slot: self.name.clone(),
                updated_time_epoch_ms: self.updated_time_epoch_ms,
                cutoff_epoch_ms: cutoff_ms,
            });
        }
        Ok(())
    }

    fn next_update_time(&self, now_ms: i64) -> i64 {
        now_ms.max(self.updated_time_epoch_ms.saturating_add(1))
    }
}

impl PartitionedMetadata for CacheSlotMetadata {
    const ROOT: &'static str = "cache_slot";

    fn name(&self) -> &str {
        &self.name
    }

    /// One partition per host, so a node lists only its own slots.
    fn partition(&self) -> String {
        self.hostname.clone()
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("name", &self.name)?;
        require_non_empty("hostname", &self.hostname)?;
        if self.updated_time_epoch_ms <= 0 {
            return Err(Error::Validation(
                "updated_time_epoch_ms must be greater than 0".to_string(),
            ));
        }
        if self.supported_index_types.is_empty() {
            return Err(Error::Validation(format!(
                "slot {} must support at least one index type",
                self.name
            )));
        }
        if self.supported_index_types.iter().any(|t| !t.is_recognized()) {
            return Err(Error::Validation(format!(
                "slot {} lists an unrecognized index type",
                self.name
            )));
        }
        match (self.cache_slot_state, self.replica_id.is_empty()) {
            (Free, false) => Err(Error::Validation(format!(
                "free slot {} must not hold replica {}",
                self.name, self.replica_id
            ))),
            (state, true) if state != Free => Err(Error::Validation(format!(
                "slot {} in state {} must hold a replica",
                self.name, state
            ))),
            _ => Ok(()),
        }
    }
}
