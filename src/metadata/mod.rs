//! Metadata model for shardlog
//!
//! Every cluster entity (snapshots, replicas, cache slots) is a named record
//! whose storage path is derived from a deterministic partition key:
//! `{entity_root}/{partition}/{name}`. Records live in a versioned,
//! watch-capable store and are only mutated through compare-and-set.

mod cache_slot;
mod client;
mod local;
mod replica;
mod s3;
mod snapshot;

pub use cache_slot::{is_legal_transition, CacheSlotMetadata, CacheSlotState, SlotActor};
pub use client::{
    drain_pending, next_watch_event, EntityStore, Listing, MetadataStore, StoredValue, WatchEvent,
    WatchReceiver,
};
pub use local::LocalMetadataStore;
pub use replica::ReplicaMetadata;
pub use s3::{ObjectStoreMetadataConfig, ObjectStoreMetadataStore};
pub use snapshot::{SnapshotMetadata, LIVE_SNAPSHOT_PATH, MAX_FUTURE_TIME};

use crate::{Error, Result};
use chrono::{DateTime, Timelike, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named metadata record routed to a store partition.
///
/// `partition()` must be a pure function of the record's own fields. Equality
/// is structural over every field, so a watch-delivered update that changes
/// nothing compares equal to the cached value.
pub trait PartitionedMetadata:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Root path segment for this entity type
    const ROOT: &'static str;

    fn name(&self) -> &str;

    fn partition(&self) -> String;

    /// Check construction invariants. Runs on every constructor and on every
    /// record decoded from the store.
    fn validate(&self) -> Result<()>;

    fn path(&self) -> String {
        entity_path(Self::ROOT, &self.partition(), self.name())
    }
}

/// Storage path for an entity.
pub fn entity_path(root: &str, partition: &str, name: &str) -> String {
    format!("{}/{}/{}", root, partition, name)
}

/// `"{epochDay}_{hourOfDay}"` for an epoch-millisecond timestamp, in UTC.
/// Timestamps outside chrono's range clamp to its first or last instant.
pub fn hour_partition(epoch_ms: i64) -> String {
    let at = DateTime::from_timestamp_millis(epoch_ms).unwrap_or(if epoch_ms < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    });
    let day = (at.date_naive() - DateTime::<Utc>::UNIX_EPOCH.date_naive()).num_days();
    format!("{}_{}", day, at.hour())
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Store-assigned record version, opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(String);

impl Version {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Self(v.to_string())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A decoded record together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

impl<T: PartitionedMetadata> Versioned<T> {
    pub fn path(&self) -> String {
        self.value.path()
    }
}

/// Index formats a snapshot can be written in and a slot can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IndexType {
    LogsLucene9,
    LogsTantivy,
    /// Any tag this build does not know. Rejected by validation.
    Unrecognized,
}

impl IndexType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::LogsLucene9 => "LOGS_LUCENE9",
            IndexType::LogsTantivy => "LOGS_TANTIVY",
            IndexType::Unrecognized => "UNRECOGNIZED",
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, IndexType::Unrecognized)
    }
}

impl From<String> for IndexType {
    fn from(value: String) -> Self {
        value.parse().unwrap_or(IndexType::Unrecognized)
    }
}

impl From<IndexType> for String {
    fn from(value: IndexType) -> Self {
        value.as_str().to_string()
    }
}

impl std::str::FromStr for IndexType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "LOGS_LUCENE9" => Ok(IndexType::LogsLucene9),
            "LOGS_TANTIVY" => Ok(IndexType::LogsTantivy),
            other => Err(Error::Validation(format!("unknown index type '{}'", other))),
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_hour_partition_is_epoch_day_and_hour() {
        let ms = Utc
            .with_ymd_and_hms(2024, 1, 15, 13, 0, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(hour_partition(ms), "19737_13");
        assert_eq!(hour_partition(ms + 59 * 60 * 1000), "19737_13");
        assert_eq!(hour_partition(ms + 60 * 60 * 1000), "19737_14");
        assert_eq!(hour_partition(0), "0_0");
        assert_eq!(hour_partition(-1), "-1_23");
    }

    #[test]
    fn test_entity_path_layout() {
        assert_eq!(entity_path("replica", "19737_13", "r1"), "replica/19737_13/r1");
    }

    #[test]
    fn test_index_type_round_trips_through_json() {
        let json = serde_json::to_string(&IndexType::LogsLucene9).unwrap();
        assert_eq!(json, "\"LOGS_LUCENE9\"");
        let parsed: IndexType = serde_json::from_str("\"LOGS_TANTIVY\"").unwrap();
        assert_eq!(parsed, IndexType::LogsTantivy);
    }

    #[test]
    fn test_unknown_index_type_decodes_as_unrecognized() {
        let parsed: IndexType = serde_json::from_str("\"METRICS_V2\"").unwrap();
        assert_eq!(parsed, IndexType::Unrecognized);
        assert!(!parsed.is_recognized());
        assert!("METRICS_V2".parse::<IndexType>().is_err());
    }
}
