//! Replica metadata: an obligation to serve one snapshot until an expiry time.

use super::{hour_partition, require_non_empty, IndexType, PartitionedMetadata};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Associates cache capacity with a snapshot. One snapshot may have several
/// replicas; each is scheduled onto cache slots independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaMetadata {
    pub name: String,
    pub snapshot_id: String,
    pub created_time_epoch_ms: i64,
    /// 0 means the replica never expires
    pub expire_after_epoch_ms: i64,
    /// Set when the replica is re-served to recover from a lost slot
    pub is_restored: bool,
    pub index_type: IndexType,
}

impl ReplicaMetadata {
    pub fn new(
        name: impl Into<String>,
        snapshot_id: impl Into<String>,
        created_time_epoch_ms: i64,
        expire_after_epoch_ms: i64,
        is_restored: bool,
        index_type: IndexType,
    ) -> Result<Self> {
        let replica = Self {
            name: name.into(),
            snapshot_id: snapshot_id.into(),
            created_time_epoch_ms,
            expire_after_epoch_ms,
            is_restored,
            index_type,
        };
        replica.validate()?;
        Ok(replica)
    }

    /// True once a non-zero expiry is at or before `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expire_after_epoch_ms != 0 && self.expire_after_epoch_ms <= now_ms
    }

    /// Copy with the restored flag set.
    pub fn restored(&self) -> Self {
        Self {
            is_restored: true,
            ..self.clone()
        }
    }
}

impl PartitionedMetadata for ReplicaMetadata {
    const ROOT: &'static str = "replica";

    fn name(&self) -> &str {
        &self.name
    }

    /// Keyed on expiry rather than creation: replicas re-created in bulk after
    /// a recovery share an expiry horizon with the originals, so they land in
    /// the same spread of partitions instead of all in the current hour.
    fn partition(&self) -> String {
        hour_partition(self.expire_after_epoch_ms)
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("name", &self.name)?;
        require_non_empty("snapshot_id", &self.snapshot_id)?;
        if self.created_time_epoch_ms <= 0 {
            return Err(Error::Validation(
                "created_time_epoch_ms must be greater than 0".to_string(),
            ));
        }
        if self.expire_after_epoch_ms < 0 {
            return Err(Error::Validation(
                "expire_after_epoch_ms must be greater than or equal to 0".to_string(),
            ));
        }
        if !self.index_type.is_recognized() {
            return Err(Error::Validation(format!(
                "replica {} has an unrecognized index type",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(replica: &ReplicaMetadata) -> u64 {
        let mut hasher = DefaultHasher::new();
        replica.hash(&mut hasher);
        hasher.finish()
    }

    fn replica() -> ReplicaMetadata {
        ReplicaMetadata::new("name", "snapshot", 100, 200, false, IndexType::LogsLucene9).unwrap()
    }

    #[test]
    fn test_fields_are_stored_verbatim() {
        let r = ReplicaMetadata::new("r1", "s1", 1234, 5678, true, IndexType::LogsTantivy).unwrap();
        assert_eq!(r.name, "r1");
        assert_eq!(r.snapshot_id, "s1");
        assert_eq!(r.created_time_epoch_ms, 1234);
        assert_eq!(r.expire_after_epoch_ms, 5678);
        assert!(r.is_restored);
        assert_eq!(r.index_type, IndexType::LogsTantivy);
    }

    #[test]
    fn test_equality_and_hash_are_structural() {
        let a = replica();
        let b = replica();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let variants = vec![
            ReplicaMetadata { name: "other".into(), ..a.clone() },
            ReplicaMetadata { snapshot_id: "other".into(), ..a.clone() },
            ReplicaMetadata { created_time_epoch_ms: 101, ..a.clone() },
            ReplicaMetadata { expire_after_epoch_ms: 201, ..a.clone() },
            ReplicaMetadata { is_restored: true, ..a.clone() },
            ReplicaMetadata { index_type: IndexType::LogsTantivy, ..a.clone() },
        ];
        for v in variants {
            assert_ne!(a, v);
            assert_ne!(hash_of(&a), hash_of(&v));
        }
    }

    #[test]
    fn test_invalid_arguments_are_rejected() {
        let it = IndexType::LogsLucene9;
        assert!(matches!(
            ReplicaMetadata::new("r", "", 100, 0, false, it),
            Err(Error::Validation(_))
        ));
        assert!(ReplicaMetadata::new("", "s", 100, 0, false, it).is_err());
        assert!(ReplicaMetadata::new("r", "s", 0, 0, false, it).is_err());
        assert!(ReplicaMetadata::new("r", "s", -1, 0, false, it).is_err());
        assert!(ReplicaMetadata::new("r", "s", 100, -1, false, it).is_err());
        assert!(ReplicaMetadata::new("r", "s", 100, 0, false, IndexType::Unrecognized).is_err());
        assert!(ReplicaMetadata::new("r", "s", 100, 0, false, it).is_ok());
    }

    #[test]
    fn test_partition_uses_expiry_in_utc() {
        let expire = Utc
            .with_ymd_and_hms(2024, 1, 15, 13, 0, 0)
            .unwrap()
            .timestamp_millis();
        let a = ReplicaMetadata::new("a", "s", 1, expire, false, IndexType::LogsLucene9).unwrap();
        let b = ReplicaMetadata::new("b", "s", 999_999, expire, true, IndexType::LogsLucene9)
            .unwrap();
        assert_eq!(a.partition(), "19737_13");
        assert_eq!(a.partition(), b.partition());
        assert_eq!(a.path(), "replica/19737_13/a");
    }

    #[test]
    fn test_expiry() {
        let never = ReplicaMetadata::new("r", "s", 1, 0, false, IndexType::LogsLucene9).unwrap();
        assert!(!never.is_expired(i64::MAX));

        let r = replica();
        assert!(!r.is_expired(199));
        assert!(r.is_expired(200));
        assert!(r.is_expired(201));
    }

    #[test]
    fn test_serde_round_trip_preserves_equality() {
        let r = replica();
        let json = serde_json::to_vec(&r).unwrap();
        let decoded: ReplicaMetadata = serde_json::from_slice(&json).unwrap();
        assert_eq!(r, decoded);
    }
}
