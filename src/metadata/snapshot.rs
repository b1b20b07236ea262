//! Snapshot metadata: one sealed chunk persisted to blob storage.

use super::{hour_partition, require_non_empty, IndexType, PartitionedMetadata};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Blob path of a snapshot whose chunk is still being indexed
pub const LIVE_SNAPSHOT_PATH: &str = "LIVE";

/// End time of a live snapshot; the real end is not known until rollover
pub const MAX_FUTURE_TIME: i64 = i64::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Snapshot id
    pub name: String,
    /// Content-derived blob key, or `LIVE_SNAPSHOT_PATH`
    pub blob_path: String,
    pub start_time_epoch_ms: i64,
    pub end_time_epoch_ms: i64,
    pub size_bytes: u64,
    pub index_type: IndexType,
}

impl SnapshotMetadata {
    pub fn new(
        name: impl Into<String>,
        blob_path: impl Into<String>,
        start_time_epoch_ms: i64,
        end_time_epoch_ms: i64,
        size_bytes: u64,
        index_type: IndexType,
    ) -> Result<Self> {
        let snapshot = Self {
            name: name.into(),
            blob_path: blob_path.into(),
            start_time_epoch_ms,
            end_time_epoch_ms,
            size_bytes,
            index_type,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Sentinel for a chunk that is still accepting writes.
    pub fn live(name: impl Into<String>, start_time_epoch_ms: i64, index_type: IndexType) -> Result<Self> {
        Self::new(
            name,
            LIVE_SNAPSHOT_PATH,
            start_time_epoch_ms,
            MAX_FUTURE_TIME,
            0,
            index_type,
        )
    }

    pub fn is_live(&self) -> bool {
        self.blob_path == LIVE_SNAPSHOT_PATH
    }
}

impl PartitionedMetadata for SnapshotMetadata {
    const ROOT: &'static str = "snapshot";

    fn name(&self) -> &str {
        &self.name
    }

    /// Keyed on start time, which is fixed when the chunk opens, so the live
    /// sentinel and the sealed record share a path.
    fn partition(&self) -> String {
        hour_partition(self.start_time_epoch_ms)
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("name", &self.name)?;
        require_non_empty("blob_path", &self.blob_path)?;
        if self.start_time_epoch_ms <= 0 {
            return Err(Error::Validation(
                "start_time_epoch_ms must be greater than 0".to_string(),
            ));
        }
        if self.end_time_epoch_ms < self.start_time_epoch_ms {
            return Err(Error::Validation(format!(
                "snapshot {} ends ({}) before it starts ({})",
                self.name, self.end_time_epoch_ms, self.start_time_epoch_ms
            )));
        }
        if !self.index_type.is_recognized() {
            return Err(Error::Validation(format!(
                "snapshot {} has an unrecognized index type",
                self.name
            )));
        }
        Ok(())
    }
}
