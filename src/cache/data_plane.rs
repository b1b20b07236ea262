//! Where downloaded snapshots live while a slot serves them

use crate::chunk::{content_hash, decode_segment};
use crate::metadata::SnapshotMetadata;
use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Node-local data plane behind the slot state machine.
#[async_trait]
pub trait SlotDataPlane: Send + Sync {
    /// Make `bytes` of `snapshot` queryable through `slot`, replacing whatever
    /// the slot held before.
    async fn attach(&self, slot: &str, snapshot: &SnapshotMetadata, bytes: Bytes) -> Result<()>;

    /// Release everything held for `slot`. Detaching an empty slot succeeds.
    async fn detach(&self, slot: &str) -> Result<()>;
}

/// Keeps each slot's snapshot under `{root}/{slot}/{snapshot}.seg`.
pub struct LocalDiskDataPlane {
    root: PathBuf,
}

impl LocalDiskDataPlane {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn slot_dir(&self, slot: &str) -> PathBuf {
        self.root.join(slot)
    }

    /// Name of the snapshot attached to `slot`, if any.
    pub async fn attached(&self, slot: &str) -> Result<Option<String>> {
        let mut entries = match fs::read_dir(self.slot_dir(slot)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(snapshot) = name.strip_suffix(".seg") {
                return Ok(Some(snapshot.to_string()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl SlotDataPlane for LocalDiskDataPlane {
    async fn attach(&self, slot: &str, snapshot: &SnapshotMetadata, bytes: Bytes) -> Result<()> {
        // Blob keys end in the content hash; a mismatch means a damaged download
        let expected = snapshot.blob_path.rsplit('/').next().unwrap_or_default();
        let actual = content_hash(&bytes);
        if expected != actual {
            return Err(Error::Corruption(format!(
                "snapshot {} downloaded with hash {}, expected {}",
                snapshot.name, actual, expected
            )));
        }
        decode_segment(&bytes)?;

        self.detach(slot).await?;
        let dir = self.slot_dir(slot);
        fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("{}.tmp", snapshot.name));
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, dir.join(format!("{}.seg", snapshot.name))).await?;
        debug!(slot, snapshot = %snapshot.name, size_bytes = bytes.len(), "Attached snapshot");
        Ok(())
    }

    async fn detach(&self, slot: &str) -> Result<()> {
        match fs::remove_dir_all(self.slot_dir(slot)).await {
            Ok(()) => {
                debug!(slot, "Detached slot");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
