//! On-disk chunk directories and their manifests
//!
//! `{data_dir}/{chunk_id}/segment.log` holds the records and
//! `{data_dir}/{chunk_id}/manifest.json` tracks how far the chunk got through
//! rollover, so a restarted indexer can resume where it stopped.

use super::segment::content_hash;
use crate::metadata::IndexType;
use crate::{Error, Result};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

pub const SEGMENT_FILE: &str = "segment.log";
const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_TMP: &str = "manifest.json.tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestState {
    /// Still accepting records
    Active,
    /// Segment closed and hashed, not yet in blob storage
    Sealed,
    /// Blob written, metadata not yet published
    Uploaded,
    /// Snapshot and replicas published
    Published,
    /// Retries exhausted; kept for operator recovery
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub chunk_id: String,
    pub index_type: IndexType,
    pub start_time_epoch_ms: i64,
    pub state: ManifestState,
    #[serde(default)]
    pub end_time_epoch_ms: Option<i64>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub message_count: u64,
}

impl ChunkManifest {
    pub fn active(chunk_id: impl Into<String>, index_type: IndexType, start_time_epoch_ms: i64) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            index_type,
            start_time_epoch_ms,
            state: ManifestState::Active,
            end_time_epoch_ms: None,
            content_hash: None,
            size_bytes: 0,
            message_count: 0,
        }
    }

    /// Content-derived blob key, once the chunk is sealed.
    pub fn blob_key(&self) -> Option<String> {
        self.content_hash
            .as_ref()
            .map(|hash| format!("{}/{}", self.index_type.as_str(), hash))
    }
}

/// Chunk directories under one data dir.
#[derive(Debug, Clone)]
pub struct LocalChunkStore {
    data_dir: PathBuf,
}

impl LocalChunkStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir).await?;
        Ok(())
    }

    pub fn chunk_dir(&self, chunk_id: &str) -> PathBuf {
        self.data_dir.join(chunk_id)
    }

    pub fn segment_path(&self, chunk_id: &str) -> PathBuf {
        self.chunk_dir(chunk_id).join(SEGMENT_FILE)
    }

    /// Create the directory for a new chunk and record its manifest.
    pub async fn create_chunk(&self, manifest: &ChunkManifest) -> Result<PathBuf> {
        let dir = self.chunk_dir(&manifest.chunk_id);
        fs::create_dir_all(&dir).await?;
        self.write_manifest(manifest).await?;
        Ok(dir.join(SEGMENT_FILE))
    }

    /// Replace the manifest atomically: write a temp file, fsync, rename.
    pub async fn write_manifest(&self, manifest: &ChunkManifest) -> Result<()> {
        let dir = self.chunk_dir(&manifest.chunk_id);
        let tmp = dir.join(MANIFEST_TMP);
        let json = serde_json::to_vec_pretty(manifest)?;
        let file = {
            fs::write(&tmp, &json).await?;
            fs::File::open(&tmp).await?
        };
        file.sync_all().await?;
        fs::rename(&tmp, dir.join(MANIFEST_FILE)).await?;
        debug!(chunk_id = %manifest.chunk_id, state = ?manifest.state, "Wrote chunk manifest");
        Ok(())
    }

    pub async fn read_manifest(&self, chunk_id: &str) -> Result<Option<ChunkManifest>> {
        let path = self.chunk_dir(chunk_id).join(MANIFEST_FILE);
        match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).map(Some).map_err(|e| {
                Error::Corruption(format!("{}: unreadable manifest: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Manifests of every chunk directory, oldest first.
    pub async fn list_manifests(&self) -> Result<Vec<ChunkManifest>> {
        let mut manifests = Vec::new();
        let mut entries = match fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let chunk_id = entry.file_name().to_string_lossy().to_string();
            match self.read_manifest(&chunk_id).await? {
                Some(manifest) => manifests.push(manifest),
                None => warn!(chunk_id = %chunk_id, "Chunk directory without manifest, ignoring"),
            }
        }
        manifests.sort_by(|a, b| {
            a.start_time_epoch_ms
                .cmp(&b.start_time_epoch_ms)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(manifests)
    }

    /// Sealed segment bytes, verified against the manifest's content hash.
    pub async fn read_sealed(&self, manifest: &ChunkManifest) -> Result<Bytes> {
        let expected = manifest.content_hash.as_deref().ok_or_else(|| {
            Error::Internal(format!("chunk {} has no content hash", manifest.chunk_id))
        })?;
        let path = self.segment_path(&manifest.chunk_id);
        let bytes = fs::read(&path).await.map_err(|e| {
            Error::Corruption(format!("{}: sealed segment unreadable: {}", path.display(), e))
        })?;
        let actual = content_hash(&bytes);
        if actual != expected {
            return Err(Error::Corruption(format!(
                "{}: content hash {} does not match manifest {}",
                path.display(),
                actual,
                expected
            )));
        }
        Ok(Bytes::from(bytes))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
