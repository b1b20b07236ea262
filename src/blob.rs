//! Blob storage for sealed chunk files
//!
//! Keys are content-derived, so a put of an existing key is a successful no-op
//! and a key's bytes never change once written.

use crate::retry::with_timeout;
use crate::{Error, Result};

use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Blob store configuration
#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    /// Key prefix for all snapshot blobs
    pub prefix: String,
    /// Bound on a single put or get
    pub op_timeout: Duration,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            prefix: "snapshots".to_string(),
            op_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct BlobStore {
    object_store: Arc<dyn ObjectStore>,
    config: BlobStoreConfig,
}

impl BlobStore {
    pub fn new(object_store: Arc<dyn ObjectStore>, config: BlobStoreConfig) -> Self {
        Self {
            object_store,
            config,
        }
    }

    fn location(&self, key: &str) -> Path {
        let prefix = self.config.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            Path::from(key)
        } else {
            Path::from(format!("{}/{}", prefix, key))
        }
    }

    /// Write `bytes` under `key`. Writing a key that already exists succeeds
    /// without touching the stored object.
    pub async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        let size = bytes.len();
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        let put = async {
            match self
                .object_store
                .put_opts(&self.location(key), PutPayload::from(bytes), opts)
                .await
            {
                Ok(_) => {
                    debug!(key, size_bytes = size, "Uploaded blob");
                    Ok(())
                }
                Err(object_store::Error::AlreadyExists { .. }) => {
                    debug!(key, "Blob already present");
                    Ok(())
                }
                Err(e) => Err(Error::StorageIo(e.to_string())),
            }
        };
        with_timeout(self.config.op_timeout, "blob put", put).await
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let get = async {
            match self.object_store.get(&self.location(key)).await {
                Ok(result) => result
                    .bytes()
                    .await
                    .map_err(|e| Error::StorageIo(e.to_string())),
                Err(object_store::Error::NotFound { .. }) => {
                    Err(Error::BlobNotFound(key.to_string()))
                }
                Err(e) => Err(Error::StorageIo(e.to_string())),
            }
        };
        with_timeout(self.config.op_timeout, "blob get", get).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let head = async {
            match self.object_store.head(&self.location(key)).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(Error::StorageIo(e.to_string())),
            }
        };
        with_timeout(self.config.op_timeout, "blob head", head).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn store() -> BlobStore {
        BlobStore::new(Arc::new(InMemory::new()), BlobStoreConfig::default())
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let blobs = store();
        blobs.put("LOGS_LUCENE9/abc", Bytes::from_static(b"one")).await.unwrap();
        blobs.put("LOGS_LUCENE9/abc", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(
            blobs.get("LOGS_LUCENE9/abc").await.unwrap(),
            Bytes::from_static(b"one")
        );
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let blobs = store();
        assert!(matches!(
            blobs.get("nope").await,
            Err(Error::BlobNotFound(key)) if key == "nope"
        ));
        assert!(!blobs.exists("nope").await.unwrap());
    }
}
