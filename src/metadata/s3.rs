//! Object-store-backed metadata store for multi-process deployments
//!
//! Each record is one JSON object at `{metadata_prefix}/{path}`. Atomic writes
//! use conditional puts: `PutMode::Create` for creates and
//! `PutMode::Update(e_tag)` for compare-and-set, so the record's ETag is its
//! version. Watches are served by polling `list(prefix)` and diffing ETags.
//! `list` fetches the listed objects concurrently, up to
//! `LIST_FETCH_CONCURRENCY` gets in flight, and returns them in path order.
//!
//! Conditional delete is not offered by object stores; `delete` re-reads the
//! ETag and deletes when it still matches, which leaves a small window in
//! which a concurrent update can be lost. Only the scheduler deletes records,
//! and only expired replicas no slot references.

use super::client::{MetadataStore, StoredValue, WatchEvent, WatchReceiver};
use super::Version;
use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use metrics::counter;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const LIST_FETCH_CONCURRENCY: usize = 16;

/// Object-store metadata configuration
#[derive(Debug, Clone)]
pub struct ObjectStoreMetadataConfig {
    /// Key prefix under which all metadata lives
    pub metadata_prefix: String,
    /// How often watch pollers re-list their prefix
    pub watch_poll_interval: Duration,
}

impl Default for ObjectStoreMetadataConfig {
    fn default() -> Self {
        Self {
            metadata_prefix: "metadata".to_string(),
            watch_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Metadata store on top of any `ObjectStore` with conditional-put support
pub struct ObjectStoreMetadataStore {
    object_store: Arc<dyn ObjectStore>,
    config: ObjectStoreMetadataConfig,
}

impl ObjectStoreMetadataStore {
    pub fn new(object_store: Arc<dyn ObjectStore>, config: ObjectStoreMetadataConfig) -> Self {
        info!(
            prefix = %config.metadata_prefix,
            poll_ms = config.watch_poll_interval.as_millis() as u64,
            "Using object-store metadata backend"
        );
        Self {
            object_store,
            config,
        }
    }

    fn object_path(&self, path: &str) -> Path {
        Path::from(format!("{}/{}", self.config.metadata_prefix.trim_end_matches('/'), path))
    }

    fn logical_path(prefix: &str, location: &Path) -> String {
        let full = location.as_ref();
        full.strip_prefix(prefix.trim_end_matches('/'))
            .map(|p| p.trim_start_matches('/').to_string())
            .unwrap_or_else(|| full.to_string())
    }

    fn version_of(path: &str, e_tag: Option<String>) -> Result<Version> {
        e_tag.map(Version::new).ok_or_else(|| {
            Error::Config(format!(
                "object store returned no ETag for {}; conditional writes are required for metadata",
                path
            ))
        })
    }

    async fn put(&self, path: &str, value: Bytes, mode: PutMode) -> Result<Version> {
        let opts = PutOptions {
            mode,
            ..Default::default()
        };
        let result = match self
            .object_store
            .put_opts(&self.object_path(path), PutPayload::from(value), opts)
            .await
        {
            Ok(result) => Self::version_of(path, result.e_tag),
            Err(object_store::Error::NotImplemented)
            | Err(object_store::Error::NotSupported { .. }) => Err(Error::Config(format!(
                "conditional writes are required for metadata at {} but are not supported by the object store",
                path
            ))),
            Err(e) => Err(Error::from_object_store(e)),
        };
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_conflict() => "conflict",
            Err(_) => "error",
        };
        counter!(
            "shardlog_metadata_cas_attempts_total",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id(),
            "result" => outcome
        )
        .increment(1);
        result
    }

    /// ETag of every object under `prefix`, keyed by logical path.
    async fn list_etags(
        object_store: &Arc<dyn ObjectStore>,
        root: &str,
        prefix: &Path,
    ) -> Result<HashMap<String, Version>> {
        let metas: Vec<_> = object_store
            .list(Some(prefix))
            .try_collect()
            .await
            .map_err(Error::from_object_store)?;
        Ok(metas
            .into_iter()
            .filter_map(|meta| {
                let path = Self::logical_path(root, &meta.location);
                meta.e_tag.map(|tag| (path, Version::new(tag)))
            })
            .collect())
    }
}

#[async_trait]
impl MetadataStore for ObjectStoreMetadataStore {
    async fn create(&self, path: &str, value: Bytes) -> Result<Version> {
        match self.put(path, value, PutMode::Create).await {
            Err(Error::AlreadyExists(_)) => Err(Error::AlreadyExists(path.to_string())),
            other => other,
        }
    }

    async fn update(&self, path: &str, expected: &Version, value: Bytes) -> Result<Version> {
        let mode = PutMode::Update(UpdateVersion {
            e_tag: Some(expected.as_str().to_string()),
            version: None,
        });
        match self.put(path, value, mode).await {
            Err(Error::VersionConflict { .. }) => Err(Error::VersionConflict {
                path: path.to_string(),
                expected: expected.to_string(),
            }),
            other => other,
        }
    }

    async fn delete(&self, path: &str, expected: &Version) -> Result<()> {
        let current = self
            .get(path)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if &current.version != expected {
            return Err(Error::VersionConflict {
                path: path.to_string(),
                expected: expected.to_string(),
            });
        }
        self.object_store
            .delete(&self.object_path(path))
            .await
            .map_err(Error::from_object_store)
    }

    async fn get(&self, path: &str) -> Result<Option<StoredValue>> {
        let result = match self.object_store.get(&self.object_path(path)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(Error::from_object_store(e)),
        };
        let version = Self::version_of(path, result.meta.e_tag.clone())?;
        let bytes = result.bytes().await.map_err(Error::from_object_store)?;
        Ok(Some(StoredValue { bytes, version }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, StoredValue)>> {
        let listed = Self::list_etags(
            &self.object_store,
            &self.config.metadata_prefix,
            &self.object_path(prefix),
        )
        .await?;
        let mut paths: Vec<String> = listed.into_keys().collect();
        paths.sort();

        let fetched: Vec<(String, Option<StoredValue>)> = futures::stream::iter(paths)
            .map(|path| async move {
                let stored = self.get(&path).await?;
                Ok::<_, Error>((path, stored))
            })
            .buffered(LIST_FETCH_CONCURRENCY)
            .try_collect()
            .await?;
        // Deleted between list and get: skip
        Ok(fetched
            .into_iter()
            .filter_map(|(path, stored)| stored.map(|stored| (path, stored)))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        let object_store = Arc::clone(&self.object_store);
        let root = self.config.metadata_prefix.clone();
        let list_prefix = self.object_path(prefix);
        let poll = self.config.watch_poll_interval;
        let mut known = Self::list_etags(&object_store, &root, &list_prefix).await?;
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            loop {
                interval.tick().await;
                if tx.is_closed() {
                    debug!(prefix = %prefix, "Watch receiver dropped, stopping poller");
                    break;
                }
                let current = match Self::list_etags(&object_store, &root, &list_prefix).await {
                    Ok(current) => current,
                    Err(e) => {
                        warn!(prefix = %prefix, error = %e, "Watch poll failed, will retry");
                        continue;
                    }
                };

                let mut events = Vec::new();
                for (path, version) in &current {
                    match known.get(path) {
                        None => events.push(WatchEvent::Created {
                            path: path.clone(),
                            version: version.clone(),
                        }),
                        Some(prev) if prev != version => events.push(WatchEvent::Updated {
                            path: path.clone(),
                            version: version.clone(),
                        }),
                        Some(_) => {}
                    }
                }
                for path in known.keys() {
                    if !current.contains_key(path) {
                        events.push(WatchEvent::Deleted { path: path.clone() });
                    }
                }
                known = current;

                for event in events {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
