//! Metadata store contract and the typed entity client built on it

use super::{PartitionedMetadata, Version, Versioned};
use crate::retry::{with_retry, with_timeout, RetryPolicy};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Raw value plus the version the store assigned to it
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub bytes: Bytes,
    pub version: Version,
}

/// Change notification delivered by `MetadataStore::watch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created { path: String, version: Version },
    Updated { path: String, version: Version },
    Deleted { path: String },
}

impl WatchEvent {
    pub fn path(&self) -> &str {
        match self {
            WatchEvent::Created { path, .. }
            | WatchEvent::Updated { path, .. }
            | WatchEvent::Deleted { path } => path,
        }
    }
}

/// Receiving end of a watch. Unbounded, so a slow consumer never loses a
/// terminal state; the channel closes when the store shuts the watch down.
pub type WatchReceiver = mpsc::UnboundedReceiver<WatchEvent>;

/// Result of a full listing: the records that decoded plus the names of
/// those that did not.
#[derive(Debug, Clone)]
pub struct Listing<T> {
    pub records: Vec<Versioned<T>>,
    pub undecodable: Vec<String>,
}

/// Next event from an optional watch. Pends forever when there is no watch,
/// so callers can keep it as a `select!` branch next to an interval;
/// `None` means the watch was closed and should be re-established.
pub async fn next_watch_event(watch: &mut Option<WatchReceiver>) -> Option<WatchEvent> {
    match watch {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Discard events already queued behind one that triggered a pass.
pub fn drain_pending(watch: &mut Option<WatchReceiver>) -> usize {
    let mut drained = 0;
    if let Some(rx) = watch {
        while rx.try_recv().is_ok() {
            drained += 1;
        }
    }
    drained
}

/// Metadata store interface
///
/// Abstracts the coordination service holding cluster state. Implementations
/// must make `create`, `update` and `delete` atomic with respect to each other.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create a record; fails with `AlreadyExists` when the path is taken
    async fn create(&self, path: &str, value: Bytes) -> Result<Version>;

    /// Compare-and-set; fails with `VersionConflict` when `expected` is stale
    async fn update(&self, path: &str, expected: &Version, value: Bytes) -> Result<Version>;

    /// Delete a record at `expected` version
    async fn delete(&self, path: &str, expected: &Version) -> Result<()>;

    /// Read a record
    async fn get(&self, path: &str) -> Result<Option<StoredValue>>;

    /// Read every record under a path prefix
    async fn list(&self, prefix: &str) -> Result<Vec<(String, StoredValue)>>;

    /// Subscribe to changes under a path prefix
    async fn watch(&self, prefix: &str) -> Result<WatchReceiver>;
}

/// Typed, time-bounded client for one entity type.
pub struct EntityStore<T> {
    store: Arc<dyn MetadataStore>,
    op_timeout: Duration,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for EntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            op_timeout: self.op_timeout,
            _entity: PhantomData,
        }
    }
}

impl<T: PartitionedMetadata> EntityStore<T> {
    pub fn new(store: Arc<dyn MetadataStore>, op_timeout: Duration) -> Self {
        Self {
            store,
            op_timeout,
            _entity: PhantomData,
        }
    }

    fn encode(entity: &T) -> Result<Bytes> {
        entity.validate()?;
        Ok(Bytes::from(serde_json::to_vec(entity)?))
    }

    fn decode(path: &str, stored: StoredValue) -> Result<Versioned<T>> {
        let value: T = serde_json::from_slice(&stored.bytes)
            .map_err(|e| Error::Serialization(format!("{}: {}", path, e)))?;
        value.validate()?;
        Ok(Versioned {
            value,
            version: stored.version,
        })
    }

    fn prefix() -> String {
        format!("{}/", T::ROOT)
    }

    pub async fn create(&self, entity: &T) -> Result<Versioned<T>> {
        let path = entity.path();
        let bytes = Self::encode(entity)?;
        let version = with_timeout(self.op_timeout, "metadata create", self.store.create(&path, bytes)).await?;
        debug!(path = %path, version = %version, "Created metadata record");
        Ok(Versioned {
            value: entity.clone(),
            version,
        })
    }

    /// Create the record unless one already exists at its path, in which case
    /// the stored record is returned unchanged. Used for idempotent publish.
    pub async fn create_if_absent(&self, entity: &T) -> Result<Versioned<T>> {
        match self.create(entity).await {
            Ok(created) => Ok(created),
            Err(Error::AlreadyExists(path)) => {
                debug!(path = %path, "Record already present, keeping existing");
                self.get(&entity.partition(), entity.name())
                    .await?
                    .ok_or_else(|| Error::NotFound(path))
            }
            Err(e) => Err(e),
        }
    }

    /// Compare-and-set `next` over `current`. Both must route to the same path.
    pub async fn update(&self, current: &Versioned<T>, next: &T) -> Result<Versioned<T>> {
        let path = current.value.path();
        if next.path() != path {
            return Err(Error::Validation(format!(
                "update would move record from {} to {}",
                path,
                next.path()
            )));
        }
        let bytes = Self::encode(next)?;
        let version = with_timeout(
            self.op_timeout,
            "metadata update",
            self.store.update(&path, &current.version, bytes),
        )
        .await?;
        Ok(Versioned {
            value: next.clone(),
            version,
        })
    }

    pub async fn delete(&self, current: &Versioned<T>) -> Result<()> {
        let path = current.value.path();
        with_timeout(
            self.op_timeout,
            "metadata delete",
            self.store.delete(&path, &current.version),
        )
        .await
    }

    pub async fn get(&self, partition: &str, name: &str) -> Result<Option<Versioned<T>>> {
        let path = super::entity_path(T::ROOT, partition, name);
        match with_timeout(self.op_timeout, "metadata get", self.store.get(&path)).await? {
            Some(stored) => Ok(Some(Self::decode(&path, stored)?)),
            None => Ok(None),
        }
    }

    /// Look a record up by name alone, scanning every partition.
    pub async fn find(&self, name: &str) -> Result<Option<Versioned<T>>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|entry| entry.value.name() == name))
    }

    /// Every decodable record of this type. Corrupt records are skipped.
    pub async fn list(&self) -> Result<Vec<Versioned<T>>> {
        Ok(self.list_prefix(&Self::prefix()).await?.records)
    }

    /// Like `list`, but also reports the names of records that exist and
    /// could not be decoded.
    pub async fn list_all(&self) -> Result<Listing<T>> {
        self.list_prefix(&Self::prefix()).await
    }

    /// Every record in one partition.
    pub async fn list_partition(&self, partition: &str) -> Result<Vec<Versioned<T>>> {
        Ok(self
            .list_prefix(&format!("{}/{}/", T::ROOT, partition))
            .await?
            .records)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Listing<T>> {
        let entries = with_timeout(self.op_timeout, "metadata list", self.store.list(prefix)).await?;
        let mut listing = Listing {
            records: Vec::with_capacity(entries.len()),
            undecodable: Vec::new(),
        };
        for (path, stored) in entries {
            match Self::decode(&path, stored) {
                Ok(entry) => listing.records.push(entry),
                Err(e) => {
                    warn!(path = %path, error = %e, "Skipping undecodable metadata record");
                    let name = path.rsplit('/').next().unwrap_or(path.as_str());
                    listing.undecodable.push(name.to_string());
                }
            }
        }
        Ok(listing)
    }

    pub async fn watch(&self) -> Result<WatchReceiver> {
        with_timeout(self.op_timeout, "metadata watch", self.store.watch(&Self::prefix())).await
    }

    /// Subscribe with bounded backoff. `None` when the budget runs out; the
    /// caller falls back to interval-only reconciliation and tries again later.
    pub async fn watch_with_retry(&self, policy: &RetryPolicy) -> Option<WatchReceiver> {
        match with_retry(policy, "metadata watch", || self.watch()).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(root = T::ROOT, error = %e, "Watch unavailable, reconciling on interval only");
                None
            }
        }
    }
}
