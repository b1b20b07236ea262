//! Local in-memory metadata store for development and testing

use super::client::{MetadataStore, StoredValue, WatchEvent, WatchReceiver};
use super::Version;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

/// Local in-memory metadata store
///
/// Suitable for tests and single-process deployments. All mutations take the
/// records write lock, so create/update/delete are atomic and watchers see
/// events in commit order.
pub struct LocalMetadataStore {
    /// Records by path. BTreeMap so prefix listing is a range scan.
    records: RwLock<BTreeMap<String, StoredValue>>,
    /// Global version counter
    next_version: AtomicU64,
    watchers: Mutex<Vec<Watcher>>,
    /// Successful mutations, for write-count assertions in tests
    mutations: AtomicU64,
}

impl LocalMetadataStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_version: AtomicU64::new(1),
            watchers: Mutex::new(Vec::new()),
            mutations: AtomicU64::new(0),
        }
    }

    /// Number of successful create/update/delete calls so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Acquire)
    }

    fn bump_version(&self) -> Version {
        Version::from(self.next_version.fetch_add(1, Ordering::AcqRel))
    }

    fn notify(&self, event: WatchEvent) {
        self.mutations.fetch_add(1, Ordering::AcqRel);
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| {
            if !event.path().starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx.send(event.clone()).is_ok()
        });
    }
}

impl Default for LocalMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for LocalMetadataStore {
    async fn create(&self, path: &str, value: Bytes) -> Result<Version> {
        let version = {
            let mut records = self.records.write();
            if records.contains_key(path) {
                return Err(Error::AlreadyExists(path.to_string()));
            }
            let version = self.bump_version();
            records.insert(
                path.to_string(),
                StoredValue {
                    bytes: value,
                    version: version.clone(),
                },
            );
            // Notify under the lock so event order matches commit order
            self.notify(WatchEvent::Created {
                path: path.to_string(),
                version: version.clone(),
            });
            version
        };
        Ok(version)
    }

    async fn update(&self, path: &str, expected: &Version, value: Bytes) -> Result<Version> {
        let mut records = self.records.write();
        let current = records
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if &current.version != expected {
            return Err(Error::VersionConflict {
                path: path.to_string(),
                expected: expected.to_string(),
            });
        }
        let version = self.bump_version();
        current.bytes = value;
        current.version = version.clone();
        self.notify(WatchEvent::Updated {
            path: path.to_string(),
            version: version.clone(),
        });
        Ok(version)
    }

    async fn delete(&self, path: &str, expected: &Version) -> Result<()> {
        let mut records = self.records.write();
        let current = records
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if &current.version != expected {
            return Err(Error::VersionConflict {
                path: path.to_string(),
                expected: expected.to_string(),
            });
        }
        records.remove(path);
        self.notify(WatchEvent::Deleted {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<StoredValue>> {
        Ok(self.records.read().get(path).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, StoredValue)>> {
        let records = self.records.read();
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}
