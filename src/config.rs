//! Component factory for environment-based configuration
//!
//! Builds the object store and metadata store every binary needs from
//! environment variables, so the same binary runs against memory, a local
//! directory or S3 without code changes.

use crate::metadata::{
    LocalMetadataStore, MetadataStore, ObjectStoreMetadataConfig, ObjectStoreMetadataStore,
};
use crate::{Error, Result};

use object_store::{aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, ObjectStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Object storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Local,
    S3,
}

impl std::str::FromStr for StorageBackend {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "local" => Ok(Self::Local),
            "s3" | "aws" => Ok(Self::S3),
            other => Err(Error::Config(format!(
                "Unknown STORAGE_BACKEND: {}. Use 'memory', 'local' or 's3'",
                other
            ))),
        }
    }
}

/// Metadata backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBackend {
    /// In-process store; only useful when every component shares one process
    Local,
    /// One object per entity on the configured object store
    ObjectStore,
}

impl std::str::FromStr for MetadataBackend {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "object_store" | "s3" => Ok(Self::ObjectStore),
            other => Err(Error::Config(format!(
                "Unknown METADATA_BACKEND: {}. Use 'local' or 'object_store'",
                other
            ))),
        }
    }
}

/// Object storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Bucket name for S3
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (MinIO, LocalStack)
    pub endpoint: Option<String>,
    /// Root directory for the local backend
    pub local_root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            bucket: "shardlog-data".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            local_root: "/tmp/shardlog/blobs".to_string(),
        }
    }
}

impl StorageConfig {
    /// Environment variables:
    /// - STORAGE_BACKEND: "memory" (default), "local" or "s3"
    /// - S3_BUCKET: bucket name (required for s3)
    /// - S3_REGION: region (default: us-east-1)
    /// - S3_ENDPOINT: custom endpoint (optional)
    /// - STORAGE_LOCAL_ROOT: directory for the local backend
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(backend) = std::env::var("STORAGE_BACKEND") {
            config.backend = backend.parse()?;
        }
        match std::env::var("S3_BUCKET") {
            Ok(bucket) => config.bucket = bucket,
            Err(_) if config.backend == StorageBackend::S3 => {
                return Err(Error::Config(
                    "S3_BUCKET required when STORAGE_BACKEND=s3".to_string(),
                ))
            }
            Err(_) => {}
        }
        if let Ok(region) = std::env::var("S3_REGION") {
            config.region = region;
        }
        config.endpoint = std::env::var("S3_ENDPOINT").ok();
        if let Ok(root) = std::env::var("STORAGE_LOCAL_ROOT") {
            config.local_root = root;
        }
        Ok(config)
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create object store from environment
    ///
    /// AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY are used when set, otherwise
    /// the builder falls back to the instance role.
    pub async fn create_object_store() -> Result<Arc<dyn ObjectStore>> {
        Self::object_store_from_config(&StorageConfig::from_env()?)
    }

    pub fn object_store_from_config(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
        match config.backend {
            StorageBackend::Memory => {
                info!("Using in-memory object store (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            StorageBackend::Local => {
                info!(root = %config.local_root, "Using local filesystem object store");
                std::fs::create_dir_all(&config.local_root)?;
                let store = LocalFileSystem::new_with_prefix(&config.local_root)
                    .map_err(Error::from_object_store)?;
                Ok(Arc::new(store))
            }
            StorageBackend::S3 => {
                info!(bucket = %config.bucket, region = %config.region, "Using S3 object store");
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&config.bucket)
                    .with_region(&config.region);

                if let Some(endpoint) = &config.endpoint {
                    info!(endpoint = %endpoint, "Using custom S3 endpoint");
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                    builder = builder.with_access_key_id(&key);
                }
                if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                    builder = builder.with_secret_access_key(&secret);
                }

                Ok(Arc::new(builder.build().map_err(Error::from_object_store)?))
            }
        }
    }

    /// Create metadata store from environment
    ///
    /// Environment variables:
    /// - METADATA_BACKEND: "local" (default) or "object_store"
    /// - METADATA_PREFIX: key prefix for metadata objects (default: metadata)
    /// - METADATA_POLL_INTERVAL_MS: watch polling interval (default: 1000)
    ///
    /// The object-store backend needs conditional updates, which the
    /// in-memory and S3 stores support and the local filesystem store does not.
    pub async fn create_metadata_store(
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Arc<dyn MetadataStore>> {
        let backend: MetadataBackend = std::env::var("METADATA_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .parse()?;

        match backend {
            MetadataBackend::Local => {
                info!("Using LocalMetadataStore (development mode)");
                Ok(Arc::new(LocalMetadataStore::new()))
            }
            MetadataBackend::ObjectStore => {
                let mut config = ObjectStoreMetadataConfig::default();
                if let Ok(prefix) = std::env::var("METADATA_PREFIX") {
                    config.metadata_prefix = prefix;
                }
                if let Ok(ms) = std::env::var("METADATA_POLL_INTERVAL_MS") {
                    let ms: u64 = ms.trim().parse().map_err(|_| {
                        Error::Config(format!("METADATA_POLL_INTERVAL_MS is not a number: {}", ms))
                    })?;
                    config.watch_poll_interval = Duration::from_millis(ms.max(1));
                }
                Ok(Arc::new(ObjectStoreMetadataStore::new(object_store, config)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_storage_backend() {
        assert_eq!("memory".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert_eq!(" S3 ".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!("local".parse::<StorageBackend>().unwrap(), StorageBackend::Local);
        assert!(matches!(
            "gcs".parse::<StorageBackend>(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_parse_metadata_backend() {
        assert_eq!(
            "object_store".parse::<MetadataBackend>().unwrap(),
            MetadataBackend::ObjectStore
        );
        assert_eq!("local".parse::<MetadataBackend>().unwrap(), MetadataBackend::Local);
        assert!("etcd".parse::<MetadataBackend>().is_err());
    }

    #[test]
    fn test_local_backend_creates_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Local,
            local_root: dir.path().join("blobs").to_string_lossy().to_string(),
            ..Default::default()
        };
        ComponentFactory::object_store_from_config(&config).unwrap();
        assert!(dir.path().join("blobs").is_dir());
    }
}
