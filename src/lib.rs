//! # shardlog
//!
//! Coordination core of a distributed log index-and-search engine.
//!
//! Indexers append log messages into a local chunk, roll the chunk over when
//! a size, count or age limit is reached, upload the sealed segment to object
//! storage and publish Snapshot and Replica records. Cache nodes expose fixed
//! slots that load replicas on demand. A scheduler keeps every live replica
//! bound to enough slots and reclaims slots that stopped heart-beating.
//!
//! ## Architecture
//!
//! - **Metadata**: versioned, partitioned records (snapshot, replica,
//!   cache slot) with compare-and-set updates and watches
//! - **Indexer**: [`chunk::ChunkManager`] drives the chunk lifecycle
//! - **Cache node**: [`cache::CacheNode`] drives its slots through the state
//!   machine in [`metadata::CacheSlotState`]
//! - **Manager**: [`scheduler::ClusterScheduler`] assigns, evicts and reaps

pub mod blob;
pub mod cache;
pub mod chunk;
pub mod clock;
pub mod config;
pub mod metadata;
pub mod retry;
pub mod rollover;
pub mod scheduler;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::blob::{BlobStore, BlobStoreConfig};
    pub use crate::cache::{CacheNode, CacheNodeConfig, LocalDiskDataPlane, SlotDataPlane};
    pub use crate::chunk::{ChunkManager, ChunkManagerConfig, LogMessage, ReplicaPolicy};
    pub use crate::clock::{BoundedClock, Clock, ManualClock};
    pub use crate::metadata::{
        CacheSlotMetadata, CacheSlotState, EntityStore, IndexType, MetadataStore,
        ReplicaMetadata, SnapshotMetadata,
    };
    pub use crate::retry::RetryPolicy;
    pub use crate::rollover::RolloverPolicy;
    pub use crate::scheduler::{ClusterScheduler, SchedulerConfig};
    pub use crate::{Error, Result};
}
