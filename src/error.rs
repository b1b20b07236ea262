//! Error types for shardlog

use crate::metadata::{CacheSlotState, SlotActor};
use thiserror::Error;

/// Result type alias for shardlog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for shardlog
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed entity construction. Never persisted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Compare-and-set lost against a concurrent writer
    #[error("Version conflict at {path}: expected version {expected}")]
    VersionConflict { path: String, expected: String },

    /// Create of a path that already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Metadata record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Blob key not found
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    /// Blob or metadata store unreachable
    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    /// Operation exceeded its time bound
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Slot presumed abandoned by its owning node
    #[error("Slot {slot} is stale: last updated at {updated_time_epoch_ms}, cutoff {cutoff_epoch_ms}")]
    Stale {
        slot: String,
        updated_time_epoch_ms: i64,
        cutoff_epoch_ms: i64,
    },

    /// Write into a chunk that is no longer accepting records
    #[error("Chunk {0} is closed")]
    ChunkClosed(String),

    /// Slot transition not present in the transition table
    #[error("Illegal slot transition {from:?} -> {to:?} by {actor:?} on {slot}")]
    IllegalTransition {
        slot: String,
        from: CacheSlotState,
        to: CacheSlotState,
        actor: SlotActor,
    },

    /// Bounded retry gave up
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<Error>,
    },

    /// Unrecoverable local storage corruption
    #[error("Local storage corruption: {0}")]
    Corruption(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transient failures worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageIo(_) | Error::Timeout(_) | Error::Io(_))
    }

    /// Lost a compare-and-set race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. } | Error::AlreadyExists(_))
    }

    pub(crate) fn from_object_store(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Error::NotFound(path),
            object_store::Error::AlreadyExists { path, .. } => Error::AlreadyExists(path),
            object_store::Error::Precondition { path, .. } => Error::VersionConflict {
                path,
                expected: "unknown".to_string(),
            },
            other => Error::StorageIo(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
