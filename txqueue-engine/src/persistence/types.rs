use crate::core::types::{ObjectId, Payload};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Persistence error types
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Store corrupted at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Object not found: {0}")]
    NotFound(ObjectId),

    #[error("Failed to delete record {id} at {path:?}")]
    DeleteFailed { id: ObjectId, path: PathBuf },

    #[error("Invalid queue name: {0:?}")]
    InvalidQueueName(String),

    #[error("Persistence strategy is closed")]
    Closed,

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("Background task failed: {0}")]
    Background(String),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// A stored payload together with the queue that owns it.
///
/// Replay needs the queue name to put a recovered identifier back on the
/// right queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holder {
    pub queue: String,
    pub payload: Payload,
}

impl Holder {
    pub fn new(queue: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            queue: queue.into(),
            payload: payload.into(),
        }
    }
}

/// Which durable backend to construct
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Map-backed, nothing survives a restart
    Memory,
    /// One file per record under `<path>/<queue>/`
    File,
    /// Single append-only journal file, compacted by rewrite
    Journal,
    /// Segmented log with a persisted low-water mark
    Log,
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: Backend,
    pub path: PathBuf,
    pub fsync_mode: FsyncMode,
    pub fsync_interval_ms: u64,
    pub buffer_size_kb: usize,
    pub compaction_interval_ms: u64,
    pub segment_size_kb: u64,
    pub file_extension: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Journal,
            path: PathBuf::from("./data/queues"),
            fsync_mode: FsyncMode::Always,
            fsync_interval_ms: 1000,
            buffer_size_kb: 64,
            compaction_interval_ms: 5000,
            segment_size_kb: 4096,
            file_extension: "msg".to_string(),
        }
    }
}

/// Fsync mode for appended records
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FsyncMode {
    /// Fsync after every write (safest, slowest)
    Always,
    /// Fsync periodically (balanced)
    Periodic,
    /// Never fsync (fastest, least safe)
    Never,
}
