use std::path::PathBuf;

use thiserror::Error;

use crate::coordinator::TxPhase;

/// Errors surfaced across the storage API.
///
/// Failures strictly before the database commit roll the transaction back
/// and clean up any pending blob files. Failures strictly after the commit
/// cannot undo durability; those are logged by the coordinator and never
/// reach the caller through this type.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no record for zoid {zoid}")]
    KeyMissing { zoid: u64, tid: Option<u64> },

    #[error("conflict on zoid {zoid}: stored with serial {expected}, current serial is {actual}")]
    Conflict { zoid: u64, expected: u64, actual: u64 },

    #[error("operation not allowed in transaction phase {0:?}")]
    InvalidState(TxPhase),

    #[error("storage is opened read-only")]
    ReadOnly,

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("storage is closed")]
    Closed,

    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("record payload is malformed: {0}")]
    BadPayload(String),

    #[error("external object store error: {0}")]
    ExternalStore(String),

    #[error("no external object store configured, blob of {size} bytes exceeds the inline threshold")]
    NoExternalStore { size: u64 },

    #[error("blob source file missing: {}", .0.display())]
    BlobSourceMissing(PathBuf),

    #[error("database error: {0}")]
    Database(#[from] postgres::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn missing(zoid: u64) -> Self {
        StorageError::KeyMissing { zoid, tid: None }
    }

    pub(crate) fn missing_at(zoid: u64, tid: u64) -> Self {
        StorageError::KeyMissing { zoid, tid: Some(tid) }
    }

    /// Whether a retry of the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Conflict { .. } | StorageError::PoolExhausted)
    }
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;
