//! # error
//!
//! why: one error type for the log, stable and snapshot stores
//! relations: wraps kvdb-core's CodecError and sled errors, wrapped in turn by kvdb::Error
//! what: StoreError

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use kvdb_core::CodecError;
use thiserror::Error;

/// Errors surfaced by the log, stable and snapshot stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Missing log entry or metadata key. Expected during normal operation.
    #[error("not found")]
    NotFound,

    /// Persisted bytes that cannot be decoded.
    #[error("corrupt: {0}")]
    Corrupt(String),

    #[error("store is opened read-only")]
    ReadOnly,

    /// Another handle holds the database lock.
    #[error("database {} is locked (waited {waited:?})", path.display())]
    ResourceBusy { path: PathBuf, waited: Duration },

    #[error("storage engine: {0}")]
    Engine(#[from] sled::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("metadata encoding: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CodecError> for StoreError {
    fn from(err: CodecError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
