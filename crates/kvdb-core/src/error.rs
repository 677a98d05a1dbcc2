//! # error
//!
//! why: one error type for everything that turns bytes back into values
//! relations: returned by log.rs and command.rs, wrapped by kvdb-storage and kvdb errors
//! what: CodecError

use thiserror::Error;

use crate::log::HEADER_LEN;

/// Failure to decode a log entry or a command payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("log entry truncated: {len} bytes, need at least {HEADER_LEN}")]
    Truncated { len: usize },

    #[error("log entry declares {declared} data bytes but only {available} remain")]
    LengthOverflow { declared: u64, available: usize },

    #[error("unknown log type {0}")]
    UnknownLogType(u8),

    #[error("empty command payload")]
    Empty,

    #[error("unsupported command encoding version {0}")]
    UnknownVersion(u8),

    #[error("malformed command: {0}")]
    Malformed(String),
}
