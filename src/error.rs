//! Storage error model shared across the shard engine and its callers.
//! Encoding violations are programming or corruption errors; shard-open
//! failures are routine on the read path and fatal on a per-request basis
//! on the write path.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("encoded value must be 8 bytes, got {0}")]
    BadValueLength(usize),

    #[error("metric short code must be 16 bytes, got {0}")]
    BadShortCodeLength(usize),

    #[error("shard key must be 24 bytes, got {0}")]
    BadKeyLength(usize),

    #[error("shard {path} does not exist")]
    ShardAbsent { path: PathBuf },

    #[error("shard {path} carries an unknown serialization marker {found:?}")]
    MagicMismatch { path: PathBuf, found: Vec<u8> },

    #[error("scan range start {start} is after end {end}")]
    InvertedRange { start: u64, end: u64 },

    #[error("timestamp {0} is outside the representable calendar range")]
    TimeOutOfRange(u64),

    #[error(transparent)]
    Kv(#[from] sled::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
