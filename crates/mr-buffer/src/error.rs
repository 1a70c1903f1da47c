//! Error types for buffer and write-ahead log operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for buffer operations.
pub type Result<T> = std::result::Result<T, BufferError>;

/// Errors from the write-ahead log.
#[derive(Error, Debug)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt log {path} at byte {offset}: {reason}")]
    Corrupt {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("index {index} not found (first={first}, last={last})")]
    NotFound { index: u64, first: u64, last: u64 },

    #[error("out of order write: expected index {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("truncate index {index} outside [{first}, {last}]")]
    OutOfRange { index: u64, first: u64, last: u64 },

    #[error("record of {0} bytes exceeds the frame size limit")]
    TooLarge(usize),
}

/// Errors from buffer construction and operations.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("invalid buffer capacity {0}: must be greater than zero")]
    InvalidCapacity(usize),

    #[error("disk buffer for {0} requires a buffer directory")]
    MissingDirectory(String),

    #[error("buffer storage error: {0}")]
    Storage(WalError),

    #[error("buffer log is corrupt: {0}")]
    Corrupt(WalError),

    #[error("stats registration failed: {0}")]
    Stats(#[from] prometheus::Error),
}

impl BufferError {
    /// True when the on-disk log can no longer be trusted.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, BufferError::Corrupt(_))
    }
}

impl From<WalError> for BufferError {
    fn from(err: WalError) -> Self {
        match err {
            WalError::Corrupt { .. } => BufferError::Corrupt(err),
            other => BufferError::Storage(other),
        }
    }
}

impl From<std::io::Error> for BufferError {
    fn from(err: std::io::Error) -> Self {
        BufferError::Storage(WalError::Io(err))
    }
}
