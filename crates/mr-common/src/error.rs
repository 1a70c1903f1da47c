//! Error types shared across the metrics relay crates.
//!
//! Every variant carries a stable numeric code and a category so the agent
//! binary can map failures onto exit codes and structured log fields:
//! - 10-19: configuration errors
//! - 20-29: metric codec errors
//! - 60-69: I/O and serialization errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for metrics relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration file errors.
    Config,
    /// Metric serialization errors.
    Codec,
    /// File I/O errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Codec => write!(f, "codec"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for the shared layer.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("failed to parse config {path}: {reason}")]
    ConfigParse { path: String, reason: String },

    // Codec errors (20-29)
    #[error("metric encode failed: {0}")]
    Encode(String),

    #[error("metric decode failed: {0}")]
    Decode(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::Validation(_) => 11,
            Error::ConfigParse { .. } => 12,
            Error::Encode(_) => 20,
            Error::Decode(_) => 21,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::Validation(_) | Error::ConfigParse { .. } => {
                ErrorCategory::Config
            }
            Error::Encode(_) | Error::Decode(_) => ErrorCategory::Codec,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether retrying the operation can succeed without operator input.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) | Error::Validation(_) | Error::ConfigParse { .. } => false,
            // A record that failed to decode will fail again.
            Error::Encode(_) | Error::Decode(_) => false,
            Error::Io(_) => true,
            Error::Json(_) => false,
        }
    }
}
