//! Error types for strata.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for strata.
///
/// Every variant is terminal for the operation in which it occurs: there is
/// no retry or recovery at this layer. Callers surface the failure with the
/// original message preserved.
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("not found: {path}: {reason}")]
    NotFound { path: PathBuf, reason: String },

    #[error("invalid source identifier {identifier:?}: {reason}")]
    InvalidSource { identifier: String, reason: String },

    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    #[error("cycle detected at {reference}")]
    CycleDetected { reference: String },

    #[error("engine call {operation} failed: {reason}")]
    Transport { operation: String, reason: String },

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StrataError {
    /// Classify an I/O failure for `path`: missing files map to `NotFound`,
    /// everything else stays an I/O error.
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound { path, reason: source.to_string() }
        } else {
            Self::Io { path, source }
        }
    }
}
