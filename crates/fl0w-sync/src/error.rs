//! Sync error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that end a sync operation as a whole.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to walk {path}: {reason}")]
    Walk { path: PathBuf, reason: String },

    #[error("Failed to watch {path}: {reason}")]
    Watcher { path: PathBuf, reason: String },
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A recoverable failure affecting one file.
///
/// Reported back to the peer (as an `err` message) instead of ending the
/// session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: {reason}")]
pub struct FileError {
    /// Relative path as sent on the wire
    pub path: String,
    /// Human-readable cause
    pub reason: String,
}

impl FileError {
    pub fn new(path: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
