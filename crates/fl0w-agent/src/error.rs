//! Error types for the fl0w agents.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;
use std::path::PathBuf;

use fl0w_protocol::ProtocolError;
use fl0w_sync::SyncError;
use thiserror::Error;

// ============================================================================
// Agent Error Type
// ============================================================================

/// Errors raised while an agent talks to the relay or the host.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The current relay session ended while a message was queued.
    #[error("Relay link closed")]
    LinkClosed,

    /// Shutdown was requested while waiting.
    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    /// A host command (hostname, reboot, shutdown) failed.
    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },
}

/// Convenience Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

// ============================================================================
// Process Error Type
// ============================================================================

/// Why a `run` request was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// Another program is still running or being killed.
    #[error("already running")]
    AlreadyRunning { program: String },

    /// The name is empty or would escape the programs folder.
    #[error("invalid program name: {0:?}")]
    InvalidProgram(String),

    #[error("failed to start {path}: {reason}")]
    Spawn { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_running_message_is_wire_text() {
        let err = ProcessError::AlreadyRunning {
            program: "drive".to_string(),
        };
        assert_eq!(err.to_string(), "already running");
    }

    #[test]
    fn test_io_error_from_conversion() {
        let io_error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let err: AgentError = io_error.into();
        assert!(matches!(err, AgentError::Io(_)));
    }

    #[test]
    fn test_process_error_wraps_transparently() {
        let err: AgentError = ProcessError::InvalidProgram("../x".to_string()).into();
        assert!(err.to_string().contains("../x"));
    }
}
