//! Custom error types for rustpapercollect.
//!
//! Internal helpers return `Result<T, StateError>` and propagate with `?`.
//! Public entry points of the checkpoint and recovery components convert these
//! errors once, at their boundary, into a safe default value plus a log event.

use thiserror::Error;

/// Main error type for session state and recovery operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// No session with this id exists in memory or on disk
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A session with this id already exists
    #[error("Session already exists: {0}")]
    SessionExists(String),

    /// Checkpoint missing or unreadable
    #[error("Checkpoint not found: {session_id}/{checkpoint_id}")]
    CheckpointNotFound {
        /// Owning session
        session_id: String,
        /// Requested checkpoint
        checkpoint_id: String,
    },

    /// Checksum mismatch or other corruption
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Atomic write could not be completed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Recovery could not proceed
    #[error("Recovery error: {0}")]
    Recovery(String),
}

/// Result type alias using `StateError`
pub type Result<T> = std::result::Result<T, StateError>;

/// Extension trait for adding context to Option types
pub trait OptionExt<T> {
    /// Convert Option to Result with a session-not-found error
    fn ok_or_session(self, session_id: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_session(self, session_id: &str) -> Result<T> {
        self.ok_or_else(|| StateError::SessionNotFound(session_id.to_string()))
    }
}
