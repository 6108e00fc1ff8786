//! Error types for dirsync

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for dirsync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// A read or write on the framed channel transferred zero bytes, or the
    /// socket was closed mid-frame
    #[error("Channel broken: {0}")]
    ChannelBroken(String),

    /// The hub rejected the shared secret during bootstrap
    #[error("Authentication rejected by hub")]
    AuthenticationRejected,

    /// A rename/delete/write failed while applying a received change
    #[error("Failed to apply {action} on {path}: {source}")]
    Apply {
        /// Wire action being applied (MOVED, DELETED, FILE_MODIFIED)
        action: &'static str,
        /// Local path the mutation targeted
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A just-modified file could not be read after all retry attempts
    #[error("File {path} unreadable after {attempts} attempts")]
    RetryExhausted {
        /// Path that could not be read
        path: PathBuf,
        /// Number of attempts made
        attempts: u32,
    },

    /// Unknown action string or malformed header frame
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A relative path was empty, escaped the sync root, or contained the
    /// field separator
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Building or extracting the bootstrap snapshot failed
    #[error("Archive error: {0}")]
    Archive(String),

    /// Configuration could not be loaded or is incomplete
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem watcher could not be started
    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// The client receive loop hit too many consecutive errors
    #[error("Too many consecutive errors ({errors}), giving up")]
    ErrorBudgetExhausted {
        /// Consecutive error count when the loop stopped
        errors: u32,
    },

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether a hub-side session must be torn down after this error.
    ///
    /// Apply failures are logged and swallowed; everything else on the
    /// receive path leaves the channel in an unknown state.
    pub fn is_fatal_to_session(&self) -> bool {
        !matches!(self, SyncError::Apply { .. })
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
