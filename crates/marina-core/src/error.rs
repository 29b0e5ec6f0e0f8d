//! Error types for the marina sync library.

use thiserror::Error;

/// Result type alias using marina's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of local filesystem failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalIoErrorKind {
    /// File or directory does not exist.
    NotFound,
    /// Insufficient filesystem permissions.
    PermissionDenied,
    /// Device is out of space or over quota.
    OutOfSpace,
    /// Any other I/O failure.
    Other,
}

/// Classification of remote storage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Network-level failure (connection, timeout, interrupted transfer).
    Transport,
    /// Remote object does not exist.
    NotFound,
    /// Authentication or authorization failure.
    Auth,
    /// Any other remote failure.
    Other,
}

/// Core error type for marina attachment operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database adapter operation failed (SQL, transaction, or driver error).
    #[error("Database error: {0}")]
    Database(String),

    /// Local filesystem operation failed.
    #[error("Local I/O error ({kind:?}): {message}")]
    LocalIo {
        kind: LocalIoErrorKind,
        message: String,
    },

    /// Remote storage operation failed.
    #[error("Remote storage error ({kind:?}): {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    /// Operation on an unknown attachment id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not valid for the attachment's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Queue configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cooperative cancellation; exits cleanly and is never retried.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Shorthand for a remote transport failure.
    pub fn remote_transport(message: impl Into<String>) -> Self {
        Error::Remote {
            kind: RemoteErrorKind::Transport,
            message: message.into(),
        }
    }

    /// Shorthand for a local I/O failure of the given kind.
    pub fn local_io(kind: LocalIoErrorKind, message: impl Into<String>) -> Self {
        Error::LocalIo {
            kind,
            message: message.into(),
        }
    }

    /// Whether this error is cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match e.kind() {
            ErrorKind::NotFound => LocalIoErrorKind::NotFound,
            ErrorKind::PermissionDenied => LocalIoErrorKind::PermissionDenied,
            // StorageFull/QuotaExceeded are unstable on some toolchains; fall
            // back to the raw OS codes for ENOSPC and EDQUOT.
            _ => match e.raw_os_error() {
                Some(28) | Some(122) => LocalIoErrorKind::OutOfSpace,
                _ => LocalIoErrorKind::Other,
            },
        };
        Error::LocalIo {
            kind,
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
