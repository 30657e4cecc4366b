//! Error taxonomy shared by the hub and the client

use std::path::PathBuf;

/// Errors produced by the sync engine
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Filesystem open/read/write/rename failure
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Connection read/write/dial failure
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// Connection closed while a request was outstanding
    #[error("connection closed")]
    Disconnected,

    /// One snapshot entry failed validation
    #[error("malformed payload for {path}: {reason}")]
    MalformedPayload { path: String, reason: String },

    /// Frame could not be decoded or the operation cannot be served
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Path escapes the store root or is otherwise unusable
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// No response arrived for a request in time
    #[error("request {id} ({op}) timed out")]
    Timeout { id: String, op: String },

    /// The peer answered with an error envelope
    #[error("remote error on {op}: {message}")]
    Remote { op: String, message: String },
}

impl SyncError {
    /// Wrap an io error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the connection is gone
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Disconnected)
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
