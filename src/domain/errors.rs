//! Domain Errors
//!
//! Error taxonomy shared by the hub and edge agents.

use std::path::PathBuf;

/// Invalid relative path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),
    #[error("path escapes the replica root: {0}")]
    Traversal(String),
    #[error("path is outside the replica root: {0:?}")]
    OutsideRoot(PathBuf),
}

/// Replication failures.
///
/// Only `Setup` and `Watch` (at startup) are fatal; everything else is
/// logged or reported back to the peer that caused it.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Replica root is missing, not a directory, or not writable.
    #[error("replica root {path:?} is not usable: {reason}")]
    Setup { path: PathBuf, reason: String },

    /// The change source could not attach to a path.
    #[error("failed to watch {path:?}: {reason}")]
    Watch { path: PathBuf, reason: String },

    /// A filesystem operation failed while applying a change.
    #[error("{operation} {path} failed: {source}")]
    Apply {
        operation: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection lost or a send failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message would not fit in one frame. The session stays up.
    #[error("message of {size} bytes exceeds the frame limit of {limit}")]
    FrameTooLarge { size: u64, limit: usize },

    /// Unknown operation kind or malformed message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Path(#[from] PathError),
}

impl SyncError {
    pub fn apply(operation: impl Into<String>, path: impl ToString, source: std::io::Error) -> Self {
        Self::Apply {
            operation: operation.into(),
            path: path.to_string(),
            source,
        }
    }

    /// Whether the process should stop on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Setup { .. } | Self::Watch { .. })
    }
}
