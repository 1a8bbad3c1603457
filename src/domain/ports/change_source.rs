//! Change Source Port
//!
//! Defines the interface to the platform facility that reports filesystem
//! mutations under a replica root.

use crate::domain::entities::ChangeEvent;
use crate::domain::errors::SyncError;
use std::any::Any;
use std::path::Path;
use tokio::sync::mpsc;

/// Source of filesystem change notifications.
///
/// This is an outbound port. Implementations wrap inotify / FSEvents /
/// ReadDirectoryChangesW (via `notify`) or, for embedding and tests, a
/// channel the caller pushes into.
pub trait ChangeSource: Send + Sync {
    /// Start watching `root` recursively.
    ///
    /// Events for hidden entries and for the root itself are never sent.
    /// Returns `SyncError::Watch` if the watch cannot be established;
    /// errors after that point are logged and watching continues.
    /// Watching stops when the returned handle is dropped.
    fn watch(&self, root: &Path, events: mpsc::Sender<ChangeEvent>) -> Result<WatchHandle, SyncError>;
}

/// Keeps a watch alive. Dropping it stops delivery.
pub struct WatchHandle {
    _guard: Box<dyn Any + Send>,
}

impl WatchHandle {
    pub fn new(guard: impl Any + Send) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").finish_non_exhaustive()
    }
}
