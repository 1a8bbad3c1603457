//! Manual Change Source
//!
//! A ChangeSource whose events are pushed by the caller instead of by the
//! operating system. Used when an embedding application already knows what
//! it changed, and by tests that need exact control over event timing.

use crate::domain::entities::ChangeEvent;
use crate::domain::errors::SyncError;
use crate::domain::ports::{ChangeSource, WatchHandle};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

type Slot = Arc<Mutex<Option<mpsc::Sender<ChangeEvent>>>>;

/// Caller-driven change source.
///
/// Cloning is cheap; clones feed the same watch.
#[derive(Clone, Default)]
pub struct ManualChangeSource {
    sender: Slot,
}

impl ManualChangeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a watch is currently active.
    pub fn is_watching(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Deliver an event to the active watch.
    ///
    /// Returns `false` if nothing is watching or the event is for a hidden
    /// path.
    pub async fn emit(&self, event: ChangeEvent) -> bool {
        if event.path.is_hidden() {
            return false;
        }
        let sender = self.sender.lock().clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

struct ManualWatch {
    slot: Slot,
}

impl Drop for ManualWatch {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

impl ChangeSource for ManualChangeSource {
    fn watch(&self, root: &Path, events: mpsc::Sender<ChangeEvent>) -> Result<WatchHandle, SyncError> {
        if !root.is_dir() {
            return Err(SyncError::Watch {
                path: root.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }
        *self.sender.lock() = Some(events);
        Ok(WatchHandle::new(ManualWatch {
            slot: self.sender.clone(),
        }))
    }
}
