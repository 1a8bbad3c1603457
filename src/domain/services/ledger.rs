//! Operation Ledger
//!
//! Short-lived markers that suppress self-echo.
//!
//! A replica registers an [`OperationKey`] right before it applies a change
//! that came from a peer. The change source then reports that very write
//! back as if it were a local edit; while the key is registered the agent
//! treats the report as an echo. Registrations release themselves after a
//! fixed window, so a genuine second edit to the same path inside the
//! window is suppressed too. That false-negative is the accepted price for
//! loop freedom without causal metadata.

use crate::domain::entities::{OpFamily, OperationKey};
use crate::domain::value_objects::SessionId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default suppression window.
pub const DEFAULT_SUPPRESSION_WINDOW: Duration = Duration::from_millis(500);

/// An active registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    generation: u64,
    /// Session whose operation caused the registration (hub side only)
    pub origin: Option<SessionId>,
}

/// Time-windowed echo-suppression table.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct OperationLedger {
    entries: Arc<DashMap<OperationKey, Registration>>,
    generation: Arc<AtomicU64>,
    window: Duration,
}

impl OperationLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Register a key and schedule its release after the window.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, key: OperationKey) {
        self.register_from(key, None);
    }

    /// Register a key on behalf of a session.
    pub fn register_from(&self, key: OperationKey, origin: Option<SessionId>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!("ledger register {} gen={}", key, generation);
        self.entries.insert(key.clone(), Registration { generation, origin });

        let entries = self.entries.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // A newer registration of the same key owns the entry now.
            entries.remove_if(&key, |_, r| r.generation == generation);
        });
    }

    /// Look up the registration covering `key`.
    ///
    /// A `delete` registration also covers every descendant path, since a
    /// recursive delete makes the change source report each child.
    pub fn lookup(&self, key: &OperationKey) -> Option<Registration> {
        if let Some(r) = self.entries.get(key) {
            return Some(*r);
        }

        if key.family == OpFamily::Delete {
            for ancestor in key.path.ancestors() {
                let probe = OperationKey::new(OpFamily::Delete, ancestor);
                if let Some(r) = self.entries.get(&probe) {
                    return Some(*r);
                }
            }
        }

        None
    }

    pub fn is_active(&self, key: &OperationKey) -> bool {
        self.lookup(key).is_some()
    }

    /// Drop a registration before its window elapses.
    pub fn release(&self, key: &OperationKey) {
        self.entries.remove(key);
    }

    /// Number of active registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for OperationLedger {
    fn default() -> Self {
        Self::new(DEFAULT_SUPPRESSION_WINDOW)
    }
}
