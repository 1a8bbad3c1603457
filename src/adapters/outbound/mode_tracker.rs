//! Permission Drift Tracker
//!
//! Directory watchers report pure permission changes unreliably, so the edge
//! keeps the last known mode of every path in a DashMap and re-stats them on
//! an interval. Any difference becomes a synthetic chmod event.

use crate::adapters::outbound::LocalReplica;
use crate::domain::entities::ChangeEvent;
use crate::domain::value_objects::RelPath;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default poll interval.
pub const DEFAULT_MODE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// DashMap-backed cache of permission bits.
///
/// Cloning is cheap and clones share the cache.
#[derive(Clone)]
pub struct ModeTracker {
    modes: Arc<DashMap<RelPath, u32>>,
    replica: LocalReplica,
}

impl ModeTracker {
    pub fn new(replica: LocalReplica) -> Self {
        Self {
            modes: Arc::new(DashMap::new()),
            replica,
        }
    }

    /// Populate the cache from the current on-disk modes.
    ///
    /// Returns the number of paths cached.
    pub async fn warm(&self, paths: impl IntoIterator<Item = RelPath>) -> usize {
        let mut count = 0;
        for path in paths {
            if let Ok(mode) = self.replica.mode_of(&path).await {
                self.modes.insert(path, mode);
                count += 1;
            }
        }
        count
    }

    /// Re-read and cache the mode of one path.
    pub async fn refresh(&self, path: &RelPath) {
        match self.replica.mode_of(path).await {
            Ok(mode) => {
                self.modes.insert(path.clone(), mode);
            }
            Err(_) => self.forget(path),
        }
    }

    pub fn record(&self, path: RelPath, mode: u32) {
        self.modes.insert(path, mode);
    }

    /// Drop a path and everything below it.
    pub fn forget(&self, path: &RelPath) {
        self.modes.remove(path);
        self.modes.retain(|k, _| !k.is_descendant_of(path));
    }

    pub fn get(&self, path: &RelPath) -> Option<u32> {
        self.modes.get(path).map(|e| *e.value())
    }

    pub fn clear(&self) {
        self.modes.clear();
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Re-stat every known path and report drifted modes.
    pub async fn poll(&self) -> Vec<ChangeEvent> {
        let known: Vec<RelPath> = self.modes.iter().map(|e| e.key().clone()).collect();
        let mut drifted = Vec::new();

        for path in known {
            match self.replica.mode_of(&path).await {
                Ok(mode) => {
                    let previous = self.modes.insert(path.clone(), mode);
                    if matches!(previous, Some(old) if old != mode) {
                        tracing::debug!("mode drift on {}: {:o}", path, mode);
                        drifted.push(ChangeEvent::mode_changed(path, mode));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.modes.remove(&path);
                }
                Err(e) => {
                    tracing::debug!("mode poll failed for {}: {}", path, e);
                }
            }
        }

        drifted
    }

    /// Start the background poll task.
    ///
    /// The task ends when `events` is closed or the handle is aborted.
    pub fn start_polling(&self, interval: Duration, events: mpsc::Sender<ChangeEvent>) -> JoinHandle<()> {
        let tracker = self.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            timer.tick().await;

            loop {
                timer.tick().await;

                for event in tracker.poll().await {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::entities::ChangeKind;
    use tempfile::TempDir;

    fn p(s: &str) -> RelPath {
        RelPath::parse(s).unwrap()
    }

    async fn setup() -> (TempDir, LocalReplica, ModeTracker) {
        let dir = TempDir::new().unwrap();
        let replica = LocalReplica::open(dir.path()).unwrap();
        replica.write_file(&p("a.txt"), b"a").await.unwrap();
        replica.write_file(&p("d/b.txt"), b"b").await.unwrap();
        replica.set_mode(&p("a.txt"), 0o644).await.unwrap();
        let tracker = ModeTracker::new(replica.clone());
        (dir, replica, tracker)
    }

    #[tokio::test]
    async fn test_warm_populates_cache() {
        let (_dir, _replica, tracker) = setup().await;
        let count = tracker.warm(vec![p("a.txt"), p("d"), p("d/b.txt"), p("missing")]).await;

        assert_eq!(count, 3);
        assert_eq!(tracker.get(&p("a.txt")), Some(0o644));
    }

    #[tokio::test]
    async fn test_poll_detects_drift_once() {
        let (_dir, replica, tracker) = setup().await;
        tracker.warm(vec![p("a.txt")]).await;

        assert!(tracker.poll().await.is_empty());

        replica.set_mode(&p("a.txt"), 0o600).await.unwrap();
        let events = tracker.poll().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::ModeChanged);
        assert_eq!(events[0].path, p("a.txt"));
        assert_eq!(events[0].mode, Some(0o600));

        // Cache updated, no repeat
        assert!(tracker.poll().await.is_empty());
    }

    #[tokio::test]
    async fn test_recorded_mode_is_not_reported() {
        let (_dir, replica, tracker) = setup().await;
        tracker.warm(vec![p("a.txt")]).await;

        replica.set_mode(&p("a.txt"), 0o700).await.unwrap();
        tracker.record(p("a.txt"), 0o700);

        assert!(tracker.poll().await.is_empty());
    }

    #[tokio::test]
    async fn test_vanished_paths_are_evicted() {
        let (_dir, replica, tracker) = setup().await;
        tracker.warm(vec![p("a.txt")]).await;

        replica.remove(&p("a.txt")).await.unwrap();
        assert!(tracker.poll().await.is_empty());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_forget_removes_descendants() {
        let (_dir, _replica, tracker) = setup().await;
        tracker.warm(vec![p("a.txt"), p("d"), p("d/b.txt")]).await;

        tracker.forget(&p("d"));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(&p("d/b.txt")).is_none());
    }

    #[tokio::test]
    async fn test_polling_task_emits_events() {
        let (_dir, replica, tracker) = setup().await;
        tracker.warm(vec![p("a.txt")]).await;

        let (tx, mut rx) = mpsc::channel(8);
        let handle = tracker.start_polling(Duration::from_millis(20), tx);

        replica.set_mode(&p("a.txt"), 0o640).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.mode, Some(0o640));

        handle.abort();
    }
}
