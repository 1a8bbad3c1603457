mod local_replica;
mod manual_change_source;
mod mode_tracker;
mod notify_change_source;
pub mod snapshot;

pub use local_replica::LocalReplica;
pub use manual_change_source::ManualChangeSource;
pub use mode_tracker::{ModeTracker, DEFAULT_MODE_POLL_INTERVAL};
pub use notify_change_source::{translate, NotifyChangeSource};
pub use snapshot::{snapshot, snapshot_subtree};
