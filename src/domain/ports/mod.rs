mod change_source;

pub use change_source::{ChangeSource, WatchHandle};
