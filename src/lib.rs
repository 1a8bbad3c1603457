//! edge-sync Library
//!
//! Hub/edge directory replication. This module exposes the components for
//! use in integration tests and as a library.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod replication;

// Re-export commonly used types
pub use adapters::outbound::{LocalReplica, ManualChangeSource, NotifyChangeSource};
pub use config::{load_config, Role};
pub use domain::entities::{ChangeEvent, ChangeKind, EntryKind, FsEntry, OpFamily, OperationKey};
pub use domain::errors::{PathError, SyncError};
pub use domain::ports::ChangeSource;
pub use domain::services::OperationLedger;
pub use domain::value_objects::{RelPath, SessionId};
pub use infrastructure::ShutdownController;
pub use replication::{EdgeAgent, EdgeState, HubAgent, ReplicationConfig};
