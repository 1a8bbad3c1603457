//! Hub/Edge Replication Module
//!
//! One hub owns the canonical directory tree; any number of edges keep
//! local replicas of it and push their own edits back.
//!
//! ## Architecture
//!
//! - **Transport (TCP)**: length-prefixed, checksummed bincode frames
//! - **Hub**: snapshot on connect, content queries, applies edge operations, broadcasts changes
//! - **Edge**: reconcile on (re)connect, applies broadcasts, forwards local edits
//! - **Ledger**: short-lived operation keys that keep applied changes from echoing back
//!
//! ## How It Works
//!
//! 1. An edge connects and receives the hub's full snapshot
//! 2. The edge deletes what the hub lacks, creates directories, and queries file content
//! 3. Once every query is answered the edge starts watching its root
//! 4. Local edits flow edge→hub as operations, hub changes flow hub→edges as notices
//! 5. The hub skips the originating edge when broadcasting the result of its operation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use edge_sync::adapters::outbound::NotifyChangeSource;
//! use edge_sync::replication::{HubAgent, ReplicationConfig};
//! use std::sync::Arc;
//!
//! let config = ReplicationConfig::new("hub", "/srv/share");
//! let hub = Arc::new(HubAgent::new(config, Arc::new(NotifyChangeSource::new()))?);
//! hub.run().await?;
//! ```

mod apply;
mod config;
mod edge;
mod hub;
pub mod protocol;
pub mod transport;

pub use apply::Applier;
pub use config::{ConfigError, ReplicationConfig, DEFAULT_MAX_FRAME_BYTES, DEFAULT_PORT};
pub use edge::{backoff_delay, EdgeAgent, EdgeState};
pub use hub::HubAgent;
pub use protocol::{ChangeEventName, ChangeNotice, Message, Operation, OperationError, OperationRequest};
pub use transport::{SessionHandle, TransportEvent};
