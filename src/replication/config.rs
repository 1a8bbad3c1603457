//! Replication Configuration
//!
//! Configuration shared by the hub and edge agents.

use crate::adapters::outbound::DEFAULT_MODE_POLL_INTERVAL;
use crate::domain::services::DEFAULT_SUPPRESSION_WINDOW;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default port the hub listens on.
pub const DEFAULT_PORT: u16 = 4100;

/// Default upper bound for one transport frame (64 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Configuration for a replication agent.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Name used in logs (e.g., "hub", "edge-laptop")
    pub node_id: String,

    /// Replica root directory
    pub root: PathBuf,

    /// Address the hub binds (default: 0.0.0.0:4100)
    pub listen_addr: SocketAddr,

    /// Address an edge connects to (e.g., "hub.example.com:4100")
    pub hub_addr: String,

    /// How long an applied remote change suppresses its own echo (default: 500ms)
    pub suppression_window: Duration,

    /// Permission drift poll interval (default: 2s)
    pub mode_poll_interval: Duration,

    /// First reconnect delay; doubles per failed attempt (default: 500ms)
    pub reconnect_delay: Duration,

    /// Reconnect delay cap (default: 30s)
    pub max_reconnect_delay: Duration,

    /// Consecutive failed connects before giving up; `None` retries forever (default: 20)
    pub max_reconnect_attempts: Option<u32>,

    /// Largest accepted frame in bytes (default: 64 MiB)
    pub max_frame_bytes: usize,

    /// Capacity of the internal event channels (default: 1024)
    pub channel_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            root: PathBuf::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            hub_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            suppression_window: DEFAULT_SUPPRESSION_WINDOW,
            mode_poll_interval: DEFAULT_MODE_POLL_INTERVAL,
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: Some(20),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            channel_capacity: 1024,
        }
    }
}

impl ReplicationConfig {
    /// Create a new configuration with node ID and replica root.
    pub fn new(node_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            root: root.into(),
            ..Default::default()
        }
    }

    /// Set the hub listen address.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the hub address an edge connects to.
    pub fn hub_addr(mut self, addr: impl Into<String>) -> Self {
        self.hub_addr = addr.into();
        self
    }

    /// Set the echo suppression window.
    pub fn suppression_window(mut self, window: Duration) -> Self {
        self.suppression_window = window;
        self
    }

    /// Set the permission drift poll interval.
    pub fn mode_poll_interval(mut self, interval: Duration) -> Self {
        self.mode_poll_interval = interval;
        self
    }

    /// Set the initial reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the reconnect budget.
    pub fn max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the frame size limit.
    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::MissingNodeId);
        }
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::MissingRoot);
        }
        if self.suppression_window.is_zero() {
            return Err(ConfigError::ZeroDuration("suppression_window"));
        }
        if self.mode_poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("mode_poll_interval"));
        }
        if self.max_frame_bytes < 1024 {
            return Err(ConfigError::FrameLimitTooSmall(self.max_frame_bytes));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("node_id is required")]
    MissingNodeId,
    #[error("replica root is required")]
    MissingRoot,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("max_frame_bytes {0} is below the 1024 byte minimum")]
    FrameLimitTooSmall(usize),
    #[error("channel_capacity must be greater than zero")]
    ZeroChannelCapacity,
}
