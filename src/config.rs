use crate::replication::{ReplicationConfig, DEFAULT_MAX_FRAME_BYTES, DEFAULT_PORT};
use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Which side of the protocol this process runs.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Hub,
    Edge,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Hub => "hub",
            Role::Edge => "edge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hub" => Some(Role::Hub),
            "edge" => Some(Role::Edge),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub role: Option<Role>,
    pub root: Option<String>,
    pub node_id: Option<String>,
    pub debug: bool,

    // Hub settings
    pub listen_addr: String,

    // Edge settings
    pub hub_addr: String,
    pub mode_poll_ms: u64,
    pub reconnect_delay_ms: u64,
    /// 0 retries forever
    pub reconnect_attempts: u32,

    // Shared settings
    pub suppression_window_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: None,
            root: None,
            node_id: None,
            debug: false,
            listen_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            hub_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            mode_poll_ms: 2000,
            reconnect_delay_ms: 500,
            reconnect_attempts: 20,
            suppression_window_ms: 500,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let role = match std::env::var("EDGESYNC_ROLE") {
        Ok(v) => Some(Role::parse(&v).with_context(|| format!("EDGESYNC_ROLE must be hub or edge, got {:?}", v))?),
        Err(_) => None,
    };

    let root = std::env::var("EDGESYNC_ROOT").ok();
    let node_id = std::env::var("EDGESYNC_NODE_ID").ok();
    let debug = std::env::var("DEBUG").is_ok();

    let listen_addr = std::env::var("EDGESYNC_LISTEN_ADDR")
        .unwrap_or(defaults.listen_addr);

    let hub_addr = std::env::var("EDGESYNC_HUB_ADDR")
        .map(|v| with_default_port(&v))
        .unwrap_or(defaults.hub_addr);

    let mode_poll_ms = env_number("EDGESYNC_MODE_POLL_MS", defaults.mode_poll_ms)?;
    let reconnect_delay_ms = env_number("EDGESYNC_RECONNECT_DELAY_MS", defaults.reconnect_delay_ms)?;
    let reconnect_attempts = env_number("EDGESYNC_RECONNECT_ATTEMPTS", defaults.reconnect_attempts)?;
    let suppression_window_ms = env_number("EDGESYNC_SUPPRESSION_WINDOW_MS", defaults.suppression_window_ms)?;
    let max_frame_bytes = env_number("EDGESYNC_MAX_FRAME_BYTES", defaults.max_frame_bytes)?;

    Ok(Config {
        role,
        root,
        node_id,
        debug,
        listen_addr,
        hub_addr,
        mode_poll_ms,
        reconnect_delay_ms,
        reconnect_attempts,
        suppression_window_ms,
        max_frame_bytes,
    })
}

/// Read a numeric variable; unset means `default`, unparsable is an error.
fn env_number<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{} must be a non-negative integer, got {:?}", name, v)),
        Err(_) => Ok(default),
    }
}

/// Append the default port to a hub address that has none.
pub fn with_default_port(addr: &str) -> String {
    let has_port = addr
        .rsplit_once(':')
        .map(|(_, port)| port.parse::<u16>().is_ok())
        .unwrap_or(false);
    if has_port {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    }
}

impl Config {
    /// Apply positional arguments: `hub <port> <root>` or `edge <hub-addr> <root>`.
    ///
    /// Missing trailing arguments leave the environment values in place.
    pub fn with_args<I>(mut self, args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();

        let Some(role) = args.next() else {
            return Ok(self);
        };
        let role = Role::parse(&role).with_context(|| format!("unknown role {:?}, expected hub or edge", role))?;
        self.role = Some(role);

        if let Some(target) = args.next() {
            match role {
                Role::Hub => {
                    let port: u16 = target
                        .parse()
                        .with_context(|| format!("invalid port {:?}", target))?;
                    self.listen_addr = format!("0.0.0.0:{}", port);
                }
                Role::Edge => self.hub_addr = with_default_port(&target),
            }
        }

        if let Some(root) = args.next() {
            self.root = Some(root);
        }

        if let Some(extra) = args.next() {
            anyhow::bail!("unexpected argument {:?}", extra);
        }

        Ok(self)
    }

    /// Build the agent configuration.
    pub fn replication(&self) -> anyhow::Result<(Role, ReplicationConfig)> {
        let role = self
            .role
            .context("role is required (EDGESYNC_ROLE or first argument)")?;
        let root = self
            .root
            .as_deref()
            .context("replica root is required (EDGESYNC_ROOT or last argument)")?;
        let listen_addr: SocketAddr = self
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {:?}", self.listen_addr))?;

        let node_id = self.node_id.clone().unwrap_or_else(|| role.as_str().to_string());
        let attempts = (self.reconnect_attempts > 0).then_some(self.reconnect_attempts);

        let config = ReplicationConfig::new(node_id, root)
            .listen_addr(listen_addr)
            .hub_addr(self.hub_addr.clone())
            .suppression_window(Duration::from_millis(self.suppression_window_ms))
            .mode_poll_interval(Duration::from_millis(self.mode_poll_ms))
            .reconnect_delay(Duration::from_millis(self.reconnect_delay_ms))
            .max_reconnect_attempts(attempts)
            .max_frame_bytes(self.max_frame_bytes);
        config.validate()?;

        Ok((role, config))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:4100");
        assert_eq!(cfg.suppression_window_ms, 500);
        assert_eq!(cfg.mode_poll_ms, 2000);
        assert_eq!(cfg.reconnect_attempts, 20);
        assert!(cfg.role.is_none());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("hub"), Some(Role::Hub));
        assert_eq!(Role::parse("EDGE"), Some(Role::Edge));
        assert_eq!(Role::parse("relay"), None);
    }

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("hub.local"), "hub.local:4100");
        assert_eq!(with_default_port("hub.local:9000"), "hub.local:9000");
        assert_eq!(with_default_port("10.0.0.1"), "10.0.0.1:4100");
        assert_eq!(with_default_port("[::1]:4200"), "[::1]:4200");
    }

    #[test]
    fn test_hub_args() {
        let cfg = Config::default().with_args(args(&["hub", "4200", "/srv/share"])).unwrap();
        assert_eq!(cfg.role, Some(Role::Hub));
        assert_eq!(cfg.listen_addr, "0.0.0.0:4200");
        assert_eq!(cfg.root.as_deref(), Some("/srv/share"));
    }

    #[test]
    fn test_edge_args() {
        let cfg = Config::default().with_args(args(&["edge", "hub.local", "/home/me/share"])).unwrap();
        assert_eq!(cfg.role, Some(Role::Edge));
        assert_eq!(cfg.hub_addr, "hub.local:4100");
    }

    #[test]
    fn test_bad_args() {
        assert!(Config::default().with_args(args(&["relay"])).is_err());
        assert!(Config::default().with_args(args(&["hub", "not-a-port"])).is_err());
        assert!(Config::default().with_args(args(&["hub", "1", "/a", "/b"])).is_err());
    }

    #[test]
    fn test_no_args_keeps_env_values() {
        let mut cfg = Config::default();
        cfg.root = Some("/from/env".to_string());
        let cfg = cfg.with_args(Vec::new()).unwrap();
        assert_eq!(cfg.root.as_deref(), Some("/from/env"));
    }

    #[test]
    fn test_replication_config() {
        let mut cfg = Config::default().with_args(args(&["edge", "hub:4100", "/tmp/replica"])).unwrap();
        cfg.reconnect_attempts = 0;
        cfg.suppression_window_ms = 250;

        let (role, rc) = cfg.replication().unwrap();
        assert_eq!(role, Role::Edge);
        assert_eq!(rc.node_id, "edge");
        assert_eq!(rc.hub_addr, "hub:4100");
        assert_eq!(rc.max_reconnect_attempts, None);
        assert_eq!(rc.suppression_window, Duration::from_millis(250));
    }

    #[test]
    fn test_replication_requires_role_and_root() {
        assert!(Config::default().replication().is_err());

        let mut cfg = Config::default();
        cfg.role = Some(Role::Hub);
        assert!(cfg.replication().is_err());
    }

    // Tests below share the process environment.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    #[test]
    fn test_load_config_with_node_id() {
        let _env = ENV_LOCK.lock();
        std::env::set_var("EDGESYNC_NODE_ID", "laptop");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.node_id, Some("laptop".to_string()));
        std::env::remove_var("EDGESYNC_NODE_ID");
    }

    #[test]
    fn test_load_config_with_hub_addr() {
        let _env = ENV_LOCK.lock();
        std::env::set_var("EDGESYNC_HUB_ADDR", "hub.example.com");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.hub_addr, "hub.example.com:4100");
        std::env::remove_var("EDGESYNC_HUB_ADDR");
    }

    #[test]
    fn test_load_config_numbers() {
        let _env = ENV_LOCK.lock();
        std::env::set_var("EDGESYNC_MODE_POLL_MS", "750");
        std::env::set_var("EDGESYNC_RECONNECT_ATTEMPTS", "0");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.mode_poll_ms, 750);
        assert_eq!(cfg.reconnect_attempts, 0);
        assert_eq!(cfg.suppression_window_ms, 500);
        std::env::remove_var("EDGESYNC_MODE_POLL_MS");
        std::env::remove_var("EDGESYNC_RECONNECT_ATTEMPTS");
    }

    #[test]
    fn test_load_config_rejects_bad_numbers() {
        let _env = ENV_LOCK.lock();
        for name in [
            "EDGESYNC_MODE_POLL_MS",
            "EDGESYNC_RECONNECT_DELAY_MS",
            "EDGESYNC_RECONNECT_ATTEMPTS",
            "EDGESYNC_SUPPRESSION_WINDOW_MS",
            "EDGESYNC_MAX_FRAME_BYTES",
        ] {
            std::env::set_var(name, "soon");
            let err = load_config().unwrap_err();
            std::env::remove_var(name);
            assert!(err.to_string().contains(name), "{}", err);
        }

        std::env::set_var("EDGESYNC_RECONNECT_ATTEMPTS", "-1");
        assert!(load_config().is_err());
        std::env::remove_var("EDGESYNC_RECONNECT_ATTEMPTS");
    }

    #[test]
    fn test_config_debug() {
        let cfg = Config::default();
        let debug_str = format!("{:?}", cfg);
        assert!(debug_str.contains("listen_addr"));
        assert!(debug_str.contains("0.0.0.0:4100"));
    }
}
