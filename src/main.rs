//! edge-sync - Hub/Edge Directory Replication
//!
//! This is the composition root that wires together all the components.

use edge_sync::adapters::outbound::NotifyChangeSource;
use edge_sync::config::{load_config, Role};
use edge_sync::domain::ports::ChangeSource;
use edge_sync::infrastructure::shutdown_signal;
use edge_sync::replication::{EdgeAgent, HubAgent};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration from environment, then positional arguments
    let cfg = match load_config().and_then(|cfg| cfg.with_args(std::env::args().skip(1))) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("edge-sync: {:#}", e);
            eprintln!("usage: edge-sync hub <port> <root> | edge-sync edge <hub-addr> <root>");
            return ExitCode::from(2);
        }
    };

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: edge_sync::config::Config) -> anyhow::Result<()> {
    let (role, replication) = cfg.replication()?;

    // ===== COMPOSITION ROOT =====
    let change_source: Arc<dyn ChangeSource> = Arc::new(NotifyChangeSource::new());

    match role {
        Role::Hub => {
            let hub = Arc::new(HubAgent::new(replication, change_source)?);
            tokio::spawn(shutdown_signal(hub.shutdown_controller()));
            hub.run().await
        }
        Role::Edge => {
            let edge = Arc::new(EdgeAgent::new(replication, change_source)?);
            tokio::spawn(shutdown_signal(edge.shutdown_controller()));
            edge.run().await
        }
    }
}
