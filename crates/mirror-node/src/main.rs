//! Mirror node entry point.
//!
//! Loads configuration, wires the services, starts LAN discovery, and runs
//! until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! mirror-node [OPTIONS]
//!
//! Options:
//!   --config <PATH>        Config file [env: MIRROR_CONFIG]
//!   --hostname <NAME>      Override identity.hostname [env: MIRROR_HOSTNAME]
//!   --mirror-id <ID>       Override identity.mirror_id [env: MIRROR_ID]
//!   --log-level <LEVEL>    Override logging.log_level [env: MIRROR_LOG_LEVEL]
//!   --no-discovery         Do not bind the UDP discovery socket
//! ```
//!
//! `RUST_LOG` takes precedence over both `--log-level` and the config file.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mirror_node::infrastructure::node::NodeState;
use mirror_node::infrastructure::storage::config::{load_config, load_config_from, AppConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// LAN mirror node: peer discovery, QR session activation and session
/// transfer.
#[derive(Debug, Parser)]
#[command(name = "mirror-node", version)]
struct Cli {
    /// Path to the TOML config file.  Defaults to the platform config
    /// directory.
    #[arg(long, env = "MIRROR_CONFIG")]
    config: Option<PathBuf>,

    /// Hostname this mirror registers and announces under.
    #[arg(long, env = "MIRROR_HOSTNAME")]
    hostname: Option<String>,

    /// Stable mirror id; defaults to the hostname.
    #[arg(long, env = "MIRROR_ID")]
    mirror_id: Option<String>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, env = "MIRROR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Disable LAN discovery.
    #[arg(long)]
    no_discovery: bool,
}

impl Cli {
    /// Loads the config file and applies command-line overrides.
    fn into_config(self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => load_config_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => load_config().context("failed to load config")?,
        };

        if let Some(hostname) = self.hostname {
            config.identity.hostname = hostname;
        }
        if let Some(mirror_id) = self.mirror_id {
            config.identity.mirror_id = mirror_id;
        }
        if let Some(level) = self.log_level {
            config.logging.log_level = level;
        }
        if self.no_discovery {
            config.discovery.enabled = false;
        }
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .init();

    info!(
        "mirror node {} starting",
        config.identity.hostname
    );

    let discovery_enabled = config.discovery.enabled;
    let node = NodeState::new(config);

    // Shutdown flag shared with the discovery thread.
    let running = Arc::new(AtomicBool::new(true));

    // ── Discovery ─────────────────────────────────────────────────────────────
    let discovery = if discovery_enabled {
        match node.start_discovery(Arc::clone(&running)) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("failed to start discovery: {e}");
                None
            }
        }
    } else {
        info!("discovery disabled");
        None
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    info!("mirror node ready.  Press Ctrl-C to exit.");

    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if let Some(handle) = discovery {
        handle.stop();
    }
    info!(
        "mirror node stopped ({} known peer(s))",
        node.registry.len().saturating_sub(1)
    );
    Ok(())
}
