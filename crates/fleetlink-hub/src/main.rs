//! Fleetlink hub — entry point.
//!
//! Binds the WebSocket listener and routes channel frames between machine
//! instances and operator clients until shut down.
//!
//! # Usage
//!
//! ```text
//! fleetlink-hub [OPTIONS]
//!
//! Options:
//!   --config <PATH>       TOML configuration file
//!   --bind <ADDR>         IP address to bind [default: 0.0.0.0]
//!   --port <PORT>         Listener port [default: 8700]
//!   --access-key <KEY>    Bearer token sockets must present
//! ```
//!
//! CLI arguments override the configuration file; the file overrides the
//! built-in defaults. The log level is controlled by `RUST_LOG`.
//!
//! # Environment variable overrides
//!
//! | Variable              | Description                      |
//! |-----------------------|----------------------------------|
//! | `FLEETLINK_BIND`      | Listener bind address            |
//! | `FLEETLINK_PORT`      | Listener port                    |
//! | `FLEETLINK_ACCESS_KEY`| Channel bearer token             |

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleetlink_hub::domain::{load_config, HubConfig};
use fleetlink_hub::infrastructure::run_server;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Fleetlink hub.
///
/// Connects remote machine instances and operator clients over persistent
/// WebSockets and routes channel frames between them.
#[derive(Debug, Parser)]
#[command(
    name = "fleetlink-hub",
    about = "Connection registry and claim-gated message router for fleet channels",
    version
)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// IP address to bind the WebSocket listener to.
    ///
    /// Use `0.0.0.0` to accept connections from any interface, or
    /// `127.0.0.1` for local-only access.
    #[arg(long, env = "FLEETLINK_BIND")]
    bind: Option<String>,

    /// TCP port for the WebSocket listener.
    #[arg(long, env = "FLEETLINK_PORT")]
    port: Option<u16>,

    /// Bearer token every machine and operator socket must present.
    #[arg(long, env = "FLEETLINK_ACCESS_KEY")]
    access_key: Option<String>,
}

impl Cli {
    /// Resolves the effective configuration: file (or defaults) plus CLI
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error when the config file cannot be read or parsed, or
    /// when the resulting bind address is invalid.
    fn into_hub_config(self) -> anyhow::Result<HubConfig> {
        let mut config = load_config(self.config.as_deref())?;

        if let Some(bind) = self.bind {
            config.network.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(access_key) = self.access_key {
            config.security.access_key = access_key;
        }

        // Fail fast on an unusable listen address.
        config.listen_addr()?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging. Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.into_hub_config()?;

    info!("fleetlink hub starting on {}", config.listen_addr()?);

    // Graceful shutdown flag, cleared by Ctrl-C. The accept loop checks it
    // every 200 ms.
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    run_server(config, running).await?;

    info!("fleetlink hub stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_produce_default_config() {
        let cli = Cli::parse_from(["fleetlink-hub"]);
        let config = cli.into_hub_config().unwrap();
        assert_eq!(config, HubConfig::default());
    }

    #[test]
    fn test_cli_port_override() {
        let cli = Cli::parse_from(["fleetlink-hub", "--port", "9100"]);
        let config = cli.into_hub_config().unwrap();
        assert_eq!(config.network.port, 9100);
    }

    #[test]
    fn test_cli_bind_override() {
        let cli = Cli::parse_from(["fleetlink-hub", "--bind", "127.0.0.1"]);
        let config = cli.into_hub_config().unwrap();
        assert_eq!(config.network.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_cli_access_key_override() {
        let cli = Cli::parse_from(["fleetlink-hub", "--access-key", "prod-key"]);
        let config = cli.into_hub_config().unwrap();
        assert_eq!(config.security.access_key, "prod-key");
    }

    #[test]
    fn test_cli_invalid_bind_address_returns_error() {
        let cli = Cli::parse_from(["fleetlink-hub", "--bind", "not.an.ip"]);
        assert!(cli.into_hub_config().is_err());
    }

    #[test]
    fn test_cli_missing_config_file_returns_error() {
        let cli = Cli::parse_from(["fleetlink-hub", "--config", "/nonexistent/hub.toml"]);
        assert!(cli.into_hub_config().is_err());
    }
}
