//! TOML-based hub configuration.
//!
//! [`HubConfig`] is the single source of truth for all runtime settings.
//! It is built from an optional TOML file plus CLI/environment overrides
//! applied in `main.rs`, and then shared across session tasks behind an
//! `Arc`.
//!
//! Fields use serde defaults so a partial file (or no file at all) yields a
//! working local-development configuration:
//!
//! ```toml
//! [network]
//! bind_address = "0.0.0.0"
//! port = 8700
//!
//! [security]
//! access_key = "dev-access-key"
//!
//! [channel]
//! outbound_queue = 64
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configured bind address and port do not form a socket address.
    #[error("invalid listen address: '{0}'")]
    InvalidAddress(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Listener bind settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// IP address the WebSocket listener binds to. `"0.0.0.0"` accepts
    /// connections from any interface; use `"127.0.0.1"` for local-only.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port for the WebSocket listener.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Access control settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    /// Bearer token every machine and operator socket must present during
    /// the WebSocket upgrade. The default only suits local development;
    /// production deployments override it via `--access-key` or
    /// `FLEETLINK_ACCESS_KEY`.
    #[serde(default = "default_access_key")]
    pub access_key: String,
}

/// Channel queue sizing.
///
/// All queues are bounded so one slow socket can never hold unbounded
/// memory; see the router documentation for the overflow policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    /// Capacity of each machine connection's outbound command queue.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Capacity of each operator subscription's delivery queue.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    /// Capacity of each operator's disconnect-notification queue.
    #[serde(default = "default_disconnect_queue")]
    pub disconnect_queue: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8700
}
fn default_access_key() -> String {
    "dev-access-key".to_string()
}
fn default_outbound_queue() -> usize {
    64
}
fn default_subscriber_queue() -> usize {
    64
}
fn default_disconnect_queue() -> usize {
    4
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            security: SecurityConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            access_key: default_access_key(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
            subscriber_queue: default_subscriber_queue(),
            disconnect_queue: default_disconnect_queue(),
        }
    }
}

impl HubConfig {
    /// Resolves the listener socket address from the network section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] when `bind_address` is not a
    /// valid IP address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let text = format!("{}:{}", self.network.bind_address, self.network.port);
        text.parse()
            .map_err(|_| ConfigError::InvalidAddress(text))
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads the hub configuration.
///
/// With `Some(path)` the file must exist and parse; with `None` the built-in
/// defaults are returned.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when the file cannot be read and
/// [`ConfigError::Parse`] when its TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<HubConfig, ConfigError> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(toml::from_str(&content)?)
        }
        None => Ok(HubConfig::default()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_expected_port() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.network.port, 8700);
        assert_eq!(cfg.network.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_default_config_queue_sizes() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.channel.outbound_queue, 64);
        assert_eq!(cfg.channel.subscriber_queue, 64);
        assert_eq!(cfg.channel.disconnect_queue, 4);
    }

    #[test]
    fn test_listen_addr_combines_address_and_port() {
        let mut cfg = HubConfig::default();
        cfg.network.bind_address = "127.0.0.1".to_string();
        cfg.network.port = 9000;

        let addr = cfg.listen_addr().unwrap();

        assert_eq!(addr.to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn test_listen_addr_rejects_invalid_bind_address() {
        let mut cfg = HubConfig::default();
        cfg.network.bind_address = "not.an.ip".to_string();

        let result = cfg.listen_addr();

        assert!(matches!(result, Err(ConfigError::InvalidAddress(_))));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut cfg = HubConfig::default();
        cfg.network.port = 9123;
        cfg.security.access_key = "secret".to_string();
        cfg.channel.outbound_queue = 128;

        let text = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: HubConfig = toml::from_str(&text).expect("deserialize");

        assert_eq!(cfg, restored);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: HubConfig = toml::from_str("").expect("empty config is valid");
        assert_eq!(cfg, HubConfig::default());
    }

    #[test]
    fn test_partial_toml_inherits_defaults() {
        let text = r#"
[network]
port = 9999
"#;

        let cfg: HubConfig = toml::from_str(text).expect("partial config is valid");

        assert_eq!(cfg.network.port, 9999);
        // Unspecified fields keep their defaults
        assert_eq!(cfg.network.bind_address, "0.0.0.0");
        assert_eq!(cfg.channel.outbound_queue, 64);
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        let result: Result<HubConfig, _> = toml::from_str("[[[ not valid toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_without_path_returns_defaults() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg, HubConfig::default());
    }

    #[test]
    fn test_load_config_with_missing_file_returns_io_error() {
        let path = Path::new("/nonexistent/fleetlink/hub.toml");
        let result = load_config(Some(path));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_config_reads_file_from_disk() {
        let dir = std::env::temp_dir().join(format!("fleetlink_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hub.toml");
        std::fs::write(&path, "[security]\naccess_key = \"from-file\"\n").unwrap();

        let cfg = load_config(Some(&path)).unwrap();

        assert_eq!(cfg.security.access_key, "from-file");
        std::fs::remove_dir_all(&dir).ok();
    }
}
