//! Domain layer for fleetlink-hub.
//!
//! Holds the configuration schema. The structs here perform no I/O
//! themselves; [`config::load_config`] is the single place that touches the
//! filesystem, so tests and embedders can construct configs directly.

pub mod config;

pub use config::{load_config, ChannelConfig, ConfigError, HubConfig, NetworkConfig, SecurityConfig};
