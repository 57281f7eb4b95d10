//! Infrastructure layer for fleetlink-hub.
//!
//! The infrastructure layer handles all I/O: accepting WebSocket connections
//! from machines and operators, authenticating them at the upgrade boundary,
//! and running the per-session receive loops.
//!
//! # Responsibilities
//!
//! - Binding the TCP listener and accepting sockets
//! - Performing the WebSocket upgrade with path routing and bearer-token
//!   verification
//! - Spawning one Tokio task per accepted socket
//! - Running the machine-side and operator-side session loops
//! - Handling the graceful shutdown signal
//!
//! # What does NOT belong here?
//!
//! - Routing decisions and claim rules (application layer)
//! - Frame types and validation (fleetlink-core)
//! - Configuration parsing (domain layer / `main.rs`)

pub mod auth;
pub mod machine_session;
pub mod operator_session;
pub mod persistence;
pub mod ws_server;

// Re-export the primary entry points so `main.rs` can call them concisely.
pub use ws_server::{bind_listener, run_server, serve, HubState};
