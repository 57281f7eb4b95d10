//! fleetlink-hub library crate.
//!
//! The hub connects remote machine instances and operator clients over
//! persistent WebSockets and routes channel frames between them. Its core is
//! the connection registry and the claim-gated message router: the hub tracks
//! which instances are live, lets operators subscribe to an instance's
//! outbound signals, forwards operator commands subject to mutual-exclusion
//! ("claim") rules, and guarantees cleanup when either side disconnects at an
//! arbitrary point.
//!
//! # Architecture
//!
//! ```text
//! Machine (JSON frames over WebSocket, /{instance_id}/ws)
//!         ↕
//! [fleetlink-hub]
//!   ├── domain/           HubConfig (TOML + defaults)
//!   ├── application/      ConnectionRegistry, ClaimGuard, MessageRouter,
//!   │                     SignalStore port
//!   └── infrastructure/
//!         ├── ws_server/  accept loop, upgrade-time auth + path routing
//!         ├── machine_session/  instance-side receive loop
//!         ├── operator_session/ app-side receive loop
//!         ├── auth/       bearer-token credential check boundary
//!         └── persistence/ SignalStore boundary implementation
//!         ↕
//! Operator (JSON frames over WebSocket, /app/{instance_id}/ws)
//! ```
//!
//! # Layer rules
//!
//! - `domain` holds configuration types only (no I/O inside the types).
//! - `application` depends on `domain` and `fleetlink-core`; it owns all
//!   shared mutable state and is fully testable without sockets.
//! - `infrastructure` depends on everything else plus `tokio` and
//!   `tungstenite`; it owns the sockets and the per-session tasks.

/// Domain layer: configuration types.
pub mod domain;

/// Application layer: registry, claim gate, and router.
pub mod application;

/// Infrastructure layer: WebSocket server and session loops.
pub mod infrastructure;
