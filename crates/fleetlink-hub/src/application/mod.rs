//! Application layer for fleetlink-hub.
//!
//! This layer owns all shared mutable state of the hub: the connection
//! registry, the per-connection claim bits, and the subscriber lists. It
//! knows *what* to do with a frame; the infrastructure layer decides *how*
//! frames arrive and leave (sockets, tasks).
//!
//! # Responsibilities
//!
//! - Tracking live machine connections by instance id
//! - Enforcing the command claim (mutual exclusion between operator sessions)
//! - Fanning signals out to subscribers in registration order
//! - Tearing connections down exactly once, with disconnect notification
//! - Defining the `SignalStore` port for the persistence collaborator
//!
//! # What does NOT belong here?
//!
//! - Opening sockets or accepting connections (infrastructure)
//! - Frame encoding/decoding (fleetlink-core)
//! - Credential checks (enforced at the socket-accept boundary, never here)

pub mod claim;
pub mod registry;
pub mod router;

pub use claim::ClaimGuard;
pub use registry::{ConnectionHandle, ConnectionRegistry, SubscriptionToken};
pub use router::{MessageRouter, RouterError, SignalStore};
