//! Persistence collaborator boundary.
//!
//! Telemetry and host-configuration storage is an external concern: the hub
//! only decides *whether* a signal is persisted (the router hands `vms`-topic
//! signals to the [`SignalStore`] port), never how. [`LoggingSignalStore`]
//! is the stand-in implementation used when no real store is wired up — it
//! records the decision in the log so the delegation is observable.

use async_trait::async_trait;
use fleetlink_core::{Frame, InstanceId};
use tracing::info;

use crate::application::SignalStore;

/// A [`SignalStore`] that logs each persisted signal instead of storing it.
pub struct LoggingSignalStore;

#[async_trait]
impl SignalStore for LoggingSignalStore {
    async fn persist(&self, instance_id: InstanceId, frame: &Frame) -> Result<(), String> {
        let fields = frame.payload.as_ref().map(|p| p.len()).unwrap_or(0);
        info!("instance {instance_id}: vms signal persisted ({fields} payload fields)");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
