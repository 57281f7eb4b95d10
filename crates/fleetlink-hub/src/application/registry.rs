//! ConnectionRegistry: the set of live machine connections.
//!
//! The registry is the hub's in-memory map of every machine that currently
//! holds an open socket. Each entry tracks:
//!
//! - The bounded outbound queue feeding the connection's socket writer.
//! - The command claim (`None` = unclaimed, `Some(session)` = claimed).
//! - Two ordered subscriber lists: frame subscribers and disconnect
//!   subscribers, both keyed by [`SubscriptionToken`] so unsubscribe never
//!   needs to compare callbacks by identity.
//!
//! At most one live connection exists per instance id: registering a second
//! connection under the same id displaces the first, and the displaced
//! connection is handed back to the caller for full teardown. A machine
//! reconnecting after a network drop must not be locked out by its own stale
//! half-open socket.
//!
//! The registry itself is a plain single-owner struct; [`MessageRouter`]
//! wraps it in `Arc<Mutex<..>>` and never holds the lock across an await
//! point.
//!
//! [`MessageRouter`]: crate::application::router::MessageRouter

use std::collections::{BTreeMap, HashMap};

use fleetlink_core::{Frame, InstanceId, SessionId};
use tokio::sync::mpsc;

/// Sender half of one frame subscription: receives `(instance_id, frame)`.
pub type FrameSender = mpsc::Sender<(InstanceId, Frame)>;

/// Sender half of one disconnect subscription: receives the instance id once.
pub type DisconnectSender = mpsc::Sender<InstanceId>;

/// Opaque handle identifying one subscription on one instance.
///
/// Tokens are monotonically increasing, so iterating subscribers in token
/// order reproduces registration order — the delivery-order guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionToken(u64);

/// Identity of one registered connection.
///
/// Besides the instance id, the handle carries a registry-assigned serial so
/// a session tearing down a connection that has meanwhile been displaced by
/// a reconnect cannot destroy the newcomer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    instance_id: InstanceId,
    serial: u64,
}

impl ConnectionHandle {
    /// The instance this connection represents.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }
}

/// One live machine connection.
pub struct Connection {
    serial: u64,
    outbound: mpsc::Sender<Frame>,
    claim: Option<SessionId>,
    frame_subs: BTreeMap<u64, FrameSender>,
    disconnect_subs: BTreeMap<u64, DisconnectSender>,
    /// Teardown-in-progress latch; guarantees disconnect subscribers are
    /// notified exactly once even under racing teardown paths.
    closing: bool,
}

impl Connection {
    /// Whether an operator session currently holds the command claim.
    pub fn is_claimed(&self) -> bool {
        self.claim.is_some()
    }

    /// Marks the connection as closing and takes both subscriber lists,
    /// returning the disconnect senders in registration order.
    ///
    /// Returns `None` if teardown already started.
    pub(crate) fn begin_close(&mut self) -> Option<Vec<DisconnectSender>> {
        if self.closing {
            return None;
        }
        self.closing = true;
        self.frame_subs.clear();
        let subs = std::mem::take(&mut self.disconnect_subs);
        Some(subs.into_values().collect())
    }
}

/// Per-instance teardown data extracted under the registry lock.
pub(crate) struct Teardown {
    pub handle: ConnectionHandle,
    pub disconnect_subs: Vec<DisconnectSender>,
}

/// In-memory registry of all live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<InstanceId, Connection>,
    /// Source of subscription tokens and connection serials.
    next_serial: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Registers a connection for `instance_id` with the given outbound queue.
    ///
    /// Returns the new connection's handle plus the displaced stale
    /// connection, if one was live under the same id. The caller is
    /// responsible for tearing the displaced connection down (notifying its
    /// disconnect subscribers and dropping it, which closes its queue).
    pub fn register(
        &mut self,
        instance_id: InstanceId,
        outbound: mpsc::Sender<Frame>,
    ) -> (ConnectionHandle, Option<Connection>) {
        let serial = self.next_serial();
        let displaced = self.connections.insert(
            instance_id,
            Connection {
                serial,
                outbound,
                claim: None,
                frame_subs: BTreeMap::new(),
                disconnect_subs: BTreeMap::new(),
                closing: false,
            },
        );
        (
            ConnectionHandle {
                instance_id,
                serial,
            },
            displaced,
        )
    }

    /// Whether a live connection exists for `instance_id`.
    pub fn contains(&self, instance_id: InstanceId) -> bool {
        self.connections.contains_key(&instance_id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// All live instance ids, sorted for deterministic liveness reporting.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Begins teardown of the connection identified by `handle`.
    ///
    /// Returns `None` if the handle no longer names a live connection (it was
    /// displaced or already removed) or teardown already started — the
    /// exactly-once guarantee for disconnect notification.
    pub(crate) fn begin_teardown(&mut self, handle: ConnectionHandle) -> Option<Teardown> {
        let conn = self.connections.get_mut(&handle.instance_id)?;
        if conn.serial != handle.serial {
            return None;
        }
        let disconnect_subs = conn.begin_close()?;
        Some(Teardown {
            handle,
            disconnect_subs,
        })
    }

    /// Begins teardown of whatever connection currently holds `instance_id`.
    ///
    /// Used by the router when a send failure reveals a dead peer and no
    /// handle is at hand.
    pub(crate) fn begin_teardown_any(&mut self, instance_id: InstanceId) -> Option<Teardown> {
        let conn = self.connections.get_mut(&instance_id)?;
        let serial = conn.serial;
        let disconnect_subs = conn.begin_close()?;
        Some(Teardown {
            handle: ConnectionHandle {
                instance_id,
                serial,
            },
            disconnect_subs,
        })
    }

    /// Removes the connection identified by `handle`, releasing its outbound
    /// queue. No-op when the handle is stale.
    pub(crate) fn remove(&mut self, handle: ConnectionHandle) {
        if let Some(conn) = self.connections.get(&handle.instance_id) {
            if conn.serial == handle.serial {
                self.connections.remove(&handle.instance_id);
            }
        }
    }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    /// Appends a frame subscriber to the instance's list.
    ///
    /// Returns `None` when the instance has no live connection (the
    /// subscription is a no-op, matching the router contract).
    pub fn subscribe_frames(
        &mut self,
        instance_id: InstanceId,
        sender: FrameSender,
    ) -> Option<SubscriptionToken> {
        let serial = self.next_serial();
        let conn = self.connections.get_mut(&instance_id)?;
        conn.frame_subs.insert(serial, sender);
        Some(SubscriptionToken(serial))
    }

    /// Removes a frame subscriber; `true` if it was present.
    pub fn unsubscribe_frames(&mut self, instance_id: InstanceId, token: SubscriptionToken) -> bool {
        self.connections
            .get_mut(&instance_id)
            .map(|conn| conn.frame_subs.remove(&token.0).is_some())
            .unwrap_or(false)
    }

    /// Appends a disconnect subscriber to the instance's list.
    pub fn subscribe_disconnect(
        &mut self,
        instance_id: InstanceId,
        sender: DisconnectSender,
    ) -> Option<SubscriptionToken> {
        let serial = self.next_serial();
        let conn = self.connections.get_mut(&instance_id)?;
        conn.disconnect_subs.insert(serial, sender);
        Some(SubscriptionToken(serial))
    }

    /// Removes a disconnect subscriber; `true` if it was present.
    pub fn unsubscribe_disconnect(
        &mut self,
        instance_id: InstanceId,
        token: SubscriptionToken,
    ) -> bool {
        self.connections
            .get_mut(&instance_id)
            .map(|conn| conn.disconnect_subs.remove(&token.0).is_some())
            .unwrap_or(false)
    }

    /// Snapshot of the instance's frame subscribers in registration order.
    pub(crate) fn frame_subscribers(
        &self,
        instance_id: InstanceId,
    ) -> Option<Vec<(SubscriptionToken, FrameSender)>> {
        let conn = self.connections.get(&instance_id)?;
        Some(
            conn.frame_subs
                .iter()
                .map(|(&serial, sender)| (SubscriptionToken(serial), sender.clone()))
                .collect(),
        )
    }

    // ── Claim state ───────────────────────────────────────────────────────────

    /// The claim holder of an instance.
    ///
    /// Outer `None` means the instance is not connected; inner `None` means
    /// connected but unclaimed.
    pub fn claim_of(&self, instance_id: InstanceId) -> Option<Option<SessionId>> {
        self.connections.get(&instance_id).map(|conn| conn.claim)
    }

    /// Records `session` as the claim holder. The caller must have checked
    /// the gate first; this is the mutation half of an atomic check-then-set
    /// performed under one lock by the router.
    pub(crate) fn set_claim(&mut self, instance_id: InstanceId, session: SessionId) {
        if let Some(conn) = self.connections.get_mut(&instance_id) {
            conn.claim = Some(session);
        }
    }

    /// Clears the claim iff it is held by `session`; `true` if cleared.
    ///
    /// Idempotent: clearing an unclaimed or absent instance is a no-op, so
    /// every exit path of a session may release unconditionally.
    pub fn clear_claim(&mut self, instance_id: InstanceId, session: SessionId) -> bool {
        match self.connections.get_mut(&instance_id) {
            Some(conn) if conn.claim == Some(session) => {
                conn.claim = None;
                true
            }
            _ => false,
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// The instance's outbound queue sender, if connected.
    pub(crate) fn outbound_of(&self, instance_id: InstanceId) -> Option<mpsc::Sender<Frame>> {
        self.connections
            .get(&instance_id)
            .map(|conn| conn.outbound.clone())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
