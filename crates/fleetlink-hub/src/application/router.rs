//! MessageRouter: the public operations over the connection registry.
//!
//! The router composes the registry and the claim gate into the operations
//! the session loops call: register/unregister, subscribe/unsubscribe,
//! claim/release, `command` (claim-gated), `relay` (the peer pass-through)
//! and `broadcast` (fan-out to subscribers).
//!
//! # Locking discipline
//!
//! All shared state lives in one `ConnectionRegistry` behind a
//! `std::sync::Mutex`. The lock is only ever held for short, non-async
//! critical sections; senders are cloned out under the lock and awaited
//! after release. Every read-modify-write — lookup + claim gate + capture of
//! the outbound queue — happens inside a single critical section, so there
//! is no window between checking the claim and capturing the send path.
//!
//! # Send policy
//!
//! Each connection's outbound queue is bounded. A `command` or `relay`
//! either enqueues immediately or fails: a closed or full queue means the
//! peer is dead or unresponsive, and the router treats both exactly like a
//! disconnect — the connection is torn down and disconnect subscribers still
//! fire. Broadcast delivery to operator subscribers, by contrast, awaits
//! each subscriber's bounded queue in registration order: a slow operator
//! back-pressures only the one instance it subscribes to, never unrelated
//! instances.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use fleetlink_core::{Frame, InstanceId, MessageKind, SessionId, Topic};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::application::claim::{forward_allowed, ClaimGuard};
use crate::application::registry::{
    ConnectionHandle, ConnectionRegistry, DisconnectSender, FrameSender, SubscriptionToken,
    Teardown,
};

/// Error type for router operations.
///
/// These are returned to the calling session loop only; they never cross to
/// another connection and they never close the caller's socket.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    /// The target instance has no live connection.
    #[error("instance {0} is not connected")]
    NotConnected(InstanceId),

    /// The command claim on the instance is held by another session.
    #[error("instance {0} is claimed by another session")]
    ClaimConflict(InstanceId),

    /// The instance's outbound queue is closed or full. The connection has
    /// been torn down, exactly as if the peer had disconnected.
    #[error("send to instance {0} failed")]
    PeerSendFailure(InstanceId),
}

/// Port to the external persistence collaborator.
///
/// The router decides *whether* a signal is persisted (`vms`-topic signals
/// are); how the data is stored is entirely the collaborator's business.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Persists one signal frame for the given instance.
    async fn persist(&self, instance_id: InstanceId, frame: &Frame) -> Result<(), String>;
}

/// The message router.
///
/// Cheaply cloneable; every session task holds its own clone.
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<Mutex<ConnectionRegistry>>,
    signal_store: Arc<dyn SignalStore>,
}

impl MessageRouter {
    /// Creates a router with the given persistence collaborator.
    pub fn new(signal_store: Arc<dyn SignalStore>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(ConnectionRegistry::new())),
            signal_store,
        }
    }

    /// Locks the registry, recovering from poisoning.
    ///
    /// The lock is never held across an await point, so a poisoned lock can
    /// only mean a panic in a pure accessor; the registry state is still
    /// coherent.
    fn lock(&self) -> MutexGuard<'_, ConnectionRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Registers a machine connection and returns its handle.
    ///
    /// If a connection is already live under the same instance id it is
    /// displaced and fully torn down: its disconnect subscribers fire and
    /// its outbound queue closes, which ends its socket.
    pub async fn register_connection(
        &self,
        instance_id: InstanceId,
        outbound: mpsc::Sender<Frame>,
    ) -> ConnectionHandle {
        let (handle, displaced) = self.lock().register(instance_id, outbound);
        if let Some(mut stale) = displaced {
            warn!("instance {instance_id} reconnected; displacing stale connection");
            if let Some(subs) = stale.begin_close() {
                notify_disconnect(instance_id, subs).await;
            }
            // Dropping the stale connection closes its outbound queue.
        }
        handle
    }

    /// Deregisters the connection identified by `handle`.
    ///
    /// Fires every disconnect subscriber with the instance id, in
    /// registration order, each delivery completed before the next begins;
    /// then clears both subscriber lists and removes the connection,
    /// releasing its outbound queue. Returns `false` when the handle is
    /// stale or teardown already ran — the notification fires exactly once.
    pub async fn unregister_connection(&self, handle: ConnectionHandle) -> bool {
        let teardown = self.lock().begin_teardown(handle);
        match teardown {
            Some(teardown) => {
                self.finish_teardown(teardown).await;
                true
            }
            None => false,
        }
    }

    async fn finish_teardown(&self, teardown: Teardown) {
        let instance_id = teardown.handle.instance_id();
        notify_disconnect(instance_id, teardown.disconnect_subs).await;
        self.lock().remove(teardown.handle);
        debug!("instance {instance_id} deregistered");
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// The liveness listing: all connected instance ids, sorted.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.lock().instance_ids()
    }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    /// Subscribes `sender` to frames broadcast for `instance_id`.
    ///
    /// Returns `None` (a no-op) when the instance is not connected.
    pub fn subscribe_frames(
        &self,
        instance_id: InstanceId,
        sender: FrameSender,
    ) -> Option<SubscriptionToken> {
        self.lock().subscribe_frames(instance_id, sender)
    }

    /// Removes a frame subscription; a no-op when absent.
    pub fn unsubscribe_frames(&self, instance_id: InstanceId, token: SubscriptionToken) -> bool {
        self.lock().unsubscribe_frames(instance_id, token)
    }

    /// Subscribes `sender` to the instance's disconnect notification.
    pub fn subscribe_disconnect(
        &self,
        instance_id: InstanceId,
        sender: DisconnectSender,
    ) -> Option<SubscriptionToken> {
        self.lock().subscribe_disconnect(instance_id, sender)
    }

    /// Removes a disconnect subscription; a no-op when absent.
    pub fn unsubscribe_disconnect(
        &self,
        instance_id: InstanceId,
        token: SubscriptionToken,
    ) -> bool {
        self.lock().unsubscribe_disconnect(instance_id, token)
    }

    // ── Claim ─────────────────────────────────────────────────────────────────

    /// The instance's claim bit, or `None` when the instance is unknown.
    pub fn is_claimed(&self, instance_id: InstanceId) -> Option<bool> {
        self.lock().claim_of(instance_id).map(|claim| claim.is_some())
    }

    /// Claims exclusive command authority over `instance_id` for `session`.
    ///
    /// Returns a [`ClaimGuard`] whose drop releases the claim on every exit
    /// path of the owning session. Claiming an instance this session already
    /// holds returns a fresh guard; the first guard to release wins, so a
    /// session should hold at most one guard per instance.
    ///
    /// # Errors
    ///
    /// [`RouterError::NotConnected`] when the instance is unknown and
    /// [`RouterError::ClaimConflict`] when another session holds the claim.
    pub fn claim(
        &self,
        instance_id: InstanceId,
        session: SessionId,
    ) -> Result<ClaimGuard, RouterError> {
        let mut registry = self.lock();
        match registry.claim_of(instance_id) {
            None => Err(RouterError::NotConnected(instance_id)),
            Some(Some(holder)) if holder != session => {
                Err(RouterError::ClaimConflict(instance_id))
            }
            Some(_) => {
                registry.set_claim(instance_id, session);
                drop(registry);
                debug!("session {session} claimed instance {instance_id}");
                Ok(ClaimGuard::new(
                    Arc::clone(&self.registry),
                    instance_id,
                    session,
                ))
            }
        }
    }

    /// Releases the claim on `instance_id` iff `session` holds it.
    ///
    /// Idempotent: releasing an unclaimed or unknown instance is a no-op.
    /// Normally invoked through [`ClaimGuard`]'s drop.
    pub fn release(&self, instance_id: InstanceId, session: SessionId) -> bool {
        self.lock().clear_claim(instance_id, session)
    }

    // ── Forwarding ────────────────────────────────────────────────────────────

    /// Sends a command frame to the instance, subject to the claim gate.
    ///
    /// The lookup, the gate decision, and the capture of the outbound queue
    /// happen atomically under one lock.
    ///
    /// # Errors
    ///
    /// - [`RouterError::NotConnected`] when the instance is unknown.
    /// - [`RouterError::ClaimConflict`] when another session holds the claim.
    /// - [`RouterError::PeerSendFailure`] when the outbound queue is closed
    ///   or full; the connection is torn down as if it had disconnected.
    pub async fn command(
        &self,
        instance_id: InstanceId,
        frame: Frame,
        session: SessionId,
    ) -> Result<(), RouterError> {
        let outbound = {
            let registry = self.lock();
            let holder = registry
                .claim_of(instance_id)
                .ok_or(RouterError::NotConnected(instance_id))?;
            if !forward_allowed(holder, session) {
                return Err(RouterError::ClaimConflict(instance_id));
            }
            registry
                .outbound_of(instance_id)
                .ok_or(RouterError::NotConnected(instance_id))?
        };
        self.dispatch(instance_id, &outbound, frame).await
    }

    /// Sends a peer frame to the instance, bypassing the claim gate.
    ///
    /// Peer traffic is pass-through between sessions and is deliberately not
    /// subject to claim exclusivity.
    ///
    /// # Errors
    ///
    /// [`RouterError::NotConnected`] or [`RouterError::PeerSendFailure`],
    /// as for [`command`](Self::command).
    pub async fn relay(&self, instance_id: InstanceId, frame: Frame) -> Result<(), RouterError> {
        let outbound = {
            self.lock()
                .outbound_of(instance_id)
                .ok_or(RouterError::NotConnected(instance_id))?
        };
        self.dispatch(instance_id, &outbound, frame).await
    }

    async fn dispatch(
        &self,
        instance_id: InstanceId,
        outbound: &mpsc::Sender<Frame>,
        frame: Frame,
    ) -> Result<(), RouterError> {
        match outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) | Err(TrySendError::Full(_)) => {
                // A dead or unresponsive peer; tear the connection down the
                // same way a disconnect would.
                warn!("send to instance {instance_id} failed; tearing connection down");
                let teardown = self.lock().begin_teardown_any(instance_id);
                if let Some(teardown) = teardown {
                    self.finish_teardown(teardown).await;
                }
                Err(RouterError::PeerSendFailure(instance_id))
            }
        }
    }

    /// Fans a frame out to every subscriber of `instance_id`, in
    /// registration order, each delivery completed before the next begins.
    ///
    /// Silently a no-op when the instance is not connected (logged at debug).
    /// Subscribers whose receiving side has gone away are pruned.
    /// `vms`-topic signal frames are additionally handed to the persistence
    /// collaborator.
    pub async fn broadcast(&self, instance_id: InstanceId, frame: &Frame) {
        let subscribers = match self.lock().frame_subscribers(instance_id) {
            Some(subscribers) => subscribers,
            None => {
                debug!("broadcast for unknown instance {instance_id} dropped");
                return;
            }
        };

        let mut dead = Vec::new();
        for (token, sender) in subscribers {
            if sender.send((instance_id, frame.clone())).await.is_err() {
                dead.push(token);
            }
        }
        if !dead.is_empty() {
            let mut registry = self.lock();
            for token in dead {
                registry.unsubscribe_frames(instance_id, token);
            }
        }

        if frame.kind == MessageKind::Signal && frame.topic == Topic::Vms {
            if let Err(e) = self.signal_store.persist(instance_id, frame).await {
                warn!("persisting vms signal for instance {instance_id} failed: {e}");
            }
        }
    }
}

/// Delivers the disconnect notification to each subscriber in registration
/// order, sequentially. Subscribers that have gone away are skipped.
async fn notify_disconnect(instance_id: InstanceId, subscribers: Vec<DisconnectSender>) {
    for sender in subscribers {
        if sender.send(instance_id).await.is_err() {
            debug!("disconnect subscriber for instance {instance_id} already gone");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
