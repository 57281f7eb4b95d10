//! Command claim: exclusivity over one instance.
//!
//! A claim grants one operator session exclusive command authority over one
//! machine. The decision rule is pure and lives in [`forward_allowed`]; the
//! claim bit itself is part of the connection entry in the registry.
//!
//! Acquisition goes through [`MessageRouter::claim`], which returns a
//! [`ClaimGuard`]. The guard releases the claim when dropped, so every exit
//! path of the owning session — clean close, protocol error, panic unwind —
//! releases the claim without the session tracking a flag of its own.
//!
//! [`MessageRouter::claim`]: crate::application::router::MessageRouter::claim

use std::sync::{Arc, Mutex};

use fleetlink_core::{InstanceId, SessionId};
use tracing::debug;

use crate::application::registry::ConnectionRegistry;

/// Whether a command from `caller` may be forwarded given the current claim
/// holder.
///
/// A command passes when nobody holds the claim, or when the caller is the
/// holder. A caller that is not the holder while a holder exists is rejected.
pub fn forward_allowed(holder: Option<SessionId>, caller: SessionId) -> bool {
    match holder {
        None => true,
        Some(session) => session == caller,
    }
}

/// Scoped claim token.
///
/// Holds the command claim on one instance for one session. Dropping the
/// guard releases the claim; releasing an instance that has meanwhile been
/// deregistered (or re-registered by a reconnect) is a no-op, because the
/// registry only clears a claim still held by this guard's session.
#[must_use = "dropping the guard releases the claim"]
pub struct ClaimGuard {
    registry: Arc<Mutex<ConnectionRegistry>>,
    instance_id: InstanceId,
    session: SessionId,
    released: bool,
}

impl ClaimGuard {
    pub(crate) fn new(
        registry: Arc<Mutex<ConnectionRegistry>>,
        instance_id: InstanceId,
        session: SessionId,
    ) -> Self {
        Self {
            registry,
            instance_id,
            session,
            released: false,
        }
    }

    /// The claimed instance.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// The session holding the claim.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Releases the claim explicitly. Equivalent to dropping the guard.
    pub fn release(mut self) {
        self.clear();
    }

    fn clear(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if registry.clear_claim(self.instance_id, self.session) {
            debug!(
                "session {} released claim on instance {}",
                self.session, self.instance_id
            );
        }
    }
}

impl std::fmt::Debug for ClaimGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimGuard")
            .field("instance_id", &self.instance_id)
            .field("session", &self.session)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[test]
    fn test_forward_allowed_when_unclaimed() {
        let caller = Uuid::new_v4();
        assert!(forward_allowed(None, caller));
    }

    #[test]
    fn test_forward_allowed_for_holder() {
        let caller = Uuid::new_v4();
        assert!(forward_allowed(Some(caller), caller));
    }

    #[test]
    fn test_forward_rejected_for_non_holder() {
        let holder = Uuid::new_v4();
        let caller = Uuid::new_v4();
        assert!(!forward_allowed(Some(holder), caller));
    }

    fn registry_with_instance(
        id: InstanceId,
    ) -> (Arc<Mutex<ConnectionRegistry>>, mpsc::Receiver<fleetlink_core::Frame>) {
        let mut registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(1);
        registry.register(id, tx);
        (Arc::new(Mutex::new(registry)), rx)
    }

    #[test]
    fn test_guard_drop_releases_claim() {
        let id = Uuid::new_v4();
        let session = Uuid::new_v4();
        let (registry, _rx) = registry_with_instance(id);
        registry.lock().unwrap().set_claim(id, session);

        {
            let _guard = ClaimGuard::new(Arc::clone(&registry), id, session);
            assert_eq!(registry.lock().unwrap().claim_of(id), Some(Some(session)));
        }

        assert_eq!(registry.lock().unwrap().claim_of(id), Some(None));
    }

    #[test]
    fn test_guard_explicit_release_then_drop_releases_once() {
        let id = Uuid::new_v4();
        let session = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (registry, _rx) = registry_with_instance(id);
        registry.lock().unwrap().set_claim(id, session);

        let guard = ClaimGuard::new(Arc::clone(&registry), id, session);
        guard.release();

        // A claim taken by another session afterwards must stay untouched.
        registry.lock().unwrap().set_claim(id, other);
        assert_eq!(registry.lock().unwrap().claim_of(id), Some(Some(other)));
    }

    #[test]
    fn test_guard_release_after_deregistration_is_noop() {
        let id = Uuid::new_v4();
        let session = Uuid::new_v4();
        let (registry, _rx) = registry_with_instance(id);
        registry.lock().unwrap().set_claim(id, session);

        let guard = ClaimGuard::new(Arc::clone(&registry), id, session);

        // The instance disconnects while the guard is outstanding.
        {
            let mut reg = registry.lock().unwrap();
            let teardown = reg.begin_teardown_any(id).unwrap();
            reg.remove(teardown.handle);
        }

        drop(guard);
        assert_eq!(registry.lock().unwrap().claim_of(id), None);
    }

    #[test]
    fn test_guard_releases_on_panic_unwind() {
        let id = Uuid::new_v4();
        let session = Uuid::new_v4();
        let (registry, _rx) = registry_with_instance(id);
        registry.lock().unwrap().set_claim(id, session);

        let registry_clone = Arc::clone(&registry);
        let result = std::panic::catch_unwind(move || {
            let _guard = ClaimGuard::new(registry_clone, id, session);
            panic!("session died");
        });
        assert!(result.is_err());

        let holder = registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .claim_of(id);
        assert_eq!(holder, Some(None), "claim must be released on unwind");
    }
}
