//! Lease-based admission for new exchanges.
//!
//! Admission is directional: the lease received from the peer governs
//! exchanges this end initiates, and the lease this end granted governs
//! exchanges the peer initiates. The TTL is evaluated synchronously at
//! admission time; there is no background timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use weft_core::FrameKind;

/// Handle to a responder registered with a governor, used for coordinated
/// shutdown: outstanding responders are forcibly terminated when the
/// governor is torn down.
pub trait ResponderHandle: Send + Sync + 'static {
    fn terminate(&self);
}

/// Connection-scoped admission policy.
pub trait LeaseGovernor: Send + Sync + 'static {
    /// Track a responder for coordinated shutdown. Returns a token for
    /// [`unregister`](Self::unregister).
    fn register(&self, handle: Arc<dyn ResponderHandle>) -> u64;

    fn unregister(&self, token: u64);

    /// True iff a locally-initiated exchange of this kind may proceed,
    /// drawing one admission from the lease received from the peer.
    fn accept(&self, kind: FrameKind) -> bool;

    /// True iff a peer-initiated exchange of this kind may proceed, drawing
    /// one admission from the lease this end granted.
    fn accept_inbound(&self, kind: FrameKind) -> bool;

    /// Replace the received lease. All fields swap atomically; no partial
    /// update is ever observable by a concurrent admission check.
    fn apply_lease(&self, count: u32, ttl: Duration);

    /// Record a lease this end granted to the peer.
    fn record_grant(&self, count: u32, ttl: Duration);
}

/// Governor used when lease admission is disabled: always accepts.
#[derive(Debug, Default)]
pub struct NullLeaseGovernor;

impl LeaseGovernor for NullLeaseGovernor {
    fn register(&self, _handle: Arc<dyn ResponderHandle>) -> u64 {
        0
    }

    fn unregister(&self, _token: u64) {}

    fn accept(&self, _kind: FrameKind) -> bool {
        true
    }

    fn accept_inbound(&self, _kind: FrameKind) -> bool {
        true
    }

    fn apply_lease(&self, _count: u32, _ttl: Duration) {}

    fn record_grant(&self, _count: u32, _ttl: Duration) {}
}

#[derive(Debug)]
struct LeaseState {
    count: u32,
    ttl: Duration,
    granted_at: Instant,
}

impl LeaseState {
    fn empty() -> Self {
        Self {
            count: 0,
            ttl: Duration::ZERO,
            granted_at: Instant::now(),
        }
    }

    fn admit(&mut self) -> bool {
        if self.count > 0 && Instant::now() < self.granted_at + self.ttl {
            self.count -= 1;
            true
        } else {
            false
        }
    }

    fn remaining(&self) -> u32 {
        if Instant::now() < self.granted_at + self.ttl {
            self.count
        } else {
            0
        }
    }
}

/// Governor enforcing count- and TTL-bounded leases, one budget per
/// direction.
///
/// Both budgets start empty: local requests are rejected until a lease is
/// received, and peer requests until one is granted.
pub struct BoundedLeaseGovernor {
    received: Mutex<LeaseState>,
    granted: Mutex<LeaseState>,
    responders: Mutex<HashMap<u64, Arc<dyn ResponderHandle>>>,
    next_token: AtomicU64,
}

impl BoundedLeaseGovernor {
    pub fn new() -> Self {
        Self {
            received: Mutex::new(LeaseState::empty()),
            granted: Mutex::new(LeaseState::empty()),
            responders: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Remaining locally-initiated admissions, TTL permitting.
    pub fn remaining(&self) -> u32 {
        self.received
            .lock()
            .expect("lease state poisoned")
            .remaining()
    }

    /// Remaining peer-initiated admissions, TTL permitting.
    pub fn granted_remaining(&self) -> u32 {
        self.granted
            .lock()
            .expect("lease state poisoned")
            .remaining()
    }

    /// Forcibly terminate every registered responder.
    pub fn shutdown(&self) {
        let responders: Vec<_> = {
            let mut map = self.responders.lock().expect("responder map poisoned");
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in responders {
            handle.terminate();
        }
    }
}

impl Default for BoundedLeaseGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseGovernor for BoundedLeaseGovernor {
    fn register(&self, handle: Arc<dyn ResponderHandle>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::AcqRel);
        self.responders
            .lock()
            .expect("responder map poisoned")
            .insert(token, handle);
        token
    }

    fn unregister(&self, token: u64) {
        self.responders
            .lock()
            .expect("responder map poisoned")
            .remove(&token);
    }

    fn accept(&self, kind: FrameKind) -> bool {
        let admitted = self.received.lock().expect("lease state poisoned").admit();
        if !admitted {
            tracing::debug!(?kind, "lease admission denied for local request");
        }
        admitted
    }

    fn accept_inbound(&self, kind: FrameKind) -> bool {
        let admitted = self.granted.lock().expect("lease state poisoned").admit();
        if !admitted {
            tracing::debug!(?kind, "lease admission denied for peer request");
        }
        admitted
    }

    fn apply_lease(&self, count: u32, ttl: Duration) {
        let mut state = self.received.lock().expect("lease state poisoned");
        *state = LeaseState {
            count,
            ttl,
            granted_at: Instant::now(),
        };
    }

    fn record_grant(&self, count: u32, ttl: Duration) {
        let mut state = self.granted.lock().expect("lease state poisoned");
        *state = LeaseState {
            count,
            ttl,
            granted_at: Instant::now(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_empty_lease_rejects_both_directions() {
        let governor = BoundedLeaseGovernor::new();
        assert!(!governor.accept(FrameKind::RequestFnf));
        assert!(!governor.accept_inbound(FrameKind::RequestFnf));
    }

    #[test]
    fn test_count_exhaustion() {
        let governor = BoundedLeaseGovernor::new();
        governor.apply_lease(2, Duration::from_secs(60));

        assert!(governor.accept(FrameKind::RequestResponse));
        assert!(governor.accept(FrameKind::RequestStream));
        assert!(!governor.accept(FrameKind::RequestFnf));
        assert_eq!(governor.remaining(), 0);
    }

    #[test]
    fn test_directions_draw_separate_budgets() {
        let governor = BoundedLeaseGovernor::new();
        governor.apply_lease(1, Duration::from_secs(60));
        governor.record_grant(2, Duration::from_secs(60));

        // Peer-initiated admissions consume the granted budget only.
        assert!(governor.accept_inbound(FrameKind::RequestResponse));
        assert!(governor.accept_inbound(FrameKind::RequestResponse));
        assert!(!governor.accept_inbound(FrameKind::RequestResponse));

        // The send budget is untouched.
        assert_eq!(governor.remaining(), 1);
        assert!(governor.accept(FrameKind::RequestFnf));
        assert!(!governor.accept(FrameKind::RequestFnf));
        assert_eq!(governor.granted_remaining(), 0);
    }

    #[test]
    fn test_expired_ttl_rejects() {
        let governor = BoundedLeaseGovernor::new();
        governor.apply_lease(10, Duration::ZERO);
        assert!(!governor.accept(FrameKind::RequestResponse));
        assert_eq!(governor.remaining(), 0);

        governor.record_grant(10, Duration::ZERO);
        assert!(!governor.accept_inbound(FrameKind::RequestResponse));
        assert_eq!(governor.granted_remaining(), 0);
    }

    #[test]
    fn test_new_lease_replaces_exhausted_one() {
        let governor = BoundedLeaseGovernor::new();
        governor.apply_lease(1, Duration::from_secs(60));
        assert!(governor.accept(FrameKind::RequestResponse));
        assert!(!governor.accept(FrameKind::RequestResponse));

        governor.apply_lease(5, Duration::from_secs(60));
        assert_eq!(governor.remaining(), 5);
        assert!(governor.accept(FrameKind::RequestResponse));
    }

    #[test]
    fn test_null_governor_always_accepts() {
        let governor = NullLeaseGovernor;
        for _ in 0..1000 {
            assert!(governor.accept(FrameKind::RequestFnf));
            assert!(governor.accept_inbound(FrameKind::RequestFnf));
        }
    }

    #[test]
    fn test_shutdown_terminates_registered_responders() {
        struct Flag(AtomicBool);
        impl ResponderHandle for Flag {
            fn terminate(&self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let governor = BoundedLeaseGovernor::new();
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let token = governor.register(flag.clone());

        governor.shutdown();
        assert!(flag.0.load(Ordering::Acquire));

        // Token is gone after shutdown; unregister is a no-op.
        governor.unregister(token);
    }

    #[test]
    fn test_unregistered_responder_not_terminated() {
        struct Flag(AtomicBool);
        impl ResponderHandle for Flag {
            fn terminate(&self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let governor = BoundedLeaseGovernor::new();
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let token = governor.register(flag.clone());
        governor.unregister(token);

        governor.shutdown();
        assert!(!flag.0.load(Ordering::Acquire));
    }
}
