//! Demand (REQUEST_N) accounting for streaming exchanges.
//!
//! Demand-based flow control prevents a producer from emitting more items
//! than the consumer has granted. The sender claims one unit per value frame;
//! the receiver uses the same counter to detect demand overrun by the peer.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Default demand window granted with a new stream or channel exchange.
pub const DEFAULT_DEMAND_WINDOW: u32 = 64;

/// Consumed-item threshold at which the consumer grants a refill.
pub const DEFAULT_DEMAND_REFILL: u32 = 32;

/// Linearizable outstanding-demand counter.
///
/// Signed and saturating: concurrent grant and claim from different threads
/// can never race past zero or overflow.
#[derive(Debug, Clone)]
pub struct DemandTracker {
    demand: Arc<AtomicI64>,
}

impl DemandTracker {
    pub fn new(initial: u32) -> Self {
        Self {
            demand: Arc::new(AtomicI64::new(i64::from(initial))),
        }
    }

    /// Grant `n` additional items of demand, saturating at `i64::MAX`.
    pub fn grant(&self, n: u32) {
        let mut current = self.demand.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(i64::from(n));
            match self.demand.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Claim one unit of demand. Returns false when none is outstanding.
    pub fn try_claim(&self) -> bool {
        let mut current = self.demand.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match self.demand.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn available(&self) -> i64 {
        self.demand.load(Ordering::Acquire)
    }
}

impl Default for DemandTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_exhaustion() {
        let demand = DemandTracker::new(2);
        assert!(demand.try_claim());
        assert!(demand.try_claim());
        assert!(!demand.try_claim());
        assert_eq!(demand.available(), 0);
    }

    #[test]
    fn test_grant_restores_demand() {
        let demand = DemandTracker::new(0);
        assert!(!demand.try_claim());

        demand.grant(3);
        assert_eq!(demand.available(), 3);
        assert!(demand.try_claim());
    }

    #[test]
    fn test_grant_saturates() {
        let demand = DemandTracker::new(u32::MAX);
        for _ in 0..4 {
            demand.grant(u32::MAX);
        }
        assert!(demand.available() > 0);
        assert!(demand.try_claim());
    }

    #[test]
    fn test_concurrent_claims_never_go_negative() {
        let demand = DemandTracker::new(100);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let demand = demand.clone();
            handles.push(std::thread::spawn(move || {
                let mut claimed = 0u32;
                while demand.try_claim() {
                    claimed += 1;
                }
                claimed
            }));
        }
        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
        assert_eq!(demand.available(), 0);
    }
}
