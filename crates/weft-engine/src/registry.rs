//! Stream id allocation and the id → exchange map.
//!
//! Requester-assigned ids are odd on the client side and even on the server
//! side, so the two peers' self-issued ids never collide. An id is present
//! in the map iff its exchange is non-terminal; ids are reused only after
//! the counter wraps, and never while the prior exchange is still live.

use crate::exchange::Exchange;
use std::collections::HashMap;
use std::sync::Mutex;
use weft_core::MAX_STREAM_ID;

/// Which end of the connection this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiated the connection; allocates odd stream ids.
    Client,
    /// Accepted the connection; allocates even stream ids.
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

struct RegistryInner {
    exchanges: HashMap<u32, Exchange>,
    next_id: u32,
}

/// Maps stream id to exchange state.
pub(crate) struct StreamRegistry {
    role: Role,
    inner: Mutex<RegistryInner>,
}

impl StreamRegistry {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            inner: Mutex::new(RegistryInner {
                exchanges: HashMap::new(),
                next_id: role.first_stream_id(),
            }),
        }
    }

    fn advance(&self, inner: &mut RegistryInner) -> u32 {
        loop {
            let id = inner.next_id;
            let next = id + 2;
            inner.next_id = if next > MAX_STREAM_ID {
                self.role.first_stream_id()
            } else {
                next
            };
            if !inner.exchanges.contains_key(&id) {
                return id;
            }
        }
    }

    /// Allocate the next free local id and register the exchange under it.
    pub fn allocate(&self, exchange: Exchange) -> u32 {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let id = self.advance(&mut inner);
        inner.exchanges.insert(id, exchange);
        id
    }

    /// Allocate an id for an exchange that is terminal on transmission
    /// (fire-and-forget); nothing is registered.
    pub fn next_stream_id(&self) -> u32 {
        let mut inner = self.inner.lock().expect("registry poisoned");
        self.advance(&mut inner)
    }

    /// Register a peer-assigned id (responder side).
    pub fn insert(&self, stream_id: u32, exchange: Exchange) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.exchanges.insert(stream_id, exchange);
    }

    pub fn remove(&self, stream_id: u32) -> Option<Exchange> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.exchanges.remove(&stream_id)
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.exchanges.contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.exchanges.len()
    }

    /// Run `f` against the exchange for `stream_id`, if live.
    pub fn with<R>(&self, stream_id: u32, f: impl FnOnce(&mut Exchange) -> R) -> Option<R> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.exchanges.get_mut(&stream_id).map(f)
    }

    /// Close one direction of an exchange; removes it once both are closed.
    /// Closing the inbound direction also drops the consumer-facing sink.
    pub fn complete_direction(&self, stream_id: u32, inbound: bool) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let remove = match inner.exchanges.get_mut(&stream_id) {
            Some(exchange) => {
                if inbound {
                    exchange.sink = None;
                }
                exchange.open_directions = exchange.open_directions.saturating_sub(1);
                exchange.open_directions == 0
            }
            None => false,
        };
        if remove {
            inner.exchanges.remove(&stream_id);
        }
    }

    /// Remove every live exchange (connection teardown).
    pub fn drain(&self) -> Vec<(u32, Exchange)> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.exchanges.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use weft_core::DemandTracker;

    fn exchange() -> Exchange {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (exchange, _rx) = Exchange::stream_receiver(DemandTracker::new(1), cancelled);
        exchange
    }

    #[test]
    fn test_client_ids_are_odd_and_monotonic() {
        let registry = StreamRegistry::new(Role::Client);
        assert_eq!(registry.allocate(exchange()), 1);
        assert_eq!(registry.allocate(exchange()), 3);
        assert_eq!(registry.next_stream_id(), 5);
    }

    #[test]
    fn test_server_ids_are_even() {
        let registry = StreamRegistry::new(Role::Server);
        assert_eq!(registry.allocate(exchange()), 2);
        assert_eq!(registry.allocate(exchange()), 4);
    }

    #[test]
    fn test_id_not_reused_while_live() {
        let registry = StreamRegistry::new(Role::Client);
        let id = registry.allocate(exchange());
        assert!(registry.contains(id));

        // Id is free again only after the exchange is removed.
        registry.remove(id).unwrap();
        assert!(!registry.contains(id));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_wrap_skips_live_ids() {
        let registry = StreamRegistry::new(Role::Client);
        {
            let mut inner = registry.inner.lock().unwrap();
            inner.next_id = MAX_STREAM_ID; // odd: 2^31 - 1
        }
        let id = registry.allocate(exchange());
        assert_eq!(id, MAX_STREAM_ID);

        // Counter wrapped; the live id is skipped.
        {
            let mut inner = registry.inner.lock().unwrap();
            inner.next_id = MAX_STREAM_ID;
        }
        assert_eq!(registry.next_stream_id(), 1);
    }

    #[test]
    fn test_complete_both_directions_removes() {
        let registry = StreamRegistry::new(Role::Client);
        let cancelled = Arc::new(AtomicBool::new(false));
        let (ex, _rx) = Exchange::channel(
            DemandTracker::new(1),
            DemandTracker::new(0),
            Arc::new(tokio::sync::Notify::new()),
            cancelled,
        );
        let id = registry.allocate(ex);

        registry.complete_direction(id, false);
        assert!(registry.contains(id));
        registry.complete_direction(id, true);
        assert!(!registry.contains(id));
    }
}
