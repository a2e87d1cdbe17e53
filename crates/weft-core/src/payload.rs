//! Payload buffers and allocator instrumentation.
//!
//! A [`Payload`] is move-only: whoever holds it is its single owner, and the
//! drop releases it. Leak accounting is opt-in through [`TrackingAllocator`],
//! which is injected into the connection and engine constructors; there is no
//! global allocator state.

use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A binary message value: optional metadata plus data.
///
/// Not `Clone`: exactly one owner releases it, enforced by the type system.
#[derive(Debug)]
pub struct Payload {
    metadata: Option<Bytes>,
    data: Bytes,
    _guard: Option<AllocationGuard>,
}

impl Payload {
    /// An untracked payload, for callers that do not route through an
    /// allocator.
    pub fn new(metadata: Option<Bytes>, data: Bytes) -> Self {
        Self {
            metadata,
            data,
            _guard: None,
        }
    }

    pub fn from_static(data: &'static [u8]) -> Self {
        Self::new(None, Bytes::from_static(data))
    }

    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Split into raw sections. Releases the allocation: the bytes leave the
    /// tracked lifecycle.
    pub fn into_parts(self) -> (Option<Bytes>, Bytes) {
        (self.metadata, self.data)
    }
}

/// Allocates payload buffers. Injected, never global; tests supply a
/// [`TrackingAllocator`] to verify that every buffer is released.
pub trait Allocator: Send + Sync + 'static {
    fn allocate(&self, metadata: Option<Bytes>, data: Bytes) -> Payload;
}

/// Production allocator: no instrumentation attached.
#[derive(Debug, Default, Clone)]
pub struct DefaultAllocator;

impl Allocator for DefaultAllocator {
    fn allocate(&self, metadata: Option<Bytes>, data: Bytes) -> Payload {
        Payload::new(metadata, data)
    }
}

/// Leak-accounting allocator for instrumented builds and tests.
///
/// Every allocated payload carries a guard that decrements the live count on
/// drop. `outstanding() == 0` after disposal means every buffer that entered
/// the engine was released exactly once.
#[derive(Debug, Default, Clone)]
pub struct TrackingAllocator {
    live: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl TrackingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads allocated and not yet dropped.
    pub fn outstanding(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Payloads allocated over the allocator's lifetime.
    pub fn total_allocated(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }
}

impl Allocator for TrackingAllocator {
    fn allocate(&self, metadata: Option<Bytes>, data: Bytes) -> Payload {
        self.live.fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::AcqRel);
        Payload {
            metadata,
            data,
            _guard: Some(AllocationGuard {
                live: Arc::clone(&self.live),
            }),
        }
    }
}

#[derive(Debug)]
struct AllocationGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_counts_live_payloads() {
        let allocator = TrackingAllocator::new();
        let a = allocator.allocate(None, Bytes::from_static(b"a"));
        let b = allocator.allocate(Some(Bytes::from_static(b"m")), Bytes::from_static(b"b"));
        assert_eq!(allocator.outstanding(), 2);

        drop(a);
        assert_eq!(allocator.outstanding(), 1);

        drop(b);
        assert_eq!(allocator.outstanding(), 0);
        assert_eq!(allocator.total_allocated(), 2);
    }

    #[test]
    fn test_into_parts_releases() {
        let allocator = TrackingAllocator::new();
        let payload = allocator.allocate(None, Bytes::from_static(b"x"));
        let (_, data) = payload.into_parts();
        assert_eq!(&data[..], b"x");
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_default_allocator_untracked() {
        let payload = DefaultAllocator.allocate(None, Bytes::from_static(b"y"));
        assert_eq!(&payload.data()[..], b"y");
        assert!(payload.metadata().is_none());
    }
}
