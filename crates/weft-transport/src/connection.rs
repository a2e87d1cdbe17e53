//! The duplex connection boundary consumed by the protocol engine.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use weft_core::Allocator;

/// One physical channel carrying encoded frames in both directions.
///
/// Implementations must preserve per-connection submission order, except that
/// frames addressed to stream 0 may be transmitted ahead of queued data
/// frames. A batch submitted through [`send_batch`](Self::send_batch) is
/// atomic: no other frame is ever interleaved inside it, which is how a
/// fragment train stays contiguous on the wire.
pub trait DuplexConnection: Send + Sync + 'static {
    /// Enqueue one encoded frame for transmission.
    fn send_frame(&self, stream_id: u32, frame: Bytes);

    /// Enqueue a contiguous batch of frames (a fragment train).
    fn send_batch(&self, frames: Vec<Bytes>);

    /// Take the inbound frame sequence. Yields each frame exactly once, in
    /// arrival order; ownership of every buffer transfers to the caller.
    /// Returns `None` after the first call.
    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Bytes>>;

    /// Transmit a connection-level error frame on stream 0, then dispose.
    fn send_error_and_close(&self, code: u32, message: &str);

    /// The payload allocator shared by everything on this connection.
    fn allocator(&self) -> Arc<dyn Allocator>;

    /// Complete the outbound sink and fire the close signal. Idempotent.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;

    /// A listener for the close signal. Fires exactly once; observable after
    /// the fact.
    fn on_close(&self) -> CloseListener;
}

/// Single-fire close signal, owned by the connection.
#[derive(Debug)]
pub struct CloseNotifier {
    tx: watch::Sender<bool>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fire the signal. Later calls are no-ops.
    pub fn notify(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> CloseListener {
        CloseListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaits the close signal; resolves immediately if it already fired.
#[derive(Debug, Clone)]
pub struct CloseListener {
    rx: watch::Receiver<bool>,
}

impl CloseListener {
    pub async fn wait(mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_signal_fires_once() {
        let notifier = CloseNotifier::new();
        let listener = notifier.listener();
        assert!(!listener.is_closed());

        notifier.notify();
        notifier.notify();
        assert!(notifier.is_closed());

        // Resolves even though the signal fired before we awaited.
        tokio::time::timeout(Duration::from_secs(1), listener.wait())
            .await
            .expect("close listener did not resolve");
    }

    #[tokio::test]
    async fn test_listener_observes_late_subscription() {
        let notifier = CloseNotifier::new();
        notifier.notify();
        let listener = notifier.listener();
        assert!(listener.is_closed());
    }
}
