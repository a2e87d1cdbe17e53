//! In-process duplex connection.
//!
//! [`local_pair`] returns two connected ends inside one process. Each end
//! owns an outbound queue drained by a pump task into the peer's inbound
//! channel. Stream-0 frames jump ahead of queued data batches, but a batch
//! (a fragment train) is always forwarded contiguously.

use crate::connection::{CloseListener, CloseNotifier, DuplexConnection};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use weft_core::{Allocator, Frame};

#[derive(Debug, Default)]
struct QueueInner {
    priority: VecDeque<Bytes>,
    normal: VecDeque<Vec<Bytes>>,
    closed: bool,
}

/// Outbound frame queue with stream-0 priority between atomic batches.
#[derive(Debug, Default)]
struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl OutboundQueue {
    fn push(&self, stream_id: u32, frame: Bytes) {
        let mut inner = self.inner.lock().expect("outbound queue poisoned");
        if inner.closed {
            return;
        }
        if stream_id == 0 {
            inner.priority.push_back(frame);
        } else {
            inner.normal.push_back(vec![frame]);
        }
        drop(inner);
        self.notify.notify_one();
    }

    fn push_batch(&self, frames: Vec<Bytes>) {
        if frames.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("outbound queue poisoned");
        if inner.closed {
            return;
        }
        inner.normal.push_back(frames);
        drop(inner);
        self.notify.notify_one();
    }

    /// Next transmission unit: priority frames first, then one whole batch.
    fn pop(&self) -> Option<Vec<Bytes>> {
        let mut inner = self.inner.lock().expect("outbound queue poisoned");
        if let Some(frame) = inner.priority.pop_front() {
            return Some(vec![frame]);
        }
        inner.normal.pop_front()
    }

    fn close(&self) {
        let mut inner = self.inner.lock().expect("outbound queue poisoned");
        inner.closed = true;
        drop(inner);
        self.notify.notify_one();
    }

    fn is_drained(&self) -> bool {
        let inner = self.inner.lock().expect("outbound queue poisoned");
        inner.closed && inner.priority.is_empty() && inner.normal.is_empty()
    }
}

/// An end of an in-process connection pair.
pub struct LocalDuplexConnection {
    queue: Arc<OutboundQueue>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    allocator: Arc<dyn Allocator>,
    on_close: CloseNotifier,
    disposed: AtomicBool,
}

impl LocalDuplexConnection {
    fn new(
        allocator: Arc<dyn Allocator>,
        peer_tx: mpsc::UnboundedSender<Bytes>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        let queue = Arc::new(OutboundQueue::default());
        tokio::spawn(pump(Arc::clone(&queue), peer_tx));
        Self {
            queue,
            inbound: Mutex::new(Some(inbound)),
            allocator,
            on_close: CloseNotifier::new(),
            disposed: AtomicBool::new(false),
        }
    }
}

/// Forwards queued frames into the peer's inbound channel until the queue is
/// closed and drained.
async fn pump(queue: Arc<OutboundQueue>, peer_tx: mpsc::UnboundedSender<Bytes>) {
    loop {
        let notified = queue.notify.notified();
        while let Some(batch) = queue.pop() {
            for frame in batch {
                if peer_tx.send(frame).is_err() {
                    // Peer end dropped its receiver; nothing left to deliver.
                    return;
                }
            }
        }
        if queue.is_drained() {
            return;
        }
        notified.await;
    }
}

impl DuplexConnection for LocalDuplexConnection {
    fn send_frame(&self, stream_id: u32, frame: Bytes) {
        self.queue.push(stream_id, frame);
    }

    fn send_batch(&self, frames: Vec<Bytes>) {
        self.queue.push_batch(frames);
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound.lock().expect("inbound lock poisoned").take()
    }

    fn send_error_and_close(&self, code: u32, message: &str) {
        if !self.is_disposed() {
            let frame = Frame::error(0, code, message).encode();
            self.queue.push(0, frame);
        }
        self.dispose();
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.allocator)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.close();
        self.on_close.notify();
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn on_close(&self) -> CloseListener {
        self.on_close.listener()
    }
}

/// Two connected in-process ends sharing one allocator. Must be called from
/// within a tokio runtime; each end spawns its outbound pump task.
pub fn local_pair(
    allocator: Arc<dyn Allocator>,
) -> (LocalDuplexConnection, LocalDuplexConnection) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = LocalDuplexConnection::new(Arc::clone(&allocator), b_tx, a_rx);
    let b = LocalDuplexConnection::new(allocator, a_tx, b_rx);
    (a, b)
}
