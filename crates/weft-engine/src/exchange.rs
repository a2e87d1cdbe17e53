//! Per-exchange state and the application-facing handles.
//!
//! One [`Exchange`] lives in the stream registry for every non-terminal
//! interaction. Inbound frames are applied by the connection's driver task,
//! so state transitions are serialized; caller-side operations (demand,
//! cancellation) reach the exchange through atomics and channels.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_stream::Stream;
use weft_core::{DemandTracker, Payload, WeftError};

use crate::engine::EngineInner;

/// Item type of every value-carrying surface.
pub type PayloadResult = Result<Payload, WeftError>;

/// Interaction patterns that occupy a stream id (metadata push never does).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    FireAndForget,
    RequestResponse,
    RequestStream,
    RequestChannel,
}

/// Where inbound values for an exchange are delivered.
pub(crate) enum InboundSink {
    /// Request/response: exactly one terminal value.
    Once(oneshot::Sender<PayloadResult>),
    /// Stream/channel: a sequence of values.
    Many(mpsc::UnboundedSender<PayloadResult>),
}

/// Responder-side refill of the peer's send window: after enough deliveries,
/// grant the consumed demand back via REQUEST_N.
#[derive(Debug)]
pub(crate) struct RefillState {
    pub window: u32,
    pub delivered: u32,
}

impl RefillState {
    pub fn new(window: u32) -> Self {
        Self {
            window,
            delivered: 0,
        }
    }

    /// Record one delivery; returns the grant to send when the refill point
    /// is reached.
    pub fn on_delivered(&mut self) -> Option<u32> {
        self.delivered += 1;
        if self.delivered * 2 >= self.window {
            let grant = self.delivered;
            self.delivered = 0;
            Some(grant)
        } else {
            None
        }
    }
}

/// State for one in-flight exchange, keyed by stream id in the registry.
pub(crate) struct Exchange {
    pub kind: InteractionKind,
    pub sink: Option<InboundSink>,
    /// Demand we granted the peer; each inbound NEXT claims one unit.
    /// Exceeding it is a protocol violation by the peer.
    pub allowance: Option<DemandTracker>,
    /// Responder-side automatic window refill for inbound values.
    pub refill: Option<RefillState>,
    /// Demand the peer granted our outbound pump; REQUEST_N grants land here.
    pub outbound_demand: Option<DemandTracker>,
    /// Wakes the outbound pump on demand grant or cancellation.
    pub notify: Option<Arc<Notify>>,
    pub cancelled: Arc<AtomicBool>,
    /// Directions still open; the exchange is terminal at zero.
    pub open_directions: u8,
}

impl Exchange {
    /// Requester side of request/response.
    pub fn response_waiter(
        cancelled: Arc<AtomicBool>,
    ) -> (Self, oneshot::Receiver<PayloadResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                kind: InteractionKind::RequestResponse,
                sink: Some(InboundSink::Once(tx)),
                allowance: None,
                refill: None,
                outbound_demand: None,
                notify: None,
                cancelled,
                open_directions: 1,
            },
            rx,
        )
    }

    /// Requester side of request/stream.
    pub fn stream_receiver(
        allowance: DemandTracker,
        cancelled: Arc<AtomicBool>,
    ) -> (Self, mpsc::UnboundedReceiver<PayloadResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                kind: InteractionKind::RequestStream,
                sink: Some(InboundSink::Many(tx)),
                allowance: Some(allowance),
                refill: None,
                outbound_demand: None,
                notify: None,
                cancelled,
                open_directions: 1,
            },
            rx,
        )
    }

    /// Requester side of request/channel: inbound values plus an outbound
    /// pump driven by peer demand.
    pub fn channel(
        allowance: DemandTracker,
        outbound_demand: DemandTracker,
        notify: Arc<Notify>,
        cancelled: Arc<AtomicBool>,
    ) -> (Self, mpsc::UnboundedReceiver<PayloadResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                kind: InteractionKind::RequestChannel,
                sink: Some(InboundSink::Many(tx)),
                allowance: Some(allowance),
                refill: None,
                outbound_demand: Some(outbound_demand),
                notify: Some(notify),
                cancelled,
                open_directions: 2,
            },
            rx,
        )
    }

    /// Responder side of request/response: registered only so a CANCEL frame
    /// can abort the in-flight handler.
    pub fn responder_response(notify: Arc<Notify>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            kind: InteractionKind::RequestResponse,
            sink: None,
            allowance: None,
            refill: None,
            outbound_demand: None,
            notify: Some(notify),
            cancelled,
            open_directions: 1,
        }
    }

    /// Responder side of request/stream: outbound values under peer demand.
    pub fn responder_stream(
        outbound_demand: DemandTracker,
        notify: Arc<Notify>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            kind: InteractionKind::RequestStream,
            sink: None,
            allowance: None,
            refill: None,
            outbound_demand: Some(outbound_demand),
            notify: Some(notify),
            cancelled,
            open_directions: 1,
        }
    }

    /// Responder side of request/channel.
    pub fn responder_channel(
        sink: mpsc::UnboundedSender<PayloadResult>,
        allowance: DemandTracker,
        refill: RefillState,
        outbound_demand: DemandTracker,
        notify: Arc<Notify>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            kind: InteractionKind::RequestChannel,
            sink: Some(InboundSink::Many(sink)),
            allowance: Some(allowance),
            refill: Some(refill),
            outbound_demand: Some(outbound_demand),
            notify: Some(notify),
            cancelled,
            open_directions: 2,
        }
    }

    /// Terminate with an error: mark cancelled, wake the pump, and fail the
    /// consumer-facing sink.
    pub fn fail(&mut self, err: WeftError) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(notify) = &self.notify {
            notify.notify_one();
        }
        match self.sink.take() {
            Some(InboundSink::Once(tx)) => {
                let _ = tx.send(Err(err));
            }
            Some(InboundSink::Many(tx)) => {
                let _ = tx.send(Err(err));
            }
            None => {}
        }
    }
}

/// Shared handle linking an application-facing surface back to its exchange.
#[derive(Clone)]
pub(crate) struct ExchangeShared {
    pub engine: Arc<EngineInner>,
    pub stream_id: u32,
    pub cancelled: Arc<AtomicBool>,
}

impl ExchangeShared {
    fn cancel(&self) {
        self.engine.cancel_local(self.stream_id, &self.cancelled);
    }

    fn send_request_n(&self, n: u32) {
        self.engine
            .transmit(weft_core::Frame::request_n(self.stream_id, n));
    }
}

/// Resolves to the single response of a request/response exchange.
///
/// Dropping the future before it resolves cancels the exchange: a CANCEL
/// frame is sent and any response arriving later is released undelivered.
pub struct ResponseFuture {
    rx: oneshot::Receiver<PayloadResult>,
    shared: ExchangeShared,
    finished: bool,
}

impl ResponseFuture {
    pub(crate) fn new(rx: oneshot::Receiver<PayloadResult>, shared: ExchangeShared) -> Self {
        Self {
            rx,
            shared,
            finished: false,
        }
    }
}

impl Future for ResponseFuture {
    type Output = PayloadResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.finished = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.finished = true;
                Poll::Ready(Err(WeftError::ConnectionClosed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.cancel();
        }
    }
}

/// The value sequence of a request/stream or request/channel exchange.
///
/// Polling drives demand: consumed items are granted back to the peer in
/// REQUEST_N batches once the refill point is reached. Dropping the stream
/// before it terminates cancels the exchange.
pub struct PayloadStream {
    rx: mpsc::UnboundedReceiver<PayloadResult>,
    shared: ExchangeShared,
    allowance: DemandTracker,
    refill_at: u32,
    consumed: u32,
    done: bool,
}

impl PayloadStream {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<PayloadResult>,
        shared: ExchangeShared,
        allowance: DemandTracker,
        window: u32,
    ) -> Self {
        Self {
            rx,
            shared,
            allowance,
            refill_at: (window / 2).max(1),
            consumed: 0,
            done: false,
        }
    }
}

impl Stream for PayloadStream {
    type Item = PayloadResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(payload))) => {
                this.consumed += 1;
                if this.consumed >= this.refill_at {
                    this.allowance.grant(this.consumed);
                    this.shared.send_request_n(this.consumed);
                    this.consumed = 0;
                }
                Poll::Ready(Some(Ok(payload)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PayloadStream {
    fn drop(&mut self) {
        if !self.done {
            self.shared.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refill_grants_at_half_window() {
        let mut refill = RefillState::new(8);
        for _ in 0..3 {
            assert_eq!(refill.on_delivered(), None);
        }
        assert_eq!(refill.on_delivered(), Some(4));
        // Counter resets after a grant.
        assert_eq!(refill.on_delivered(), None);
    }

    #[test]
    fn test_refill_window_of_one() {
        let mut refill = RefillState::new(1);
        assert_eq!(refill.on_delivered(), Some(1));
        assert_eq!(refill.on_delivered(), Some(1));
    }

    #[test]
    fn test_exchange_fail_closes_sink() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (mut exchange, mut rx) = Exchange::response_waiter(cancelled.clone());

        exchange.fail(WeftError::ConnectionClosed);
        assert!(cancelled.load(Ordering::Acquire));
        assert!(matches!(
            rx.try_recv(),
            Ok(Err(WeftError::ConnectionClosed))
        ));
    }
}
