//! The protocol engine: frame routing, exchange lifecycle, and the
//! requester surface.
//!
//! One driver task per connection consumes the inbound frame sequence,
//! reassembles fragments, and routes strictly in arrival order: stream 0 to
//! the connection-level handlers, everything else to the registry. Outbound
//! frames pass the fragmenter; a fragment train is submitted as one atomic
//! batch so no control frame can land inside it.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use weft_core::{
    codes, Allocator, DemandTracker, Fragmenter, Frame, FrameFlags, FrameKind, Payload,
    Reassembler, WeftError, DEFAULT_DEMAND_WINDOW,
};
use weft_transport::{CloseListener, DuplexConnection};

use crate::exchange::{
    Exchange, ExchangeShared, InboundSink, PayloadStream, RefillState, ResponseFuture,
};
use crate::lease::{LeaseGovernor, NullLeaseGovernor, ResponderHandle};
use crate::registry::{Role, StreamRegistry};
use crate::responder::{NoopResponder, Responder};

type MetadataHandler = Arc<dyn Fn(Payload) + Send + Sync>;

pub(crate) struct EngineInner {
    pub(crate) connection: Arc<dyn DuplexConnection>,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) registry: StreamRegistry,
    pub(crate) lease: Arc<dyn LeaseGovernor>,
    fragmenter: Option<Fragmenter>,
    responder: Arc<dyn Responder>,
    metadata_handler: Option<MetadataHandler>,
}

impl EngineInner {
    /// Encode and enqueue a frame, splitting oversized ones into an atomic
    /// fragment batch.
    pub(crate) fn transmit(&self, frame: Frame) {
        let stream_id = frame.stream_id;
        match &self.fragmenter {
            Some(fragmenter) => {
                let mut fragments = fragmenter.split(frame);
                if fragments.len() > 1 {
                    self.connection
                        .send_batch(fragments.iter().map(Frame::encode).collect());
                } else if let Some(single) = fragments.pop() {
                    self.connection.send_frame(stream_id, single.encode());
                }
            }
            None => self.connection.send_frame(stream_id, frame.encode()),
        }
    }

    /// Caller-initiated cancellation: one-shot per exchange. Removes the
    /// registry entry, wakes the outbound pump, and tells the peer.
    pub(crate) fn cancel_local(&self, stream_id: u32, cancelled: &Arc<AtomicBool>) {
        if cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(exchange) = self.registry.remove(stream_id) {
            exchange.cancelled.store(true, Ordering::Release);
            if let Some(notify) = &exchange.notify {
                notify.notify_one();
            }
            if !self.connection.is_disposed() {
                self.transmit(Frame::cancel(stream_id));
            }
        }
    }
}

/// Terminates a registered responder by disposing its connection.
struct ConnectionHandle(Arc<dyn DuplexConnection>);

impl ResponderHandle for ConnectionHandle {
    fn terminate(&self) {
        self.0.dispose();
    }
}

/// Configures and starts a protocol engine on one connection end.
pub struct EngineBuilder {
    connection: Arc<dyn DuplexConnection>,
    role: Role,
    max_fragment_size: Option<usize>,
    lease: Arc<dyn LeaseGovernor>,
    responder: Arc<dyn Responder>,
    metadata_handler: Option<MetadataHandler>,
}

impl EngineBuilder {
    pub fn new(connection: impl DuplexConnection, role: Role) -> Self {
        Self {
            connection: Arc::new(connection),
            role,
            max_fragment_size: None,
            lease: Arc::new(NullLeaseGovernor),
            responder: Arc::new(NoopResponder),
            metadata_handler: None,
        }
    }

    /// Fragment outbound frames whose payload exceeds `size` bytes.
    /// Fragmentation is off by default.
    pub fn max_fragment_size(mut self, size: usize) -> Self {
        self.max_fragment_size = Some(size);
        self
    }

    pub fn lease_governor(mut self, governor: Arc<dyn LeaseGovernor>) -> Self {
        self.lease = governor;
        self
    }

    pub fn responder(mut self, responder: impl Responder) -> Self {
        self.responder = Arc::new(responder);
        self
    }

    pub fn on_metadata_push(
        mut self,
        handler: impl Fn(Payload) + Send + Sync + 'static,
    ) -> Self {
        self.metadata_handler = Some(Arc::new(handler));
        self
    }

    /// Spawn the driver task and return the requester surface.
    pub fn start(self) -> Requester {
        let allocator = self.connection.allocator();
        let receiver = self.connection.take_receiver();
        let inner = Arc::new(EngineInner {
            allocator,
            registry: StreamRegistry::new(self.role),
            lease: self.lease,
            fragmenter: self.max_fragment_size.map(Fragmenter::new),
            responder: self.responder,
            metadata_handler: self.metadata_handler,
            connection: self.connection,
        });
        let token = inner
            .lease
            .register(Arc::new(ConnectionHandle(Arc::clone(&inner.connection))));
        if self.role == Role::Client {
            inner.transmit(Frame::setup());
        }
        match receiver {
            Some(rx) => {
                tokio::spawn(run_driver(Arc::clone(&inner), rx, token));
            }
            None => tracing::error!("connection receiver already taken; engine not started"),
        }
        Requester { inner }
    }
}

/// The application-facing interaction surface of one connection end.
#[derive(Clone)]
pub struct Requester {
    inner: Arc<EngineInner>,
}

impl Requester {
    fn ensure_open(&self) -> Result<(), WeftError> {
        if self.inner.connection.is_disposed() {
            Err(WeftError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Send a request with no response. Completes once the frame is accepted
    /// by the connection; rejected locally when the lease denies admission.
    pub fn fire_and_forget(&self, payload: Payload) -> Result<(), WeftError> {
        self.ensure_open()?;
        if !self.inner.lease.accept(FrameKind::RequestFnf) {
            return Err(WeftError::Rejected);
        }
        let stream_id = self.inner.registry.next_stream_id();
        let (metadata, data) = payload.into_parts();
        self.inner
            .transmit(Frame::request(FrameKind::RequestFnf, stream_id, metadata, data, 0));
        Ok(())
    }

    /// Send a request expecting exactly one response. Dropping the returned
    /// future before it resolves cancels the exchange.
    pub fn request_response(&self, payload: Payload) -> Result<ResponseFuture, WeftError> {
        self.ensure_open()?;
        if !self.inner.lease.accept(FrameKind::RequestResponse) {
            return Err(WeftError::Rejected);
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let (exchange, rx) = Exchange::response_waiter(Arc::clone(&cancelled));
        let stream_id = self.inner.registry.allocate(exchange);
        let (metadata, data) = payload.into_parts();
        self.inner.transmit(Frame::request(
            FrameKind::RequestResponse,
            stream_id,
            metadata,
            data,
            0,
        ));
        Ok(ResponseFuture::new(
            rx,
            ExchangeShared {
                engine: Arc::clone(&self.inner),
                stream_id,
                cancelled,
            },
        ))
    }

    /// Send a request for a stream of responses. Demand is granted to the
    /// responder as the returned stream is polled.
    pub fn request_stream(&self, payload: Payload) -> Result<PayloadStream, WeftError> {
        self.ensure_open()?;
        if !self.inner.lease.accept(FrameKind::RequestStream) {
            return Err(WeftError::Rejected);
        }
        let window = DEFAULT_DEMAND_WINDOW;
        let allowance = DemandTracker::new(window);
        let cancelled = Arc::new(AtomicBool::new(false));
        let (exchange, rx) = Exchange::stream_receiver(allowance.clone(), Arc::clone(&cancelled));
        let stream_id = self.inner.registry.allocate(exchange);
        let (metadata, data) = payload.into_parts();
        self.inner.transmit(Frame::request(
            FrameKind::RequestStream,
            stream_id,
            metadata,
            data,
            window,
        ));
        Ok(PayloadStream::new(
            rx,
            ExchangeShared {
                engine: Arc::clone(&self.inner),
                stream_id,
                cancelled,
            },
            allowance,
            window,
        ))
    }

    /// Open a bidirectional channel. The first outbound payload rides the
    /// request frame; an empty source surfaces as a cancellation error since
    /// the protocol has no encoding for an empty channel.
    pub fn request_channel(
        &self,
        source: impl Stream<Item = Payload> + Send + 'static,
    ) -> Result<PayloadStream, WeftError> {
        self.ensure_open()?;
        if !self.inner.lease.accept(FrameKind::RequestChannel) {
            return Err(WeftError::Rejected);
        }
        let window = DEFAULT_DEMAND_WINDOW;
        let allowance = DemandTracker::new(window);
        let demand = DemandTracker::new(0);
        let notify = Arc::new(Notify::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        let (exchange, rx) = Exchange::channel(
            allowance.clone(),
            demand.clone(),
            Arc::clone(&notify),
            Arc::clone(&cancelled),
        );
        let stream_id = self.inner.registry.allocate(exchange);
        tokio::spawn(run_channel_outbound(
            Arc::clone(&self.inner),
            stream_id,
            Box::pin(source),
            demand,
            notify,
            Arc::clone(&cancelled),
            window,
        ));
        Ok(PayloadStream::new(
            rx,
            ExchangeShared {
                engine: Arc::clone(&self.inner),
                stream_id,
                cancelled,
            },
            allowance,
            window,
        ))
    }

    /// Push out-of-band metadata on stream 0.
    ///
    /// Only the metadata section reaches the wire: a payload carrying both
    /// sections has its data released undelivered, and a payload built
    /// without a metadata section sends its data bytes as the metadata.
    pub fn metadata_push(&self, payload: Payload) -> Result<(), WeftError> {
        self.ensure_open()?;
        let (metadata, data) = payload.into_parts();
        self.inner
            .transmit(Frame::metadata_push(metadata.unwrap_or(data)));
        Ok(())
    }

    /// Grant the peer a lease of `count` new exchanges within `ttl`. The
    /// grant also arms the local governor's inbound budget, which admits the
    /// peer's requests on receipt.
    pub fn grant_lease(&self, count: u32, ttl: Duration) -> Result<(), WeftError> {
        self.ensure_open()?;
        self.inner.lease.record_grant(count, ttl);
        self.inner.transmit(Frame::lease(count, ttl));
        Ok(())
    }

    pub fn dispose(&self) {
        self.inner.connection.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.connection.is_disposed()
    }

    pub fn on_close(&self) -> CloseListener {
        self.inner.connection.on_close()
    }

    /// Live (non-terminal) exchanges on this end.
    pub fn pending_exchanges(&self) -> usize {
        self.inner.registry.len()
    }
}

/// Consumes the inbound frame sequence until the connection closes or a
/// protocol violation occurs.
async fn run_driver(
    inner: Arc<EngineInner>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    lease_token: u64,
) {
    let mut reassembler = Reassembler::new();
    let close = inner.connection.on_close();
    let reason = loop {
        let buf = tokio::select! {
            _ = close.clone().wait() => break WeftError::ConnectionClosed,
            received = rx.recv() => match received {
                Some(buf) => buf,
                None => break WeftError::ConnectionClosed,
            },
        };
        let frame = match Frame::decode(buf) {
            Ok(frame) => frame,
            Err(err) => break fail_connection(&inner, WeftError::from(err)),
        };
        let frame = match reassembler.accept(frame) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err) => break fail_connection(&inner, WeftError::from(err)),
        };
        tracing::trace!(stream_id = frame.stream_id, kind = ?frame.kind, "routing frame");
        if let Err(err) = route(&inner, frame) {
            break fail_connection(&inner, err);
        }
    };
    teardown(&inner, reason, lease_token);
}

/// Dispose the connection over a terminal condition; local violations are
/// reported to the peer first.
fn fail_connection(inner: &Arc<EngineInner>, err: WeftError) -> WeftError {
    match &err {
        WeftError::Protocol(_) | WeftError::Frame(_) => {
            tracing::error!(%err, "protocol violation; closing connection");
            inner
                .connection
                .send_error_and_close(err.wire_code(), &err.to_string());
        }
        _ => inner.connection.dispose(),
    }
    err
}

fn teardown(inner: &Arc<EngineInner>, reason: WeftError, lease_token: u64) {
    inner.connection.dispose();
    inner.lease.unregister(lease_token);
    for (stream_id, mut exchange) in inner.registry.drain() {
        tracing::debug!(stream_id, kind = ?exchange.kind, "failing exchange on connection close");
        exchange.fail(reason.clone());
    }
}

fn route(inner: &Arc<EngineInner>, frame: Frame) -> Result<(), WeftError> {
    if frame.stream_id == 0 {
        return route_connection(inner, frame);
    }
    match frame.kind {
        FrameKind::Payload => route_payload(inner, frame),
        FrameKind::Error => route_error(inner, frame),
        FrameKind::Cancel => {
            if let Some(exchange) = inner.registry.remove(frame.stream_id) {
                exchange.cancelled.store(true, Ordering::Release);
                // notify_one stores a permit, so a task that has not yet
                // started waiting still observes the cancellation.
                if let Some(notify) = &exchange.notify {
                    notify.notify_one();
                }
            }
            Ok(())
        }
        FrameKind::RequestN => {
            let known = inner.registry.with(frame.stream_id, |exchange| {
                if let Some(demand) = &exchange.outbound_demand {
                    demand.grant(frame.value);
                }
                if let Some(notify) = &exchange.notify {
                    notify.notify_one();
                }
            });
            if known.is_none() {
                tracing::warn!(stream_id = frame.stream_id, "REQUEST_N for unknown stream dropped");
            }
            Ok(())
        }
        kind if kind.is_request() => respond(inner, frame),
        kind => {
            tracing::warn!(stream_id = frame.stream_id, ?kind, "unexpected frame dropped");
            Ok(())
        }
    }
}

fn route_connection(inner: &Arc<EngineInner>, frame: Frame) -> Result<(), WeftError> {
    match frame.kind {
        FrameKind::Setup => {
            tracing::debug!("peer setup received");
            Ok(())
        }
        FrameKind::Lease => {
            let ttl = frame.decode_lease_ttl().unwrap_or(Duration::ZERO);
            inner.lease.apply_lease(frame.value, ttl);
            Ok(())
        }
        FrameKind::Keepalive => {
            if frame.flags.contains(FrameFlags::RESPOND) {
                inner.transmit(Frame::keepalive(false, frame.data));
            }
            Ok(())
        }
        FrameKind::MetadataPush => {
            if let Some(handler) = &inner.metadata_handler {
                let payload = inner.allocator.allocate(frame.metadata, Bytes::new());
                handler(payload);
            }
            Ok(())
        }
        FrameKind::Error => {
            let err = WeftError::from_wire(frame.value, frame.error_message());
            tracing::error!(%err, "connection error from peer");
            // Peer-reported: close without echoing the error back.
            inner.connection.dispose();
            Err(err)
        }
        kind => {
            tracing::warn!(?kind, "unexpected connection-level frame dropped");
            Ok(())
        }
    }
}

fn route_payload(inner: &Arc<EngineInner>, frame: Frame) -> Result<(), WeftError> {
    let stream_id = frame.stream_id;
    let is_next = frame.flags.is_next();
    let is_complete = frame.flags.is_complete();
    let Frame { metadata, data, .. } = frame;

    let mut overrun = false;
    let mut refill_grant = None;
    let mut inbound_done = false;

    let known = inner.registry.with(stream_id, |exchange| {
        if exchange.cancelled.load(Ordering::Acquire) {
            // Dropped undelivered; the frame's buffers are released here.
            return;
        }
        if is_next {
            if let Some(allowance) = &exchange.allowance {
                if !allowance.try_claim() {
                    overrun = true;
                    return;
                }
            }
            let payload = inner.allocator.allocate(metadata, data);
            match &mut exchange.sink {
                Some(InboundSink::Once(_)) => {
                    if let Some(InboundSink::Once(tx)) = exchange.sink.take() {
                        let _ = tx.send(Ok(payload));
                    }
                    inbound_done = true;
                }
                Some(InboundSink::Many(tx)) => {
                    if tx.send(Ok(payload)).is_err() {
                        tracing::debug!(stream_id, "consumer gone; payload dropped");
                    } else if let Some(refill) = &mut exchange.refill {
                        if let Some(grant) = refill.on_delivered() {
                            if let Some(allowance) = &exchange.allowance {
                                allowance.grant(grant);
                            }
                            refill_grant = Some(grant);
                        }
                    }
                }
                None => {
                    tracing::warn!(stream_id, "value frame for outbound-only exchange dropped");
                }
            }
        }
        if is_complete {
            inbound_done = true;
        }
    });

    if known.is_none() {
        tracing::warn!(stream_id, "payload frame for unknown stream dropped");
        return Ok(());
    }
    if overrun {
        return Err(WeftError::Protocol(format!(
            "demand overrun on stream {stream_id}"
        )));
    }
    if let Some(grant) = refill_grant {
        inner.transmit(Frame::request_n(stream_id, grant));
    }
    if inbound_done {
        inner.registry.complete_direction(stream_id, true);
    }
    Ok(())
}

fn route_error(inner: &Arc<EngineInner>, frame: Frame) -> Result<(), WeftError> {
    let stream_id = frame.stream_id;
    let err = WeftError::from_wire(frame.value, frame.error_message());
    match inner.registry.remove(stream_id) {
        Some(mut exchange) => exchange.fail(err),
        None => tracing::warn!(stream_id, "error frame for unknown stream dropped"),
    }
    Ok(())
}

/// Dispatch a request-initiating frame to the installed responder.
fn respond(inner: &Arc<EngineInner>, frame: Frame) -> Result<(), WeftError> {
    let stream_id = frame.stream_id;
    if inner.registry.contains(stream_id) {
        return Err(WeftError::Protocol(format!(
            "request on stream {stream_id} already in use"
        )));
    }
    if !inner.lease.accept_inbound(frame.kind) {
        if frame.kind != FrameKind::RequestFnf {
            inner.transmit(Frame::error(stream_id, codes::REJECTED, "lease exhausted"));
        }
        return Ok(());
    }

    let kind = frame.kind;
    let initial_demand = frame.value;
    let payload = inner.allocator.allocate(frame.metadata, frame.data);

    match kind {
        FrameKind::RequestFnf => {
            let fut = inner.responder.fire_and_forget(payload);
            tokio::spawn(async move {
                if let Err(err) = fut.await {
                    tracing::warn!(%err, "fire-and-forget handler failed");
                }
            });
        }
        FrameKind::RequestResponse => {
            let cancelled = Arc::new(AtomicBool::new(false));
            let notify = Arc::new(Notify::new());
            inner.registry.insert(
                stream_id,
                Exchange::responder_response(Arc::clone(&notify), Arc::clone(&cancelled)),
            );
            let fut = inner.responder.request_response(payload);
            let engine = Arc::clone(inner);
            tokio::spawn(async move {
                tokio::select! {
                    _ = notify.notified() => {}
                    result = fut => {
                        if cancelled.load(Ordering::Acquire) {
                            return;
                        }
                        engine.registry.remove(stream_id);
                        match result {
                            Ok(payload) => {
                                let (metadata, data) = payload.into_parts();
                                let mut frame = Frame::next(stream_id, metadata, data);
                                frame.flags = frame.flags.with(FrameFlags::COMPLETE);
                                engine.transmit(frame);
                            }
                            Err(err) => engine.transmit(Frame::error(
                                stream_id,
                                err.wire_code(),
                                &err.to_string(),
                            )),
                        }
                    }
                }
            });
        }
        FrameKind::RequestStream => {
            let demand = DemandTracker::new(initial_demand);
            let notify = Arc::new(Notify::new());
            let cancelled = Arc::new(AtomicBool::new(false));
            inner.registry.insert(
                stream_id,
                Exchange::responder_stream(
                    demand.clone(),
                    Arc::clone(&notify),
                    Arc::clone(&cancelled),
                ),
            );
            let source = inner.responder.request_stream(payload);
            tokio::spawn(pump_outbound(
                Arc::clone(inner),
                stream_id,
                source,
                demand,
                notify,
                cancelled,
            ));
        }
        FrameKind::RequestChannel => {
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let window = DEFAULT_DEMAND_WINDOW;
            let allowance = DemandTracker::new(window);
            let demand = DemandTracker::new(initial_demand);
            let notify = Arc::new(Notify::new());
            let cancelled = Arc::new(AtomicBool::new(false));
            // The first payload rides the request frame and does not count
            // against the granted window.
            let _ = in_tx.send(Ok(payload));
            inner.registry.insert(
                stream_id,
                Exchange::responder_channel(
                    in_tx,
                    allowance,
                    RefillState::new(window),
                    demand.clone(),
                    Arc::clone(&notify),
                    Arc::clone(&cancelled),
                ),
            );
            let source = inner
                .responder
                .request_channel(Box::pin(UnboundedReceiverStream::new(in_rx)));
            inner.transmit(Frame::request_n(stream_id, window));
            tokio::spawn(pump_outbound(
                Arc::clone(inner),
                stream_id,
                source,
                demand,
                notify,
                cancelled,
            ));
        }
        kind => tracing::warn!(?kind, "non-request kind in responder dispatch"),
    }
    Ok(())
}

/// Requester side of a channel: the first payload rides the request frame,
/// the rest flow under peer demand. An empty source never reaches the wire
/// and surfaces to the caller as a cancellation error.
async fn run_channel_outbound(
    inner: Arc<EngineInner>,
    stream_id: u32,
    mut source: BoxStream<'static, Payload>,
    demand: DemandTracker,
    notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
    window: u32,
) {
    let first = source.next().await;
    if cancelled.load(Ordering::Acquire) {
        return;
    }
    let Some(first) = first else {
        if let Some(mut exchange) = inner.registry.remove(stream_id) {
            exchange.fail(WeftError::Cancelled);
        }
        return;
    };
    let (metadata, data) = first.into_parts();
    inner.transmit(Frame::request(
        FrameKind::RequestChannel,
        stream_id,
        metadata,
        data,
        window,
    ));
    pump_outbound(
        inner,
        stream_id,
        Box::pin(source.map(Ok)),
        demand,
        notify,
        cancelled,
    )
    .await;
}

/// Emits a source's values on `stream_id`, one unit of peer-granted demand
/// per value, until the source ends, errors, or the exchange is cancelled.
async fn pump_outbound(
    inner: Arc<EngineInner>,
    stream_id: u32,
    mut source: BoxStream<'static, Result<Payload, WeftError>>,
    demand: DemandTracker,
    notify: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
) {
    loop {
        if cancelled.load(Ordering::Acquire) {
            return;
        }
        if !demand.try_claim() {
            let notified = notify.notified();
            if cancelled.load(Ordering::Acquire) {
                return;
            }
            // A grant may have raced the first claim; retry before parking.
            if !demand.try_claim() {
                notified.await;
                continue;
            }
        }
        match source.next().await {
            Some(Ok(payload)) => {
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                let (metadata, data) = payload.into_parts();
                inner.transmit(Frame::next(stream_id, metadata, data));
            }
            Some(Err(err)) => {
                if let Some(mut exchange) = inner.registry.remove(stream_id) {
                    exchange.fail(err.clone());
                }
                if !cancelled.swap(true, Ordering::AcqRel) {
                    inner.transmit(Frame::error(stream_id, err.wire_code(), &err.to_string()));
                }
                return;
            }
            None => {
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                inner.transmit(Frame::complete(stream_id));
                inner.registry.complete_direction(stream_id, false);
                return;
            }
        }
    }
}
