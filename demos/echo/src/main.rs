//! Echo demo: a client and an echo server over an in-process connection,
//! exercising request/response, request/stream, and request/channel.

use bytes::Bytes;
use futures_util::future::{ready, BoxFuture};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::sync::Arc;
use weft_core::{DefaultAllocator, Payload};
use weft_engine::{EngineBuilder, PayloadResult, Responder, Role};
use weft_transport::local_pair;

struct EchoResponder;

impl Responder for EchoResponder {
    fn request_response(&self, payload: Payload) -> BoxFuture<'static, PayloadResult> {
        let (metadata, data) = payload.into_parts();
        tracing::info!(bytes = data.len(), "echoing response");
        Box::pin(ready(Ok(Payload::new(metadata, data))))
    }

    fn request_stream(&self, payload: Payload) -> BoxStream<'static, PayloadResult> {
        let (_, data) = payload.into_parts();
        Box::pin(stream::iter((0..5).map(move |i| {
            let mut echoed = data.to_vec();
            echoed.extend_from_slice(format!(" #{i}").as_bytes());
            Ok(Payload::new(None, Bytes::from(echoed)))
        })))
    }

    fn request_channel(
        &self,
        payloads: BoxStream<'static, PayloadResult>,
    ) -> BoxStream<'static, PayloadResult> {
        payloads
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (client_end, server_end) = local_pair(Arc::new(DefaultAllocator));
    let _server = EngineBuilder::new(server_end, Role::Server)
        .responder(EchoResponder)
        .start();
    let client = EngineBuilder::new(client_end, Role::Client).start();

    let response = client
        .request_response(Payload::from_static(b"hello, weft"))?
        .await?;
    tracing::info!(data = %String::from_utf8_lossy(response.data()), "request/response");

    let mut items = client.request_stream(Payload::from_static(b"burst"))?;
    while let Some(item) = items.next().await {
        let payload = item?;
        tracing::info!(data = %String::from_utf8_lossy(payload.data()), "request/stream");
    }

    let source = stream::iter(
        (0..3).map(|i| Payload::new(None, Bytes::from(format!("channel message {i}")))),
    );
    let mut echoed = client.request_channel(source)?;
    while let Some(item) = echoed.next().await {
        let payload = item?;
        tracing::info!(data = %String::from_utf8_lossy(payload.data()), "request/channel");
    }

    client.dispose();
    Ok(())
}
