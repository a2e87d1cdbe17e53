//! The application-facing responder surface.

use crate::exchange::PayloadResult;
use futures_util::future::{ready, BoxFuture};
use futures_util::stream::{self, BoxStream};
use weft_core::{codes, Payload, WeftError};

fn unsupported(operation: &str) -> WeftError {
    WeftError::Application {
        code: codes::APPLICATION_ERROR,
        message: format!("{operation} not supported"),
    }
}

/// Handles requester-initiated exchanges arriving on a connection.
///
/// Every method has a rejecting default, so an implementation only provides
/// the interactions it actually serves.
pub trait Responder: Send + Sync + 'static {
    fn fire_and_forget(&self, payload: Payload) -> BoxFuture<'static, Result<(), WeftError>> {
        drop(payload);
        Box::pin(ready(Ok(())))
    }

    fn request_response(&self, payload: Payload) -> BoxFuture<'static, PayloadResult> {
        drop(payload);
        Box::pin(ready(Err(unsupported("request_response"))))
    }

    fn request_stream(&self, payload: Payload) -> BoxStream<'static, PayloadResult> {
        drop(payload);
        Box::pin(stream::once(ready(Err(unsupported("request_stream")))))
    }

    fn request_channel(
        &self,
        payloads: BoxStream<'static, PayloadResult>,
    ) -> BoxStream<'static, PayloadResult> {
        drop(payloads);
        Box::pin(stream::once(ready(Err(unsupported("request_channel")))))
    }

    fn metadata_push(&self, payload: Payload) -> BoxFuture<'static, ()> {
        drop(payload);
        Box::pin(ready(()))
    }
}

/// Responder that accepts nothing; the default for a pure requester end.
#[derive(Debug, Default)]
pub struct NoopResponder;

impl Responder for NoopResponder {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_reject_value_interactions() {
        let responder = NoopResponder;

        let err = responder
            .request_response(Payload::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Application { .. }));

        responder
            .fire_and_forget(Payload::from_static(b"x"))
            .await
            .unwrap();
    }
}
