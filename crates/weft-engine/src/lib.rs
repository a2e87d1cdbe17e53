//! Connection-oriented messaging engine multiplexing fire-and-forget,
//! request/response, request/stream, request/channel, and metadata-push
//! exchanges over one duplex connection, with lease-based admission and
//! demand-based flow control.
//!
//! Each connection end runs one driver task that consumes the inbound frame
//! sequence in order. Applications interact through a [`Requester`] handle
//! and an optional [`Responder`] implementation installed via
//! [`EngineBuilder`].

mod engine;
mod exchange;
mod lease;
mod registry;
mod responder;

pub use engine::{EngineBuilder, Requester};
pub use exchange::{InteractionKind, PayloadResult, PayloadStream, ResponseFuture};
pub use lease::{BoundedLeaseGovernor, LeaseGovernor, NullLeaseGovernor, ResponderHandle};
pub use registry::Role;
pub use responder::{NoopResponder, Responder};
