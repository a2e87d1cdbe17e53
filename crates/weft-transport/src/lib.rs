//! Transport boundary for the Weft protocol engine.
//!
//! The engine consumes the [`DuplexConnection`] trait; concrete transports
//! implement it. This crate ships the in-process [`local`] transport used by
//! tests and demos.

pub mod connection;
pub mod local;

pub use connection::{CloseListener, CloseNotifier, DuplexConnection};
pub use local::{local_pair, LocalDuplexConnection};
