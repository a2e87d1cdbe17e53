//! Core types and utilities for the Weft messaging protocol.
//!
//! This crate provides the foundation types used across all Weft components:
//! - Frame model and structural wire codec
//! - Fragmentation and reassembly of oversized frames
//! - Demand (REQUEST_N) accounting primitives
//! - Payload buffers with injectable allocator instrumentation
//! - Error taxonomy and wire error codes

pub mod error;
pub mod flow;
pub mod fragment;
pub mod frame;
pub mod payload;

pub use error::{codes, FrameError, WeftError};
pub use flow::{DemandTracker, DEFAULT_DEMAND_REFILL, DEFAULT_DEMAND_WINDOW};
pub use fragment::{Fragmenter, Reassembler};
pub use frame::{Frame, FrameFlags, FrameKind, MAX_STREAM_ID};
pub use payload::{Allocator, DefaultAllocator, Payload, TrackingAllocator};
