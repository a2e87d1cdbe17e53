//! Fragmentation and reassembly of oversized frames.
//!
//! A frame whose metadata+data exceed the configured threshold is split into
//! a lead frame (keeping the original kind and flags) plus `Payload`
//! continuation frames, with FOLLOWS set on every fragment except the last.
//! Metadata is consumed before data, so each fragment carries at most one
//! metadata slice followed by a data slice.
//!
//! Continuation frames carry neither NEXT nor COMPLETE; that distinguishes
//! them from a fresh value frame on the same stream and lets the reassembler
//! detect out-of-order fragment sequences.

use crate::error::FrameError;
use crate::frame::{Frame, FrameFlags, FrameKind};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Splits outbound frames exceeding the size threshold.
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    max_fragment_size: usize,
}

impl Fragmenter {
    pub fn new(max_fragment_size: usize) -> Self {
        assert!(max_fragment_size > 0, "fragment size must be non-zero");
        Self { max_fragment_size }
    }

    /// Split `frame` into wire fragments. Returns the frame unchanged when it
    /// fits within the threshold.
    pub fn split(&self, frame: Frame) -> Vec<Frame> {
        if frame.payload_len() <= self.max_fragment_size {
            return vec![frame];
        }

        let Frame {
            stream_id,
            kind,
            flags,
            value,
            metadata,
            data,
        } = frame;

        let mut remaining_metadata = metadata.unwrap_or_default();
        let mut remaining_data = data;
        let mut fragments = Vec::new();
        let mut first = true;

        while !remaining_metadata.is_empty() || !remaining_data.is_empty() || first {
            let metadata_take = remaining_metadata.len().min(self.max_fragment_size);
            let chunk_metadata = if metadata_take > 0 {
                Some(remaining_metadata.split_to(metadata_take))
            } else {
                None
            };
            let data_take = remaining_data
                .len()
                .min(self.max_fragment_size - metadata_take);
            let chunk_data = remaining_data.split_to(data_take);

            let last = remaining_metadata.is_empty() && remaining_data.is_empty();
            let mut chunk_flags = if first {
                flags
            } else {
                FrameFlags::empty()
            };
            chunk_flags = if chunk_metadata.is_some() {
                chunk_flags.with(FrameFlags::METADATA)
            } else {
                chunk_flags.without(FrameFlags::METADATA)
            };
            chunk_flags = if last {
                chunk_flags.without(FrameFlags::FOLLOWS)
            } else {
                chunk_flags.with(FrameFlags::FOLLOWS)
            };

            fragments.push(Frame {
                stream_id,
                kind: if first { kind } else { FrameKind::Payload },
                flags: chunk_flags,
                value: if first { value } else { 0 },
                metadata: chunk_metadata,
                data: chunk_data,
            });
            first = false;
        }

        fragments
    }
}

#[derive(Debug)]
struct PartialFrame {
    kind: FrameKind,
    flags: FrameFlags,
    value: u32,
    metadata: BytesMut,
    has_metadata: bool,
    data: BytesMut,
}

/// Accumulates inbound fragments per stream id until a frame without FOLLOWS
/// completes the sequence.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<u32, PartialFrame>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound frame. Returns a complete frame once the fragment
    /// sequence (possibly of length one) is finished, or `None` while more
    /// fragments are expected.
    pub fn accept(&mut self, frame: Frame) -> Result<Option<Frame>, FrameError> {
        let stream_id = frame.stream_id;

        if let Entry::Occupied(mut entry) = self.partial.entry(stream_id) {
            // Cancellation or an error abandons the pending sequence.
            if matches!(frame.kind, FrameKind::Cancel | FrameKind::Error) {
                entry.remove();
                return Ok(Some(frame));
            }
            // Otherwise only flag-less payload frames continue it.
            if frame.kind != FrameKind::Payload
                || frame.flags.is_next()
                || frame.flags.is_complete()
            {
                entry.remove();
                return Err(FrameError::FragmentInterleaved(stream_id));
            }
            let partial = entry.get_mut();
            if let Some(metadata) = &frame.metadata {
                partial.metadata.put_slice(metadata);
                partial.has_metadata = true;
            }
            partial.data.put_slice(&frame.data);

            if frame.flags.is_follows() {
                tracing::trace!(stream_id, buffered = partial.data.len(), "fragment buffered");
                return Ok(None);
            }
            return Ok(Some(Self::finish(stream_id, entry.remove())));
        }

        if !frame.flags.is_follows() {
            // An unfragmented payload frame that carries no value, completion,
            // or metadata is a stray continuation.
            if frame.kind == FrameKind::Payload
                && !frame.flags.is_next()
                && !frame.flags.is_complete()
                && frame.flags.as_u8() != 0
            {
                return Err(FrameError::OrphanFragment(stream_id));
            }
            return Ok(Some(frame));
        }

        if frame.kind == FrameKind::Payload && !frame.flags.is_next() {
            return Err(FrameError::OrphanFragment(stream_id));
        }

        let mut metadata = BytesMut::new();
        let has_metadata = frame.metadata.is_some();
        if let Some(m) = &frame.metadata {
            metadata.put_slice(m);
        }
        let mut data = BytesMut::new();
        data.put_slice(&frame.data);
        self.partial.insert(
            stream_id,
            PartialFrame {
                kind: frame.kind,
                flags: frame.flags,
                value: frame.value,
                metadata,
                has_metadata,
                data,
            },
        );
        Ok(None)
    }

    /// Discard any partial state for a stream (cancelled or errored).
    pub fn forget(&mut self, stream_id: u32) {
        self.partial.remove(&stream_id);
    }

    fn finish(stream_id: u32, partial: PartialFrame) -> Frame {
        let metadata = if partial.has_metadata {
            Some(partial.metadata.freeze())
        } else {
            None
        };
        let mut flags = partial.flags.without(FrameFlags::FOLLOWS);
        flags = if metadata.is_some() {
            flags.with(FrameFlags::METADATA)
        } else {
            flags.without(FrameFlags::METADATA)
        };
        Frame {
            stream_id,
            kind: partial.kind,
            flags,
            value: partial.value,
            metadata,
            data: partial.data.freeze(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble_all(fragments: Vec<Frame>) -> Frame {
        let mut reassembler = Reassembler::new();
        let mut out = None;
        let count = fragments.len();
        for (i, fragment) in fragments.into_iter().enumerate() {
            let result = reassembler.accept(fragment).unwrap();
            if i + 1 < count {
                assert!(result.is_none(), "premature completion at fragment {i}");
            } else {
                out = result;
            }
        }
        out.expect("sequence did not complete")
    }

    #[test]
    fn test_small_frame_passes_through() {
        let fragmenter = Fragmenter::new(128);
        let frame = Frame::next(1, None, Bytes::from_static(b"small"));
        let fragments = fragmenter.split(frame);
        assert_eq!(fragments.len(), 1);
        assert!(!fragments[0].flags.is_follows());
    }

    #[test]
    fn test_split_and_reassemble_identity() {
        // Sizes from just over the threshold to many multiples of it.
        for size in [17, 32, 33, 100, 1000, 4096] {
            let fragmenter = Fragmenter::new(16);
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let metadata: Vec<u8> = (0..size / 3).map(|i| (i % 13) as u8).collect();
            let frame = Frame::next(
                7,
                Some(Bytes::from(metadata.clone())),
                Bytes::from(data.clone()),
            );

            let fragments = fragmenter.split(frame);
            assert!(fragments.len() > 1, "size {size} did not fragment");
            for (i, fragment) in fragments.iter().enumerate() {
                assert!(fragment.payload_len() <= 16);
                assert_eq!(fragment.flags.is_follows(), i + 1 < fragments.len());
            }

            let whole = reassemble_all(fragments);
            assert_eq!(whole.metadata.as_deref(), Some(&metadata[..]));
            assert_eq!(&whole.data[..], &data[..]);
            assert!(whole.flags.is_next());
            assert!(!whole.flags.is_follows());
        }
    }

    #[test]
    fn test_lead_frame_keeps_kind_and_demand() {
        let fragmenter = Fragmenter::new(8);
        let frame = Frame::request(
            FrameKind::RequestChannel,
            3,
            None,
            Bytes::from(vec![9u8; 40]),
            16,
        );
        let fragments = fragmenter.split(frame);
        assert_eq!(fragments[0].kind, FrameKind::RequestChannel);
        assert_eq!(fragments[0].value, 16);
        assert!(fragments[1..]
            .iter()
            .all(|f| f.kind == FrameKind::Payload && f.value == 0));

        let whole = reassemble_all(fragments);
        assert_eq!(whole.kind, FrameKind::RequestChannel);
        assert_eq!(whole.value, 16);
        assert_eq!(whole.data.len(), 40);
    }

    #[test]
    fn test_interleaved_frame_is_protocol_error() {
        let fragmenter = Fragmenter::new(8);
        let mut fragments = fragmenter
            .split(Frame::next(5, None, Bytes::from(vec![1u8; 32])))
            .into_iter();

        let mut reassembler = Reassembler::new();
        assert!(reassembler.accept(fragments.next().unwrap()).unwrap().is_none());

        // A fresh value frame on the same stream before the sequence finishes.
        let result = reassembler.accept(Frame::next(5, None, Bytes::from_static(b"x")));
        assert!(matches!(result, Err(FrameError::FragmentInterleaved(5))));
    }

    #[test]
    fn test_fragments_on_other_streams_are_independent() {
        let fragmenter = Fragmenter::new(8);
        let a = fragmenter.split(Frame::next(1, None, Bytes::from(vec![1u8; 20])));
        let b = fragmenter.split(Frame::next(3, None, Bytes::from(vec![2u8; 20])));

        let mut reassembler = Reassembler::new();
        let mut done = 0;
        for frame in a.into_iter().zip(b).flat_map(|(x, y)| [x, y]) {
            if reassembler.accept(frame).unwrap().is_some() {
                done += 1;
            }
        }
        assert_eq!(done, 2);
    }

    #[test]
    fn test_orphan_continuation_rejected() {
        let mut reassembler = Reassembler::new();
        let orphan = Frame {
            stream_id: 9,
            kind: FrameKind::Payload,
            flags: FrameFlags::new(FrameFlags::METADATA),
            value: 0,
            metadata: Some(Bytes::from_static(b"m")),
            data: Bytes::new(),
        };
        assert!(matches!(
            reassembler.accept(orphan),
            Err(FrameError::OrphanFragment(9))
        ));
    }

    #[test]
    fn test_cancel_abandons_pending_sequence() {
        let fragmenter = Fragmenter::new(8);
        let mut fragments = fragmenter
            .split(Frame::next(4, None, Bytes::from(vec![0u8; 32])))
            .into_iter();

        let mut reassembler = Reassembler::new();
        assert!(reassembler.accept(fragments.next().unwrap()).unwrap().is_none());

        let out = reassembler.accept(Frame::cancel(4)).unwrap();
        assert_eq!(out.unwrap().kind, FrameKind::Cancel);

        // Partial state is gone; a fresh frame on the id passes through.
        assert!(reassembler
            .accept(Frame::next(4, None, Bytes::from_static(b"new")))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_forget_discards_partial_state() {
        let fragmenter = Fragmenter::new(8);
        let mut fragments = fragmenter
            .split(Frame::next(2, None, Bytes::from(vec![0u8; 32])))
            .into_iter();

        let mut reassembler = Reassembler::new();
        assert!(reassembler.accept(fragments.next().unwrap()).unwrap().is_none());
        reassembler.forget(2);

        // A new sequence on the same id starts cleanly.
        let frame = Frame::next(2, None, Bytes::from_static(b"fresh"));
        assert!(reassembler.accept(frame).unwrap().is_some());
    }
}
