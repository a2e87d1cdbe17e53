//! Frame model and structural wire codec.
//!
//! Wire layout: `[stream_id u32][kind u8][flags u8][value u32]` followed by
//! `[metadata_len u32][metadata]` when the METADATA flag is set, then the
//! remaining bytes as data. The `value` field carries initial demand on
//! request frames, the grant on REQUEST_N frames, and the error code on
//! ERROR frames.

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;

/// Stream ids are 31-bit; the top bit is reserved.
pub const MAX_STREAM_ID: u32 = (1 << 31) - 1;

const HEADER_LEN: usize = 4 + 1 + 1 + 4;

/// Frame kinds understood by the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Connection setup, first frame on the wire (stream 0).
    Setup = 0x01,
    /// Replaces the admission lease (stream 0).
    Lease = 0x02,
    /// Liveness probe (stream 0).
    Keepalive = 0x03,
    /// Starts a request/response exchange.
    RequestResponse = 0x04,
    /// Starts a fire-and-forget exchange.
    RequestFnf = 0x05,
    /// Starts a request/stream exchange; `value` is the initial demand.
    RequestStream = 0x06,
    /// Starts a request/channel exchange; `value` is the initial demand.
    RequestChannel = 0x07,
    /// Grants `value` additional items of demand.
    RequestN = 0x08,
    /// Cancels the exchange on this stream id.
    Cancel = 0x09,
    /// Carries a value (NEXT), completion (COMPLETE), or a fragment.
    Payload = 0x0A,
    /// Terminates an exchange, or the connection when on stream 0;
    /// `value` is the error code and the data is the message.
    Error = 0x0B,
    /// Out-of-band metadata push (stream 0).
    MetadataPush = 0x0C,
}

impl FrameKind {
    fn from_u8(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            0x01 => FrameKind::Setup,
            0x02 => FrameKind::Lease,
            0x03 => FrameKind::Keepalive,
            0x04 => FrameKind::RequestResponse,
            0x05 => FrameKind::RequestFnf,
            0x06 => FrameKind::RequestStream,
            0x07 => FrameKind::RequestChannel,
            0x08 => FrameKind::RequestN,
            0x09 => FrameKind::Cancel,
            0x0A => FrameKind::Payload,
            0x0B => FrameKind::Error,
            0x0C => FrameKind::MetadataPush,
            other => return Err(FrameError::UnknownKind(other)),
        })
    }

    /// True for the kinds that open a new exchange on a fresh stream id.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            FrameKind::RequestResponse
                | FrameKind::RequestFnf
                | FrameKind::RequestStream
                | FrameKind::RequestChannel
        )
    }
}

/// Frame flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// The frame may be dropped by a peer that does not understand it.
    pub const IGNORE: u8 = 0b0000_0001;
    /// A metadata section is present.
    pub const METADATA: u8 = 0b0000_0010;
    /// More fragments of this logical frame follow.
    pub const FOLLOWS: u8 = 0b0000_0100;
    /// This direction of the exchange is complete.
    pub const COMPLETE: u8 = 0b0000_1000;
    /// The frame carries a value.
    pub const NEXT: u8 = 0b0001_0000;
    /// Keepalive only: the receiver should respond in kind.
    pub const RESPOND: u8 = 0b0010_0000;

    pub fn new(flags: u8) -> Self {
        Self(flags)
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn with(self, flag: u8) -> Self {
        Self(self.0 | flag)
    }

    pub fn without(self, flag: u8) -> Self {
        Self(self.0 & !flag)
    }

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn is_metadata(&self) -> bool {
        self.contains(Self::METADATA)
    }

    pub fn is_follows(&self) -> bool {
        self.contains(Self::FOLLOWS)
    }

    pub fn is_complete(&self) -> bool {
        self.contains(Self::COMPLETE)
    }

    pub fn is_next(&self) -> bool {
        self.contains(Self::NEXT)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// A decoded protocol unit. Immutable once decoded; routed exactly once.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub flags: FrameFlags,
    /// Initial demand, REQUEST_N grant, error code, or lease count.
    pub value: u32,
    pub metadata: Option<Bytes>,
    pub data: Bytes,
}

impl Frame {
    pub fn new(stream_id: u32, kind: FrameKind, flags: FrameFlags) -> Self {
        Self {
            stream_id,
            kind,
            flags,
            value: 0,
            metadata: None,
            data: Bytes::new(),
        }
    }

    /// A request-initiating frame carrying the payload and initial demand.
    pub fn request(
        kind: FrameKind,
        stream_id: u32,
        metadata: Option<Bytes>,
        data: Bytes,
        initial_demand: u32,
    ) -> Self {
        debug_assert!(kind.is_request());
        let mut flags = FrameFlags::empty();
        if metadata.is_some() {
            flags = flags.with(FrameFlags::METADATA);
        }
        Self {
            stream_id,
            kind,
            flags,
            value: initial_demand,
            metadata,
            data,
        }
    }

    /// A value-carrying payload frame.
    pub fn next(stream_id: u32, metadata: Option<Bytes>, data: Bytes) -> Self {
        let mut flags = FrameFlags::new(FrameFlags::NEXT);
        if metadata.is_some() {
            flags = flags.with(FrameFlags::METADATA);
        }
        Self {
            stream_id,
            kind: FrameKind::Payload,
            flags,
            value: 0,
            metadata,
            data,
        }
    }

    /// A payload frame completing one direction of an exchange.
    pub fn complete(stream_id: u32) -> Self {
        Self::new(
            stream_id,
            FrameKind::Payload,
            FrameFlags::new(FrameFlags::COMPLETE),
        )
    }

    pub fn cancel(stream_id: u32) -> Self {
        Self::new(stream_id, FrameKind::Cancel, FrameFlags::empty())
    }

    pub fn request_n(stream_id: u32, n: u32) -> Self {
        let mut frame = Self::new(stream_id, FrameKind::RequestN, FrameFlags::empty());
        frame.value = n;
        frame
    }

    pub fn error(stream_id: u32, code: u32, message: &str) -> Self {
        let mut frame = Self::new(stream_id, FrameKind::Error, FrameFlags::empty());
        frame.value = code;
        frame.data = Bytes::copy_from_slice(message.as_bytes());
        frame
    }

    pub fn setup() -> Self {
        Self::new(0, FrameKind::Setup, FrameFlags::empty())
    }

    /// A lease replacing the admission window: `count` new exchanges within
    /// `ttl`. The ttl rides in the data section as whole milliseconds.
    pub fn lease(count: u32, ttl: Duration) -> Self {
        let mut frame = Self::new(0, FrameKind::Lease, FrameFlags::empty());
        frame.value = count;
        let mut data = BytesMut::with_capacity(8);
        data.put_u64(ttl.as_millis() as u64);
        frame.data = data.freeze();
        frame
    }

    /// Decode the ttl from a lease frame.
    pub fn decode_lease_ttl(&self) -> Option<Duration> {
        if self.kind != FrameKind::Lease || self.data.len() < 8 {
            return None;
        }
        let mut buf = self.data.clone();
        Some(Duration::from_millis(buf.get_u64()))
    }

    pub fn keepalive(respond: bool, data: Bytes) -> Self {
        let flags = if respond {
            FrameFlags::new(FrameFlags::RESPOND)
        } else {
            FrameFlags::empty()
        };
        let mut frame = Self::new(0, FrameKind::Keepalive, flags);
        frame.data = data;
        frame
    }

    pub fn metadata_push(metadata: Bytes) -> Self {
        Self {
            stream_id: 0,
            kind: FrameKind::MetadataPush,
            flags: FrameFlags::new(FrameFlags::METADATA),
            value: 0,
            metadata: Some(metadata),
            data: Bytes::new(),
        }
    }

    /// The error message carried by an `Error` frame.
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Combined length of the metadata and data sections.
    pub fn payload_len(&self) -> usize {
        self.metadata.as_ref().map_or(0, Bytes::len) + self.data.len()
    }

    /// Encode this frame to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 4 + self.payload_len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(self.value);
        if let Some(metadata) = &self.metadata {
            buf.put_u32(metadata.len() as u32);
            buf.put_slice(metadata);
        }
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decode a frame from a complete wire buffer.
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }
        let stream_id = buf.get_u32();
        if stream_id > MAX_STREAM_ID {
            return Err(FrameError::StreamIdRange(stream_id));
        }
        let kind = FrameKind::from_u8(buf.get_u8())?;
        let flags = FrameFlags::new(buf.get_u8());
        let value = buf.get_u32();

        let metadata = if flags.is_metadata() {
            if buf.len() < 4 {
                return Err(FrameError::Truncated {
                    needed: 4,
                    available: buf.len(),
                });
            }
            let len = buf.get_u32() as usize;
            if buf.len() < len {
                return Err(FrameError::Truncated {
                    needed: len,
                    available: buf.len(),
                });
            }
            Some(buf.split_to(len))
        } else {
            None
        };

        Ok(Self {
            stream_id,
            kind,
            flags,
            value,
            metadata,
            data: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let original = Frame::request(
            FrameKind::RequestStream,
            5,
            Some(Bytes::from_static(b"meta")),
            Bytes::from_static(b"hello"),
            64,
        );
        let decoded = Frame::decode(original.encode()).unwrap();

        assert_eq!(decoded.stream_id, 5);
        assert_eq!(decoded.kind, FrameKind::RequestStream);
        assert_eq!(decoded.value, 64);
        assert_eq!(decoded.metadata.as_deref(), Some(&b"meta"[..]));
        assert_eq!(&decoded.data[..], b"hello");
    }

    #[test]
    fn test_roundtrip_without_metadata() {
        let decoded = Frame::decode(Frame::next(3, None, Bytes::from_static(b"x")).encode()).unwrap();
        assert!(decoded.metadata.is_none());
        assert!(decoded.flags.is_next());
        assert_eq!(&decoded.data[..], b"x");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u32(1);
        raw.put_u8(0x7F);
        raw.put_u8(0);
        raw.put_u32(0);
        assert!(matches!(
            Frame::decode(raw.freeze()),
            Err(FrameError::UnknownKind(0x7F))
        ));
    }

    #[test]
    fn test_stream_id_range_enforced() {
        let mut raw = BytesMut::new();
        raw.put_u32(1 << 31);
        raw.put_u8(FrameKind::Payload as u8);
        raw.put_u8(0);
        raw.put_u32(0);
        assert!(matches!(
            Frame::decode(raw.freeze()),
            Err(FrameError::StreamIdRange(_))
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let encoded = Frame::cancel(9).encode();
        let truncated = encoded.slice(..HEADER_LEN - 2);
        assert!(matches!(
            Frame::decode(truncated),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_lease_ttl_roundtrip() {
        let frame = Frame::lease(10, Duration::from_secs(30));
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.value, 10);
        assert_eq!(decoded.decode_lease_ttl(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_error_message() {
        let frame = Frame::error(7, crate::codes::APPLICATION_ERROR, "boom");
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.value, crate::codes::APPLICATION_ERROR);
        assert_eq!(decoded.error_message(), "boom");
    }

    #[test]
    fn test_flags() {
        let flags = FrameFlags::new(FrameFlags::NEXT | FrameFlags::COMPLETE);
        assert!(flags.is_next());
        assert!(flags.is_complete());
        assert!(!flags.is_follows());
        assert!(!flags.without(FrameFlags::NEXT).is_next());
    }
}
