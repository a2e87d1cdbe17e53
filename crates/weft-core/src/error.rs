//! Error taxonomy for the Weft protocol.
//!
//! Exchange-scoped errors ([`WeftError::Application`], [`WeftError::Cancelled`])
//! are contained to a single exchange. [`WeftError::Protocol`] is fatal to the
//! connection and triggers an error frame on stream 0 followed by disposal.

/// Wire error codes carried by `Error` frames.
pub mod codes {
    /// The connection is being terminated; no exchange-level recovery possible.
    pub const CONNECTION_ERROR: u32 = 0x0101;
    /// The responder signalled a business-logic failure for one exchange.
    pub const APPLICATION_ERROR: u32 = 0x0201;
    /// A new exchange was refused by the admission policy.
    pub const REJECTED: u32 = 0x0202;
    /// The exchange was cancelled before completion.
    pub const CANCELED: u32 = 0x0203;
    /// The peer violated the protocol (malformed frame, demand overrun,
    /// broken fragment sequence).
    pub const INVALID: u32 = 0x0204;
}

/// Weft error type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WeftError {
    /// A new exchange was denied by the lease governor. The exchange is never
    /// created and nothing is transmitted.
    #[error("exchange rejected by lease governor")]
    Rejected,

    /// The peer violated the protocol. Fatal to the connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A responder-signalled failure scoped to one exchange.
    #[error("application error {code:#06x}: {message}")]
    Application { code: u32, message: String },

    /// The exchange was cancelled. Also covers the empty request/channel
    /// source, which the protocol has no frame encoding for.
    #[error("exchange cancelled")]
    Cancelled,

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection was disposed while the exchange was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame could not be decoded or reassembled.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl WeftError {
    /// Classify an inbound wire error by its code.
    pub fn from_wire(code: u32, message: String) -> Self {
        match code {
            codes::REJECTED => WeftError::Rejected,
            codes::CANCELED => WeftError::Cancelled,
            codes::INVALID => WeftError::Protocol(message),
            codes::CONNECTION_ERROR => WeftError::ConnectionClosed,
            _ => WeftError::Application { code, message },
        }
    }

    /// The wire code used when transmitting this error in an `Error` frame.
    pub fn wire_code(&self) -> u32 {
        match self {
            WeftError::Rejected => codes::REJECTED,
            WeftError::Cancelled => codes::CANCELED,
            WeftError::Protocol(_) | WeftError::Frame(_) => codes::INVALID,
            WeftError::Application { code, .. } => *code,
            WeftError::Transport(_) | WeftError::ConnectionClosed => codes::CONNECTION_ERROR,
        }
    }
}

/// Frame decode and reassembly errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("stream id {0} out of range")]
    StreamIdRange(u32),

    #[error("fragment continuation for stream {0} with no pending lead frame")]
    OrphanFragment(u32),

    #[error("new lead frame for stream {0} while a fragment sequence is pending")]
    FragmentInterleaved(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code_roundtrip() {
        let err = WeftError::from_wire(codes::REJECTED, String::new());
        assert!(matches!(err, WeftError::Rejected));
        assert_eq!(err.wire_code(), codes::REJECTED);

        let err = WeftError::from_wire(codes::CANCELED, String::new());
        assert!(matches!(err, WeftError::Cancelled));
        assert_eq!(err.wire_code(), codes::CANCELED);
    }

    #[test]
    fn test_unrecognized_code_is_application_error() {
        let err = WeftError::from_wire(0x0301, "custom".to_string());
        match err {
            WeftError::Application { code, ref message } => {
                assert_eq!(code, 0x0301);
                assert_eq!(message, "custom");
            }
            other => panic!("expected application error, got {other:?}"),
        }
    }
}
