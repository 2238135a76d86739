//! Error taxonomy for the client transport.
//!
//! Transport errors carry a QUIC wire code and close the connection with
//! CONNECTION_CLOSE; application errors close with APPLICATION_CLOSE; local
//! errors are program-level misuse that never reaches the wire.

use thiserror::Error;

/// QUIC transport error codes per RFC 9000 Section 20.1.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    /// No error (0x00).
    #[error("no error")]
    NoError,

    /// Internal error (0x01).
    #[error("internal error")]
    InternalError,

    /// Connection refused (0x02).
    #[error("connection refused")]
    ConnectionRefused,

    /// Flow control error (0x03).
    #[error("flow control error")]
    FlowControlError,

    /// Stream limit error (0x04).
    #[error("stream limit error")]
    StreamLimitError,

    /// Stream state error (0x05).
    #[error("stream state error")]
    StreamStateError,

    /// Final size error (0x06).
    #[error("final size error")]
    FinalSizeError,

    /// Frame encoding error (0x07).
    #[error("frame encoding error")]
    FrameEncodingError,

    /// Transport parameter error (0x08).
    #[error("transport parameter error")]
    TransportParameterError,

    /// Protocol violation (0x0A).
    #[error("protocol violation")]
    ProtocolViolation,

    /// Invalid token (0x0B).
    #[error("invalid token")]
    InvalidToken,

    /// Crypto buffer exceeded (0x0D).
    #[error("crypto buffer exceeded")]
    CryptoBufferExceeded,

    /// Version negotiation error: the server does not support our version.
    #[error("version negotiation error")]
    VersionNegotiationError,

    /// Crypto error (0x0100-0x01FF), carrying the TLS alert description.
    #[error("crypto error: alert {0:#x}")]
    Crypto(u8),
}

impl TransportErrorCode {
    /// Convert to the wire-format error code.
    pub fn to_wire(&self) -> u64 {
        match self {
            TransportErrorCode::NoError => 0x00,
            TransportErrorCode::InternalError => 0x01,
            TransportErrorCode::ConnectionRefused => 0x02,
            TransportErrorCode::FlowControlError => 0x03,
            TransportErrorCode::StreamLimitError => 0x04,
            TransportErrorCode::StreamStateError => 0x05,
            TransportErrorCode::FinalSizeError => 0x06,
            TransportErrorCode::FrameEncodingError => 0x07,
            TransportErrorCode::TransportParameterError => 0x08,
            TransportErrorCode::ProtocolViolation => 0x0a,
            TransportErrorCode::InvalidToken => 0x0b,
            TransportErrorCode::CryptoBufferExceeded => 0x0d,
            TransportErrorCode::VersionNegotiationError => 0x11,
            TransportErrorCode::Crypto(alert) => 0x0100 + *alert as u64,
        }
    }

    /// Convert a wire-format error code back into a code, if known.
    pub fn from_wire(code: u64) -> Self {
        match code {
            0x00 => TransportErrorCode::NoError,
            0x02 => TransportErrorCode::ConnectionRefused,
            0x03 => TransportErrorCode::FlowControlError,
            0x04 => TransportErrorCode::StreamLimitError,
            0x05 => TransportErrorCode::StreamStateError,
            0x06 => TransportErrorCode::FinalSizeError,
            0x07 => TransportErrorCode::FrameEncodingError,
            0x08 => TransportErrorCode::TransportParameterError,
            0x0a => TransportErrorCode::ProtocolViolation,
            0x0b => TransportErrorCode::InvalidToken,
            0x0d => TransportErrorCode::CryptoBufferExceeded,
            0x11 => TransportErrorCode::VersionNegotiationError,
            0x0100..=0x01ff => TransportErrorCode::Crypto((code - 0x0100) as u8),
            _ => TransportErrorCode::InternalError,
        }
    }
}

/// Program-level misuse detected locally; never serialized to the wire.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LocalErrorCode {
    /// An API was invoked in a state that does not allow it.
    #[error("invalid API usage")]
    InvalidOperation,

    /// A one-shot slot (cipher install, peer address per family) was filled twice.
    #[error("slot already occupied")]
    AlreadyInstalled,

    /// Malformed input detected by a codec.
    #[error("codec error")]
    CodecError,

    /// The connection has already reached a terminal state.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Unified connection error. Exactly one of these reaches the terminal
/// callback; transient conditions are absorbed before construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuicError {
    /// Local protocol violation or cryptographic failure. Closes the
    /// connection with CONNECTION_CLOSE carrying the wire code.
    #[error("transport error: {code} ({reason})")]
    Transport {
        code: TransportErrorCode,
        reason: String,
    },

    /// Raised by the application. Closes with APPLICATION_CLOSE.
    #[error("application error {code}: {reason}")]
    Application { code: u64, reason: String },

    /// The peer sent CONNECTION_CLOSE or APPLICATION_CLOSE. No reply frame
    /// is generated.
    #[error("peer closed connection, code {code}: {reason}")]
    PeerClose {
        code: u64,
        application: bool,
        reason: String,
    },

    /// Idle timer fired with no activity; the connection closes silently.
    #[error("idle timeout")]
    IdleTimeout,

    /// Handshake did not complete within its deadline.
    #[error("handshake timeout")]
    HandshakeTimeout,

    /// Program error that never reaches the wire.
    #[error("local error: {code} ({reason})")]
    Local {
        code: LocalErrorCode,
        reason: &'static str,
    },
}

impl QuicError {
    pub fn transport(code: TransportErrorCode, reason: impl Into<String>) -> Self {
        QuicError::Transport {
            code,
            reason: reason.into(),
        }
    }

    pub fn local(code: LocalErrorCode, reason: &'static str) -> Self {
        QuicError::Local { code, reason }
    }

    /// Fatal TLS failure, mapped to the QUIC crypto error range.
    pub fn crypto(alert: u8, reason: impl Into<String>) -> Self {
        QuicError::Transport {
            code: TransportErrorCode::Crypto(alert),
            reason: reason.into(),
        }
    }

    /// The wire code for the CONNECTION_CLOSE/APPLICATION_CLOSE this error
    /// produces, if it produces one.
    pub fn close_code(&self) -> Option<u64> {
        match self {
            QuicError::Transport { code, .. } => Some(code.to_wire()),
            QuicError::Application { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = core::result::Result<T, QuicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        assert_eq!(TransportErrorCode::NoError.to_wire(), 0x00);
        assert_eq!(TransportErrorCode::ProtocolViolation.to_wire(), 0x0a);
        assert_eq!(TransportErrorCode::Crypto(0x42).to_wire(), 0x0142);
        assert_eq!(
            TransportErrorCode::from_wire(0x0142),
            TransportErrorCode::Crypto(0x42)
        );
        assert_eq!(
            TransportErrorCode::from_wire(0x11),
            TransportErrorCode::VersionNegotiationError
        );
    }

    #[test]
    fn close_codes() {
        let err = QuicError::transport(TransportErrorCode::FlowControlError, "limit");
        assert_eq!(err.close_code(), Some(0x03));
        let err = QuicError::Application {
            code: 7,
            reason: "bye".into(),
        };
        assert_eq!(err.close_code(), Some(7));
        assert_eq!(QuicError::IdleTimeout.close_code(), None);
    }
}
