//! Error types for QUIC transport operations.
//!
//! Two orthogonal axes: connection-level transport errors, which are
//! signalled to the peer in a CONNECTION_CLOSE frame and move the
//! connection into `Closing`, and per-stream application aborts, which
//! travel in RESET_STREAM / STOP_SENDING and leave the connection alive.

use thiserror::Error;

/// Transport error codes (draft-27 §20).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No error (0x00). Used for graceful closure.
    #[error("no error")]
    NoError,

    /// Internal error (0x01).
    #[error("internal error")]
    InternalError,

    /// Flow control error (0x03).
    #[error("flow control error")]
    FlowControl,

    /// Stream limit error (0x04).
    #[error("stream limit error")]
    StreamLimit,

    /// Stream state error (0x05).
    #[error("stream state error")]
    StreamState,

    /// Final size error (0x06).
    #[error("final size error")]
    FinalSize,

    /// Frame encoding error (0x07).
    #[error("frame encoding error")]
    FrameEncoding,

    /// Transport parameter error (0x08).
    #[error("transport parameter error")]
    TransportParameter,

    /// Protocol violation (0x0A).
    #[error("protocol violation")]
    ProtocolViolation,

    /// TLS alert, carried in the 0x0100-0x01FF range.
    #[error("crypto error: alert {0:#x}")]
    Crypto(u8),
}

impl TransportError {
    /// Convert to the wire error code carried in CONNECTION_CLOSE.
    pub fn to_wire(self) -> u64 {
        match self {
            TransportError::NoError => 0x00,
            TransportError::InternalError => 0x01,
            TransportError::FlowControl => 0x03,
            TransportError::StreamLimit => 0x04,
            TransportError::StreamState => 0x05,
            TransportError::FinalSize => 0x06,
            TransportError::FrameEncoding => 0x07,
            TransportError::TransportParameter => 0x08,
            TransportError::ProtocolViolation => 0x0A,
            TransportError::Crypto(alert) => 0x0100 + alert as u64,
        }
    }

    /// Convert a wire error code back; unknown codes collapse to
    /// `ProtocolViolation` rather than failing the decode.
    pub fn from_wire(code: u64) -> Self {
        match code {
            0x00 => TransportError::NoError,
            0x01 => TransportError::InternalError,
            0x03 => TransportError::FlowControl,
            0x04 => TransportError::StreamLimit,
            0x05 => TransportError::StreamState,
            0x06 => TransportError::FinalSize,
            0x07 => TransportError::FrameEncoding,
            0x08 => TransportError::TransportParameter,
            0x0A => TransportError::ProtocolViolation,
            0x0100..=0x01FF => TransportError::Crypto((code - 0x0100) as u8),
            _ => TransportError::ProtocolViolation,
        }
    }
}

/// Crate-level error type.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A connection-level error. `frame_type` names the frame whose
    /// processing triggered it, for the CONNECTION_CLOSE we send.
    #[error("connection error: {kind}")]
    Connection {
        kind: TransportError,
        frame_type: Option<u64>,
    },

    /// The stream was aborted, locally or by the peer, with the given
    /// application error code.
    #[error("stream aborted: {0:#x}")]
    StreamAborted(u64),

    /// Data was enqueued after `mark_end_of_data`; caller bug.
    #[error("stream already finished")]
    StreamFinished,

    /// Header unprotection or AEAD authentication failed. The packet is
    /// silently dropped; this never becomes a connection error.
    #[error("packet failed authentication")]
    CryptoFail,

    /// The supplied buffer cannot hold the result.
    #[error("buffer too small")]
    BufferTooSmall,

    /// Nothing to do; the send path produced no packet.
    #[error("done")]
    Done,
}

impl Error {
    pub(crate) fn transport(kind: TransportError) -> Self {
        Error::Connection {
            kind,
            frame_type: None,
        }
    }

    pub(crate) fn for_frame(kind: TransportError, frame_type: u64) -> Self {
        Error::Connection {
            kind,
            frame_type: Some(frame_type),
        }
    }
}

impl From<TransportError> for Error {
    fn from(kind: TransportError) -> Self {
        Error::transport(kind)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for kind in [
            TransportError::NoError,
            TransportError::InternalError,
            TransportError::FlowControl,
            TransportError::StreamLimit,
            TransportError::StreamState,
            TransportError::FinalSize,
            TransportError::FrameEncoding,
            TransportError::TransportParameter,
            TransportError::ProtocolViolation,
            TransportError::Crypto(0x28),
        ] {
            assert_eq!(TransportError::from_wire(kind.to_wire()), kind);
        }
    }

    #[test]
    fn unknown_wire_code_maps_to_protocol_violation() {
        assert_eq!(
            TransportError::from_wire(0xdead),
            TransportError::ProtocolViolation
        );
    }
}
