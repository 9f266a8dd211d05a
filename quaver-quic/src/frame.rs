//! Frame encoding and decoding (draft-27 §19).
//!
//! Frames are `type-varint payload`. Decoding is zero-copy: STREAM,
//! CRYPTO, NEW_TOKEN and CONNECTION_CLOSE reason bytes borrow from the
//! decrypted packet buffer. Decoders reject truncated fields, out-of-range
//! values and frames that are illegal in the packet type that carried
//! them.

use crate::codec::{varint_len, Reader, Writer};
use crate::error::{Error, Result, TransportError};
use crate::packet::{ConnectionId, PacketType, MAX_CID_LEN};
use crate::ranges::RangeSet;

// Frame type values (draft-27 §19), one constant per wire type.
pub const TYPE_PADDING: u64 = 0x00;
pub const TYPE_PING: u64 = 0x01;
pub const TYPE_ACK: u64 = 0x02;
pub const TYPE_ACK_ECN: u64 = 0x03;
pub const TYPE_RESET_STREAM: u64 = 0x04;
pub const TYPE_STOP_SENDING: u64 = 0x05;
pub const TYPE_CRYPTO: u64 = 0x06;
pub const TYPE_NEW_TOKEN: u64 = 0x07;
pub const TYPE_STREAM_BASE: u64 = 0x08; // 0x08..=0x0f
pub const TYPE_MAX_DATA: u64 = 0x10;
pub const TYPE_MAX_STREAM_DATA: u64 = 0x11;
pub const TYPE_MAX_STREAMS_BIDI: u64 = 0x12;
pub const TYPE_MAX_STREAMS_UNI: u64 = 0x13;
pub const TYPE_DATA_BLOCKED: u64 = 0x14;
pub const TYPE_STREAM_DATA_BLOCKED: u64 = 0x15;
pub const TYPE_STREAMS_BLOCKED_BIDI: u64 = 0x16;
pub const TYPE_STREAMS_BLOCKED_UNI: u64 = 0x17;
pub const TYPE_NEW_CONNECTION_ID: u64 = 0x18;
pub const TYPE_RETIRE_CONNECTION_ID: u64 = 0x19;
pub const TYPE_PATH_CHALLENGE: u64 = 0x1a;
pub const TYPE_PATH_RESPONSE: u64 = 0x1b;
pub const TYPE_CONNECTION_CLOSE: u64 = 0x1c;
pub const TYPE_APPLICATION_CLOSE: u64 = 0x1d;
pub const TYPE_HANDSHAKE_DONE: u64 = 0x1e;

// STREAM frame flag bits, encoded in the type byte (draft-27 §19.8):
// FIN marks the last frame, LEN adds an explicit length field, OFF adds
// an explicit offset field.
const STREAM_FIN: u64 = 0x01;
const STREAM_LEN: u64 = 0x02;
const STREAM_OFF: u64 = 0x04;

/// ECN counters carried in ACK frames of type 0x03 (draft-27 §19.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcnCounts {
    /// ECT(0)-marked packets received.
    pub ect0: u64,

    /// ECT(1)-marked packets received.
    pub ect1: u64,

    /// ECN-CE-marked packets received.
    pub ce: u64,
}

/// One decoded (or to-be-encoded) frame (draft-27 §19).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// PADDING (0x00, draft-27 §19.1). A run of consecutive padding
    /// bytes, folded into one frame on decode.
    Padding {
        /// Number of zero bytes in the run.
        len: usize,
    },

    /// PING (0x01, draft-27 §19.2). Solicits an ACK; carries nothing.
    Ping,

    /// ACK (0x02) or ACK with ECN counts (0x03), draft-27 §19.3.
    Ack {
        /// Received packet numbers being acknowledged, as ranges.
        ranges: RangeSet,

        /// Delay since the largest was received, already scaled by the
        /// sender's ack_delay_exponent (microseconds on this side).
        delay: u64,

        /// ECN counters, present only in the 0x03 form.
        ecn: Option<EcnCounts>,
    },

    /// RESET_STREAM (0x04, draft-27 §19.4). Abruptly ends sending on a
    /// stream.
    ResetStream {
        /// Stream being reset.
        stream_id: u64,

        /// Application-defined error code.
        error_code: u64,

        /// Final size of the stream in bytes, for flow-control accounting.
        final_size: u64,
    },

    /// STOP_SENDING (0x05, draft-27 §19.5). Asks the peer to stop
    /// sending on a stream.
    StopSending {
        /// Stream the request applies to.
        stream_id: u64,

        /// Application-defined error code.
        error_code: u64,
    },

    /// CRYPTO (0x06, draft-27 §19.6). Handshake bytes for the packet's
    /// encryption level; a stream frame without id or FIN.
    Crypto {
        /// Byte offset in the crypto stream.
        offset: u64,

        /// Handshake data, borrowed from the packet buffer.
        data: &'a [u8],
    },

    /// NEW_TOKEN (0x07, draft-27 §19.7). Address-validation token for a
    /// future connection; server to client only.
    NewToken {
        /// Opaque token, never empty.
        token: &'a [u8],
    },

    /// STREAM (0x08-0x0f, draft-27 §19.8). Application data; the low
    /// three type bits are the OFF / LEN / FIN flags.
    Stream {
        /// Stream carrying the data.
        stream_id: u64,

        /// Byte offset in the stream (0 when the OFF bit is clear).
        offset: u64,

        /// Stream data, borrowed from the packet buffer.
        data: &'a [u8],

        /// FIN bit: this frame ends the stream.
        fin: bool,
    },

    /// MAX_DATA (0x10, draft-27 §19.9). Connection-level flow-control
    /// limit.
    MaxData {
        /// Total bytes the peer may now send across all streams.
        max: u64,
    },

    /// MAX_STREAM_DATA (0x11, draft-27 §19.10). Per-stream flow-control
    /// limit.
    MaxStreamData {
        /// Stream the limit applies to.
        stream_id: u64,

        /// Bytes the peer may now send on that stream.
        max: u64,
    },

    /// MAX_STREAMS (0x12 bidirectional / 0x13 unidirectional, draft-27
    /// §19.11). Stream-creation limit.
    MaxStreams {
        /// True for the bidirectional (0x12) form.
        bidi: bool,

        /// Cumulative number of streams of that type the peer may open.
        max: u64,
    },

    /// DATA_BLOCKED (0x14, draft-27 §19.12). Sender is stalled on the
    /// connection flow-control limit.
    DataBlocked {
        /// Connection limit at which the stall occurred.
        limit: u64,
    },

    /// STREAM_DATA_BLOCKED (0x15, draft-27 §19.13). Sender is stalled on
    /// a stream's flow-control limit.
    StreamDataBlocked {
        /// Stalled stream.
        stream_id: u64,

        /// Stream limit at which the stall occurred.
        limit: u64,
    },

    /// STREAMS_BLOCKED (0x16 bidirectional / 0x17 unidirectional,
    /// draft-27 §19.14). Sender wants to open more streams than allowed.
    StreamsBlocked {
        /// True for the bidirectional (0x16) form.
        bidi: bool,

        /// Stream limit at which the stall occurred.
        limit: u64,
    },

    /// NEW_CONNECTION_ID (0x18, draft-27 §19.15). Supplies the peer with
    /// an alternative connection id.
    NewConnectionId {
        /// Sequence number of the issued id.
        seq: u64,

        /// Ids with sequence numbers below this must be retired.
        retire_prior_to: u64,

        /// The connection id itself, 1-20 bytes.
        cid: ConnectionId,

        /// Stateless reset token tied to the id (storage only here).
        reset_token: [u8; 16],
    },

    /// RETIRE_CONNECTION_ID (0x19, draft-27 §19.16). The sender will no
    /// longer use one of the ids we issued.
    RetireConnectionId {
        /// Sequence number of the retired id.
        seq: u64,
    },

    /// PATH_CHALLENGE (0x1a, draft-27 §19.17). Must be echoed back in a
    /// PATH_RESPONSE on the same path.
    PathChallenge {
        /// Arbitrary probe payload.
        data: [u8; 8],
    },

    /// PATH_RESPONSE (0x1b, draft-27 §19.18). Echo of a received
    /// PATH_CHALLENGE.
    PathResponse {
        /// The challenged payload, unchanged.
        data: [u8; 8],
    },

    /// Transport-level CONNECTION_CLOSE (0x1c, draft-27 §19.19),
    /// carrying the offending frame type.
    ConnectionClose {
        /// Transport error code (§20 wire values).
        error_code: u64,

        /// Type of the frame whose processing triggered the close, or 0.
        frame_type: u64,

        /// Human-readable reason, borrowed from the packet buffer.
        reason: &'a [u8],
    },

    /// Application-level CONNECTION_CLOSE (0x1d, draft-27 §19.19).
    ApplicationClose {
        /// Application-defined error code.
        error_code: u64,

        /// Human-readable reason, borrowed from the packet buffer.
        reason: &'a [u8],
    },

    /// HANDSHAKE_DONE (0x1e, draft-27 §19.20). Server-only signal that
    /// confirms the handshake for the client.
    HandshakeDone,
}

fn encoding_err() -> Error {
    Error::transport(TransportError::FrameEncoding)
}

impl<'a> Frame<'a> {
    /// Wire type of this frame (for STREAM, the base type).
    pub fn ty(&self) -> u64 {
        match self {
            Frame::Padding { .. } => TYPE_PADDING,
            Frame::Ping => TYPE_PING,
            Frame::Ack { ecn: None, .. } => TYPE_ACK,
            Frame::Ack { ecn: Some(_), .. } => TYPE_ACK_ECN,
            Frame::ResetStream { .. } => TYPE_RESET_STREAM,
            Frame::StopSending { .. } => TYPE_STOP_SENDING,
            Frame::Crypto { .. } => TYPE_CRYPTO,
            Frame::NewToken { .. } => TYPE_NEW_TOKEN,
            Frame::Stream { .. } => TYPE_STREAM_BASE,
            Frame::MaxData { .. } => TYPE_MAX_DATA,
            Frame::MaxStreamData { .. } => TYPE_MAX_STREAM_DATA,
            Frame::MaxStreams { bidi: true, .. } => TYPE_MAX_STREAMS_BIDI,
            Frame::MaxStreams { bidi: false, .. } => TYPE_MAX_STREAMS_UNI,
            Frame::DataBlocked { .. } => TYPE_DATA_BLOCKED,
            Frame::StreamDataBlocked { .. } => TYPE_STREAM_DATA_BLOCKED,
            Frame::StreamsBlocked { bidi: true, .. } => TYPE_STREAMS_BLOCKED_BIDI,
            Frame::StreamsBlocked { bidi: false, .. } => TYPE_STREAMS_BLOCKED_UNI,
            Frame::NewConnectionId { .. } => TYPE_NEW_CONNECTION_ID,
            Frame::RetireConnectionId { .. } => TYPE_RETIRE_CONNECTION_ID,
            Frame::PathChallenge { .. } => TYPE_PATH_CHALLENGE,
            Frame::PathResponse { .. } => TYPE_PATH_RESPONSE,
            Frame::ConnectionClose { .. } => TYPE_CONNECTION_CLOSE,
            Frame::ApplicationClose { .. } => TYPE_APPLICATION_CLOSE,
            Frame::HandshakeDone => TYPE_HANDSHAKE_DONE,
        }
    }

    /// Whether receipt of this frame obliges the peer to send an ACK
    /// (draft-27 §13.2).
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. }
                | Frame::Ack { .. }
                | Frame::ConnectionClose { .. }
                | Frame::ApplicationClose { .. }
        )
    }

    /// Frame legality per packet type (draft-27 §12.4 table). 0-RTT is
    /// not produced by this endpoint; received 0-RTT packets are dropped
    /// before frame processing.
    pub fn allowed_in(&self, ty: PacketType) -> bool {
        match ty {
            PacketType::Initial | PacketType::Handshake => matches!(
                self,
                Frame::Padding { .. }
                    | Frame::Ping
                    | Frame::Ack { .. }
                    | Frame::Crypto { .. }
                    | Frame::ConnectionClose { .. }
            ),
            PacketType::Short => true,
            PacketType::ZeroRtt | PacketType::Retry => false,
        }
    }

    /// Decode the next frame from `r`.
    pub fn decode(r: &mut Reader<'a>) -> Result<Frame<'a>> {
        let ty = r.get_varint()?;
        let frame = match ty {
            TYPE_PADDING => {
                let mut len = 1;
                while !r.is_empty() && r.peek_u8()? == 0x00 {
                    r.get_u8()?;
                    len += 1;
                }
                Frame::Padding { len }
            }
            TYPE_PING => Frame::Ping,
            TYPE_ACK | TYPE_ACK_ECN => {
                let largest = r.get_varint()?;
                let delay = r.get_varint()?;
                let range_count = r.get_varint()?;
                let first_range = r.get_varint()?;

                let mut ranges = RangeSet::new();
                let mut smallest = largest.checked_sub(first_range).ok_or_else(encoding_err)?;
                ranges.insert(smallest..largest + 1);
                for _ in 0..range_count {
                    let gap = r.get_varint()?;
                    let len = r.get_varint()?;
                    // gap is the count of unacked packets minus one below
                    // the previous smallest.
                    let next_largest = smallest
                        .checked_sub(gap + 2)
                        .ok_or_else(encoding_err)?;
                    smallest = next_largest.checked_sub(len).ok_or_else(encoding_err)?;
                    ranges.insert(smallest..next_largest + 1);
                }
                let ecn = if ty == TYPE_ACK_ECN {
                    Some(EcnCounts {
                        ect0: r.get_varint()?,
                        ect1: r.get_varint()?,
                        ce: r.get_varint()?,
                    })
                } else {
                    None
                };
                Frame::Ack { ranges, delay, ecn }
            }
            TYPE_RESET_STREAM => Frame::ResetStream {
                stream_id: r.get_varint()?,
                error_code: r.get_varint()?,
                final_size: r.get_varint()?,
            },
            TYPE_STOP_SENDING => Frame::StopSending {
                stream_id: r.get_varint()?,
                error_code: r.get_varint()?,
            },
            TYPE_CRYPTO => {
                let offset = r.get_varint()?;
                let len = r.get_varint_len()?;
                Frame::Crypto {
                    offset,
                    data: r.get_bytes(len)?,
                }
            }
            TYPE_NEW_TOKEN => {
                let len = r.get_varint_len()?;
                if len == 0 {
                    return Err(encoding_err());
                }
                Frame::NewToken {
                    token: r.get_bytes(len)?,
                }
            }
            t if (TYPE_STREAM_BASE..TYPE_STREAM_BASE + 8).contains(&t) => {
                let stream_id = r.get_varint()?;
                let offset = if t & STREAM_OFF != 0 {
                    r.get_varint()?
                } else {
                    0
                };
                let data = if t & STREAM_LEN != 0 {
                    let len = r.get_varint_len()?;
                    r.get_bytes(len)?
                } else {
                    r.take_remaining()
                };
                Frame::Stream {
                    stream_id,
                    offset,
                    data,
                    fin: t & STREAM_FIN != 0,
                }
            }
            TYPE_MAX_DATA => Frame::MaxData {
                max: r.get_varint()?,
            },
            TYPE_MAX_STREAM_DATA => Frame::MaxStreamData {
                stream_id: r.get_varint()?,
                max: r.get_varint()?,
            },
            TYPE_MAX_STREAMS_BIDI | TYPE_MAX_STREAMS_UNI => Frame::MaxStreams {
                bidi: ty == TYPE_MAX_STREAMS_BIDI,
                max: r.get_varint()?,
            },
            TYPE_DATA_BLOCKED => Frame::DataBlocked {
                limit: r.get_varint()?,
            },
            TYPE_STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                stream_id: r.get_varint()?,
                limit: r.get_varint()?,
            },
            TYPE_STREAMS_BLOCKED_BIDI | TYPE_STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                bidi: ty == TYPE_STREAMS_BLOCKED_BIDI,
                limit: r.get_varint()?,
            },
            TYPE_NEW_CONNECTION_ID => {
                let seq = r.get_varint()?;
                let retire_prior_to = r.get_varint()?;
                let cid_len = r.get_u8()? as usize;
                if cid_len == 0 || cid_len > MAX_CID_LEN || retire_prior_to > seq {
                    return Err(encoding_err());
                }
                let cid = ConnectionId::from_slice(r.get_bytes(cid_len)?).ok_or_else(encoding_err)?;
                let mut reset_token = [0u8; 16];
                reset_token.copy_from_slice(r.get_bytes(16)?);
                Frame::NewConnectionId {
                    seq,
                    retire_prior_to,
                    cid,
                    reset_token,
                }
            }
            TYPE_RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                seq: r.get_varint()?,
            },
            TYPE_PATH_CHALLENGE => {
                let mut data = [0u8; 8];
                data.copy_from_slice(r.get_bytes(8)?);
                Frame::PathChallenge { data }
            }
            TYPE_PATH_RESPONSE => {
                let mut data = [0u8; 8];
                data.copy_from_slice(r.get_bytes(8)?);
                Frame::PathResponse { data }
            }
            TYPE_CONNECTION_CLOSE => {
                let error_code = r.get_varint()?;
                let frame_type = r.get_varint()?;
                let reason_len = r.get_varint_len()?;
                Frame::ConnectionClose {
                    error_code,
                    frame_type,
                    reason: r.get_bytes(reason_len)?,
                }
            }
            TYPE_APPLICATION_CLOSE => {
                let error_code = r.get_varint()?;
                let reason_len = r.get_varint_len()?;
                Frame::ApplicationClose {
                    error_code,
                    reason: r.get_bytes(reason_len)?,
                }
            }
            TYPE_HANDSHAKE_DONE => Frame::HandshakeDone,
            _ => return Err(encoding_err()),
        };
        Ok(frame)
    }

    /// Encode into `w`. STREAM frames always carry an explicit length and
    /// an offset field when the offset is non-zero.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        match self {
            Frame::Padding { len } => {
                for _ in 0..*len {
                    w.put_u8(0)?;
                }
            }
            Frame::Ping => w.put_varint(TYPE_PING)?,
            Frame::Ack { ranges, delay, ecn } => {
                let ty = if ecn.is_some() { TYPE_ACK_ECN } else { TYPE_ACK };
                let mut iter = ranges.iter().rev();
                let first = iter.next().ok_or(Error::BufferTooSmall)?;
                let largest = first.end - 1;

                w.put_varint(ty)?;
                w.put_varint(largest)?;
                w.put_varint(*delay)?;
                w.put_varint(ranges.len() as u64 - 1)?;
                w.put_varint(largest - first.start)?;

                let mut prev_smallest = first.start;
                for range in iter {
                    let next_largest = range.end - 1;
                    w.put_varint(prev_smallest - next_largest - 2)?;
                    w.put_varint(next_largest - range.start)?;
                    prev_smallest = range.start;
                }
                if let Some(ecn) = ecn {
                    w.put_varint(ecn.ect0)?;
                    w.put_varint(ecn.ect1)?;
                    w.put_varint(ecn.ce)?;
                }
            }
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                w.put_varint(TYPE_RESET_STREAM)?;
                w.put_varint(*stream_id)?;
                w.put_varint(*error_code)?;
                w.put_varint(*final_size)?;
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                w.put_varint(TYPE_STOP_SENDING)?;
                w.put_varint(*stream_id)?;
                w.put_varint(*error_code)?;
            }
            Frame::Crypto { offset, data } => {
                w.put_varint(TYPE_CRYPTO)?;
                w.put_varint(*offset)?;
                w.put_varint(data.len() as u64)?;
                w.put_bytes(data)?;
            }
            Frame::NewToken { token } => {
                w.put_varint(TYPE_NEW_TOKEN)?;
                w.put_varint(token.len() as u64)?;
                w.put_bytes(token)?;
            }
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                let mut ty = TYPE_STREAM_BASE | STREAM_LEN;
                if *offset > 0 {
                    ty |= STREAM_OFF;
                }
                if *fin {
                    ty |= STREAM_FIN;
                }
                w.put_varint(ty)?;
                w.put_varint(*stream_id)?;
                if *offset > 0 {
                    w.put_varint(*offset)?;
                }
                w.put_varint(data.len() as u64)?;
                w.put_bytes(data)?;
            }
            Frame::MaxData { max } => {
                w.put_varint(TYPE_MAX_DATA)?;
                w.put_varint(*max)?;
            }
            Frame::MaxStreamData { stream_id, max } => {
                w.put_varint(TYPE_MAX_STREAM_DATA)?;
                w.put_varint(*stream_id)?;
                w.put_varint(*max)?;
            }
            Frame::MaxStreams { bidi, max } => {
                w.put_varint(if *bidi {
                    TYPE_MAX_STREAMS_BIDI
                } else {
                    TYPE_MAX_STREAMS_UNI
                })?;
                w.put_varint(*max)?;
            }
            Frame::DataBlocked { limit } => {
                w.put_varint(TYPE_DATA_BLOCKED)?;
                w.put_varint(*limit)?;
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                w.put_varint(TYPE_STREAM_DATA_BLOCKED)?;
                w.put_varint(*stream_id)?;
                w.put_varint(*limit)?;
            }
            Frame::StreamsBlocked { bidi, limit } => {
                w.put_varint(if *bidi {
                    TYPE_STREAMS_BLOCKED_BIDI
                } else {
                    TYPE_STREAMS_BLOCKED_UNI
                })?;
                w.put_varint(*limit)?;
            }
            Frame::NewConnectionId {
                seq,
                retire_prior_to,
                cid,
                reset_token,
            } => {
                w.put_varint(TYPE_NEW_CONNECTION_ID)?;
                w.put_varint(*seq)?;
                w.put_varint(*retire_prior_to)?;
                w.put_u8(cid.len() as u8)?;
                w.put_bytes(cid.as_bytes())?;
                w.put_bytes(reset_token)?;
            }
            Frame::RetireConnectionId { seq } => {
                w.put_varint(TYPE_RETIRE_CONNECTION_ID)?;
                w.put_varint(*seq)?;
            }
            Frame::PathChallenge { data } => {
                w.put_varint(TYPE_PATH_CHALLENGE)?;
                w.put_bytes(data)?;
            }
            Frame::PathResponse { data } => {
                w.put_varint(TYPE_PATH_RESPONSE)?;
                w.put_bytes(data)?;
            }
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                w.put_varint(TYPE_CONNECTION_CLOSE)?;
                w.put_varint(*error_code)?;
                w.put_varint(*frame_type)?;
                w.put_varint(reason.len() as u64)?;
                w.put_bytes(reason)?;
            }
            Frame::ApplicationClose { error_code, reason } => {
                w.put_varint(TYPE_APPLICATION_CLOSE)?;
                w.put_varint(*error_code)?;
                w.put_varint(reason.len() as u64)?;
                w.put_bytes(reason)?;
            }
            Frame::HandshakeDone => w.put_varint(TYPE_HANDSHAKE_DONE)?,
        }
        Ok(())
    }

    /// Encoded size of this frame.
    pub fn wire_len(&self) -> usize {
        match self {
            Frame::Padding { len } => *len,
            Frame::Ping | Frame::HandshakeDone => 1,
            Frame::Ack { ranges, delay, ecn } => {
                let mut iter = ranges.iter().rev();
                let first = iter.next().expect("ack of nothing");
                let largest = first.end - 1;
                let mut len = 1
                    + varint_len(largest)
                    + varint_len(*delay)
                    + varint_len(ranges.len() as u64 - 1)
                    + varint_len(largest - first.start);
                let mut prev_smallest = first.start;
                for range in iter {
                    let next_largest = range.end - 1;
                    len += varint_len(prev_smallest - next_largest - 2)
                        + varint_len(next_largest - range.start);
                    prev_smallest = range.start;
                }
                if let Some(ecn) = ecn {
                    len += varint_len(ecn.ect0) + varint_len(ecn.ect1) + varint_len(ecn.ce);
                }
                len
            }
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => 1 + varint_len(*stream_id) + varint_len(*error_code) + varint_len(*final_size),
            Frame::StopSending {
                stream_id,
                error_code,
            } => 1 + varint_len(*stream_id) + varint_len(*error_code),
            Frame::Crypto { offset, data } => {
                1 + varint_len(*offset) + varint_len(data.len() as u64) + data.len()
            }
            Frame::NewToken { token } => 1 + varint_len(token.len() as u64) + token.len(),
            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => {
                let off = if *offset > 0 { varint_len(*offset) } else { 0 };
                1 + varint_len(*stream_id) + off + varint_len(data.len() as u64) + data.len()
            }
            Frame::MaxData { max } => 1 + varint_len(*max),
            Frame::MaxStreamData { stream_id, max } => {
                1 + varint_len(*stream_id) + varint_len(*max)
            }
            Frame::MaxStreams { max, .. } => 1 + varint_len(*max),
            Frame::DataBlocked { limit } => 1 + varint_len(*limit),
            Frame::StreamDataBlocked { stream_id, limit } => {
                1 + varint_len(*stream_id) + varint_len(*limit)
            }
            Frame::StreamsBlocked { limit, .. } => 1 + varint_len(*limit),
            Frame::NewConnectionId { seq, retire_prior_to, cid, .. } => {
                1 + varint_len(*seq) + varint_len(*retire_prior_to) + 1 + cid.len() + 16
            }
            Frame::RetireConnectionId { seq } => 1 + varint_len(*seq),
            Frame::PathChallenge { .. } | Frame::PathResponse { .. } => 1 + 8,
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                1 + varint_len(*error_code)
                    + varint_len(*frame_type)
                    + varint_len(reason.len() as u64)
                    + reason.len()
            }
            Frame::ApplicationClose { error_code, reason } => {
                1 + varint_len(*error_code) + varint_len(reason.len() as u64) + reason.len()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame<'_>) {
        let mut buf = [0u8; 256];
        let mut w = Writer::new(&mut buf);
        frame.encode(&mut w).unwrap();
        let len = w.offset();
        assert_eq!(len, frame.wire_len(), "wire_len of {frame:?}");
        let mut r = Reader::new(&buf[..len]);
        let decoded = Frame::decode(&mut r).unwrap();
        assert!(r.is_empty(), "trailing bytes after {frame:?}");
        assert_eq!(decoded, frame);
    }

    fn ack_ranges(ranges: &[core::ops::Range<u64>]) -> RangeSet {
        let mut set = RangeSet::new();
        for r in ranges {
            set.insert(r.clone());
        }
        set
    }

    #[test]
    fn round_trip_every_type() {
        round_trip(Frame::Padding { len: 5 });
        round_trip(Frame::Ping);
        round_trip(Frame::Ack {
            ranges: ack_ranges(&[0..4, 7..8, 20..33]),
            delay: 1987,
            ecn: None,
        });
        round_trip(Frame::Ack {
            ranges: ack_ranges(&[2..3]),
            delay: 0,
            ecn: Some(EcnCounts {
                ect0: 1,
                ect1: 2,
                ce: 3,
            }),
        });
        round_trip(Frame::ResetStream {
            stream_id: 4,
            error_code: 0x77,
            final_size: 8190,
        });
        round_trip(Frame::StopSending {
            stream_id: 9,
            error_code: 15,
        });
        round_trip(Frame::Crypto {
            offset: 1200,
            data: b"client hello",
        });
        round_trip(Frame::NewToken { token: b"tok" });
        round_trip(Frame::Stream {
            stream_id: 2,
            offset: 0,
            data: &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
            fin: false,
        });
        round_trip(Frame::Stream {
            stream_id: 3,
            offset: 77,
            data: b"",
            fin: true,
        });
        round_trip(Frame::MaxData { max: 1 << 20 });
        round_trip(Frame::MaxStreamData {
            stream_id: 8,
            max: 4096,
        });
        round_trip(Frame::MaxStreams {
            bidi: true,
            max: 100,
        });
        round_trip(Frame::MaxStreams {
            bidi: false,
            max: 3,
        });
        round_trip(Frame::DataBlocked { limit: 500 });
        round_trip(Frame::StreamDataBlocked {
            stream_id: 1,
            limit: 80,
        });
        round_trip(Frame::StreamsBlocked {
            bidi: false,
            limit: 9,
        });
        round_trip(Frame::NewConnectionId {
            seq: 3,
            retire_prior_to: 1,
            cid: ConnectionId::from_slice(&[1, 2, 3, 4, 5]).unwrap(),
            reset_token: [0xab; 16],
        });
        round_trip(Frame::RetireConnectionId { seq: 2 });
        round_trip(Frame::PathChallenge { data: [7; 8] });
        round_trip(Frame::PathResponse { data: [8; 8] });
        round_trip(Frame::ConnectionClose {
            error_code: 0x0A,
            frame_type: TYPE_STREAM_BASE,
            reason: b"bad stream",
        });
        round_trip(Frame::ApplicationClose {
            error_code: 42,
            reason: b"",
        });
        round_trip(Frame::HandshakeDone);
    }

    #[test]
    fn padding_run_is_folded() {
        let buf = [0u8; 9];
        let mut r = Reader::new(&buf);
        assert_eq!(Frame::decode(&mut r).unwrap(), Frame::Padding { len: 9 });
        assert!(r.is_empty());
    }

    #[test]
    fn stream_without_len_takes_rest() {
        // Type 0x08: no OFF, no LEN, no FIN.
        let buf = [0x08, 0x04, 0xaa, 0xbb, 0xcc];
        let mut r = Reader::new(&buf);
        match Frame::decode(&mut r).unwrap() {
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                assert_eq!(stream_id, 4);
                assert_eq!(offset, 0);
                assert_eq!(data, &[0xaa, 0xbb, 0xcc]);
                assert!(!fin);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_frames_rejected() {
        for bad in [
            &[0x02u8, 0x05][..],          // ACK missing fields
            &[0x06, 0x00, 0x05, 1, 2][..], // CRYPTO length beyond buffer
            &[0x1a, 1, 2, 3][..],          // PATH_CHALLENGE short
            &[0x18, 0x01, 0x00, 21][..],   // NEW_CONNECTION_ID oversized cid
        ] {
            let mut r = Reader::new(bad);
            assert!(Frame::decode(&mut r).is_err(), "accepted {bad:02x?}");
        }
    }

    #[test]
    fn ack_first_range_underflow_rejected() {
        // largest=2 but first_range=5.
        let buf = [0x02, 0x02, 0x00, 0x00, 0x05];
        let mut r = Reader::new(&buf);
        assert!(Frame::decode(&mut r).is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        let buf = [0x21, 0x00];
        let mut r = Reader::new(&buf);
        assert!(Frame::decode(&mut r).is_err());
    }

    #[test]
    fn retire_prior_to_above_seq_rejected() {
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        w.put_varint(TYPE_NEW_CONNECTION_ID).unwrap();
        w.put_varint(1).unwrap(); // seq
        w.put_varint(3).unwrap(); // retire_prior_to > seq
        w.put_u8(1).unwrap();
        w.put_u8(0xff).unwrap();
        w.put_bytes(&[0; 16]).unwrap();
        let len = w.offset();
        let mut r = Reader::new(&buf[..len]);
        assert!(Frame::decode(&mut r).is_err());
    }

    #[test]
    fn legality_by_packet_type() {
        let stream = Frame::Stream {
            stream_id: 0,
            offset: 0,
            data: b"x",
            fin: false,
        };
        let crypto = Frame::Crypto {
            offset: 0,
            data: b"x",
        };
        assert!(!stream.allowed_in(PacketType::Initial));
        assert!(stream.allowed_in(PacketType::Short));
        assert!(crypto.allowed_in(PacketType::Initial));
        assert!(crypto.allowed_in(PacketType::Handshake));
        let app_close = Frame::ApplicationClose {
            error_code: 0,
            reason: b"",
        };
        assert!(!app_close.allowed_in(PacketType::Handshake));
        assert!(app_close.allowed_in(PacketType::Short));
    }

    #[test]
    fn ack_eliciting_classification() {
        assert!(!Frame::Padding { len: 1 }.is_ack_eliciting());
        assert!(!Frame::Ack {
            ranges: ack_ranges(&[0..1]),
            delay: 0,
            ecn: None
        }
        .is_ack_eliciting());
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(Frame::MaxData { max: 1 }.is_ack_eliciting());
        assert!(!Frame::ApplicationClose {
            error_code: 0,
            reason: b""
        }
        .is_ack_eliciting());
    }
}
