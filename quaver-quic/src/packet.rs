//! Packet headers and packet-number encoding (draft-27 §17, §A).
//!
//! Long headers carry `1|1|T|T|R|R|P|P` in the first byte, short headers
//! `0|1|S|R|R|K|P|P`; the spin bit is not used. Packet numbers go on the
//! wire truncated to 1-4 bytes and are reconstructed against the largest
//! number processed in the same space.

use bytes::Bytes;
use rand::RngCore;

use crate::codec::Reader;
use crate::crypto::Level;
use crate::error::{Error, Result, TransportError};

/// The draft-27 version number.
pub const VERSION_DRAFT_27: u32 = 0xff00_001b;

/// Connection ids may be up to 20 bytes.
pub const MAX_CID_LEN: usize = 20;

/// Minimum UDP datagram length for client Initial packets.
pub const MIN_INITIAL_LEN: usize = 1200;

/// An opaque connection id, up to [`MAX_CID_LEN`] bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    pub fn new(bytes: Bytes) -> Option<Self> {
        (bytes.len() <= MAX_CID_LEN).then_some(Self { bytes })
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        Self::new(Bytes::copy_from_slice(slice))
    }

    /// Freshly generated random id of `len` bytes.
    pub fn random(len: usize) -> Self {
        debug_assert!(len <= MAX_CID_LEN);
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            bytes: Bytes::from(bytes),
        }
    }

    pub fn empty() -> Self {
        Self {
            bytes: Bytes::new(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for b in self.bytes.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Wire packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    Short,
}

impl PacketType {
    /// Long-header type bits (`T T` of the first byte).
    pub fn from_long_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => PacketType::Initial,
            1 => PacketType::ZeroRtt,
            2 => PacketType::Handshake,
            _ => PacketType::Retry,
        }
    }

    pub fn long_bits(self) -> u8 {
        match self {
            PacketType::Initial => 0,
            PacketType::ZeroRtt => 1,
            PacketType::Handshake => 2,
            PacketType::Retry => 3,
            PacketType::Short => unreachable!("short packets have no long type bits"),
        }
    }

    pub fn level(self) -> Level {
        match self {
            PacketType::Initial | PacketType::Retry => Level::Initial,
            PacketType::ZeroRtt => Level::EarlyData,
            PacketType::Handshake => Level::Handshake,
            PacketType::Short => Level::Application,
        }
    }
}

/// Packet number spaces. 0-RTT and 1-RTT share `Application`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpaceId {
    Initial = 0,
    Handshake = 1,
    Application = 2,
}

impl SpaceId {
    pub const COUNT: usize = 3;
    pub const ALL: [SpaceId; 3] = [SpaceId::Initial, SpaceId::Handshake, SpaceId::Application];

    pub fn from_level(level: Level) -> Self {
        match level {
            Level::Initial => SpaceId::Initial,
            Level::Handshake => SpaceId::Handshake,
            Level::EarlyData | Level::Application => SpaceId::Application,
        }
    }
}

/// A parsed, still header-protected packet header.
///
/// `pn_offset` is the offset of the packet number field within the
/// sub-packet; `payload_len` (long headers) covers packet number plus
/// protected payload.
#[derive(Debug)]
pub struct PlainHeader {
    pub ty: PacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: Option<ConnectionId>,
    pub token: Option<Bytes>,
    pub payload_len: Option<usize>,
    pub pn_offset: usize,
}

fn violation() -> Error {
    Error::transport(TransportError::ProtocolViolation)
}

/// Parse one sub-packet header from the front of `buf`. For short headers
/// the destination id length is not self-describing and is taken from
/// `local_cid_len`.
pub fn parse_header(buf: &[u8], local_cid_len: usize) -> Result<PlainHeader> {
    let mut r = Reader::new(buf);
    let first = r.get_u8()?;

    // Fixed bit must be set in every draft-27 packet.
    if first & 0x40 == 0 {
        return Err(violation());
    }

    if first & 0x80 == 0 {
        // Short header: dcid of locally chosen length, then packet number.
        let dcid = ConnectionId::from_slice(r.get_bytes(local_cid_len)?).ok_or_else(violation)?;
        return Ok(PlainHeader {
            ty: PacketType::Short,
            version: 0,
            dcid,
            scid: None,
            token: None,
            payload_len: None,
            pn_offset: r.offset(),
        });
    }

    let ty = PacketType::from_long_bits(first >> 4);
    let version = r.get_u32()?;

    let dcid_len = r.get_u8()? as usize;
    if dcid_len > MAX_CID_LEN {
        return Err(violation());
    }
    let dcid = ConnectionId::from_slice(r.get_bytes(dcid_len)?).ok_or_else(violation)?;

    let scid_len = r.get_u8()? as usize;
    if scid_len > MAX_CID_LEN {
        return Err(violation());
    }
    let scid = ConnectionId::from_slice(r.get_bytes(scid_len)?).ok_or_else(violation)?;

    let token = if ty == PacketType::Initial {
        let token_len = r.get_varint_len()?;
        Some(Bytes::copy_from_slice(r.get_bytes(token_len)?))
    } else {
        None
    };

    let payload_len = if ty == PacketType::Retry {
        None
    } else {
        Some(r.get_varint_len()?)
    };

    Ok(PlainHeader {
        ty,
        version,
        dcid,
        scid: Some(scid),
        token,
        payload_len,
        pn_offset: r.offset(),
    })
}

/// Smallest truncated packet-number length that is unambiguous given the
/// largest acknowledged number (draft-27 §A.2).
pub fn pn_len(full_pn: u64, largest_acked: Option<u64>) -> usize {
    let num_unacked = match largest_acked {
        Some(acked) => full_pn.saturating_sub(acked),
        None => full_pn + 1,
    };
    if num_unacked < 1 << 7 {
        1
    } else if num_unacked < 1 << 15 {
        2
    } else if num_unacked < 1 << 23 {
        3
    } else {
        4
    }
}

/// Reconstruct a full 62-bit packet number from its truncation
/// (draft-27 §A.3). `largest` is the largest number processed in the same
/// space, or `None` before any.
pub fn decode_pn(largest: Option<u64>, truncated: u64, pn_len: usize) -> u64 {
    let expected = largest.map_or(0, |l| l + 1);
    let pn_nbits = pn_len * 8;
    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected & !pn_mask) | truncated;
    if candidate + pn_hwin <= expected && candidate + pn_win < (1u64 << 62) {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_sequential() {
        assert_eq!(decode_pn(None, 0, 1), 0);
        assert_eq!(decode_pn(Some(0), 1, 1), 1);
        assert_eq!(decode_pn(Some(1), 2, 1), 2);
    }

    #[test]
    fn decode_wraps_forward() {
        assert_eq!(decode_pn(Some(255), 0, 1), 256);
        assert_eq!(decode_pn(Some(65535), 0, 2), 65536);
    }

    #[test]
    fn decode_draft_example() {
        // §A.3 worked example.
        assert_eq!(decode_pn(Some(0xa82f30ea), 0x9b32, 2), 0xa82f9b32);
    }

    #[test]
    fn encode_length_tracks_gap() {
        assert_eq!(pn_len(10, Some(5)), 1);
        assert_eq!(pn_len(200, Some(5)), 2);
        assert_eq!(pn_len(50_000, Some(5)), 3);
        assert_eq!(pn_len(10_000_000, Some(5)), 4);
        assert_eq!(pn_len(0, None), 1);
    }

    #[test]
    fn pn_round_trip() {
        for (full, largest) in [(42u64, Some(40u64)), (1_000_000, Some(999_950)), (3, None)] {
            let len = pn_len(full, largest);
            let truncated = full & ((1u64 << (8 * len)) - 1);
            // The receiver has processed everything up to `full - 1`.
            let largest_rx = if full == 0 { None } else { Some(full - 1) };
            assert_eq!(decode_pn(largest_rx, truncated, len), full);
        }
    }

    #[test]
    fn parse_short_header() {
        let mut buf = vec![0x43u8];
        buf.extend_from_slice(&[0xaa; 8]); // dcid
        buf.extend_from_slice(&[0, 0, 0, 0]); // pn + payload
        let hdr = parse_header(&buf, 8).unwrap();
        assert_eq!(hdr.ty, PacketType::Short);
        assert_eq!(hdr.dcid.len(), 8);
        assert_eq!(hdr.pn_offset, 9);
    }

    #[test]
    fn parse_long_header_initial() {
        let mut buf = vec![0xc0u8]; // long, Initial
        buf.extend_from_slice(&VERSION_DRAFT_27.to_be_bytes());
        buf.push(4);
        buf.extend_from_slice(&[1, 2, 3, 4]);
        buf.push(2);
        buf.extend_from_slice(&[9, 9]);
        buf.push(0); // empty token
        buf.push(17); // length
        buf.extend_from_slice(&[0u8; 17]);
        let hdr = parse_header(&buf, 0).unwrap();
        assert_eq!(hdr.ty, PacketType::Initial);
        assert_eq!(hdr.version, VERSION_DRAFT_27);
        assert_eq!(hdr.dcid.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(hdr.scid.unwrap().as_bytes(), &[9, 9]);
        assert_eq!(hdr.token.unwrap().len(), 0);
        assert_eq!(hdr.payload_len, Some(17));
        assert_eq!(hdr.pn_offset, 14);
    }

    #[test]
    fn missing_fixed_bit_rejected() {
        assert!(parse_header(&[0x00, 1, 2, 3], 0).is_err());
    }

    #[test]
    fn oversized_cid_rejected() {
        let mut buf = vec![0xc0u8];
        buf.extend_from_slice(&VERSION_DRAFT_27.to_be_bytes());
        buf.push(21);
        buf.extend_from_slice(&[0; 40]);
        assert!(parse_header(&buf, 0).is_err());
    }
}
