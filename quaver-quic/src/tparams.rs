//! Transport parameters (draft-27 §18), carried in a dedicated TLS
//! extension. Unknown parameters are ignored; a duplicated id is a
//! `TransportParameter` connection error.

use crate::codec::{varint_len, Reader};
use crate::error::{Error, Result, TransportError};
use crate::packet::ConnectionId;

const ID_ORIGINAL_CONNECTION_ID: u64 = 0x00;
const ID_MAX_IDLE_TIMEOUT: u64 = 0x01;
const ID_STATELESS_RESET_TOKEN: u64 = 0x02;
const ID_MAX_PACKET_SIZE: u64 = 0x03;
const ID_INITIAL_MAX_DATA: u64 = 0x04;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const ID_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const ID_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const ID_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const ID_ACK_DELAY_EXPONENT: u64 = 0x0a;
const ID_MAX_ACK_DELAY: u64 = 0x0b;
const ID_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const ID_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;

/// Transport parameters as exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// Destination connection id of the client's first Initial, echoed by
    /// the server.
    pub original_connection_id: Option<ConnectionId>,
    /// Milliseconds; 0 disables the idle timeout.
    pub max_idle_timeout: u64,
    pub stateless_reset_token: Option<[u8; 16]>,
    /// Largest UDP payload the peer is willing to receive (>= 1200).
    pub max_packet_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    /// Milliseconds.
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            original_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_packet_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
        }
    }
}

fn push_varint(buf: &mut Vec<u8>, v: u64) {
    match varint_len(v) {
        1 => buf.push(v as u8),
        2 => buf.extend_from_slice(&((v as u16) | 0x4000).to_be_bytes()),
        4 => buf.extend_from_slice(&((v as u32) | 0x8000_0000).to_be_bytes()),
        _ => buf.extend_from_slice(&(v | 0xc000_0000_0000_0000).to_be_bytes()),
    }
}

fn push_param(buf: &mut Vec<u8>, id: u64, value: &[u8]) {
    push_varint(buf, id);
    push_varint(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

fn push_varint_param(buf: &mut Vec<u8>, id: u64, value: u64) {
    push_varint(buf, id);
    push_varint(buf, varint_len(value) as u64);
    push_varint(buf, value);
}

fn param_err() -> Error {
    Error::transport(TransportError::TransportParameter)
}

impl TransportParams {
    /// Encode for the TLS extension. Parameters that still hold their
    /// draft-27 default are omitted.
    pub fn encode(&self) -> Vec<u8> {
        let defaults = TransportParams::default();
        let mut buf = Vec::with_capacity(128);

        if let Some(cid) = &self.original_connection_id {
            push_param(&mut buf, ID_ORIGINAL_CONNECTION_ID, cid.as_bytes());
        }
        if self.max_idle_timeout != defaults.max_idle_timeout {
            push_varint_param(&mut buf, ID_MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        }
        if let Some(token) = &self.stateless_reset_token {
            push_param(&mut buf, ID_STATELESS_RESET_TOKEN, token);
        }
        if self.max_packet_size != defaults.max_packet_size {
            push_varint_param(&mut buf, ID_MAX_PACKET_SIZE, self.max_packet_size);
        }
        if self.initial_max_data != 0 {
            push_varint_param(&mut buf, ID_INITIAL_MAX_DATA, self.initial_max_data);
        }
        if self.initial_max_stream_data_bidi_local != 0 {
            push_varint_param(
                &mut buf,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
                self.initial_max_stream_data_bidi_local,
            );
        }
        if self.initial_max_stream_data_bidi_remote != 0 {
            push_varint_param(
                &mut buf,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
                self.initial_max_stream_data_bidi_remote,
            );
        }
        if self.initial_max_stream_data_uni != 0 {
            push_varint_param(
                &mut buf,
                ID_INITIAL_MAX_STREAM_DATA_UNI,
                self.initial_max_stream_data_uni,
            );
        }
        if self.initial_max_streams_bidi != 0 {
            push_varint_param(
                &mut buf,
                ID_INITIAL_MAX_STREAMS_BIDI,
                self.initial_max_streams_bidi,
            );
        }
        if self.initial_max_streams_uni != 0 {
            push_varint_param(
                &mut buf,
                ID_INITIAL_MAX_STREAMS_UNI,
                self.initial_max_streams_uni,
            );
        }
        if self.ack_delay_exponent != defaults.ack_delay_exponent {
            push_varint_param(&mut buf, ID_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        }
        if self.max_ack_delay != defaults.max_ack_delay {
            push_varint_param(&mut buf, ID_MAX_ACK_DELAY, self.max_ack_delay);
        }
        if self.disable_active_migration {
            push_param(&mut buf, ID_DISABLE_ACTIVE_MIGRATION, &[]);
        }
        if self.active_connection_id_limit != defaults.active_connection_id_limit {
            push_varint_param(
                &mut buf,
                ID_ACTIVE_CONNECTION_ID_LIMIT,
                self.active_connection_id_limit,
            );
        }
        buf
    }

    /// Decode the peer's parameters. `is_server` is the *local* role:
    /// a server must not receive server-only parameters from a client.
    pub fn decode(raw: &[u8], is_server: bool) -> Result<Self> {
        let mut params = TransportParams::default();
        let mut seen: u64 = 0;
        let mut r = Reader::new(raw);

        while !r.is_empty() {
            let id = r.get_varint()?;
            let len = r.get_varint_len()?;
            let value = r.get_bytes(len).map_err(|_| param_err())?;
            let mut vr = Reader::new(value);

            // Duplicate detection for the ids we track.
            if id < 64 {
                let bit = 1u64 << id;
                if seen & bit != 0 {
                    return Err(param_err());
                }
                seen |= bit;
            }

            match id {
                ID_ORIGINAL_CONNECTION_ID => {
                    if is_server {
                        return Err(param_err());
                    }
                    params.original_connection_id =
                        Some(ConnectionId::from_slice(value).ok_or_else(param_err)?);
                }
                ID_MAX_IDLE_TIMEOUT => params.max_idle_timeout = vr.get_varint()?,
                ID_STATELESS_RESET_TOKEN => {
                    if is_server || value.len() != 16 {
                        return Err(param_err());
                    }
                    let mut token = [0u8; 16];
                    token.copy_from_slice(value);
                    params.stateless_reset_token = Some(token);
                }
                ID_MAX_PACKET_SIZE => {
                    params.max_packet_size = vr.get_varint()?;
                    if params.max_packet_size < 1200 {
                        return Err(param_err());
                    }
                }
                ID_INITIAL_MAX_DATA => params.initial_max_data = vr.get_varint()?,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = vr.get_varint()?
                }
                ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = vr.get_varint()?
                }
                ID_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = vr.get_varint()?
                }
                ID_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = vr.get_varint()?
                }
                ID_INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = vr.get_varint()?,
                ID_ACK_DELAY_EXPONENT => {
                    params.ack_delay_exponent = vr.get_varint()?;
                    if params.ack_delay_exponent > 20 {
                        return Err(param_err());
                    }
                }
                ID_MAX_ACK_DELAY => {
                    params.max_ack_delay = vr.get_varint()?;
                    if params.max_ack_delay >= 1 << 14 {
                        return Err(param_err());
                    }
                }
                ID_DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(param_err());
                    }
                    params.disable_active_migration = true;
                }
                ID_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = vr.get_varint()?
                }
                _ => {} // unknown parameters are ignored
            }
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let params = TransportParams {
            original_connection_id: Some(ConnectionId::from_slice(&[1, 2, 3]).unwrap()),
            max_idle_timeout: 30_000,
            stateless_reset_token: Some([9; 16]),
            max_packet_size: 1350,
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 65536,
            initial_max_stream_data_bidi_remote: 65536,
            initial_max_stream_data_uni: 32768,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 8,
            ack_delay_exponent: 8,
            max_ack_delay: 40,
            disable_active_migration: true,
            active_connection_id_limit: 4,
        };
        let encoded = params.encode();
        let decoded = TransportParams::decode(&encoded, false).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn defaults_encode_empty() {
        assert!(TransportParams::default().encode().is_empty());
    }

    #[test]
    fn unknown_parameter_ignored() {
        let mut raw = Vec::new();
        push_param(&mut raw, 0x33, &[1, 2, 3]);
        push_varint_param(&mut raw, ID_INITIAL_MAX_DATA, 77);
        let params = TransportParams::decode(&raw, true).unwrap();
        assert_eq!(params.initial_max_data, 77);
    }

    #[test]
    fn duplicate_parameter_rejected() {
        let mut raw = Vec::new();
        push_varint_param(&mut raw, ID_INITIAL_MAX_DATA, 1);
        push_varint_param(&mut raw, ID_INITIAL_MAX_DATA, 2);
        assert!(TransportParams::decode(&raw, true).is_err());
    }

    #[test]
    fn server_only_parameter_from_client_rejected() {
        let mut raw = Vec::new();
        push_param(&mut raw, ID_STATELESS_RESET_TOKEN, &[0; 16]);
        assert!(TransportParams::decode(&raw, true).is_err());
        assert!(TransportParams::decode(&raw, false).is_ok());
    }

    #[test]
    fn bounds_enforced() {
        let mut raw = Vec::new();
        push_varint_param(&mut raw, ID_ACK_DELAY_EXPONENT, 21);
        assert!(TransportParams::decode(&raw, false).is_err());

        let mut raw = Vec::new();
        push_varint_param(&mut raw, ID_MAX_PACKET_SIZE, 1100);
        assert!(TransportParams::decode(&raw, false).is_err());
    }
}
