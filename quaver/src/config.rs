//! Endpoint configuration, deserializable from whatever format the host
//! application prefers.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;

use quaver_quic::TransportParams;

/// Kernel-level socket tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// SO_RCVBUF, if set.
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF, if set.
    pub send_buffer_size: Option<usize>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: Some(4 * 1024 * 1024),
            send_buffer_size: Some(4 * 1024 * 1024),
        }
    }
}

/// Per-connection transport tuning, mirrored into transport parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub idle_timeout_ms: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_udp_payload: usize,
    pub cid_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            initial_max_data: 1 << 20,
            initial_max_stream_data: 256 * 1024,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 16,
            max_udp_payload: 1350,
            cid_len: 8,
        }
    }
}

/// Top-level endpoint configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub socket: SocketConfig,
    pub transport: TransportConfig,
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.transport.max_udp_payload < 1200 {
            bail!(
                "max_udp_payload must be at least 1200, got {}",
                self.transport.max_udp_payload
            );
        }
        if self.transport.cid_len == 0 || self.transport.cid_len > 20 {
            bail!("cid_len must be 1..=20, got {}", self.transport.cid_len);
        }
        if self.transport.idle_timeout_ms != 0
            && self.transport.idle_timeout_ms < 1_000
        {
            bail!("idle_timeout_ms below 1s is going to flap; set 0 to disable");
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.transport.idle_timeout_ms > 0)
            .then(|| Duration::from_millis(self.transport.idle_timeout_ms))
    }

    /// Translate to the protocol core's connection config.
    pub fn to_connection_config(&self) -> quaver_quic::Config {
        let t = &self.transport;
        let transport_params = TransportParams {
            max_idle_timeout: t.idle_timeout_ms,
            initial_max_data: t.initial_max_data,
            initial_max_stream_data_bidi_local: t.initial_max_stream_data,
            initial_max_stream_data_bidi_remote: t.initial_max_stream_data,
            initial_max_stream_data_uni: t.initial_max_stream_data,
            initial_max_streams_bidi: t.initial_max_streams_bidi,
            initial_max_streams_uni: t.initial_max_streams_uni,
            ..TransportParams::default()
        };
        quaver_quic::Config {
            transport_params,
            max_udp_payload: t.max_udp_payload,
            cid_len: t.cid_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EndpointConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_tiny_datagrams() {
        let mut config = EndpointConfig::default();
        config.transport.max_udp_payload = 1100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_flappy_idle() {
        let mut config = EndpointConfig::default();
        config.transport.idle_timeout_ms = 10;
        assert!(config.validate().is_err());
        config.transport.idle_timeout_ms = 0;
        config.validate().unwrap();
    }

    #[test]
    fn maps_into_transport_params() {
        let config = EndpointConfig::default();
        let core = config.to_connection_config();
        assert_eq!(core.transport_params.initial_max_data, 1 << 20);
        assert_eq!(core.transport_params.max_idle_timeout, 30_000);
        assert_eq!(core.cid_len, 8);
    }
}
