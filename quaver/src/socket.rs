//! UDP socket creation and tuning.
//!
//! Uses `socket2` for the options tokio's bind API does not expose:
//! SO_REUSEADDR and the kernel buffer sizes that matter for sustained
//! UDP throughput. The socket ends up non-blocking and registered with
//! the tokio reactor.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::SocketConfig;

/// Create and configure a UDP socket bound to `bind_addr`.
pub fn create_udp_socket(bind_addr: SocketAddr, config: &SocketConfig) -> Result<UdpSocket> {
    let domain = match bind_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("creating UDP socket")?;

    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;

    if let Some(size) = config.recv_buffer_size {
        socket
            .set_recv_buffer_size(size)
            .with_context(|| format!("setting SO_RCVBUF to {size}"))?;
    }
    if let Some(size) = config.send_buffer_size {
        socket
            .set_send_buffer_size(size)
            .with_context(|| format!("setting SO_SNDBUF to {size}"))?;
    }

    if let SocketAddr::V6(addr) = bind_addr {
        socket
            .set_only_v6(!addr.ip().is_unspecified())
            .context("setting IPV6_V6ONLY")?;
    }

    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("binding UDP socket to {bind_addr}"))?;

    socket
        .set_nonblocking(true)
        .context("setting O_NONBLOCK")?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("registering socket with the reactor")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_ephemeral() {
        let config = SocketConfig::default();
        let socket = create_udp_socket("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn loopback_datagram() {
        let config = SocketConfig::default();
        let a = create_udp_socket("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let b = create_udp_socket("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        a.send_to(b"ping", b.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
