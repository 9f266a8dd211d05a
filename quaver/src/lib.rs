//! # quaver: QUIC endpoint driver
//!
//! Binds [`quaver_quic`] connections to a UDP socket and drives them from
//! one worker task per socket. The worker owns all connection state; the
//! application holds [`ConnectionHandle`]s and per-stream handles and
//! communicates over channels, exactly as the transport core's
//! concurrency model requires.
//!
//! ```rust,ignore
//! let (mut ctx, handle) = SocketContext::bind("0.0.0.0:4433".parse()?, config)?;
//! ctx.listen(Box::new(|| my_tls_session()));
//! tokio::spawn(ctx.run());
//!
//! let conn = handle.connect(peer, client_tls).await?;
//! let stream = conn.open_stream(true).await?;
//! ```

pub mod config;
pub mod context;
pub mod socket;

pub use config::{EndpointConfig, SocketConfig, TransportConfig};
pub use context::{ConnectionHandle, ContextHandle, SocketContext, TlsFactory};

pub use quaver_quic::{
    Config, Connection, Error, Event, RecvStreamHandle, SendStreamHandle, StreamHandles,
    TlsSession, TransportParams,
};

/// Install a `tracing` subscriber honoring `RUST_LOG`, for binaries that
/// have nothing fancier.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
