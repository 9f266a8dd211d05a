//! # quaver-quic: QUIC (draft-27) transport state machine
//!
//! The per-connection core of a QUIC endpoint: reliable, multiplexed,
//! encrypted delivery over an unreliable datagram service. The crate is
//! organized leaves-first:
//!
//! ```text
//! quaver-quic/
//! ├── codec     - variable-length integers, bounds-checked cursors
//! ├── ranges    - ordered disjoint interval sets
//! ├── window    - sliding duplicate-detection window
//! ├── pool      - fixed-size slab pool with back-pressure permits
//! ├── crypto    - AEAD seals, header protection, key schedule, TLS trait
//! ├── packet    - headers, connection ids, packet-number truncation
//! ├── frame     - every draft-27 frame, zero-copy decode
//! ├── tparams   - transport parameters
//! ├── recovery  - RTT, PTO, loss detection, NewReno
//! ├── space     - per-epoch packet-number space and crypto streams
//! ├── stream    - send/receive streams and the stream registry
//! ├── cid       - connection-id issuance and retirement
//! └── connection - the receive/send paths, handshake, key update, close
//! ```
//!
//! The [`Connection`] is a single-owner state machine: one worker drives
//! its receive path, send path and timers with explicit `Instant`s, and
//! the application touches it only through per-stream handles
//! ([`SendStreamHandle`], [`RecvStreamHandle`]) backed by channels and a
//! wake signal. No sockets, no clocks, no TLS internals are owned here;
//! see the `quaver` crate for the UDP socket context.

pub mod cid;
pub mod codec;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod packet;
pub mod pool;
pub mod ranges;
pub mod recovery;
pub mod space;
pub mod stream;
pub mod tparams;
pub mod window;

pub use connection::{Config, Connection, ConnectionStats, Event};
pub use crypto::{HandshakeStatus, Level, TlsEvent, TlsSession};
pub use error::{Error, Result, TransportError};
pub use frame::Frame;
pub use packet::{ConnectionId, VERSION_DRAFT_27};
pub use ranges::RangeSet;
pub use stream::{
    RecvStreamHandle, SendStreamHandle, StreamHandles, StreamId, MAX_HELD_CHUNKS,
};
pub use tparams::TransportParams;

/// Which end of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_server(self) -> bool {
        matches!(self, Side::Server)
    }

    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}
