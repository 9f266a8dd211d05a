//! The per-connection state machine (draft-27 §5, §10, §12-§13).
//!
//! One worker drives each connection: the receive path unseals coalesced
//! packets and processes frames in wire order; the send path assembles
//! one datagram per call, coalescing packets of ascending encryption
//! levels under a frame-priority scheme; timers cover loss recovery, ACK
//! deadlines, idle and the closing/draining periods. The TLS stack is an
//! external collaborator reached through [`TlsSession`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::cid::CidManager;
use crate::codec::{Reader, Writer};
use crate::crypto::{HandshakeStatus, Level, Seal, TlsEvent, TlsSession, TAG_LEN};
use crate::error::{Error, Result, TransportError};
use crate::frame::{self, Frame};
use crate::packet::{
    self, ConnectionId, PacketType, SpaceId, MIN_INITIAL_LEN, VERSION_DRAFT_27,
};
use crate::pool::{BufferPool, CHUNK_SIZE};
use crate::recovery::{FrameList, Recovery, SentFrame, SentPacket, TimerEvent};
use crate::space::PacketSpace;
use crate::stream::{SendState, StreamHandles, StreamId, StreamMap};
use crate::tparams::TransportParams;
use crate::Side;

/// Hard ceiling on a single datagram (2^14 - 1, draft-27 §14).
const MAX_DATAGRAM_CEILING: usize = (1 << 14) - 1;
/// Closing and draining last three probe timeouts.
const CLOSE_PTO_FACTOR: u32 = 3;

/// Connection configuration: local transport parameters plus the knobs
/// the state machine needs directly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Transport parameters offered to the peer during the handshake.
    pub transport_params: TransportParams,
    /// Local cap on outgoing datagrams, before the peer's limit applies.
    pub max_udp_payload: usize,
    /// Length of locally issued connection ids.
    pub cid_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        let transport_params = TransportParams {
            max_idle_timeout: 30_000,
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 256 * 1024,
            initial_max_stream_data_bidi_remote: 256 * 1024,
            initial_max_stream_data_uni: 256 * 1024,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 16,
            ..TransportParams::default()
        };
        Self {
            transport_params,
            max_udp_payload: 1350,
            cid_len: 8,
        }
    }
}

/// Connection lifecycle (draft-27 §10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Handshake in progress; only crypto and ACK traffic flows.
    Handshaking,
    /// Handshake complete; application streams are live.
    Connected,
    /// Local close: nothing but CONNECTION_CLOSE goes out, repeated on
    /// any receive, for 3 x PTO.
    Closing,
    /// Peer close: send nothing, discard everything, for 3 x PTO.
    Draining,
    /// Terminal; the connection can be reaped.
    Closed,
}

/// The CONNECTION_CLOSE we owe (or owed) the peer.
#[derive(Debug, Clone)]
struct CloseInfo {
    /// Application close (0x1d) rather than transport close (0x1c).
    app: bool,
    /// Wire error code.
    error_code: u64,
    /// Frame type that triggered a transport close, 0 otherwise.
    frame_type: u64,
    /// Human-readable reason bytes.
    reason: Vec<u8>,
}

/// Notifications for the socket context and the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The TLS handshake finished and peer transport parameters are in.
    HandshakeComplete,
    /// A peer-initiated stream entered the accept queue.
    StreamOpened,
    /// The connection reached its end, gracefully or otherwise.
    Closed {
        /// Wire error code from the close (0 for idle timeout).
        error_code: u64,
        /// Application-level close rather than transport-level.
        app: bool,
        /// Initiated by the peer (`true`) or locally.
        remote: bool,
    },
}

/// Running counters for cheap observability.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    /// Packets committed to the wire.
    pub packets_sent: u64,
    /// Packets received, unsealed and processed.
    pub packets_received: u64,
    /// UDP payload bytes sent.
    pub bytes_sent: u64,
    /// UDP payload bytes received.
    pub bytes_received: u64,
    /// Packets declared lost by recovery.
    pub packets_lost: u64,
    /// Current smoothed RTT estimate.
    pub smoothed_rtt: Duration,
    /// Current congestion window in bytes.
    pub congestion_window: usize,
    /// Ack-eliciting bytes currently in flight.
    pub bytes_in_flight: usize,
}

/// A QUIC connection: single-owner, driven by one worker with explicit
/// time, no I/O of its own.
pub struct Connection {
    side: Side,
    state: State,
    /// Our source connection id (the peer's destination).
    scid: ConnectionId,
    /// The peer's current source id; what we put in outgoing headers.
    dcid: ConnectionId,
    /// Destination id of the client's very first Initial; echoed by the
    /// server in its transport parameters.
    odcid: ConnectionId,
    config: Config,
    /// External TLS 1.3 session behind the narrow callback surface.
    tls: Box<dyn TlsSession>,
    /// Initial, Handshake and Application packet-number spaces.
    spaces: [PacketSpace; SpaceId::COUNT],
    recovery: Recovery,
    streams: StreamMap,
    cids: CidManager,
    /// Worker wake signal, shared with every stream handle.
    wake: Arc<Notify>,
    /// Peer transport parameters, once the handshake produced them.
    peer_params: Option<TransportParams>,

    // Connection-level flow control.
    /// Limit currently advertised to the peer.
    max_data_local: u64,
    /// Window size used when sliding `max_data_local` forward.
    recv_window: u64,
    /// Sum of highest received offsets across streams.
    rx_received: u64,
    /// Limit the peer advertised to us; monotone.
    max_data_peer: u64,
    /// Sum of highest emitted offsets across streams.
    tx_data: u64,
    /// A DATA_BLOCKED for the current limit already went out.
    tx_blocked_signaled: bool,

    // Handshake and key schedule.
    handshake_complete: bool,
    /// Key updates are legal only once confirmed (draft-27 TLS §4.1.2).
    handshake_confirmed: bool,
    /// HANDSHAKE_DONE owed to the client (server only).
    queued_handshake_done: bool,
    /// Current key-phase bit for outgoing short headers.
    key_phase: bool,
    /// A local key update is installed with the next 1-RTT packet.
    key_update_pending: bool,
    /// Pre-derived next-generation (send, recv) seals.
    next_seals: Option<(Seal, Seal)>,
    /// Old receive keys, kept one PTO for reordered packets.
    prev_recv_seal: Option<(Seal, Instant)>,
    /// Smallest packet number seen under the current receive generation.
    recv_phase_start: Option<u64>,

    // Closing, draining, idle.
    close_info: Option<CloseInfo>,
    /// A CONNECTION_CLOSE frame still has to go out.
    close_frame_pending: bool,
    /// End of the closing or draining period.
    state_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    /// An ack-eliciting packet went out since the last valid receive;
    /// the idle timer is only re-armed on the first such send.
    ack_eliciting_sent_since_recv: bool,

    // Send-path queues.
    /// MAX_DATA owed (window crossed or a previous one was lost).
    queued_max_data: bool,
    /// Spaces owing a PTO probe.
    probe_spaces: [bool; SpaceId::COUNT],
    /// PATH_CHALLENGE payload awaiting its PATH_RESPONSE echo.
    path_response: Option<[u8; 8]>,
    /// Most recent NEW_TOKEN payload (client side, storage only).
    token_store: Option<Bytes>,

    events: VecDeque<Event>,
    packets_sent: u64,
    packets_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

impl Connection {
    /// Client constructor: derives Initial seals from a fresh random
    /// destination id and produces the first crypto flight.
    pub fn client(config: Config, mut tls: Box<dyn TlsSession>, now: Instant) -> Result<Self> {
        let scid = ConnectionId::random(config.cid_len);
        let dcid = ConnectionId::random(8);
        tls.set_transport_params(&config.transport_params.encode())?;
        let mut conn = Self::common(Side::Client, config, tls, scid, dcid.clone(), dcid, now)?;
        conn.crank_tls(now)?;
        Ok(conn)
    }

    /// Server constructor. `odcid` is the destination id of the client's
    /// first Initial (key material), `peer_scid` the client's source id.
    pub fn server(
        mut config: Config,
        mut tls: Box<dyn TlsSession>,
        odcid: ConnectionId,
        peer_scid: ConnectionId,
        now: Instant,
    ) -> Result<Self> {
        let scid = ConnectionId::random(config.cid_len);
        config.transport_params.original_connection_id = Some(odcid.clone());
        tls.set_transport_params(&config.transport_params.encode())?;
        Self::common(Side::Server, config, tls, scid, peer_scid, odcid, now)
    }

    fn common(
        side: Side,
        config: Config,
        tls: Box<dyn TlsSession>,
        scid: ConnectionId,
        dcid: ConnectionId,
        odcid: ConnectionId,
        now: Instant,
    ) -> Result<Self> {
        let wake = Arc::new(Notify::new());
        let pool = BufferPool::new(CHUNK_SIZE, 64);
        let streams = StreamMap::new(side, &config.transport_params, pool, Arc::clone(&wake));
        let mut cids = CidManager::new(
            scid.clone(),
            config.transport_params.active_connection_id_limit,
            config.cid_len,
        );
        cids.set_initial_remote(dcid.clone());

        let (seal_send, seal_recv) = crate::crypto::initial_seals(
            odcid.as_bytes(),
            side == Side::Client,
        )?;
        let mut spaces = [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()];
        spaces[SpaceId::Initial as usize].seal_send = Some(seal_send);
        spaces[SpaceId::Initial as usize].seal_recv = Some(seal_recv);

        let max_data_local = config.transport_params.initial_max_data;
        let recovery = Recovery::new(Duration::from_millis(
            config.transport_params.max_ack_delay,
        ));

        let mut conn = Self {
            side,
            state: State::Handshaking,
            scid,
            dcid,
            odcid,
            config,
            tls,
            spaces,
            recovery,
            streams,
            cids,
            wake,
            peer_params: None,
            max_data_local,
            recv_window: max_data_local,
            rx_received: 0,
            max_data_peer: 0,
            tx_data: 0,
            tx_blocked_signaled: false,
            handshake_complete: false,
            handshake_confirmed: false,
            queued_handshake_done: false,
            key_phase: false,
            key_update_pending: false,
            next_seals: None,
            prev_recv_seal: None,
            recv_phase_start: None,
            close_info: None,
            close_frame_pending: false,
            state_deadline: None,
            idle_deadline: None,
            ack_eliciting_sent_since_recv: false,
            queued_max_data: false,
            probe_spaces: [false; SpaceId::COUNT],
            path_response: None,
            token_store: None,
            events: VecDeque::new(),
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
        };
        conn.arm_idle(now);
        Ok(conn)
    }

    // --- accessors -------------------------------------------------------

    /// Which end of the connection this is.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Our source connection id.
    pub fn source_id(&self) -> &ConnectionId {
        &self.scid
    }

    /// The peer's current connection id.
    pub fn destination_id(&self) -> &ConnectionId {
        &self.dcid
    }

    /// Signal the worker that application state changed (data enqueued,
    /// reads performed, aborts requested).
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Whether the TLS handshake has completed.
    pub fn is_established(&self) -> bool {
        self.handshake_complete
    }

    /// Whether the connection is fully closed and can be reaped.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Whether the connection is on its way out (closing or draining).
    pub fn is_draining(&self) -> bool {
        matches!(self.state, State::Draining | State::Closing)
    }

    /// Drain the next pending event, if any.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Snapshot of the running counters.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            packets_lost: self.recovery.lost_packets(),
            smoothed_rtt: self.recovery.rtt().smoothed(),
            congestion_window: self.recovery.congestion_window(),
            bytes_in_flight: self.recovery.bytes_in_flight(),
        }
    }

    /// Stored address-validation token from the peer's NEW_TOKEN, if any.
    pub fn token(&self) -> Option<&[u8]> {
        self.token_store.as_deref()
    }

    /// Whether `cid` routes to this connection.
    pub fn owns_cid(&self, cid: &[u8]) -> bool {
        self.cids.is_local(cid)
    }

    // --- application surface --------------------------------------------

    /// Open a locally initiated stream.
    pub fn open_stream(&mut self, bidi: bool) -> Result<StreamHandles> {
        self.streams.open_local(bidi)
    }

    /// Take the next peer-initiated stream, if one is waiting.
    pub fn accept_stream(&mut self) -> Option<StreamHandles> {
        self.streams.accept()
    }

    /// Begin a graceful (or error) close initiated by this endpoint.
    pub fn close(&mut self, app: bool, error_code: u64, reason: &[u8], now: Instant) {
        if !matches!(self.state, State::Handshaking | State::Connected) {
            return;
        }
        debug!(app, error_code, "closing connection");
        self.close_info = Some(CloseInfo {
            app,
            error_code,
            frame_type: 0,
            reason: reason.to_vec(),
        });
        self.close_frame_pending = true;
        self.enter_closing(now);
    }

    /// Request a key update; legal only once the handshake is confirmed
    /// and no previous update is still settling.
    pub fn initiate_key_update(&mut self) -> Result<()> {
        if !self.handshake_confirmed
            || self.key_update_pending
            || self.next_seals.is_some()
            || self.prev_recv_seal.is_some()
        {
            return Err(Error::Done);
        }
        let app = &self.spaces[SpaceId::Application as usize];
        let send = app.seal_send.as_ref().ok_or(Error::Done)?.update()?;
        let recv = app.seal_recv.as_ref().ok_or(Error::Done)?.update()?;
        self.next_seals = Some((send, recv));
        self.key_update_pending = true;
        Ok(())
    }

    // --- transport error plumbing ---------------------------------------

    /// Escalate a transport error from the receive path: record the
    /// CONNECTION_CLOSE to send and move to Closing.
    fn fatal(&mut self, err: Error, now: Instant) {
        if let Error::Connection { kind, frame_type } = err {
            if self.close_info.is_none() {
                self.close_info = Some(CloseInfo {
                    app: false,
                    error_code: kind.to_wire(),
                    frame_type: frame_type.unwrap_or(0),
                    reason: Vec::new(),
                });
            }
            self.close_frame_pending = true;
            self.enter_closing(now);
        }
    }

    /// Local close: start the 3 x PTO closing period (draft-27 §10.3).
    fn enter_closing(&mut self, now: Instant) {
        if matches!(self.state, State::Closing | State::Draining | State::Closed) {
            return;
        }
        self.state = State::Closing;
        self.state_deadline = Some(now + self.recovery.pto() * CLOSE_PTO_FACTOR);
        self.streams.on_connection_closed();
    }

    /// Peer close: drain for 3 x PTO without sending (draft-27 §10.3).
    fn enter_draining(&mut self, error_code: u64, app: bool, now: Instant) {
        if matches!(self.state, State::Draining | State::Closed) {
            return;
        }
        debug!(error_code, app, "peer closed connection, draining");
        self.state = State::Draining;
        self.state_deadline = Some(now + self.recovery.pto() * CLOSE_PTO_FACTOR);
        self.streams.on_connection_closed();
        self.events.push_back(Event::Closed {
            error_code,
            app,
            remote: true,
        });
    }

    // --- receive path ----------------------------------------------------

    /// Process one UDP datagram, which may hold several coalesced
    /// packets. Transport errors close the connection and propagate.
    pub fn recv(&mut self, buf: &mut [u8], now: Instant) -> Result<()> {
        if matches!(self.state, State::Closed | State::Draining) {
            return Ok(());
        }
        let datagram_len = buf.len();
        self.bytes_received += datagram_len as u64;

        let mut off = 0;
        while off < buf.len() {
            let had_accept = self.streams.has_accept_pending();
            let res = self.recv_packet(&mut buf[off..], datagram_len, now);
            if !had_accept && self.streams.has_accept_pending() {
                self.events.push_back(Event::StreamOpened);
            }
            match res {
                Ok(consumed) => {
                    debug_assert!(consumed > 0);
                    off += consumed;
                }
                Err(err) => {
                    self.fatal(err, now);
                    return Err(err);
                }
            }
            if matches!(self.state, State::Draining | State::Closed) {
                break;
            }
        }

        if self.state == State::Closing {
            // Repeat CONNECTION_CLOSE on anything received while closing.
            self.close_frame_pending = true;
        }
        Ok(())
    }

    /// Handle one sub-packet; returns bytes consumed. Undecryptable or
    /// unroutable packets are dropped silently by consuming them.
    fn recv_packet(&mut self, buf: &mut [u8], datagram_len: usize, now: Instant) -> Result<usize> {
        let hdr = match packet::parse_header(buf, self.config.cid_len) {
            Ok(hdr) => hdr,
            // Unparseable header: drop the rest of the datagram.
            Err(_) => return Ok(buf.len()),
        };

        // Bytes this sub-packet occupies in the datagram.
        let consumed = match hdr.payload_len {
            Some(len) => {
                let end = hdr.pn_offset + len;
                if end > buf.len() {
                    return Ok(buf.len());
                }
                end
            }
            None => buf.len(),
        };

        match hdr.ty {
            PacketType::Retry | PacketType::ZeroRtt => return Ok(consumed),
            PacketType::Initial | PacketType::Handshake => {
                if hdr.version != VERSION_DRAFT_27 {
                    return Ok(consumed);
                }
            }
            PacketType::Short => {
                if !self.cids.is_local(hdr.dcid.as_bytes()) {
                    return Ok(buf.len());
                }
            }
        }

        // Packet-type policies that are connection errors, not drops.
        if hdr.ty == PacketType::Initial {
            let token = hdr.token.as_ref().map_or(0, |t| t.len());
            if self.side == Side::Server && datagram_len < MIN_INITIAL_LEN {
                return Err(Error::transport(TransportError::ProtocolViolation));
            }
            if self.side == Side::Client && token != 0 {
                return Err(Error::transport(TransportError::ProtocolViolation));
            }
        }

        let space_id = SpaceId::from_level(hdr.ty.level());
        if self.spaces[space_id as usize].is_discarded()
            || !self.spaces[space_id as usize].has_recv_keys()
        {
            return Ok(consumed);
        }

        let pn_offset = hdr.pn_offset;
        let pkt = &mut buf[..consumed];

        // Header protection off; the mask derivation only needs the HP
        // key, which is stable across key updates.
        let pn_len = {
            let seal = self.spaces[space_id as usize]
                .seal_recv
                .as_ref()
                .expect("checked above");
            match seal.unprotect_header(pkt, pn_offset) {
                Ok(l) => l,
                Err(_) => return Ok(consumed),
            }
        };
        let first = pkt[0];

        // Reserved bits must be zero once unprotected.
        let reserved = if first & 0x80 != 0 { 0x0c } else { 0x18 };
        if first & reserved != 0 {
            return Err(Error::transport(TransportError::ProtocolViolation));
        }

        let truncated = {
            let mut r = Reader::new(&pkt[pn_offset..]);
            r.get_uint(pn_len).map_err(|_| Error::CryptoFail)
        };
        let truncated = match truncated {
            Ok(t) => t,
            Err(_) => return Ok(consumed),
        };
        let largest = self.spaces[space_id as usize].largest_recv_pn;
        let full_pn = packet::decode_pn(largest, truncated, pn_len);

        if self.spaces[space_id as usize].window.contains(full_pn) {
            return Ok(consumed);
        }

        // Pick the receive seal; short headers may signal a key update
        // through the phase bit.
        let header_len = pn_offset + pn_len;
        let ciphertext_len = consumed - header_len;
        let payload_len = match self.decrypt_with_phase(
            space_id, hdr.ty, first, full_pn, pkt, header_len, ciphertext_len, now,
        ) {
            Ok(len) => len,
            Err(_) => return Ok(consumed),
        };

        // Frames, in wire order. Bytes past the AEAD tag were never part
        // of the payload.
        let payload_start = header_len;
        let payload = &pkt[payload_start..payload_start + payload_len];
        let ack_eliciting = self.process_frames(space_id, hdr.ty, payload, now)?;

        // Frame processing may have discarded this very space (the server
        // confirming on a Handshake ACK); no receive state survives that.
        let space = &mut self.spaces[space_id as usize];
        if !space.is_discarded() {
            space.window.insert(full_pn);
            space.on_packet_received(
                full_pn,
                now,
                ack_eliciting,
                hdr.ty != PacketType::Short,
                Duration::from_millis(self.config.transport_params.max_ack_delay),
            );
        }
        self.packets_received += 1;

        // A valid packet refreshes liveness.
        self.arm_idle(now);
        self.ack_eliciting_sent_since_recv = false;

        // The server's first Handshake packet proves the client has the
        // handshake keys; Initial state can go.
        if self.side == Side::Server
            && hdr.ty == PacketType::Handshake
            && !self.spaces[SpaceId::Initial as usize].is_discarded()
        {
            self.discard_space(SpaceId::Initial);
        }

        // The client learns the server's chosen source id from its first
        // long-header packet.
        if self.side == Side::Client && hdr.ty == PacketType::Initial {
            if let Some(scid) = hdr.scid {
                if scid != self.dcid {
                    self.dcid = scid;
                }
            }
        }

        trace!(space = ?space_id, pn = full_pn, len = consumed, "packet received");
        Ok(consumed)
    }

    /// Decrypt the payload, handling the short-header key-phase bit:
    /// old-generation packets use the retained seal, a flipped phase
    /// pre-derives the next generation and commits it on success.
    #[allow(clippy::too_many_arguments)]
    fn decrypt_with_phase(
        &mut self,
        space_id: SpaceId,
        ty: PacketType,
        first: u8,
        full_pn: u64,
        pkt: &mut [u8],
        header_len: usize,
        ciphertext_len: usize,
        now: Instant,
    ) -> Result<usize> {
        let idx = space_id as usize;
        if ty != PacketType::Short {
            let seal = self.spaces[idx].seal_recv.as_ref().expect("keys checked");
            return seal.decrypt_packet(pkt, header_len, ciphertext_len, full_pn);
        }

        let phase = first & 0x04 != 0;
        if phase == self.key_phase {
            let seal = self.spaces[idx].seal_recv.as_ref().expect("keys checked");
            let len = seal.decrypt_packet(pkt, header_len, ciphertext_len, full_pn)?;
            self.recv_phase_start =
                Some(self.recv_phase_start.map_or(full_pn, |p| p.min(full_pn)));
            return Ok(len);
        }

        // Phase differs. An old packet from before our last update is
        // tried against the retained previous keys.
        if let Some((prev, _)) = &self.prev_recv_seal {
            if self.recv_phase_start.is_some_and(|start| full_pn < start) {
                return prev.decrypt_packet(pkt, header_len, ciphertext_len, full_pn);
            }
        }

        // Otherwise this looks like a peer-initiated key update.
        if self.next_seals.is_none() {
            let app = &self.spaces[idx];
            let send = app.seal_send.as_ref().ok_or(Error::CryptoFail)?.update()?;
            let recv = app.seal_recv.as_ref().ok_or(Error::CryptoFail)?.update()?;
            self.next_seals = Some((send, recv));
        }
        let len = {
            let (_, next_recv) = self.next_seals.as_ref().expect("just derived");
            next_recv.decrypt_packet(pkt, header_len, ciphertext_len, full_pn)?
        };
        // Authenticated under the next generation: commit the update.
        self.commit_key_update(now);
        self.recv_phase_start = Some(full_pn);
        debug!("peer-initiated key update committed");
        Ok(len)
    }

    /// Install the pre-derived next-generation seals and toggle the key
    /// phase; the old receive keys linger one PTO for reordering.
    fn commit_key_update(&mut self, now: Instant) {
        let (send, recv) = self.next_seals.take().expect("update prepared");
        let app = &mut self.spaces[SpaceId::Application as usize];
        let old_recv = app.seal_recv.replace(recv);
        app.seal_send = Some(send);
        self.prev_recv_seal = old_recv.map(|s| (s, now + self.recovery.pto()));
        self.key_phase = !self.key_phase;
        self.key_update_pending = false;
        self.recv_phase_start = None;
    }

    /// Process every frame in a decrypted payload. Returns whether the
    /// payload was ack-eliciting.
    fn process_frames(
        &mut self,
        space_id: SpaceId,
        ty: PacketType,
        payload: &[u8],
        now: Instant,
    ) -> Result<bool> {
        if payload.is_empty() {
            return Err(Error::transport(TransportError::ProtocolViolation));
        }
        let mut r = Reader::new(payload);
        let mut ack_eliciting = false;
        while !r.is_empty() {
            let frame = Frame::decode(&mut r)?;
            if !frame.allowed_in(ty) {
                return Err(Error::for_frame(TransportError::ProtocolViolation, frame.ty()));
            }
            ack_eliciting |= frame.is_ack_eliciting();
            self.process_frame(space_id, frame, now)?;
            if matches!(self.state, State::Draining | State::Closed) {
                break;
            }
        }
        Ok(ack_eliciting)
    }

    /// Apply one frame to connection state. Stream-level violations
    /// (unknown id, limit breach, final-size conflict) surface as
    /// connection errors; the caller escalates them.
    fn process_frame(&mut self, space_id: SpaceId, frame: Frame<'_>, now: Instant) -> Result<()> {
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}

            Frame::Ack { ranges, delay, .. } => {
                let exponent = self
                    .peer_params
                    .as_ref()
                    .map_or(3, |p| p.ack_delay_exponent);
                let delay = Duration::from_micros(delay.saturating_mul(1 << exponent));
                let (acked, lost) =
                    self.recovery
                        .on_ack_received(space_id, &ranges, delay, now);
                for packet in acked {
                    self.settle_frames(space_id, packet);
                }
                for packet in lost {
                    self.restitute_frames(space_id, packet);
                }
                // The client's Handshake ACK confirms the server's view.
                if self.side == Side::Server
                    && space_id == SpaceId::Handshake
                    && self.handshake_complete
                    && !self.handshake_confirmed
                {
                    self.confirm_handshake(now);
                }
            }

            Frame::Crypto { offset, data } => {
                let space = &mut self.spaces[space_id as usize];
                space.crypto_recv.insert(offset, data);
                if let Some(bytes) = space.crypto_recv.pop_all() {
                    let level = match space_id {
                        SpaceId::Initial => Level::Initial,
                        SpaceId::Handshake => Level::Handshake,
                        SpaceId::Application => Level::Application,
                    };
                    self.tls.provide_data(level, &bytes)?;
                }
                self.crank_tls(now)?;
            }

            Frame::NewToken { token } => {
                if self.side == Side::Server {
                    return Err(Error::for_frame(
                        TransportError::ProtocolViolation,
                        frame::TYPE_NEW_TOKEN,
                    ));
                }
                self.token_store = Some(Bytes::copy_from_slice(token));
            }

            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                let entry = self.streams.get_or_create(stream_id, frame::TYPE_STREAM_BASE)?;
                let recv = entry.recv.as_mut().ok_or(Error::for_frame(
                    TransportError::StreamState,
                    frame::TYPE_STREAM_BASE,
                ))?;
                let growth = recv.on_frame(offset, data, fin)?;
                self.rx_received += growth;
                if self.rx_received > self.max_data_local {
                    return Err(Error::for_frame(
                        TransportError::FlowControl,
                        frame::TYPE_STREAM_BASE,
                    ));
                }
            }

            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                let entry = self
                    .streams
                    .get_or_create(stream_id, frame::TYPE_RESET_STREAM)?;
                let recv = entry.recv.as_mut().ok_or(Error::for_frame(
                    TransportError::StreamState,
                    frame::TYPE_RESET_STREAM,
                ))?;
                let growth = recv.on_reset(error_code, final_size)?;
                self.rx_received += growth;
                if self.rx_received > self.max_data_local {
                    return Err(Error::for_frame(
                        TransportError::FlowControl,
                        frame::TYPE_RESET_STREAM,
                    ));
                }
            }

            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                let entry = self
                    .streams
                    .get_or_create(stream_id, frame::TYPE_STOP_SENDING)?;
                let send = entry.send.as_mut().ok_or(Error::for_frame(
                    TransportError::StreamState,
                    frame::TYPE_STOP_SENDING,
                ))?;
                send.on_stop_sending(error_code);
            }

            Frame::MaxData { max } => {
                self.max_data_peer = self.max_data_peer.max(max);
                self.tx_blocked_signaled = false;
            }

            Frame::MaxStreamData { stream_id, max } => {
                let entry = self
                    .streams
                    .get_or_create(stream_id, frame::TYPE_MAX_STREAM_DATA)?;
                let send = entry.send.as_mut().ok_or(Error::for_frame(
                    TransportError::StreamState,
                    frame::TYPE_MAX_STREAM_DATA,
                ))?;
                send.set_max_data(max);
            }

            Frame::MaxStreams { bidi, max } => self.streams.on_max_streams(bidi, max),

            // Blocked signals carry no state we act on beyond logging.
            Frame::DataBlocked { limit } => trace!(limit, "peer data blocked"),
            Frame::StreamDataBlocked { stream_id, limit } => {
                trace!(stream_id, limit, "peer stream data blocked")
            }
            Frame::StreamsBlocked { bidi, limit } => trace!(bidi, limit, "peer streams blocked"),

            Frame::NewConnectionId {
                seq,
                retire_prior_to,
                cid,
                reset_token,
            } => self
                .cids
                .on_new_connection_id(seq, retire_prior_to, cid, reset_token)?,

            Frame::RetireConnectionId { seq } => self
                .cids
                .on_retire_connection_id(seq, self.dcid.as_bytes())?,

            Frame::PathChallenge { data } => self.path_response = Some(data),
            Frame::PathResponse { .. } => {}

            Frame::ConnectionClose {
                error_code, ..
            } => self.enter_draining(error_code, false, now),
            Frame::ApplicationClose { error_code, .. } => {
                self.enter_draining(error_code, true, now)
            }

            Frame::HandshakeDone => {
                if self.side == Side::Server {
                    return Err(Error::for_frame(
                        TransportError::ProtocolViolation,
                        frame::TYPE_HANDSHAKE_DONE,
                    ));
                }
                if !self.handshake_confirmed {
                    self.confirm_handshake(now);
                }
            }
        }
        Ok(())
    }

    /// The handshake is confirmed (client: HANDSHAKE_DONE received;
    /// server: Handshake-space ACK after completion). Handshake keys can
    /// go, and key updates become legal.
    fn confirm_handshake(&mut self, _now: Instant) {
        self.handshake_confirmed = true;
        if !self.spaces[SpaceId::Handshake as usize].is_discarded() {
            self.discard_space(SpaceId::Handshake);
        }
        debug!("handshake confirmed");
    }

    fn discard_space(&mut self, space_id: SpaceId) {
        self.spaces[space_id as usize].discard();
        self.recovery.discard_space(space_id);
        trace!(space = ?space_id, "space discarded");
    }

    // --- ACK settlement and loss restitution -----------------------------

    /// Run the per-frame acknowledgment hooks of a newly acked packet:
    /// stream ranges move to `acked`, receive records are pruned, and
    /// one-shot frames stop being owed.
    fn settle_frames(&mut self, space_id: SpaceId, packet: SentPacket) {
        for sent in packet.frames {
            match sent {
                SentFrame::Ack { largest } => {
                    self.spaces[space_id as usize].on_ack_acked(largest)
                }
                SentFrame::Crypto { level, offset, len } => {
                    let idx = SpaceId::from_level(level) as usize;
                    self.spaces[idx].crypto_send.on_ack(offset..offset + len);
                }
                SentFrame::Stream {
                    stream_id,
                    offset,
                    len,
                    fin,
                } => {
                    if let Some(entry) = self.streams.get_mut(stream_id) {
                        if let Some(send) = entry.send.as_mut() {
                            send.on_ack(offset, len, fin);
                        }
                    }
                }
                SentFrame::ResetStream { stream_id } => {
                    if let Some(entry) = self.streams.get_mut(stream_id) {
                        if let Some(send) = entry.send.as_mut() {
                            send.on_reset_acked();
                        }
                    }
                }
                SentFrame::StopSending { stream_id } => {
                    if let Some(entry) = self.streams.get_mut(stream_id) {
                        entry.stop_sending = None;
                        entry.stop_sending_in_flight = false;
                    }
                }
                SentFrame::NewConnectionId { seq } => self.cids.on_issue_sent(seq),
                SentFrame::RetireConnectionId { seq } => self.cids.on_retire_sent(seq),
                SentFrame::MaxData
                | SentFrame::MaxStreamData { .. }
                | SentFrame::MaxStreams { .. }
                | SentFrame::HandshakeDone
                | SentFrame::Ping => {}
            }
        }
        self.streams.cleanup();
    }

    /// Replay a lost packet's frames into the send queues so the next
    /// datagram retransmits their content.
    fn restitute_frames(&mut self, space_id: SpaceId, packet: SentPacket) {
        trace!(space = ?space_id, pn = packet.pn, "replaying lost frames");
        for sent in packet.frames {
            match sent {
                SentFrame::Ack { .. } => {}
                SentFrame::Crypto { level, offset, len } => {
                    let idx = SpaceId::from_level(level) as usize;
                    self.spaces[idx].crypto_send.on_lost(offset..offset + len);
                }
                SentFrame::Stream {
                    stream_id,
                    offset,
                    len,
                    fin,
                } => {
                    if let Some(entry) = self.streams.get_mut(stream_id) {
                        if let Some(send) = entry.send.as_mut() {
                            send.on_lost(offset, len, fin);
                        }
                        self.streams.mark_flushable(stream_id);
                    }
                }
                SentFrame::ResetStream { stream_id } => {
                    if let Some(entry) = self.streams.get_mut(stream_id) {
                        entry.reset_in_flight = false;
                        if let Some(send) = entry.send.as_mut() {
                            send.on_reset_lost();
                        }
                    }
                }
                SentFrame::StopSending { stream_id } => {
                    if let Some(entry) = self.streams.get_mut(stream_id) {
                        entry.stop_sending_in_flight = false;
                    }
                }
                SentFrame::MaxData => self.queued_max_data = true,
                SentFrame::MaxStreamData { stream_id } => {
                    if let Some(entry) = self.streams.get_mut(stream_id) {
                        entry.force_window_update = true;
                    }
                }
                SentFrame::MaxStreams { bidi } => {
                    if bidi {
                        self.streams.queue_max_streams_bidi = true;
                    } else {
                        self.streams.queue_max_streams_uni = true;
                    }
                }
                SentFrame::NewConnectionId { seq } => self.cids.on_issue_lost(seq),
                SentFrame::RetireConnectionId { seq } => self.cids.on_retire_lost(seq),
                SentFrame::HandshakeDone => self.queued_handshake_done = true,
                SentFrame::Ping => {}
            }
        }
    }

    // --- handshake driver ------------------------------------------------

    /// Advance the TLS state machine and apply everything it produced:
    /// secrets become seals, handshake bytes enter the crypto streams,
    /// alerts become `Crypto` connection errors.
    fn crank_tls(&mut self, now: Instant) -> Result<()> {
        let status = self.tls.do_handshake()?;
        while let Some(event) = self.tls.poll_event() {
            match event {
                TlsEvent::Secrets {
                    level,
                    cipher_suite,
                    read_secret,
                    write_secret,
                } => self.install_secrets(level, cipher_suite, &read_secret, &write_secret)?,
                TlsEvent::HandshakeBytes { level, data } => {
                    let idx = SpaceId::from_level(level) as usize;
                    self.spaces[idx].crypto_send.write(&data);
                }
                TlsEvent::FlushFlight => {}
                TlsEvent::Alert(alert) => {
                    return Err(Error::transport(TransportError::Crypto(alert)));
                }
            }
        }
        match status {
            HandshakeStatus::Done if !self.handshake_complete => self.on_handshake_complete(now),
            HandshakeStatus::Fatal(alert) => {
                Err(Error::transport(TransportError::Crypto(alert)))
            }
            _ => Ok(()),
        }
    }

    /// Derive both seals for a level from fresh TLS traffic secrets.
    fn install_secrets(
        &mut self,
        level: Level,
        cipher_suite: u16,
        read_secret: &[u8],
        write_secret: &[u8],
    ) -> Result<()> {
        let alg = crate::crypto::Algorithm::from_cipher_suite(cipher_suite)
            .ok_or_else(|| Error::transport(TransportError::Crypto(0x28)))?;
        let idx = SpaceId::from_level(level) as usize;
        self.spaces[idx].seal_recv = Some(Seal::from_secret(alg, read_secret)?);
        self.spaces[idx].seal_send = Some(Seal::from_secret(alg, write_secret)?);
        trace!(?level, cipher_suite, "secrets installed");
        Ok(())
    }

    /// TLS reported completion: validate and adopt the peer's transport
    /// parameters, mint connection ids up to its limit, and (server)
    /// queue HANDSHAKE_DONE.
    fn on_handshake_complete(&mut self, now: Instant) -> Result<()> {
        self.handshake_complete = true;
        if self.state == State::Handshaking {
            self.state = State::Connected;
        }

        let raw = self
            .tls
            .peer_transport_params()
            .ok_or_else(|| Error::transport(TransportError::TransportParameter))?
            .to_vec();
        let params = TransportParams::decode(&raw, self.side == Side::Server)?;
        if self.side == Side::Client
            && params.original_connection_id.as_ref() != Some(&self.odcid)
        {
            return Err(Error::transport(TransportError::TransportParameter));
        }
        self.max_data_peer = self.max_data_peer.max(params.initial_max_data);
        self.streams.apply_peer_params(&params);
        self.cids.set_peer_limit(params.active_connection_id_limit);
        if let Some(token) = params.stateless_reset_token {
            self.cids.set_initial_remote_token(token);
        }
        self.peer_params = Some(params);

        if self.side == Side::Server {
            self.queued_handshake_done = true;
        }
        self.events.push_back(Event::HandshakeComplete);
        self.arm_idle(now);
        debug!(side = ?self.side, "handshake complete");
        Ok(())
    }

    // --- timers ----------------------------------------------------------

    /// Idle timeout in force: the smaller of the two advertised values,
    /// with 0 meaning disabled (draft-27 §10.2).
    fn effective_idle_timeout(&self) -> Option<Duration> {
        let local = self.config.transport_params.max_idle_timeout;
        let peer = self.peer_params.as_ref().map_or(0, |p| p.max_idle_timeout);
        let ms = match (local, peer) {
            (0, 0) => return None,
            (0, p) => p,
            (l, 0) => l,
            (l, p) => l.min(p),
        };
        Some(Duration::from_millis(ms))
    }

    /// Restart the idle timer, never below 3 x PTO.
    fn arm_idle(&mut self, now: Instant) {
        self.idle_deadline = self
            .effective_idle_timeout()
            .map(|t| now + t.max(self.recovery.pto() * CLOSE_PTO_FACTOR));
    }

    /// Earliest instant at which [`on_timeout`](Self::on_timeout) must be
    /// called.
    pub fn timeout(&self) -> Option<Instant> {
        match self.state {
            State::Closed => return None,
            State::Closing | State::Draining => return self.state_deadline,
            _ => {}
        }
        let mut next: Option<Instant> = None;
        let mut merge = |t: Option<Instant>| {
            if let Some(t) = t {
                next = Some(next.map_or(t, |n| n.min(t)));
            }
        };
        merge(self.recovery.timeout());
        for space in &self.spaces {
            if space.ack_elicited && !space.is_discarded() {
                merge(space.ack_timer);
            }
        }
        merge(self.idle_deadline);
        merge(self.prev_recv_seal.as_ref().map(|(_, t)| *t));
        next
    }

    /// Drive expired timers; the caller should attempt `send` afterward.
    pub fn on_timeout(&mut self, now: Instant) {
        match self.state {
            State::Closed => return,
            State::Closing | State::Draining => {
                if self.state_deadline.is_some_and(|t| t <= now) {
                    self.state = State::Closed;
                    if let Some(info) = &self.close_info {
                        let info = info.clone();
                        self.events.push_back(Event::Closed {
                            error_code: info.error_code,
                            app: info.app,
                            remote: false,
                        });
                    }
                    debug!("connection closed");
                }
                return;
            }
            _ => {}
        }

        if self.idle_deadline.is_some_and(|t| t <= now) {
            debug!("idle timeout");
            self.state = State::Closed;
            self.streams.on_connection_closed();
            self.events.push_back(Event::Closed {
                error_code: 0,
                app: false,
                remote: false,
            });
            return;
        }

        if self
            .prev_recv_seal
            .as_ref()
            .is_some_and(|(_, t)| *t <= now)
        {
            self.prev_recv_seal = None;
        }

        if self.recovery.timeout().is_some_and(|t| t <= now) {
            match self.recovery.on_timeout(now) {
                TimerEvent::Lost(space, packets) => {
                    for packet in packets {
                        warn!(space = ?space, pn = packet.pn, "packet lost");
                        self.restitute_frames(space, packet);
                    }
                }
                TimerEvent::Probe(space) => {
                    self.probe_spaces[space as usize] = true;
                }
                TimerEvent::None => {}
            }
        }
    }

    // --- send path -------------------------------------------------------

    /// Datagram size cap: `min(peer max_packet_size, 2^14 - 1)` once the
    /// handshake is complete, 1200 before, bounded by the local cap.
    fn max_datagram_len(&self) -> usize {
        let peer_cap = if self.handshake_complete {
            self.peer_params
                .as_ref()
                .map_or(MIN_INITIAL_LEN, |p| p.max_packet_size as usize)
                .min(MAX_DATAGRAM_CEILING)
        } else {
            MIN_INITIAL_LEN
        };
        peer_cap.min(self.config.max_udp_payload)
    }

    /// Assemble one UDP datagram. Returns `Err(Done)` when there is
    /// nothing to send.
    pub fn send(&mut self, out: &mut [u8], now: Instant) -> Result<usize> {
        if matches!(self.state, State::Closed | State::Draining) {
            return Err(Error::Done);
        }

        // Advance loss timers opportunistically so lost frames re-enter
        // the queues this very datagram.
        self.on_timeout_recovery_only(now);

        if self.state != State::Closing {
            self.streams.refresh_updates();
            self.streams.refresh_flushable();
            self.streams.cleanup();
        }

        let budget = self.max_datagram_len().min(out.len());
        let out = &mut out[..budget];

        let mut written = 0;
        for space_id in SpaceId::ALL {
            if written >= out.len() {
                break;
            }
            let n = self.send_packet(space_id, out, written, now)?;
            written += n;
            if n > 0 && self.state == State::Closing && !self.close_frame_pending {
                break;
            }
        }

        if written == 0 {
            return Err(Error::Done);
        }
        self.bytes_sent += written as u64;
        Ok(written)
    }

    /// Loss-timer slice of `on_timeout`, run at the top of the send path
    /// so freshly lost frames ride out in this datagram.
    fn on_timeout_recovery_only(&mut self, now: Instant) {
        if self.recovery.timeout().is_some_and(|t| t <= now) {
            match self.recovery.on_timeout(now) {
                TimerEvent::Lost(space, packets) => {
                    for packet in packets {
                        self.restitute_frames(space, packet);
                    }
                }
                TimerEvent::Probe(space) => self.probe_spaces[space as usize] = true,
                TimerEvent::None => {}
            }
        }
    }

    /// Build one packet for `space_id` into `out[already..]`. Returns the
    /// bytes written, 0 if the space contributes nothing.
    fn send_packet(
        &mut self,
        space_id: SpaceId,
        out: &mut [u8],
        already: usize,
        now: Instant,
    ) -> Result<usize> {
        let idx = space_id as usize;
        if self.spaces[idx].is_discarded() || self.spaces[idx].seal_send.is_none() {
            return Ok(0);
        }
        let is_app = space_id == SpaceId::Application;

        // A locally requested key update takes effect with this packet.
        if is_app && self.key_update_pending && self.state != State::Closing {
            self.commit_key_update(now);
            debug!("local key update installed");
        }

        let closing = self.close_frame_pending && self.close_compatible(space_id);
        if self.state == State::Closing && !closing {
            // While closing, CONNECTION_CLOSE is the only thing that goes
            // on the wire.
            return Ok(0);
        }
        let probe = self.probe_spaces[idx];
        let space = &self.spaces[idx];
        let crypto_pending = space.crypto_send.has_pending();
        let ack_forced = space.ack_timer_expired(now);
        let ack_owed = space.ack_elicited && !space.unacked.is_empty();

        let app_work = is_app && self.state == State::Connected && self.app_work_pending();

        if !(closing || crypto_pending || ack_forced || probe || app_work) {
            // Piggyback-only ACKs don't create packets by themselves.
            if !(ack_owed && already > 0) {
                return Ok(0);
            }
        }

        let buf = &mut out[already..];
        // Smallest useful packet: header + one frame + tag.
        if buf.len() < 64 {
            return Ok(0);
        }

        let pn = self.spaces[idx].next_pn();
        let largest_acked = self.recovery.largest_acked(space_id);
        let pn_len = packet::pn_len(pn, largest_acked);

        let mut w = Writer::new(buf);
        let (length_field_at, pn_offset) = match space_id {
            SpaceId::Initial | SpaceId::Handshake => {
                let ty = if space_id == SpaceId::Initial {
                    PacketType::Initial
                } else {
                    PacketType::Handshake
                };
                let first = 0xc0 | (ty.long_bits() << 4) | (pn_len as u8 - 1);
                w.put_u8(first)?;
                w.put_u32(VERSION_DRAFT_27)?;
                w.put_u8(self.dcid.len() as u8)?;
                w.put_bytes(self.dcid.as_bytes())?;
                w.put_u8(self.scid.len() as u8)?;
                w.put_bytes(self.scid.as_bytes())?;
                if ty == PacketType::Initial {
                    w.put_varint(0)?; // empty token
                }
                let at = w.offset();
                w.put_varint_with_len(0, 2)?; // length, rewritten below
                let pn_at = w.offset();
                w.put_uint(pn, pn_len)?;
                (Some(at), pn_at)
            }
            SpaceId::Application => {
                let first = 0x40 | ((self.key_phase as u8) << 2) | (pn_len as u8 - 1);
                w.put_u8(first)?;
                w.put_bytes(self.dcid.as_bytes())?;
                let pn_at = w.offset();
                w.put_uint(pn, pn_len)?;
                (None, pn_at)
            }
        };

        let header_len = w.offset();
        let payload_cap = w.remaining() - TAG_LEN;
        let mut frames = FrameList::new();
        let mut ack_eliciting = false;

        // Ack-eliciting content is congestion-bounded unless probing or
        // closing.
        let ae_budget = if probe || closing {
            usize::MAX
        } else {
            self.recovery.available_window()
        };

        let payload_len = self.write_frames(
            space_id,
            &mut w,
            header_len,
            payload_cap,
            ae_budget,
            closing,
            probe,
            now,
            &mut frames,
            &mut ack_eliciting,
        )?;

        if payload_len == 0 {
            return Ok(0);
        }
        let mut payload_len = payload_len;

        // Enough bytes past the sample offset for header protection.
        let min_payload = 4usize.saturating_sub(pn_len);
        while payload_len < min_payload {
            w.put_u8(0)?;
            payload_len += 1;
        }

        // A client Initial must land in a 1200-byte datagram.
        if self.side == Side::Client && space_id == SpaceId::Initial {
            let target = MIN_INITIAL_LEN - already;
            let current_total = header_len + payload_len + TAG_LEN;
            if current_total < target {
                let pad = (target - current_total).min(w.remaining().saturating_sub(TAG_LEN));
                for _ in 0..pad {
                    w.put_u8(0)?;
                }
                payload_len += pad;
            }
        }

        if let Some(at) = length_field_at {
            let length = pn_len + payload_len + TAG_LEN;
            w.rewrite_varint_at(at, length as u64, 2)?;
        }

        let seal = self.spaces[idx].seal_send.as_ref().expect("send keys");
        let total = seal.encrypt_packet(buf, header_len, payload_len, pn)?;
        seal.protect_header(buf, pn_offset, pn_len)?;

        // Commit the number only once the packet is actually produced.
        let committed = self.spaces[idx].next_packet_number();
        debug_assert_eq!(committed, pn);

        self.recovery.on_packet_sent(
            space_id,
            SentPacket {
                pn,
                time_sent: now,
                size: total,
                ack_eliciting,
                in_flight: ack_eliciting,
                frames,
            },
        );
        if ack_eliciting {
            self.probe_spaces[idx] = false;
            if !self.ack_eliciting_sent_since_recv {
                self.ack_eliciting_sent_since_recv = true;
                self.arm_idle(now);
            }
        }
        self.packets_sent += 1;

        // The client's first Handshake packet retires its Initial state.
        if self.side == Side::Client
            && space_id == SpaceId::Handshake
            && !self.spaces[SpaceId::Initial as usize].is_discarded()
        {
            self.discard_space(SpaceId::Initial);
        }

        trace!(space = ?space_id, pn, len = total, "packet sent");
        Ok(total)
    }

    /// Whether the pending close may be carried at this level: transport
    /// closes at the first level with keys, application closes only in
    /// 1-RTT packets.
    fn close_compatible(&self, space_id: SpaceId) -> bool {
        let app_close = self.close_info.as_ref().is_some_and(|c| c.app);
        if app_close {
            space_id == SpaceId::Application
        } else {
            // Transport close goes out at the first level with keys.
            true
        }
    }

    /// Anything besides ACKs waiting for the next 1-RTT packet.
    fn app_work_pending(&mut self) -> bool {
        self.queued_handshake_done
            || self.queued_max_data
            || self.window_update_due()
            || self.streams.queue_max_streams_bidi
            || self.streams.queue_max_streams_uni
            || self.path_response.is_some()
            || self.cids.next_issue().is_some()
            || self.cids.next_retire().is_some()
            || self.streams.has_updates()
            || self.streams.has_flushable()
    }

    /// Connection-level receive window has crossed its halfway mark.
    fn window_update_due(&self) -> bool {
        self.max_data_local - self.rx_received < self.recv_window / 2
    }

    /// Emit frames in priority order; returns the payload length.
    #[allow(clippy::too_many_arguments)]
    fn write_frames(
        &mut self,
        space_id: SpaceId,
        w: &mut Writer<'_>,
        header_len: usize,
        payload_cap: usize,
        ae_budget: usize,
        closing: bool,
        probe: bool,
        now: Instant,
        frames: &mut FrameList,
        ack_eliciting: &mut bool,
    ) -> Result<usize> {
        let cap_end = header_len + payload_cap;

        // 1. CONNECTION_CLOSE: alone in its packet.
        if closing {
            let info = self.close_info.clone().expect("closing implies info");
            let f = if info.app && space_id == SpaceId::Application {
                Frame::ApplicationClose {
                    error_code: info.error_code,
                    reason: &info.reason,
                }
            } else {
                Frame::ConnectionClose {
                    error_code: info.error_code,
                    frame_type: info.frame_type,
                    reason: &info.reason,
                }
            };
            if f.wire_len() <= room(w, cap_end) {
                f.encode(w)?;
                self.close_frame_pending = false;
            }
            return Ok(w.offset() - header_len);
        }

        // 2. CRYPTO.
        let mut ae_left = ae_budget;
        loop {
            let space = &mut self.spaces[space_id as usize];
            let overhead = 1 + 8 + 4; // type + worst-case offset + length
            let r = room(w, cap_end).min(ae_left);
            if r <= overhead {
                break;
            }
            let Some(range) = space.crypto_send.next_range(r - overhead) else {
                break;
            };
            let data = space.crypto_send.slice(range.clone()).to_vec();
            let f = Frame::Crypto {
                offset: range.start,
                data: &data,
            };
            f.encode(w)?;
            space.crypto_send.mark_sent(range.clone());
            frames.push(SentFrame::Crypto {
                level: level_of(space_id),
                offset: range.start,
                len: range.end - range.start,
            });
            *ack_eliciting = true;
            ae_left = ae_left.saturating_sub(f.wire_len());
        }

        // 3. ACK.
        {
            let space = &mut self.spaces[space_id as usize];
            if space.ack_elicited && !space.unacked.is_empty() {
                let delay_us = space
                    .largest_recv_time
                    .map_or(0, |t| now.duration_since(t).as_micros() as u64);
                let delay = delay_us >> self.config.transport_params.ack_delay_exponent;
                let f = Frame::Ack {
                    ranges: space.unacked.clone(),
                    delay,
                    ecn: None,
                };
                if f.wire_len() <= room(w, cap_end) {
                    let largest = space.unacked.max().expect("non-empty");
                    f.encode(w)?;
                    space.on_ack_sent(now);
                    frames.push(SentFrame::Ack { largest });
                }
            }
        }

        if space_id == SpaceId::Application && self.state == State::Connected {
            self.write_app_frames(w, cap_end, &mut ae_left, frames, ack_eliciting)?;
        }

        // PING last: probes must be ack-eliciting.
        if probe && !*ack_eliciting && room(w, cap_end) >= 1 {
            Frame::Ping.encode(w)?;
            frames.push(SentFrame::Ping);
            *ack_eliciting = true;
        }

        Ok(w.offset() - header_len)
    }

    fn write_app_frames(
        &mut self,
        w: &mut Writer<'_>,
        cap_end: usize,
        ae_left: &mut usize,
        frames: &mut FrameList,
        ack_eliciting: &mut bool,
    ) -> Result<()> {
        // HANDSHAKE_DONE (server, once complete).
        if self.queued_handshake_done
            && emit_frame(
                w,
                cap_end,
                ae_left,
                &Frame::HandshakeDone,
                SentFrame::HandshakeDone,
                frames,
                ack_eliciting,
            )?
        {
            self.queued_handshake_done = false;
        }

        // MAX_DATA and the other window/limit updates.
        if self.queued_max_data || self.window_update_due() {
            let new_max = (self.rx_received + self.recv_window).max(self.max_data_local);
            let f = Frame::MaxData { max: new_max };
            if emit_frame(w, cap_end, ae_left, &f, SentFrame::MaxData, frames, ack_eliciting)? {
                self.max_data_local = new_max;
                self.queued_max_data = false;
            }
        }
        for bidi in [true, false] {
            let flagged = if bidi {
                self.streams.queue_max_streams_bidi
            } else {
                self.streams.queue_max_streams_uni
            };
            if flagged {
                let f = Frame::MaxStreams {
                    bidi,
                    max: self.streams.local_max_streams(bidi),
                };
                if emit_frame(
                    w,
                    cap_end,
                    ae_left,
                    &f,
                    SentFrame::MaxStreams { bidi },
                    frames,
                    ack_eliciting,
                )? {
                    if bidi {
                        self.streams.queue_max_streams_bidi = false;
                    } else {
                        self.streams.queue_max_streams_uni = false;
                    }
                }
            }
        }

        // Per-stream updates: window updates now, resets and stops after
        // stream data per the frame priority.
        let mut deferred: Vec<StreamId> = Vec::new();
        let owed: Vec<StreamId> = std::iter::from_fn(|| self.streams.pop_update()).collect();
        for id in owed {
            let Some(entry) = self.streams.get_mut(id) else {
                continue;
            };
            let force = entry.force_window_update;
            let update = entry.recv.as_mut().and_then(|r| {
                r.pending_window_update()
                    .or_else(|| force.then(|| r.advertised_limit()))
            });
            if let Some(max) = update {
                let f = Frame::MaxStreamData { stream_id: id, max };
                let written = emit_frame(
                    w,
                    cap_end,
                    ae_left,
                    &f,
                    SentFrame::MaxStreamData { stream_id: id },
                    frames,
                    ack_eliciting,
                )?;
                if let Some(entry) = self.streams.get_mut(id) {
                    // The limit is committed either way; if the frame did
                    // not fit, re-advertise it from the next packet.
                    entry.force_window_update = !written;
                }
                if !written {
                    self.streams.mark_update(id);
                }
            }
            let entry = self.streams.get_mut(id).expect("entry still present");
            let wants_stop = entry.stop_sending.is_some() && !entry.stop_sending_in_flight;
            let wants_reset = entry
                .send
                .as_ref()
                .is_some_and(|s| s.state() == SendState::WantReset && !entry.reset_in_flight);
            if wants_stop || wants_reset {
                deferred.push(id);
            }
        }

        // STREAM data, round-robin over flushable streams.
        let mut data_buf = [0u8; 1500];
        let mut visited = 0usize;
        while let Some(id) = self.streams.pop_flushable() {
            visited += 1;
            if visited > 64 {
                self.streams.mark_flushable(id);
                break;
            }
            let conn_credit = self.max_data_peer.saturating_sub(self.tx_data);
            let Some(entry) = self.streams.get_mut(id) else {
                continue;
            };
            let Some(send) = entry.send.as_mut() else {
                continue;
            };

            // Worst-case STREAM frame overhead.
            let overhead = 1 + 8 + 8 + 4;
            let r = room(w, cap_end).min(*ae_left);
            if r <= overhead {
                self.streams.mark_flushable(id);
                break;
            }
            let (offset, count) = send.sendable();
            let old_unsent = send.unsent_offset();
            // Fresh bytes beyond unsent_offset consume connection credit.
            let allowed = if count == 0 {
                0
            } else {
                let retransmit = old_unsent.saturating_sub(offset);
                (count.min(retransmit + conn_credit)) as usize
            };
            let max_data_len = allowed.min(r - overhead).min(data_buf.len());
            let Some((offset, len, fin)) = send.check_out(&mut data_buf[..max_data_len]) else {
                continue;
            };
            let new_bytes = send.unsent_offset().saturating_sub(old_unsent);
            self.tx_data += new_bytes;

            let f = Frame::Stream {
                stream_id: id,
                offset,
                data: &data_buf[..len],
                fin,
            };
            let flen = f.wire_len();
            f.encode(w)?;
            *ae_left = ae_left.saturating_sub(flen);
            frames.push(SentFrame::Stream {
                stream_id: id,
                offset,
                len: len as u64,
                fin,
            });
            *ack_eliciting = true;

            if let Some(entry) = self.streams.get_mut(id) {
                if let Some(send) = entry.send.as_mut() {
                    if send.is_flushable() {
                        self.streams.mark_flushable(id);
                    }
                }
            }
        }

        // Blocked signal when connection credit is what stopped us.
        if self.tx_data >= self.max_data_peer
            && self.max_data_peer > 0
            && !self.tx_blocked_signaled
        {
            let f = Frame::DataBlocked {
                limit: self.max_data_peer,
            };
            if f.wire_len() <= room(w, cap_end).min(*ae_left) {
                f.encode(w)?;
                *ae_left -= f.wire_len();
                // No restitution entry: a fresh signal is computed if lost.
                *ack_eliciting = true;
                self.tx_blocked_signaled = true;
            }
        }

        // RESET_STREAM / STOP_SENDING.
        for id in deferred {
            let Some(entry) = self.streams.get_mut(id) else {
                continue;
            };
            if let Some(code) = entry.stop_sending {
                if !entry.stop_sending_in_flight {
                    let f = Frame::StopSending {
                        stream_id: id,
                        error_code: code,
                    };
                    if emit_frame(
                        w,
                        cap_end,
                        ae_left,
                        &f,
                        SentFrame::StopSending { stream_id: id },
                        frames,
                        ack_eliciting,
                    )? {
                        if let Some(entry) = self.streams.get_mut(id) {
                            entry.stop_sending_in_flight = true;
                        }
                    } else {
                        self.streams.mark_update(id);
                        continue;
                    }
                }
            }
            let Some(entry) = self.streams.get_mut(id) else {
                continue;
            };
            let wants_reset = entry
                .send
                .as_ref()
                .is_some_and(|s| s.state() == SendState::WantReset && !entry.reset_in_flight);
            if wants_reset {
                let send = entry.send.as_mut().expect("send half checked");
                let (code, final_size) = send.on_reset_sent();
                let f = Frame::ResetStream {
                    stream_id: id,
                    error_code: code,
                    final_size,
                };
                if emit_frame(
                    w,
                    cap_end,
                    ae_left,
                    &f,
                    SentFrame::ResetStream { stream_id: id },
                    frames,
                    ack_eliciting,
                )? {
                    if let Some(entry) = self.streams.get_mut(id) {
                        entry.reset_in_flight = true;
                    }
                } else {
                    // Could not fit: the reset stays wanted.
                    if let Some(entry) = self.streams.get_mut(id) {
                        if let Some(send) = entry.send.as_mut() {
                            send.on_reset_lost();
                        }
                    }
                    self.streams.mark_update(id);
                }
            }
        }

        // NEW_CONNECTION_ID / RETIRE_CONNECTION_ID.
        while let Some((seq, cid, token)) = self.cids.next_issue() {
            let f = Frame::NewConnectionId {
                seq,
                retire_prior_to: 0,
                cid: cid.clone(),
                reset_token: token,
            };
            if !emit_frame(
                w,
                cap_end,
                ae_left,
                &f,
                SentFrame::NewConnectionId { seq },
                frames,
                ack_eliciting,
            )? {
                break;
            }
            self.cids.on_issue_sent(seq);
        }
        while let Some(seq) = self.cids.next_retire() {
            let f = Frame::RetireConnectionId { seq };
            if !emit_frame(
                w,
                cap_end,
                ae_left,
                &f,
                SentFrame::RetireConnectionId { seq },
                frames,
                ack_eliciting,
            )? {
                break;
            }
            self.cids.on_retire_sent(seq);
        }

        // PATH_RESPONSE: pure echo of a received challenge.
        if let Some(data) = self.path_response {
            let f = Frame::PathResponse { data };
            if f.wire_len() <= room(w, cap_end) {
                f.encode(w)?;
                *ack_eliciting = true;
                self.path_response = None;
            }
        }

        Ok(())
    }
}

fn level_of(space_id: SpaceId) -> Level {
    match space_id {
        SpaceId::Initial => Level::Initial,
        SpaceId::Handshake => Level::Handshake,
        SpaceId::Application => Level::Application,
    }
}

/// Payload bytes still available before the AEAD tag reservation.
fn room(w: &Writer<'_>, cap_end: usize) -> usize {
    cap_end.saturating_sub(w.offset())
}

/// Encode `f` if it fits both the packet and the congestion budget,
/// recording its restitution. Returns whether it was written.
fn emit_frame(
    w: &mut Writer<'_>,
    cap_end: usize,
    ae_left: &mut usize,
    f: &Frame<'_>,
    sent: SentFrame,
    frames: &mut FrameList,
    ack_eliciting: &mut bool,
) -> Result<bool> {
    let len = f.wire_len();
    if len > room(w, cap_end) || len > *ae_left {
        return Ok(false);
    }
    f.encode(w)?;
    *ae_left -= len;
    frames.push(sent);
    *ack_eliciting = true;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A TLS session that never progresses; enough for frame-policy
    /// tests that sit below the handshake.
    struct NoopTls {
        params: Vec<u8>,
    }

    impl TlsSession for NoopTls {
        fn provide_data(&mut self, _level: Level, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn do_handshake(&mut self) -> Result<HandshakeStatus> {
            Ok(HandshakeStatus::NeedData)
        }
        fn poll_event(&mut self) -> Option<TlsEvent> {
            None
        }
        fn set_transport_params(&mut self, params: &[u8]) -> Result<()> {
            self.params = params.to_vec();
            Ok(())
        }
        fn peer_transport_params(&self) -> Option<&[u8]> {
            None
        }
        fn alpn(&self) -> Option<&[u8]> {
            None
        }
        fn cipher_suite(&self) -> Option<u16> {
            None
        }
    }

    fn noop_tls() -> Box<NoopTls> {
        Box::new(NoopTls { params: Vec::new() })
    }

    fn client() -> (Connection, Instant) {
        let now = Instant::now();
        let conn = Connection::client(Config::default(), noop_tls(), now).unwrap();
        (conn, now)
    }

    fn server() -> (Connection, Instant) {
        let now = Instant::now();
        let mut config = Config::default();
        config.transport_params.initial_max_streams_uni = 1;
        let conn = Connection::server(
            config,
            noop_tls(),
            ConnectionId::from_slice(&[1; 8]).unwrap(),
            ConnectionId::from_slice(&[2; 8]).unwrap(),
            now,
        )
        .unwrap();
        (conn, now)
    }

    #[test]
    fn reset_stream_on_send_only_stream_is_stream_state() {
        let (mut conn, now) = client();
        // Let the peer's limit admit one uni stream, then open it.
        conn.streams.on_max_streams(false, 1);
        let handles = conn.open_stream(false).unwrap();
        assert_eq!(handles.id, 2);

        let err = conn
            .process_frame(
                SpaceId::Application,
                Frame::ResetStream {
                    stream_id: 2,
                    error_code: 9,
                    final_size: 0,
                },
                now,
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::for_frame(TransportError::StreamState, frame::TYPE_RESET_STREAM)
        );

        // The error escalates to Closing with a CONNECTION_CLOSE owed.
        conn.fatal(err, now);
        assert!(conn.is_draining());
    }

    #[test]
    fn stream_over_uni_limit_is_stream_limit() {
        let (mut conn, now) = server();
        // Client uni index 1 exceeds the server's limit of one stream.
        let err = conn
            .process_frame(
                SpaceId::Application,
                Frame::Stream {
                    stream_id: 6,
                    offset: 0,
                    data: b"!",
                    fin: false,
                },
                now,
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::for_frame(TransportError::StreamLimit, frame::TYPE_STREAM_BASE)
        );
    }

    #[test]
    fn stop_sending_on_recv_only_stream_is_stream_state() {
        let (mut conn, now) = client();
        // Server-initiated uni stream: the client has no send half.
        let err = conn
            .process_frame(
                SpaceId::Application,
                Frame::StopSending {
                    stream_id: 3,
                    error_code: 1,
                },
                now,
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::for_frame(TransportError::StreamState, frame::TYPE_STOP_SENDING)
        );
    }

    #[test]
    fn handshake_done_from_client_is_violation() {
        let (mut conn, now) = server();
        let err = conn
            .process_frame(SpaceId::Application, Frame::HandshakeDone, now)
            .unwrap_err();
        assert_eq!(
            err,
            Error::for_frame(TransportError::ProtocolViolation, frame::TYPE_HANDSHAKE_DONE)
        );
    }

    #[test]
    fn new_token_to_server_is_violation() {
        let (mut conn, now) = server();
        let err = conn
            .process_frame(
                SpaceId::Application,
                Frame::NewToken { token: b"tok" },
                now,
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::for_frame(TransportError::ProtocolViolation, frame::TYPE_NEW_TOKEN)
        );
    }

    #[test]
    fn new_token_stored_by_client() {
        let (mut conn, now) = client();
        conn.process_frame(
            SpaceId::Application,
            Frame::NewToken { token: b"resume" },
            now,
        )
        .unwrap();
        assert_eq!(conn.token(), Some(&b"resume"[..]));
    }

    #[test]
    fn path_challenge_is_echoed() {
        let (mut conn, now) = client();
        conn.process_frame(
            SpaceId::Application,
            Frame::PathChallenge { data: [7; 8] },
            now,
        )
        .unwrap();
        assert_eq!(conn.path_response, Some([7; 8]));
    }

    #[test]
    fn local_close_enters_closing() {
        let (mut conn, now) = client();
        conn.close(true, 7, b"bye", now);
        assert!(conn.is_draining());
        assert!(conn.timeout().is_some());

        // The closing period expires into Closed.
        let deadline = conn.timeout().unwrap();
        conn.on_timeout(deadline);
        assert!(conn.is_closed());
        assert_eq!(
            conn.poll_event(),
            Some(Event::Closed {
                error_code: 7,
                app: true,
                remote: false,
            })
        );
    }

    #[test]
    fn key_update_requires_confirmation() {
        let (mut conn, _now) = client();
        assert_eq!(conn.initiate_key_update(), Err(Error::Done));
    }
}
