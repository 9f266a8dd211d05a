//! Stream identity and the per-connection stream registry.
//!
//! A stream id is a 62-bit integer whose two low bits carry the initiator
//! and directionality; the index of a stream within its type is
//! `id >> 2`. The registry creates streams on first reference (implicitly
//! creating lower-indexed streams of the same type), enforces creation
//! limits, and runs the flush and update schedulers the send path drains.

pub mod recv;
pub mod send;

pub use recv::{RecvState, RecvStream, RecvStreamHandle};
pub use send::{SendState, SendStream, SendStreamHandle, MAX_HELD_CHUNKS};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result, TransportError};
use crate::pool::BufferPool;
use crate::tparams::TransportParams;
use crate::Side;

pub type StreamId = u64;

pub(crate) fn is_bidi(id: StreamId) -> bool {
    id & 0x2 == 0
}

pub(crate) fn initiator(id: StreamId) -> Side {
    if id & 0x1 == 0 {
        Side::Client
    } else {
        Side::Server
    }
}

pub(crate) fn index(id: StreamId) -> u64 {
    id >> 2
}

pub(crate) fn id_for(side: Side, bidi: bool, index: u64) -> StreamId {
    let mut id = index << 2;
    if side == Side::Server {
        id |= 0x1;
    }
    if !bidi {
        id |= 0x2;
    }
    id
}

/// Application handles produced when a stream comes into existence.
pub struct StreamHandles {
    pub id: StreamId,
    pub send: Option<SendStreamHandle>,
    pub recv: Option<RecvStreamHandle>,
}

impl std::fmt::Debug for StreamEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEntry")
            .field("send_present", &self.send.is_some())
            .field("recv_present", &self.recv.is_some())
            .field("stop_sending", &self.stop_sending)
            .field("stop_sending_in_flight", &self.stop_sending_in_flight)
            .field("reset_in_flight", &self.reset_in_flight)
            .field("force_window_update", &self.force_window_update)
            .finish()
    }
}

pub(crate) struct StreamEntry {
    pub send: Option<SendStream>,
    pub recv: Option<RecvStream>,
    /// Handles parked here until the application accepts the stream.
    parked: Option<StreamHandles>,
    /// STOP_SENDING code owed to the peer.
    pub stop_sending: Option<u64>,
    pub stop_sending_in_flight: bool,
    pub reset_in_flight: bool,
    /// A MAX_STREAM_DATA was lost; re-advertise the current limit.
    pub force_window_update: bool,
}

impl StreamEntry {
    fn is_closed(&self) -> bool {
        let send_done = self
            .send
            .as_ref()
            .is_none_or(|s| s.is_terminal() && s.app_detached());
        let recv_done = self
            .recv
            .as_ref()
            .is_none_or(|r| r.is_terminal() && r.app_detached());
        send_done && recv_done && self.parked.is_none() && self.stop_sending.is_none()
    }
}

/// The per-connection stream registry.
pub(crate) struct StreamMap {
    side: Side,
    pool: Arc<BufferPool>,
    conn_wake: Arc<Notify>,

    streams: HashMap<StreamId, StreamEntry>,

    /// Local creation state and the peer's limits on it.
    next_local_bidi: u64,
    next_local_uni: u64,
    peer_max_streams_bidi: u64,
    peer_max_streams_uni: u64,

    /// Remote creation state and our limits on it.
    next_remote_bidi: u64,
    next_remote_uni: u64,
    local_max_streams_bidi: u64,
    local_max_streams_uni: u64,

    /// Initial per-stream flow limits, both directions.
    local_params: StreamLimits,
    peer_params: StreamLimits,

    /// Streams with sendable bytes or an unacked FIN, round-robin.
    flushable: VecDeque<StreamId>,
    flushable_set: HashSet<StreamId>,

    /// Streams owing MAX_STREAM_DATA, STOP_SENDING or RESET_STREAM.
    updates: VecDeque<StreamId>,
    updates_set: HashSet<StreamId>,

    /// Remote-initiated streams awaiting `accept`.
    accept_queue: VecDeque<StreamId>,

    /// MAX_STREAMS frames owed after stream teardown.
    pub queue_max_streams_bidi: bool,
    pub queue_max_streams_uni: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct StreamLimits {
    bidi_local: u64,
    bidi_remote: u64,
    uni: u64,
}

impl StreamLimits {
    fn from_params(params: &TransportParams) -> Self {
        Self {
            bidi_local: params.initial_max_stream_data_bidi_local,
            bidi_remote: params.initial_max_stream_data_bidi_remote,
            uni: params.initial_max_stream_data_uni,
        }
    }
}

impl StreamMap {
    pub fn new(
        side: Side,
        local_params: &TransportParams,
        pool: Arc<BufferPool>,
        conn_wake: Arc<Notify>,
    ) -> Self {
        Self {
            side,
            pool,
            conn_wake,
            streams: HashMap::new(),
            next_local_bidi: 0,
            next_local_uni: 0,
            peer_max_streams_bidi: 0,
            peer_max_streams_uni: 0,
            next_remote_bidi: 0,
            next_remote_uni: 0,
            local_max_streams_bidi: local_params.initial_max_streams_bidi,
            local_max_streams_uni: local_params.initial_max_streams_uni,
            local_params: StreamLimits::from_params(local_params),
            peer_params: StreamLimits::default(),
            flushable: VecDeque::new(),
            flushable_set: HashSet::new(),
            updates: VecDeque::new(),
            updates_set: HashSet::new(),
            accept_queue: VecDeque::new(),
            queue_max_streams_bidi: false,
            queue_max_streams_uni: false,
        }
    }

    /// Install the peer's transport parameters once the handshake
    /// produced them; limits only ever grow.
    pub fn apply_peer_params(&mut self, params: &TransportParams) {
        self.peer_max_streams_bidi = self.peer_max_streams_bidi.max(params.initial_max_streams_bidi);
        self.peer_max_streams_uni = self.peer_max_streams_uni.max(params.initial_max_streams_uni);
        self.peer_params = StreamLimits::from_params(params);
        // Streams opened before the handshake finished pick up the real
        // send limits now.
        let peer_params = self.peer_params;
        let side = self.side;
        for (&id, entry) in self.streams.iter_mut() {
            if let Some(send) = entry.send.as_mut() {
                let limit = if !is_bidi(id) {
                    peer_params.uni
                } else if initiator(id) == side {
                    peer_params.bidi_remote
                } else {
                    peer_params.bidi_local
                };
                send.set_max_data(limit);
            }
        }
    }

    pub fn on_max_streams(&mut self, bidi: bool, max: u64) {
        if bidi {
            self.peer_max_streams_bidi = self.peer_max_streams_bidi.max(max);
        } else {
            self.peer_max_streams_uni = self.peer_max_streams_uni.max(max);
        }
    }

    pub fn local_max_streams(&self, bidi: bool) -> u64 {
        if bidi {
            self.local_max_streams_bidi
        } else {
            self.local_max_streams_uni
        }
    }

    /// Flow-control limit the peer imposes on our sending half of `id`.
    fn peer_send_limit(&self, id: StreamId) -> u64 {
        if !is_bidi(id) {
            self.peer_params.uni
        } else if initiator(id) == self.side {
            // We opened it: the peer sees it as remote-initiated.
            self.peer_params.bidi_remote
        } else {
            self.peer_params.bidi_local
        }
    }

    /// Limit we impose on the peer's sending half of `id`.
    fn local_recv_limit(&self, id: StreamId) -> u64 {
        if !is_bidi(id) {
            self.local_params.uni
        } else if initiator(id) == self.side {
            self.local_params.bidi_local
        } else {
            self.local_params.bidi_remote
        }
    }

    fn build_entry(&self, id: StreamId) -> StreamEntry {
        let local = initiator(id) == self.side;
        let has_send = is_bidi(id) || local;
        let has_recv = is_bidi(id) || !local;

        let mut send_handle = None;
        let send = has_send.then(|| {
            let (stream, handle) = SendStream::new(
                self.peer_send_limit(id),
                Arc::clone(&self.pool),
                Arc::clone(&self.conn_wake),
            );
            send_handle = Some(handle);
            stream
        });
        let recv = has_recv.then(|| {
            RecvStream::new(self.local_recv_limit(id), Arc::clone(&self.conn_wake))
        });
        let recv_handle = recv.as_ref().map(|r| r.handle());

        StreamEntry {
            send,
            recv,
            parked: Some(StreamHandles {
                id,
                send: send_handle,
                recv: recv_handle,
            }),
            stop_sending: None,
            stop_sending_in_flight: false,
            reset_in_flight: false,
            force_window_update: false,
        }
    }

    /// Open a locally initiated stream. Fails with `StreamLimit` (not a
    /// connection error) when the peer's creation limit is exhausted.
    pub fn open_local(&mut self, bidi: bool) -> Result<StreamHandles> {
        let (next, limit) = if bidi {
            (self.next_local_bidi, self.peer_max_streams_bidi)
        } else {
            (self.next_local_uni, self.peer_max_streams_uni)
        };
        if next >= limit {
            return Err(Error::transport(TransportError::StreamLimit));
        }
        let id = id_for(self.side, bidi, next);
        if bidi {
            self.next_local_bidi += 1;
        } else {
            self.next_local_uni += 1;
        }
        let mut entry = self.build_entry(id);
        let handles = entry.parked.take().expect("fresh entry has handles");
        self.streams.insert(id, entry);
        debug!(stream = id, bidi, "opened local stream");
        Ok(handles)
    }

    /// Resolve `id` from a peer frame, creating it (and all lower-indexed
    /// streams of its type) if it is remote-initiated and within limits.
    pub fn get_or_create(&mut self, id: StreamId, frame_type: u64) -> Result<&mut StreamEntry> {
        let local = initiator(id) == self.side;
        let idx = index(id);

        if local {
            // The peer cannot invent our streams.
            let opened = if is_bidi(id) {
                self.next_local_bidi
            } else {
                self.next_local_uni
            };
            if idx >= opened {
                return Err(Error::for_frame(TransportError::StreamState, frame_type));
            }
            return self
                .streams
                .get_mut(&id)
                .ok_or_else(|| Error::for_frame(TransportError::StreamState, frame_type));
        }

        let (next, limit) = if is_bidi(id) {
            (self.next_remote_bidi, self.local_max_streams_bidi)
        } else {
            (self.next_remote_uni, self.local_max_streams_uni)
        };
        if idx >= next {
            if idx >= limit {
                return Err(Error::for_frame(TransportError::StreamLimit, frame_type));
            }
            // Implicit creation of every lower-indexed stream of the type.
            for i in next..=idx {
                let new_id = id_for(self.side.peer(), is_bidi(id), i);
                let entry = self.build_entry(new_id);
                self.streams.insert(new_id, entry);
                self.accept_queue.push_back(new_id);
            }
            if is_bidi(id) {
                self.next_remote_bidi = idx + 1;
            } else {
                self.next_remote_uni = idx + 1;
            }
            debug!(stream = id, "peer opened stream");
        }
        self.streams
            .get_mut(&id)
            .ok_or_else(|| Error::for_frame(TransportError::StreamState, frame_type))
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamEntry> {
        self.streams.get_mut(&id)
    }

    /// Next remote-initiated stream the application has not seen.
    pub fn accept(&mut self) -> Option<StreamHandles> {
        while let Some(id) = self.accept_queue.pop_front() {
            if let Some(entry) = self.streams.get_mut(&id) {
                if let Some(handles) = entry.parked.take() {
                    return Some(handles);
                }
            }
        }
        None
    }

    pub fn has_accept_pending(&self) -> bool {
        !self.accept_queue.is_empty()
    }

    // --- flush scheduler -------------------------------------------------

    pub fn mark_flushable(&mut self, id: StreamId) {
        if self.flushable_set.insert(id) {
            self.flushable.push_back(id);
        }
    }

    /// Pop the next stream in round-robin order; the caller re-marks it
    /// if it still has data after writing a frame.
    pub fn pop_flushable(&mut self) -> Option<StreamId> {
        let id = self.flushable.pop_front()?;
        self.flushable_set.remove(&id);
        Some(id)
    }

    /// Seed the scheduler from every stream that currently has work.
    pub fn refresh_flushable(&mut self) {
        let mut ids: Vec<StreamId> = Vec::new();
        for (&id, entry) in self.streams.iter_mut() {
            if entry.send.as_mut().is_some_and(|s| s.is_flushable()) {
                ids.push(id);
            }
        }
        for id in ids {
            self.mark_flushable(id);
        }
    }

    // --- update scheduler ------------------------------------------------

    pub fn mark_update(&mut self, id: StreamId) {
        if self.updates_set.insert(id) {
            self.updates.push_back(id);
        }
    }

    pub fn pop_update(&mut self) -> Option<StreamId> {
        let id = self.updates.pop_front()?;
        self.updates_set.remove(&id);
        Some(id)
    }

    pub fn has_updates(&self) -> bool {
        !self.updates.is_empty()
    }

    pub fn has_flushable(&self) -> bool {
        !self.flushable.is_empty()
    }

    /// Collect updates owed by stream state: window updates, app stop
    /// requests, reset requests.
    pub fn refresh_updates(&mut self) {
        let mut owed: Vec<StreamId> = Vec::new();
        for (&id, entry) in self.streams.iter_mut() {
            if let Some(recv) = entry.recv.as_mut() {
                if let Some(code) = recv.take_stop_request() {
                    if entry.stop_sending.is_none() {
                        entry.stop_sending = Some(code);
                    }
                }
            }
            let wants_update = entry.force_window_update
                || entry.recv.as_ref().is_some_and(|r| r.wants_window_update());
            let wants_stop = entry.stop_sending.is_some() && !entry.stop_sending_in_flight;
            let reset_in_flight = entry.reset_in_flight;
            let wants_reset = entry.send.as_mut().is_some_and(|s| {
                s.drain();
                s.state() == SendState::WantReset && !reset_in_flight
            });
            if wants_update || wants_stop || wants_reset {
                owed.push(id);
            }
        }
        for id in owed {
            self.mark_update(id);
        }
    }

    // --- teardown --------------------------------------------------------

    /// Drop streams whose both halves are terminal and unreferenced,
    /// granting the peer fresh creation credit for remote ones.
    pub fn cleanup(&mut self) {
        let mut closed: Vec<StreamId> = Vec::new();
        for (&id, entry) in self.streams.iter_mut() {
            if let Some(recv) = entry.recv.as_mut() {
                recv.sync();
            }
            if entry.is_closed() {
                closed.push(id);
            }
        }
        for id in closed {
            self.streams.remove(&id);
            self.flushable_set.remove(&id);
            self.updates_set.remove(&id);
            if initiator(id) != self.side {
                if is_bidi(id) {
                    self.local_max_streams_bidi += 1;
                    self.queue_max_streams_bidi = true;
                } else {
                    self.local_max_streams_uni += 1;
                    self.queue_max_streams_uni = true;
                }
            }
            debug!(stream = id, "stream destroyed");
        }
    }

    pub fn on_connection_closed(&mut self) {
        for entry in self.streams.values_mut() {
            if let Some(send) = entry.send.as_mut() {
                send.on_connection_closed();
            }
            if let Some(recv) = entry.recv.as_mut() {
                recv.on_connection_closed();
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(side: Side) -> StreamMap {
        let mut params = TransportParams::default();
        params.initial_max_streams_bidi = 4;
        params.initial_max_streams_uni = 2;
        params.initial_max_stream_data_bidi_local = 1000;
        params.initial_max_stream_data_bidi_remote = 2000;
        params.initial_max_stream_data_uni = 500;
        StreamMap::new(
            side,
            &params,
            BufferPool::new(64, 8),
            Arc::new(Notify::new()),
        )
    }

    fn peer_params() -> TransportParams {
        let mut params = TransportParams::default();
        params.initial_max_streams_bidi = 3;
        params.initial_max_streams_uni = 1;
        params.initial_max_stream_data_bidi_local = 100;
        params.initial_max_stream_data_bidi_remote = 200;
        params.initial_max_stream_data_uni = 50;
        params
    }

    #[test]
    fn id_encoding() {
        assert_eq!(id_for(Side::Client, true, 0), 0);
        assert_eq!(id_for(Side::Server, true, 0), 1);
        assert_eq!(id_for(Side::Client, false, 0), 2);
        assert_eq!(id_for(Side::Server, false, 1), 7);
        assert!(is_bidi(4));
        assert!(!is_bidi(6));
        assert_eq!(initiator(5), Side::Server);
        assert_eq!(index(9), 2);
    }

    #[test]
    fn open_local_respects_peer_limit() {
        let mut map = map(Side::Client);
        map.apply_peer_params(&peer_params());

        let first = map.open_local(false).unwrap();
        assert_eq!(first.id, 2);
        assert!(first.send.is_some());
        assert!(first.recv.is_none());

        // Peer allows exactly one uni stream.
        assert!(map.open_local(false).is_err());
        // Bidi limit is separate.
        assert_eq!(map.open_local(true).unwrap().id, 0);
    }

    #[test]
    fn remote_reference_creates_lower_indices() {
        let mut map = map(Side::Server);
        // Client uni stream with index 1: index 0 is created implicitly.
        map.get_or_create(6, 0x08).unwrap();
        assert!(map.get_mut(2).is_some());
        let first = map.accept().unwrap();
        let second = map.accept().unwrap();
        assert_eq!((first.id, second.id), (2, 6));
        assert!(map.accept().is_none());
    }

    #[test]
    fn remote_over_limit_is_stream_limit_error() {
        let mut map = map(Side::Server);
        // Local limit is 2 uni streams; index 2 is one too many.
        let err = map.get_or_create(10, 0x08).unwrap_err();
        assert_eq!(
            err,
            Error::for_frame(TransportError::StreamLimit, 0x08)
        );
    }

    #[test]
    fn peer_referencing_unopened_local_stream_is_stream_state() {
        let mut map = map(Side::Client);
        // Stream 2 is client-initiated uni; the client never opened it.
        let err = map.get_or_create(2, 0x04).unwrap_err();
        assert_eq!(err, Error::for_frame(TransportError::StreamState, 0x04));
    }

    #[test]
    fn flushable_round_robin() {
        let mut map = map(Side::Client);
        map.mark_flushable(0);
        map.mark_flushable(4);
        map.mark_flushable(0); // duplicate ignored
        assert_eq!(map.pop_flushable(), Some(0));
        map.mark_flushable(0);
        assert_eq!(map.pop_flushable(), Some(4));
        assert_eq!(map.pop_flushable(), Some(0));
        assert_eq!(map.pop_flushable(), None);
    }

    #[test]
    fn cleanup_grants_remote_credit() {
        let mut map = map(Side::Server);
        map.get_or_create(2, 0x08).unwrap();
        // Drive the receive half to terminal: reset received, app never
        // attached (parked handles dropped below).
        let entry = map.get_mut(2).unwrap();
        entry.parked = None;
        entry.recv.as_mut().unwrap().on_reset(0, 0).unwrap();
        map.cleanup();
        assert!(map.get_mut(2).is_none());
        assert_eq!(map.local_max_streams(false), 3);
        assert!(map.queue_max_streams_uni);
    }
}
