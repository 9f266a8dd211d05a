//! Inbound stream reassembly (draft-27 §2.2).
//!
//! The connection worker owns the [`RecvStream`] and feeds it STREAM
//! frames; contiguous bytes are moved into a shared queue the application
//! drains through [`RecvStreamHandle::read`]. Overlapping retransmissions
//! keep the first copy of every byte.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::{Error, Result, TransportError};
use crate::ranges::RangeSet;

/// Out-of-order byte reassembler, shared by stream and crypto receive
/// paths. Stored chunks are disjoint; overlap is trimmed on insert.
#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    chunks: BTreeMap<u64, Vec<u8>>,
    received: RangeSet,
    read_offset: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next offset the consumer has not taken yet.
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// End of the contiguous prefix starting at the read offset.
    pub fn contiguous_end(&self) -> u64 {
        match self.received.first_range() {
            Some(r) if r.start <= self.read_offset => r.end.max(self.read_offset),
            _ => self.read_offset,
        }
    }

    /// Largest offset seen so far.
    pub fn highest_received(&self) -> u64 {
        self.received.max().map_or(0, |v| v + 1)
    }

    /// Insert `data` at `offset`, keeping the first copy on overlap.
    pub fn insert(&mut self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        let mut at = offset.max(self.read_offset);

        while at < end {
            // Skip anything already received.
            if self.received.contains(at) {
                let covered = self
                    .received
                    .iter()
                    .find(|r| r.contains(&at))
                    .expect("contains implies a range");
                at = covered.end;
                continue;
            }
            // Copy up to the next received range (or the end).
            let stop = self
                .received
                .iter()
                .find(|r| r.start > at)
                .map_or(end, |r| r.start.min(end));
            let slice = &data[(at - offset) as usize..(stop - offset) as usize];
            self.chunks.insert(at, slice.to_vec());
            self.received.insert(at..stop);
            at = stop;
        }
    }

    /// Pop up to `max` contiguous bytes from the read offset.
    pub fn pop(&mut self, max: usize) -> Option<Vec<u8>> {
        let (&start, _) = self.chunks.first_key_value()?;
        if start != self.read_offset || max == 0 {
            return None;
        }
        let mut data = self.chunks.remove(&start).expect("keyed chunk");
        if data.len() > max {
            let rest = data.split_off(max);
            self.chunks.insert(start + max as u64, rest);
        }
        self.read_offset += data.len() as u64;
        Some(data)
    }

    /// Drain everything contiguous.
    pub fn pop_all(&mut self) -> Option<Vec<u8>> {
        let mut out: Option<Vec<u8>> = None;
        while let Some(chunk) = self.pop(usize::MAX) {
            match &mut out {
                Some(buf) => buf.extend_from_slice(&chunk),
                None => out = Some(chunk),
            }
        }
        out
    }
}

/// Receive-side stream states (draft-27 §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Recv,
    SizeKnown,
    DataRcvd,
    DataRead,
    ResetRecvd,
    ResetRead,
}

#[derive(Debug, Default)]
struct RecvSharedState {
    /// Contiguous bytes ready for the reader, in stream order.
    ready: VecDeque<Bytes>,
    /// Bytes handed to the reader.
    consumed: u64,
    fin: bool,
    reset: Option<u64>,
    /// Application asked to abort reading; becomes a STOP_SENDING.
    stop_request: Option<u64>,
}

/// State shared between the connection worker and the reading application.
#[derive(Debug)]
pub(crate) struct RecvShared {
    state: Mutex<RecvSharedState>,
    readable: Notify,
    /// Wakes the connection worker (window updates after reads).
    conn_wake: Arc<Notify>,
}

/// Inbound half of a stream, owned by the connection.
#[derive(Debug)]
pub struct RecvStream {
    reasm: Reassembler,
    state: RecvState,
    /// Current advertised limit for this stream.
    max_stream_data: u64,
    /// Receive window size used when advancing the limit.
    window: u64,
    final_size: Option<u64>,
    shared: Arc<RecvShared>,
}

impl RecvStream {
    pub(crate) fn new(max_stream_data: u64, conn_wake: Arc<Notify>) -> Self {
        Self {
            reasm: Reassembler::new(),
            state: RecvState::Recv,
            max_stream_data,
            window: max_stream_data,
            final_size: None,
            shared: Arc::new(RecvShared {
                state: Mutex::new(RecvSharedState::default()),
                readable: Notify::new(),
                conn_wake,
            }),
        }
    }

    pub fn state(&self) -> RecvState {
        self.state
    }

    pub(crate) fn handle(&self) -> RecvStreamHandle {
        RecvStreamHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Bytes newly occupying connection-level receive window: the highest
    /// received offset, which is what flow control accounts.
    pub(crate) fn highest_received(&self) -> u64 {
        self.reasm.highest_received()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state, RecvState::DataRead | RecvState::ResetRead)
    }

    /// Ingest one STREAM frame. Returns the growth of the highest
    /// received offset, for connection-level flow control.
    pub(crate) fn on_frame(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<u64> {
        if matches!(self.state, RecvState::ResetRecvd | RecvState::ResetRead) {
            // Late data after a reset is dropped.
            return Ok(0);
        }
        let end = offset + data.len() as u64;
        if end > self.max_stream_data {
            return Err(Error::transport(TransportError::FlowControl));
        }
        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(Error::transport(TransportError::FinalSize));
            }
        }
        if fin {
            if end < self.reasm.highest_received() {
                return Err(Error::transport(TransportError::FinalSize));
            }
            self.final_size = Some(end);
            if self.state == RecvState::Recv {
                self.state = RecvState::SizeKnown;
            }
        }

        let before = self.reasm.highest_received();
        self.reasm.insert(offset, data);
        let growth = self.reasm.highest_received().saturating_sub(before);

        // Hand the new contiguous prefix to the reader.
        let fin_reached = self.final_size == Some(self.reasm.contiguous_end());
        let popped = self.reasm.pop_all();
        if popped.is_some() || fin_reached {
            let mut shared = self.shared.state.lock().expect("recv stream lock");
            if let Some(bytes) = popped {
                shared.ready.push_back(Bytes::from(bytes));
            }
            if fin_reached {
                shared.fin = true;
                if self.state == RecvState::SizeKnown {
                    self.state = RecvState::DataRcvd;
                }
            }
            drop(shared);
            self.shared.readable.notify_one();
        }
        Ok(growth)
    }

    /// Ingest RESET_STREAM. Returns window growth as for `on_frame`.
    pub(crate) fn on_reset(&mut self, error_code: u64, final_size: u64) -> Result<u64> {
        if let Some(known) = self.final_size {
            if known != final_size {
                return Err(Error::transport(TransportError::FinalSize));
            }
        }
        if final_size < self.reasm.highest_received() {
            return Err(Error::transport(TransportError::FinalSize));
        }
        if final_size > self.max_stream_data {
            return Err(Error::transport(TransportError::FlowControl));
        }
        let growth = final_size.saturating_sub(self.reasm.highest_received());
        self.final_size = Some(final_size);
        if !matches!(self.state, RecvState::ResetRecvd | RecvState::ResetRead) {
            self.state = RecvState::ResetRecvd;
            let mut shared = self.shared.state.lock().expect("recv stream lock");
            shared.reset = Some(error_code);
            drop(shared);
            self.shared.readable.notify_one();
        }
        Ok(growth)
    }

    /// Whether consumption has crossed half the outstanding window, owing
    /// the peer a MAX_STREAM_DATA.
    pub(crate) fn wants_window_update(&self) -> bool {
        if self.state != RecvState::Recv {
            return false;
        }
        let consumed = self.shared.state.lock().expect("recv stream lock").consumed;
        self.max_stream_data - consumed < self.window / 2
    }

    /// Commit a window update: slides the advertised limit forward and
    /// returns it for the MAX_STREAM_DATA frame.
    pub(crate) fn pending_window_update(&mut self) -> Option<u64> {
        if !self.wants_window_update() {
            return None;
        }
        let consumed = self.shared.state.lock().expect("recv stream lock").consumed;
        self.max_stream_data = consumed + self.window;
        Some(self.max_stream_data)
    }

    /// Limit currently advertised to the peer, for retransmitting a lost
    /// MAX_STREAM_DATA.
    pub(crate) fn advertised_limit(&self) -> u64 {
        self.max_stream_data
    }

    /// A STOP_SENDING the application requested, taken once.
    pub(crate) fn take_stop_request(&mut self) -> Option<u64> {
        self.shared
            .state
            .lock()
            .expect("recv stream lock")
            .stop_request
            .take()
    }

    pub(crate) fn on_connection_closed(&mut self) {
        self.shared.readable.notify_one();
    }

    /// Whether the application side still holds its handle.
    pub(crate) fn app_detached(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }

    /// Fold the reader's progress back into the worker-side state. A
    /// dropped application handle counts as having observed EOF or reset.
    pub(crate) fn sync(&mut self) {
        let app_detached = Arc::strong_count(&self.shared) == 1;
        let shared = self.shared.state.lock().expect("recv stream lock");
        match self.state {
            RecvState::DataRcvd if shared.fin && (shared.ready.is_empty() || app_detached) => {
                self.state = RecvState::DataRead;
            }
            RecvState::ResetRecvd if app_detached => {
                self.state = RecvState::ResetRead;
            }
            _ => {}
        }
    }
}

/// Application-side reading handle.
#[derive(Debug, Clone)]
pub struct RecvStreamHandle {
    shared: Arc<RecvShared>,
}

impl RecvStreamHandle {
    /// Read up to `buf.len()` bytes in stream order. Returns 0 once the
    /// peer's FIN has been fully consumed, `StreamAborted` after a reset.
    /// Suspends while no data, FIN or reset is available; cancelling the
    /// future leaves the stream usable.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            {
                let mut shared = self.shared.state.lock().expect("recv stream lock");
                if let Some(code) = shared.reset {
                    return Err(Error::StreamAborted(code));
                }
                if let Some(front) = shared.ready.front_mut() {
                    let n = front.len().min(buf.len());
                    buf[..n].copy_from_slice(&front[..n]);
                    if n == front.len() {
                        shared.ready.pop_front();
                    } else {
                        let _ = front.split_to(n);
                    }
                    shared.consumed += n as u64;
                    drop(shared);
                    // Reads can unlock a window update.
                    self.shared.conn_wake.notify_one();
                    return Ok(n);
                }
                if shared.fin {
                    return Ok(0);
                }
            }
            self.shared.readable.notified().await;
        }
    }

    /// Ask the peer to stop sending: the next outgoing packet carries
    /// STOP_SENDING with `code`.
    pub fn abort_read(&self, code: u64) {
        let mut shared = self.shared.state.lock().expect("recv stream lock");
        if shared.stop_request.is_none() {
            shared.stop_request = Some(code);
        }
        drop(shared);
        self.shared.conn_wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(limit: u64) -> RecvStream {
        RecvStream::new(limit, Arc::new(Notify::new()))
    }

    #[test]
    fn reassembler_in_order() {
        let mut r = Reassembler::new();
        r.insert(0, b"hello");
        assert_eq!(r.contiguous_end(), 5);
        assert_eq!(r.pop_all().unwrap(), b"hello");
        assert_eq!(r.read_offset(), 5);
    }

    #[test]
    fn reassembler_gap_then_fill() {
        let mut r = Reassembler::new();
        r.insert(5, b"world");
        assert_eq!(r.contiguous_end(), 0);
        assert!(r.pop(100).is_none());
        r.insert(0, b"hello");
        assert_eq!(r.pop_all().unwrap(), b"helloworld");
    }

    #[test]
    fn reassembler_keeps_first_copy() {
        let mut r = Reassembler::new();
        r.insert(2, b"BBB");
        r.insert(0, b"aaaaa"); // overlaps [2,5): first copy wins there
        assert_eq!(r.pop_all().unwrap(), b"aaBBB");
    }

    #[test]
    fn reassembler_partial_pop_splits() {
        let mut r = Reassembler::new();
        r.insert(0, b"abcdef");
        assert_eq!(r.pop(4).unwrap(), b"abcd");
        assert_eq!(r.pop(4).unwrap(), b"ef");
    }

    #[test]
    fn frame_past_limit_is_flow_control_error() {
        let mut s = stream(10);
        assert_eq!(
            s.on_frame(8, b"abc", false).unwrap_err(),
            Error::transport(TransportError::FlowControl)
        );
    }

    #[test]
    fn shrinking_final_size_rejected() {
        let mut s = stream(100);
        s.on_frame(0, b"abcdefgh", false).unwrap();
        assert_eq!(
            s.on_frame(0, b"abc", true).unwrap_err(),
            Error::transport(TransportError::FinalSize)
        );
    }

    #[test]
    fn data_beyond_final_size_rejected() {
        let mut s = stream(100);
        s.on_frame(0, b"abc", true).unwrap();
        assert_eq!(
            s.on_frame(3, b"d", false).unwrap_err(),
            Error::transport(TransportError::FinalSize)
        );
    }

    #[test]
    fn state_walk_to_data_rcvd() {
        let mut s = stream(100);
        assert_eq!(s.state(), RecvState::Recv);
        s.on_frame(5, b"world", true).unwrap();
        assert_eq!(s.state(), RecvState::SizeKnown);
        s.on_frame(0, b"hello", false).unwrap();
        assert_eq!(s.state(), RecvState::DataRcvd);
    }

    #[test]
    fn window_update_at_half_window() {
        let mut s = stream(100);
        s.on_frame(0, &[0u8; 40], false).unwrap();
        assert_eq!(s.pending_window_update(), None);

        // Simulate the reader consuming 60 bytes.
        s.shared.state.lock().unwrap().consumed = 60;
        // 100 - 60 = 40 < 50: window slides to consumed + window.
        assert_eq!(s.pending_window_update(), Some(160));
        assert_eq!(s.pending_window_update(), None);
    }

    #[test]
    fn reset_final_size_conflict() {
        let mut s = stream(100);
        s.on_frame(0, b"abcde", true).unwrap();
        assert!(s.on_reset(7, 3).is_err());
        assert!(s.on_reset(7, 5).is_ok());
        assert_eq!(s.state(), RecvState::ResetRecvd);
    }

    #[tokio::test]
    async fn read_returns_data_then_eof() {
        let mut s = stream(100);
        let handle = s.handle();
        s.on_frame(0, b"hi", true).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(handle.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
        assert_eq!(handle.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_reports_reset() {
        let mut s = stream(100);
        let handle = s.handle();
        s.on_reset(0x15, 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            handle.read(&mut buf).await.unwrap_err(),
            Error::StreamAborted(0x15)
        );
    }

    #[tokio::test]
    async fn read_wakes_on_arrival() {
        let mut s = stream(100);
        let handle = s.handle();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let n = handle.read(&mut buf).await.unwrap();
            (n, buf)
        });
        tokio::task::yield_now().await;
        s.on_frame(0, b"abc", false).unwrap();
        let (n, buf) = reader.await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"abc");
    }
}
