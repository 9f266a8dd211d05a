//! Outbound stream machinery (draft-27 §2.2, §3.1).
//!
//! The producing application fills pooled slabs through a
//! [`SendStreamHandle`] and publishes full chunks over an SPSC channel;
//! the connection worker drains that channel without suspending and runs
//! the range bookkeeping: `acked`, `in_flight` and `pending` are pairwise
//! disjoint and together cover exactly `[0, dequeued)`.
//!
//! Back-pressure: a producer may hold at most [`MAX_HELD_CHUNKS`]
//! unconsumed slabs; the permits travel with the slabs and release when
//! the worker returns them to the pool after acknowledgement.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::trace;

use crate::error::{Error, Result};
use crate::pool::{BufferPool, PooledBuf};
use crate::ranges::RangeSet;

/// Most unconsumed slabs a producer may hold before `enqueue` suspends.
pub const MAX_HELD_CHUNKS: usize = 19;

/// Send-side stream states (draft-27 §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Ready,
    Send,
    DataSent,
    DataReceived,
    WantReset,
    ResetSent,
    ResetReceived,
}

/// One published chunk: a rented slab and the stream range it covers.
pub(crate) struct Chunk {
    offset: u64,
    len: usize,
    buf: PooledBuf,
}

#[derive(Debug, Default)]
struct SendSharedState {
    /// Total bytes accepted from the producer; producer-mutated only.
    written: u64,
    size_known: bool,
    /// Local abort, set once by `abort`.
    aborted: Option<u64>,
    /// Peer STOP_SENDING; surfaces to the producer as `StreamAborted`.
    stopped: Option<u64>,
    /// Every byte up to the final size has been acknowledged.
    data_received: bool,
    connection_closed: bool,
}

pub(crate) struct SendShared {
    state: Mutex<SendSharedState>,
    permits: Arc<Semaphore>,
    /// Signalled on DataReceived and on connection close.
    completion: Notify,
    conn_wake: Arc<Notify>,
    pool: Arc<BufferPool>,
}

/// Outbound half of a stream, owned by the connection worker.
pub struct SendStream {
    shared: Arc<SendShared>,
    rx: mpsc::UnboundedReceiver<Chunk>,
    /// Chunks covering the not-yet-released prefix of `[0, dequeued)`,
    /// sorted by offset.
    chunks: VecDeque<Chunk>,
    /// Bytes moved from the channel into `chunks`.
    dequeued: u64,
    /// First byte never yet emitted.
    unsent_offset: u64,
    /// Peer-advertised stream flow-control limit.
    max_data: u64,
    acked: RangeSet,
    in_flight: RangeSet,
    pending: RangeSet,
    state: SendState,
    fin_acked: bool,
    fin_in_flight: bool,
    /// Application error code, recorded once on abort.
    error_code: Option<u64>,
    /// Snapshots of producer-owned fields, refreshed by `drain`.
    written: u64,
    size_known: bool,
}

impl SendStream {
    pub(crate) fn new(
        max_data: u64,
        pool: Arc<BufferPool>,
        conn_wake: Arc<Notify>,
    ) -> (Self, SendStreamHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SendShared {
            state: Mutex::new(SendSharedState::default()),
            permits: Arc::new(Semaphore::new(MAX_HELD_CHUNKS)),
            completion: Notify::new(),
            conn_wake,
            pool,
        });
        let stream = Self {
            shared: Arc::clone(&shared),
            rx,
            chunks: VecDeque::new(),
            dequeued: 0,
            unsent_offset: 0,
            max_data,
            acked: RangeSet::new(),
            in_flight: RangeSet::new(),
            pending: RangeSet::new(),
            state: SendState::Ready,
            fin_acked: false,
            fin_in_flight: false,
            error_code: None,
            written: 0,
            size_known: false,
        };
        let handle = SendStreamHandle {
            shared,
            tx,
            tail: None,
        };
        (stream, handle)
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub(crate) fn error_code(&self) -> Option<u64> {
        self.error_code
    }

    /// First byte never yet emitted; monotone non-decreasing.
    pub(crate) fn unsent_offset(&self) -> u64 {
        self.unsent_offset
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SendState::DataReceived | SendState::ResetReceived
        )
    }

    /// Raise the peer's flow-control limit (monotone).
    pub(crate) fn set_max_data(&mut self, value: u64) {
        self.max_data = self.max_data.max(value);
    }

    /// Drain the producer channel and snapshots; never suspends.
    pub(crate) fn drain(&mut self) {
        while let Ok(chunk) = self.rx.try_recv() {
            debug_assert_eq!(chunk.offset, self.dequeued);
            self.pending
                .insert(chunk.offset..chunk.offset + chunk.len as u64);
            self.dequeued = chunk.offset + chunk.len as u64;
            self.chunks.push_back(chunk);
        }
        let (written, size_known, aborted) = {
            let shared = self.shared.state.lock().expect("send stream lock");
            (shared.written, shared.size_known, shared.aborted)
        };
        self.written = written;
        self.size_known = size_known;
        if let Some(code) = aborted {
            self.want_reset(code);
        }
    }

    /// Move the stream toward RESET_STREAM emission. Idempotent past
    /// `WantReset`.
    pub(crate) fn want_reset(&mut self, code: u64) {
        if matches!(
            self.state,
            SendState::WantReset | SendState::ResetSent | SendState::ResetReceived
        ) {
            return;
        }
        self.state = SendState::WantReset;
        self.error_code.get_or_insert(code);
        // Release a producer suspended on the chunk bound.
        self.shared.permits.close();
    }

    /// Peer asked us to stop; record the code so the producer observes
    /// the abort, then reset with the peer's code.
    pub(crate) fn on_stop_sending(&mut self, code: u64) {
        self.shared
            .state
            .lock()
            .expect("send stream lock")
            .stopped = Some(code);
        self.want_reset(code);
    }

    /// `(offset, count)` of the next sendable prefix of `pending` below
    /// the flow-control limit; `(written, 0)` when nothing is sendable.
    pub(crate) fn sendable(&mut self) -> (u64, u64) {
        self.drain();
        if let Some(range) = self.pending.first_range() {
            if range.start < self.max_data {
                return (range.start, range.end.min(self.max_data) - range.start);
            }
        }
        (self.written, 0)
    }

    /// Whether this stream has anything for the next STREAM frame.
    pub(crate) fn is_flushable(&mut self) -> bool {
        if matches!(
            self.state,
            SendState::WantReset | SendState::ResetSent | SendState::ResetReceived
        ) {
            return false;
        }
        let (_, count) = self.sendable();
        count > 0 || self.fin_needed()
    }

    fn fin_needed(&self) -> bool {
        self.size_known
            && !self.fin_acked
            && !self.fin_in_flight
            && self.unsent_offset == self.written
            && self.dequeued == self.written
    }

    /// The stream-limit offset it is blocked on, if flow control is the
    /// only thing holding data back.
    pub(crate) fn blocked_at(&self) -> Option<u64> {
        self.pending
            .first_range()
            .filter(|r| r.start >= self.max_data)
            .map(|_| self.max_data)
    }

    /// Copy the next sendable bytes into `out`, moving them from
    /// `pending` to `in_flight`. Returns `(offset, len, fin)`; `None`
    /// when there is neither data nor a FIN to carry.
    pub(crate) fn check_out(&mut self, out: &mut [u8]) -> Option<(u64, usize, bool)> {
        let (offset, count) = self.sendable();
        let len = (count as usize).min(out.len());

        if len == 0 {
            // A bare FIN still takes a frame.
            if self.fin_needed() {
                self.fin_in_flight = true;
                self.advance_state_on_emit(self.written);
                return Some((self.written, 0, true));
            }
            return None;
        }

        let end = offset + len as u64;
        self.copy_range(offset, &mut out[..len]);
        self.pending.remove(offset..end);
        self.in_flight.insert(offset..end);
        self.unsent_offset = self.unsent_offset.max(end);

        let fin = self.size_known && end == self.written && self.dequeued == self.written;
        if fin {
            self.fin_in_flight = true;
        }
        self.advance_state_on_emit(end);
        Some((offset, len, fin))
    }

    fn advance_state_on_emit(&mut self, _end: u64) {
        if self.state == SendState::Ready {
            self.state = SendState::Send;
        }
        if self.state == SendState::Send
            && self.size_known
            && self.unsent_offset == self.written
            && self.dequeued == self.written
        {
            self.state = SendState::DataSent;
        }
    }

    fn copy_range(&self, offset: u64, out: &mut [u8]) {
        let end = offset + out.len() as u64;
        for chunk in &self.chunks {
            let c_start = chunk.offset;
            let c_end = chunk.offset + chunk.len as u64;
            if c_end <= offset {
                continue;
            }
            if c_start >= end {
                break;
            }
            let from = offset.max(c_start);
            let to = end.min(c_end);
            out[(from - offset) as usize..(to - offset) as usize]
                .copy_from_slice(&chunk.buf[(from - c_start) as usize..(to - c_start) as usize]);
        }
    }

    /// A STREAM frame for `[offset, offset + count)` was acknowledged.
    pub(crate) fn on_ack(&mut self, offset: u64, count: u64, fin: bool) {
        let range = offset..offset + count;
        self.in_flight.remove(range.clone());
        self.acked.insert(range);
        if fin {
            debug_assert_eq!(offset + count, self.written);
            self.fin_acked = true;
            self.fin_in_flight = false;
        }
        self.release_acked_chunks();

        if self.state == SendState::DataSent
            && self.fin_acked
            && self.acked.contains_range(0..self.written)
        {
            self.state = SendState::DataReceived;
            let mut shared = self.shared.state.lock().expect("send stream lock");
            shared.data_received = true;
            drop(shared);
            self.shared.completion.notify_waiters();
            trace!(written = self.written, "send stream fully acknowledged");
        }
    }

    /// Return slabs whose bytes sit entirely below the contiguous acked
    /// prefix.
    fn release_acked_chunks(&mut self) {
        let released_to = match self.acked.first_range() {
            Some(r) if r.start == 0 => r.end,
            _ => return,
        };
        while let Some(front) = self.chunks.front() {
            if front.offset + front.len as u64 <= released_to {
                self.chunks.pop_front();
            } else {
                break;
            }
        }
    }

    /// A STREAM frame was declared lost; its unacked bytes go back to
    /// `pending`.
    pub(crate) fn on_lost(&mut self, offset: u64, count: u64, fin: bool) {
        let range = offset..offset + count;
        self.in_flight.remove(range.clone());
        self.pending.insert(range.clone());
        for acked in self.acked.iter() {
            if acked.start >= range.end {
                break;
            }
            self.pending.remove(acked);
        }
        if fin && !self.fin_acked {
            self.fin_in_flight = false;
        }
    }

    /// RESET_STREAM emission bookkeeping: final size is the highest byte
    /// ever emitted; buffered but unsent data is dropped now.
    pub(crate) fn on_reset_sent(&mut self) -> (u64, u64) {
        debug_assert_eq!(self.state, SendState::WantReset);
        self.state = SendState::ResetSent;
        self.chunks.clear();
        self.pending = RangeSet::new();
        self.in_flight = RangeSet::new();
        // Drain whatever the producer still had published.
        while self.rx.try_recv().is_ok() {}
        (self.error_code.unwrap_or(0), self.unsent_offset)
    }

    pub(crate) fn on_reset_acked(&mut self) {
        if self.state == SendState::ResetSent {
            self.state = SendState::ResetReceived;
            self.shared.completion.notify_waiters();
        }
    }

    pub(crate) fn on_reset_lost(&mut self) {
        if self.state == SendState::ResetSent {
            self.state = SendState::WantReset;
        }
    }

    pub(crate) fn on_connection_closed(&mut self) {
        let mut shared = self.shared.state.lock().expect("send stream lock");
        shared.connection_closed = true;
        drop(shared);
        self.shared.permits.close();
        self.shared.completion.notify_waiters();
    }

    /// Whether the application side still holds its handle.
    pub(crate) fn app_detached(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }

    #[cfg(test)]
    pub(crate) fn invariants_hold(&self) -> bool {
        // acked, in_flight, pending are disjoint and cover [0, dequeued).
        let mut union = RangeSet::new();
        let mut total = 0u64;
        for set in [&self.acked, &self.in_flight, &self.pending] {
            for r in set.iter() {
                total += r.end - r.start;
                union.insert(r);
            }
        }
        let covered: u64 = union.iter().map(|r| r.end - r.start).sum();
        total == covered && covered == self.dequeued && union.contains_range(0..self.dequeued)
    }
}

struct Tail {
    offset: u64,
    filled: usize,
    buf: PooledBuf,
}

/// Producer half, held by the application.
pub struct SendStreamHandle {
    shared: Arc<SendShared>,
    tx: mpsc::UnboundedSender<Chunk>,
    tail: Option<Tail>,
}

impl SendStreamHandle {
    fn check_writable(&self) -> Result<()> {
        let shared = self.shared.state.lock().expect("send stream lock");
        if let Some(code) = shared.aborted.or(shared.stopped) {
            return Err(Error::StreamAborted(code));
        }
        if shared.connection_closed {
            return Err(Error::StreamAborted(0));
        }
        if shared.size_known {
            return Err(Error::StreamFinished);
        }
        Ok(())
    }

    /// Append `data` to the stream. Suspends while [`MAX_HELD_CHUNKS`]
    /// slabs are outstanding; cancellation leaves the stream usable.
    pub async fn enqueue(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            self.check_writable()?;
            if self.tail.is_none() {
                let permit = Arc::clone(&self.shared.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| self.abort_error())?;
                // The wait may have ended because of an abort.
                self.check_writable()?;
                let offset = self.shared.state.lock().expect("send stream lock").written;
                let mut buf = self.shared.pool.rent();
                buf.attach_permit(permit);
                self.tail = Some(Tail {
                    offset,
                    filled: 0,
                    buf,
                });
            }

            let chunk_size = self.shared.pool.chunk_size();
            let tail = self.tail.as_mut().expect("tail just ensured");
            let n = (chunk_size - tail.filled).min(data.len());
            tail.buf[tail.filled..tail.filled + n].copy_from_slice(&data[..n]);
            tail.filled += n;
            data = &data[n..];
            self.shared.state.lock().expect("send stream lock").written += n as u64;

            if tail.filled == chunk_size {
                self.publish();
            }
        }
        Ok(())
    }

    fn abort_error(&self) -> Error {
        let shared = self.shared.state.lock().expect("send stream lock");
        Error::StreamAborted(shared.aborted.or(shared.stopped).unwrap_or(0))
    }

    fn publish(&mut self) {
        if let Some(tail) = self.tail.take() {
            if tail.filled == 0 {
                return;
            }
            let _ = self.tx.send(Chunk {
                offset: tail.offset,
                len: tail.filled,
                buf: tail.buf,
            });
            self.shared.conn_wake.notify_one();
        }
    }

    /// Make everything written so far visible to the transport.
    pub fn flush(&mut self) {
        self.publish();
        self.shared.conn_wake.notify_one();
    }

    /// Declare the final size. Subsequent `enqueue` calls fail with
    /// [`Error::StreamFinished`].
    pub fn finish(&mut self) -> Result<()> {
        {
            let mut shared = self.shared.state.lock().expect("send stream lock");
            if shared.size_known {
                return Err(Error::StreamFinished);
            }
            if let Some(code) = shared.aborted.or(shared.stopped) {
                return Err(Error::StreamAborted(code));
            }
            shared.size_known = true;
        }
        self.publish();
        self.shared.conn_wake.notify_one();
        Ok(())
    }

    /// Abort sending with an application error code. Idempotent; drops
    /// the in-progress tail chunk.
    pub fn abort(&mut self, code: u64) {
        {
            let mut shared = self.shared.state.lock().expect("send stream lock");
            if shared.aborted.is_some() {
                return;
            }
            shared.aborted = Some(code);
        }
        self.tail = None;
        self.shared.conn_wake.notify_one();
    }

    /// Wait until the peer has acknowledged all data up to the final
    /// size, or the connection closed.
    pub async fn finished(&self) {
        loop {
            let notified = self.shared.completion.notified();
            {
                let shared = self.shared.state.lock().expect("send stream lock");
                if shared.data_received || shared.connection_closed {
                    return;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    fn pair() -> (SendStream, SendStreamHandle) {
        let pool = BufferPool::new(16, 8);
        SendStream::new(1 << 20, pool, Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn enqueue_flush_checkout() {
        let (mut stream, mut handle) = pair();
        handle.enqueue(&[1, 2, 3, 4, 5]).await.unwrap();
        // Nothing published yet: the tail is partial.
        assert_eq!(stream.sendable(), (5, 0));

        handle.flush();
        assert_eq!(stream.sendable(), (0, 5));

        let mut out = [0u8; 16];
        let (offset, len, fin) = stream.check_out(&mut out).unwrap();
        assert_eq!((offset, len, fin), (0, 5, false));
        assert_eq!(&out[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(stream.state(), SendState::Send);
        assert!(stream.invariants_hold());
    }

    #[tokio::test]
    async fn full_chunk_publishes_without_flush() {
        let (mut stream, mut handle) = pair();
        handle.enqueue(&[7u8; 16]).await.unwrap(); // exactly one slab
        assert_eq!(stream.sendable(), (0, 16));
    }

    #[tokio::test]
    async fn fin_and_acks_walk_the_state_machine() {
        let (mut stream, mut handle) = pair();
        handle.enqueue(b"hello").await.unwrap();
        handle.finish().unwrap();

        let mut out = [0u8; 16];
        let (offset, len, fin) = stream.check_out(&mut out).unwrap();
        assert_eq!((offset, len, fin), (0, 5, true));
        assert_eq!(stream.state(), SendState::DataSent);

        stream.on_ack(0, 5, true);
        assert_eq!(stream.state(), SendState::DataReceived);
        assert!(stream.is_terminal());
        assert!(stream.invariants_hold());
    }

    #[tokio::test]
    async fn empty_fin_after_flushed_data() {
        let (mut stream, mut handle) = pair();
        handle.enqueue(b"data").await.unwrap();
        handle.flush();

        let mut out = [0u8; 16];
        let (_, len, fin) = stream.check_out(&mut out).unwrap();
        assert_eq!((len, fin), (4, false));

        handle.finish().unwrap();
        stream.drain();
        let (offset, len, fin) = stream.check_out(&mut out).unwrap();
        assert_eq!((offset, len, fin), (4, 0, true));
        // No further STREAM frame for this stream.
        assert!(stream.check_out(&mut out).is_none());
    }

    #[tokio::test]
    async fn loss_returns_bytes_to_pending() {
        let (mut stream, mut handle) = pair();
        handle.enqueue(&[9u8; 10]).await.unwrap();
        handle.flush();

        let mut out = [0u8; 16];
        let (offset, len, _) = stream.check_out(&mut out).unwrap();
        assert_eq!((offset, len), (0, 10));
        assert_eq!(stream.sendable(), (10, 0));

        stream.on_ack(6, 4, false);
        stream.on_lost(0, 10, false);
        // Only the unacked prefix is pending again.
        assert_eq!(stream.sendable(), (0, 6));
        assert!(stream.invariants_hold());

        let (offset, len, _) = stream.check_out(&mut out).unwrap();
        assert_eq!((offset, len), (0, 6));
        stream.on_ack(0, 6, false);
        assert!(stream.invariants_hold());
    }

    #[tokio::test]
    async fn abort_makes_enqueue_fail_and_requests_reset() {
        let (mut stream, mut handle) = pair();
        handle.enqueue(b"x").await.unwrap();
        handle.abort(0x2a);
        handle.abort(0x2a); // idempotent

        assert_eq!(
            handle.enqueue(b"y").await.unwrap_err(),
            Error::StreamAborted(0x2a)
        );

        stream.drain();
        assert_eq!(stream.state(), SendState::WantReset);
        let (code, final_size) = stream.on_reset_sent();
        assert_eq!(code, 0x2a);
        assert_eq!(final_size, 0);
        stream.on_reset_acked();
        assert_eq!(stream.state(), SendState::ResetReceived);
    }

    #[tokio::test]
    async fn stop_sending_aborts_producer_with_peer_code() {
        let (mut stream, mut handle) = pair();
        stream.on_stop_sending(15);
        assert_eq!(stream.state(), SendState::WantReset);
        assert_eq!(
            handle.enqueue(b"z").await.unwrap_err(),
            Error::StreamAborted(15)
        );
    }

    #[tokio::test]
    async fn enqueue_after_finish_is_a_caller_bug() {
        let (_stream, mut handle) = pair();
        handle.finish().unwrap();
        assert_eq!(
            handle.enqueue(b"late").await.unwrap_err(),
            Error::StreamFinished
        );
        assert_eq!(handle.finish().unwrap_err(), Error::StreamFinished);
    }

    #[tokio::test]
    async fn backpressure_suspends_at_chunk_bound() {
        let (mut stream, mut handle) = pair();
        // Fill all 19 permits with full slabs.
        handle.enqueue(&vec![0u8; 16 * MAX_HELD_CHUNKS]).await.unwrap();

        let mut more = tokio::spawn(async move {
            handle.enqueue(&[1u8; 16]).await.unwrap();
            handle
        });
        tokio::task::yield_now().await;
        assert!(!more.is_finished());

        // Worker consumes and acknowledges one slab: a permit frees up.
        stream.drain();
        let mut out = [0u8; 16];
        let (offset, len, _) = stream.check_out(&mut out).unwrap();
        stream.on_ack(offset, len as u64, false);

        let handle = (&mut more).await.unwrap();
        drop(handle);
        assert!(stream.invariants_hold());
    }

    #[tokio::test]
    async fn finished_waits_for_data_received() {
        let (mut stream, mut handle) = pair();
        handle.enqueue(b"bye").await.unwrap();
        handle.finish().unwrap();

        let waiter = tokio::spawn(async move { handle.finished().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let mut out = [0u8; 16];
        let (offset, len, fin) = stream.check_out(&mut out).unwrap();
        stream.on_ack(offset, len as u64, fin);
        assert_eq!(stream.state(), SendState::DataReceived);
        waiter.await.unwrap();
    }
}
