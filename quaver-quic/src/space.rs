//! Per-epoch packet-number space state (draft-27 §12.3, §13.1).
//!
//! Each space numbers its own packets, tracks what it has received and
//! not yet acknowledged, carries the epoch's seals, and owns the two
//! crypto streams. The duplicate-detection window only rejects replays;
//! the `unacked` range set is what ACK frames are built from.

use std::time::{Duration, Instant};

use crate::crypto::Seal;
use crate::ranges::RangeSet;
use crate::stream::recv::Reassembler;
use crate::window::PacketWindow;

/// Outbound crypto stream: handshake bytes with range-tracked
/// retransmission, bounded only by an effectively infinite limit.
#[derive(Debug, Default)]
pub(crate) struct CryptoSend {
    /// Every byte handed over by the TLS stack, retained until the space
    /// is discarded (flights are small).
    data: Vec<u8>,
    pending: RangeSet,
    in_flight: RangeSet,
    acked: RangeSet,
}

impl CryptoSend {
    pub fn write(&mut self, bytes: &[u8]) {
        let start = self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        self.pending.insert(start..start + bytes.len() as u64);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// First pending range, clipped to `max` bytes.
    pub fn next_range(&self, max: usize) -> Option<core::ops::Range<u64>> {
        let range = self.pending.first_range()?;
        let end = range.end.min(range.start + max as u64);
        (end > range.start).then_some(range.start..end)
    }

    pub fn slice(&self, range: core::ops::Range<u64>) -> &[u8] {
        &self.data[range.start as usize..range.end as usize]
    }

    pub fn mark_sent(&mut self, range: core::ops::Range<u64>) {
        self.pending.remove(range.clone());
        self.in_flight.insert(range);
    }

    pub fn on_ack(&mut self, range: core::ops::Range<u64>) {
        self.in_flight.remove(range.clone());
        self.acked.insert(range);
    }

    pub fn on_lost(&mut self, range: core::ops::Range<u64>) {
        self.in_flight.remove(range.clone());
        self.pending.insert(range.clone());
        for acked in self.acked.iter() {
            if acked.start >= range.end {
                break;
            }
            self.pending.remove(acked);
        }
    }
}

/// State for one packet-number space.
pub(crate) struct PacketSpace {
    /// Largest packet number received and processed, with its arrival
    /// time (used for the ACK delay field).
    pub largest_recv_pn: Option<u64>,
    pub largest_recv_time: Option<Instant>,
    /// Next packet number to send; strictly monotone.
    next_pn: u64,
    /// Received packet numbers for which an ACK is still owed.
    pub unacked: RangeSet,
    /// Duplicate rejection over the last 64 packet numbers.
    pub window: PacketWindow,
    /// An ack-eliciting packet arrived since the last ACK we sent.
    pub ack_elicited: bool,
    pub last_ack_sent_at: Option<Instant>,
    /// Deadline by which an ACK must go out.
    pub ack_timer: Option<Instant>,
    pub seal_send: Option<Seal>,
    pub seal_recv: Option<Seal>,
    pub crypto_send: CryptoSend,
    pub crypto_recv: Reassembler,
    discarded: bool,
}

impl PacketSpace {
    pub fn new() -> Self {
        Self {
            largest_recv_pn: None,
            largest_recv_time: None,
            next_pn: 0,
            unacked: RangeSet::new(),
            window: PacketWindow::new(),
            ack_elicited: false,
            last_ack_sent_at: None,
            ack_timer: None,
            seal_send: None,
            seal_recv: None,
            crypto_send: CryptoSend::default(),
            crypto_recv: Reassembler::new(),
            discarded: false,
        }
    }

    pub fn next_packet_number(&mut self) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    pub fn next_pn(&self) -> u64 {
        self.next_pn
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub fn has_recv_keys(&self) -> bool {
        self.seal_recv.is_some()
    }

    /// Record a new (non-duplicate) packet. `immediate_ack` is set for
    /// long-header packets; short-header packets may wait max_ack_delay.
    pub fn on_packet_received(
        &mut self,
        pn: u64,
        now: Instant,
        ack_eliciting: bool,
        immediate_ack: bool,
        max_ack_delay: Duration,
    ) {
        self.unacked.insert(pn..pn + 1);
        if self.largest_recv_pn.is_none_or(|l| pn > l) {
            self.largest_recv_pn = Some(pn);
            self.largest_recv_time = Some(now);
        }
        if ack_eliciting {
            self.ack_elicited = true;
            let deadline = if immediate_ack {
                now
            } else {
                now + max_ack_delay
            };
            self.ack_timer = Some(self.ack_timer.map_or(deadline, |t| t.min(deadline)));
        }
    }

    /// Whether a packet must be generated just to carry an ACK.
    pub fn ack_timer_expired(&self, now: Instant) -> bool {
        self.ack_elicited && self.ack_timer.is_some_and(|t| t <= now)
    }

    /// An ACK covering `unacked` went out.
    pub fn on_ack_sent(&mut self, now: Instant) {
        self.ack_elicited = false;
        self.ack_timer = None;
        self.last_ack_sent_at = Some(now);
    }

    /// The peer acknowledged a packet of ours that carried an ACK up to
    /// `largest`; those receive records can go.
    pub fn on_ack_acked(&mut self, largest: u64) {
        self.unacked.remove_until(largest + 1);
    }

    /// Discard the space (draft-27 §4.9): seals, numbering and crypto
    /// state all go.
    pub fn discard(&mut self) {
        self.seal_send = None;
        self.seal_recv = None;
        self.unacked = RangeSet::new();
        self.ack_elicited = false;
        self.ack_timer = None;
        self.crypto_send = CryptoSend::default();
        self.crypto_recv = Reassembler::new();
        self.discarded = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_numbers_are_monotone() {
        let mut space = PacketSpace::new();
        assert_eq!(space.next_packet_number(), 0);
        assert_eq!(space.next_packet_number(), 1);
        assert_eq!(space.next_pn(), 2);
    }

    #[test]
    fn ack_bookkeeping() {
        let mut space = PacketSpace::new();
        let now = Instant::now();
        let delay = Duration::from_millis(25);

        space.on_packet_received(0, now, true, false, delay);
        space.on_packet_received(3, now, false, false, delay);
        assert_eq!(space.largest_recv_pn, Some(3));
        assert!(space.ack_elicited);
        assert!(!space.ack_timer_expired(now));
        assert!(space.ack_timer_expired(now + delay));

        space.on_ack_sent(now + delay);
        assert!(!space.ack_elicited);
        // Receive records stay until the peer confirms our ACK arrived.
        assert_eq!(space.unacked.len(), 2);
        space.on_ack_acked(3);
        assert!(space.unacked.is_empty());
    }

    #[test]
    fn long_header_packets_want_immediate_ack() {
        let mut space = PacketSpace::new();
        let now = Instant::now();
        space.on_packet_received(0, now, true, true, Duration::from_millis(25));
        assert!(space.ack_timer_expired(now));
    }

    #[test]
    fn crypto_send_retransmission() {
        let mut cs = CryptoSend::default();
        cs.write(b"hello");
        cs.write(b"world");
        assert!(cs.has_pending());

        let range = cs.next_range(4).unwrap();
        assert_eq!(range, 0..4);
        assert_eq!(cs.slice(range.clone()), b"hell");
        cs.mark_sent(range);

        let range = cs.next_range(100).unwrap();
        assert_eq!(range, 4..10);
        cs.mark_sent(range.clone());
        assert!(!cs.has_pending());

        cs.on_ack(4..10);
        cs.on_lost(0..4);
        assert_eq!(cs.next_range(100).unwrap(), 0..4);

        // A lost range that was partially acked only re-pends the rest.
        cs.mark_sent(0..4);
        cs.on_ack(0..2);
        cs.on_lost(0..4);
        assert_eq!(cs.next_range(100).unwrap(), 2..4);
    }

    #[test]
    fn discard_clears_everything() {
        let mut space = PacketSpace::new();
        space.crypto_send.write(b"flight");
        space.on_packet_received(7, Instant::now(), true, true, Duration::ZERO);
        space.discard();
        assert!(space.is_discarded());
        assert!(space.unacked.is_empty());
        assert!(!space.crypto_send.has_pending());
        assert!(!space.has_recv_keys());
    }
}
