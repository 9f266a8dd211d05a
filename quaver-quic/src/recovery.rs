//! Loss detection and congestion control (draft-27 recovery).
//!
//! Keeps one RTT estimator and one NewReno congestion window per
//! connection, and per-space sent-packet lists. Each sent packet carries
//! the frame restitutions the send path replays when the packet is
//! declared lost.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tinyvec::TinyVec;
use tracing::trace;

use crate::crypto::Level;
use crate::packet::SpaceId;
use crate::ranges::RangeSet;

/// Reordering threshold in packets (draft-27 recovery §6.1.1).
const PACKET_THRESHOLD: u64 = 3;
/// Timer granularity.
const GRANULARITY: Duration = Duration::from_millis(1);
/// Initial RTT before any sample.
const INITIAL_RTT: Duration = Duration::from_millis(333);
/// Base datagram size used for window arithmetic.
const MAX_DATAGRAM_SIZE: usize = 1200;
/// Initial congestion window: 10 datagrams.
const INITIAL_WINDOW: usize = 10 * MAX_DATAGRAM_SIZE;
/// Floor for the congestion window: 2 datagrams.
const MIN_WINDOW: usize = 2 * MAX_DATAGRAM_SIZE;

/// What a sent frame re-marks as pending when its packet is lost, and
/// what it settles when the packet is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SentFrame {
    Ack { largest: u64 },
    Crypto { level: Level, offset: u64, len: u64 },
    Stream { stream_id: u64, offset: u64, len: u64, fin: bool },
    ResetStream { stream_id: u64 },
    StopSending { stream_id: u64 },
    MaxData,
    MaxStreamData { stream_id: u64 },
    MaxStreams { bidi: bool },
    NewConnectionId { seq: u64 },
    RetireConnectionId { seq: u64 },
    HandshakeDone,
    #[default]
    Ping,
}

/// Restitution list of one packet; small packets stay off the heap.
pub type FrameList = TinyVec<[SentFrame; 4]>;

/// Record of one sent packet, kept until acknowledged or declared lost.
#[derive(Debug)]
pub struct SentPacket {
    pub pn: u64,
    pub time_sent: Instant,
    pub size: usize,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    pub frames: FrameList,
}

/// RTT estimation (draft-27 recovery §5): exponentially weighted moving
/// averages for smoothed RTT and variance.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed: Duration,
    var: Duration,
    min: Duration,
    latest: Duration,
    has_sample: bool,
}

impl RttEstimator {
    fn new() -> Self {
        Self {
            smoothed: INITIAL_RTT,
            var: INITIAL_RTT / 2,
            min: INITIAL_RTT,
            latest: INITIAL_RTT,
            has_sample: false,
        }
    }

    fn update(&mut self, sample: Duration, ack_delay: Duration) {
        self.latest = sample;
        if !self.has_sample {
            self.has_sample = true;
            self.min = sample;
            self.smoothed = sample;
            self.var = sample / 2;
            return;
        }
        self.min = self.min.min(sample);
        // Remove the peer's ack delay unless that would take the sample
        // below the observed minimum.
        let adjusted = if sample > self.min + ack_delay {
            sample - ack_delay
        } else {
            sample
        };
        let var_sample = if self.smoothed > adjusted {
            self.smoothed - adjusted
        } else {
            adjusted - self.smoothed
        };
        self.var = (self.var * 3 + var_sample) / 4;
        self.smoothed = (self.smoothed * 7 + adjusted) / 8;
    }

    pub fn smoothed(&self) -> Duration {
        self.smoothed
    }

    pub fn var(&self) -> Duration {
        self.var
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn latest(&self) -> Duration {
        self.latest
    }

    /// Base probe timeout, before exponential backoff.
    pub fn pto(&self, max_ack_delay: Duration) -> Duration {
        self.smoothed + (self.var * 4).max(GRANULARITY) + max_ack_delay
    }
}

/// NewReno congestion window.
#[derive(Debug)]
struct NewReno {
    cwnd: usize,
    ssthresh: usize,
    recovery_start: Option<Instant>,
}

impl NewReno {
    fn new() -> Self {
        Self {
            cwnd: INITIAL_WINDOW,
            ssthresh: usize::MAX,
            recovery_start: None,
        }
    }

    fn on_ack(&mut self, sent: Instant, bytes: usize) {
        if self.in_recovery(sent) {
            return;
        }
        if self.cwnd < self.ssthresh {
            // Slow start.
            self.cwnd += bytes;
        } else {
            // Congestion avoidance, one datagram per window.
            self.cwnd += MAX_DATAGRAM_SIZE * bytes / self.cwnd;
        }
    }

    fn on_loss(&mut self, now: Instant, sent: Instant) {
        if self.in_recovery(sent) {
            return;
        }
        self.recovery_start = Some(now);
        self.cwnd = (self.cwnd / 2).max(MIN_WINDOW);
        self.ssthresh = self.cwnd;
    }

    fn in_recovery(&self, sent: Instant) -> bool {
        self.recovery_start.is_some_and(|start| sent <= start)
    }
}

#[derive(Debug, Default)]
struct SpaceState {
    /// Sent packets ordered by packet number.
    sent: VecDeque<SentPacket>,
    largest_acked: Option<u64>,
    /// When the earliest outstanding packet will be declared lost by the
    /// time threshold.
    loss_time: Option<Instant>,
    /// Send time of the most recent ack-eliciting packet.
    last_ack_eliciting: Option<Instant>,
}

impl SpaceState {
    fn has_ack_eliciting_in_flight(&self) -> bool {
        self.sent.iter().any(|p| p.ack_eliciting)
    }
}

/// What the expired loss-detection timer asks the send path to do.
#[derive(Debug)]
pub enum TimerEvent {
    /// Packets crossed the time threshold; replay their frames.
    Lost(SpaceId, Vec<SentPacket>),
    /// Probe timeout: send an ack-eliciting packet in this space,
    /// ignoring the congestion window.
    Probe(SpaceId),
    None,
}

/// Per-connection loss recovery state.
#[derive(Debug)]
pub struct Recovery {
    rtt: RttEstimator,
    congestion: NewReno,
    spaces: [SpaceState; SpaceId::COUNT],
    bytes_in_flight: usize,
    pto_count: u32,
    max_ack_delay: Duration,
    lost_packets: u64,
}

impl Recovery {
    pub fn new(max_ack_delay: Duration) -> Self {
        Self {
            rtt: RttEstimator::new(),
            congestion: NewReno::new(),
            spaces: Default::default(),
            bytes_in_flight: 0,
            pto_count: 0,
            max_ack_delay,
            lost_packets: 0,
        }
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    pub fn congestion_window(&self) -> usize {
        self.congestion.cwnd
    }

    /// Bytes the congestion window still allows in flight.
    pub fn available_window(&self) -> usize {
        self.congestion.cwnd.saturating_sub(self.bytes_in_flight)
    }

    pub fn lost_packets(&self) -> u64 {
        self.lost_packets
    }

    /// Probe timeout with exponential backoff applied.
    pub fn pto(&self) -> Duration {
        self.rtt.pto(self.max_ack_delay) * (1 << self.pto_count.min(10))
    }

    pub fn on_packet_sent(&mut self, space: SpaceId, packet: SentPacket) {
        let state = &mut self.spaces[space as usize];
        if packet.ack_eliciting {
            state.last_ack_eliciting = Some(packet.time_sent);
        }
        if packet.in_flight {
            self.bytes_in_flight += packet.size;
        }
        state.sent.push_back(packet);
    }

    /// Process an ACK frame for `space`. Returns the newly acknowledged
    /// and newly lost packets; the caller settles / replays their frames.
    pub fn on_ack_received(
        &mut self,
        space: SpaceId,
        acked: &RangeSet,
        ack_delay: Duration,
        now: Instant,
    ) -> (Vec<SentPacket>, Vec<SentPacket>) {
        let state = &mut self.spaces[space as usize];
        let largest_acked = match acked.max() {
            Some(pn) => pn,
            None => return (Vec::new(), Vec::new()),
        };
        if state.largest_acked.is_none_or(|l| largest_acked > l) {
            state.largest_acked = Some(largest_acked);
        }

        let mut newly_acked = Vec::new();
        let mut kept = VecDeque::with_capacity(state.sent.len());
        for packet in state.sent.drain(..) {
            if acked.contains(packet.pn) {
                newly_acked.push(packet);
            } else {
                kept.push_back(packet);
            }
        }
        state.sent = kept;

        if newly_acked.is_empty() {
            return (Vec::new(), Vec::new());
        }

        // An RTT sample is only taken when the largest acknowledged packet
        // is newly acknowledged and ack-eliciting.
        if let Some(largest) = newly_acked.iter().find(|p| p.pn == largest_acked) {
            if largest.ack_eliciting {
                self.rtt
                    .update(now.duration_since(largest.time_sent), ack_delay);
            }
        }

        for packet in &newly_acked {
            if packet.in_flight {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size);
                self.congestion.on_ack(packet.time_sent, packet.size);
            }
        }

        self.pto_count = 0;
        let lost = self.detect_lost(space, now);
        (newly_acked, lost)
    }

    /// Loss detection (draft-27 recovery §6.1): a packet is lost once a
    /// later packet was acknowledged and it is either `PACKET_THRESHOLD`
    /// behind or older than the time threshold.
    fn detect_lost(&mut self, space: SpaceId, now: Instant) -> Vec<SentPacket> {
        let state = &mut self.spaces[space as usize];
        let largest_acked = match state.largest_acked {
            Some(l) => l,
            None => return Vec::new(),
        };

        let loss_delay = self
            .rtt
            .smoothed
            .max(self.rtt.latest)
            .mul_f64(9.0 / 8.0)
            .max(GRANULARITY);
        let lost_before = now.checked_sub(loss_delay);

        state.loss_time = None;
        let mut lost = Vec::new();
        let mut kept = VecDeque::with_capacity(state.sent.len());
        for packet in state.sent.drain(..) {
            if packet.pn > largest_acked {
                kept.push_back(packet);
                continue;
            }
            let time_lost = lost_before.is_some_and(|t| packet.time_sent <= t);
            if time_lost || packet.pn + PACKET_THRESHOLD <= largest_acked {
                lost.push(packet);
            } else {
                // Not yet lost; it will be at time_sent + loss_delay.
                let when = packet.time_sent + loss_delay;
                state.loss_time = Some(state.loss_time.map_or(when, |t: Instant| t.min(when)));
                kept.push_back(packet);
            }
        }
        state.sent = kept;

        if !lost.is_empty() {
            self.lost_packets += lost.len() as u64;
            let mut latest_sent = None::<Instant>;
            for packet in &lost {
                if packet.in_flight {
                    self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size);
                    latest_sent = Some(latest_sent.map_or(packet.time_sent, |t| t.max(packet.time_sent)));
                }
            }
            if let Some(sent) = latest_sent {
                self.congestion.on_loss(now, sent);
            }
            trace!(space = ?space, count = lost.len(), cwnd = self.congestion.cwnd, "packets lost");
        }
        lost
    }

    /// Earliest deadline at which [`on_timeout`](Self::on_timeout) must run.
    pub fn timeout(&self) -> Option<Instant> {
        fn merge(next: &mut Option<Instant>, t: Option<Instant>) {
            if let Some(t) = t {
                *next = Some(next.map_or(t, |n| n.min(t)));
            }
        }
        let mut next: Option<Instant> = None;
        for state in &self.spaces {
            merge(&mut next, state.loss_time);
        }
        if next.is_some() {
            return next;
        }
        // No loss timer armed: fall back to PTO over spaces with
        // ack-eliciting packets outstanding.
        let pto = self.pto();
        for state in &self.spaces {
            if state.has_ack_eliciting_in_flight() {
                merge(&mut next, state.last_ack_eliciting.map(|t| t + pto));
            }
        }
        next
    }

    /// Drive the expired timer.
    pub fn on_timeout(&mut self, now: Instant) -> TimerEvent {
        // Time-threshold loss first.
        let loss_space = SpaceId::ALL
            .into_iter()
            .filter(|s| self.spaces[*s as usize].loss_time.is_some_and(|t| t <= now))
            .min_by_key(|s| self.spaces[*s as usize].loss_time);
        if let Some(space) = loss_space {
            let lost = self.detect_lost(space, now);
            if !lost.is_empty() {
                return TimerEvent::Lost(space, lost);
            }
        }

        // Otherwise a PTO fired: probe the earliest eligible space.
        let pto = self.pto();
        let probe_space = SpaceId::ALL
            .into_iter()
            .filter(|s| self.spaces[*s as usize].has_ack_eliciting_in_flight())
            .filter(|s| {
                self.spaces[*s as usize]
                    .last_ack_eliciting
                    .is_some_and(|t| t + pto <= now)
            })
            .min_by_key(|s| self.spaces[*s as usize].last_ack_eliciting);
        match probe_space {
            Some(space) => {
                self.pto_count += 1;
                trace!(space = ?space, pto_count = self.pto_count, "probe timeout");
                TimerEvent::Probe(space)
            }
            None => TimerEvent::None,
        }
    }

    /// Discard all state for a space (draft-27 §4.9): its packets leave
    /// flight accounting without counting as lost.
    pub fn discard_space(&mut self, space: SpaceId) {
        let state = &mut self.spaces[space as usize];
        for packet in state.sent.drain(..) {
            if packet.in_flight {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size);
            }
        }
        state.loss_time = None;
        state.last_ack_eliciting = None;
        state.largest_acked = None;
        self.pto_count = 0;
    }

    pub fn largest_acked(&self, space: SpaceId) -> Option<u64> {
        self.spaces[space as usize].largest_acked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(pn: u64, now: Instant, size: usize) -> SentPacket {
        SentPacket {
            pn,
            time_sent: now,
            size,
            ack_eliciting: true,
            in_flight: true,
            frames: std::iter::once(SentFrame::Ping).collect(),
        }
    }

    fn ranges(list: &[core::ops::Range<u64>]) -> RangeSet {
        let mut set = RangeSet::new();
        for r in list {
            set.insert(r.clone());
        }
        set
    }

    #[test]
    fn rtt_first_and_subsequent_samples() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        assert_eq!(rtt.smoothed(), Duration::from_millis(100));
        assert_eq!(rtt.var(), Duration::from_millis(50));

        rtt.update(Duration::from_millis(200), Duration::ZERO);
        // srtt = 7/8*100 + 1/8*200 = 112.5ms
        assert_eq!(rtt.smoothed(), Duration::from_micros(112_500));
        assert_eq!(rtt.min(), Duration::from_millis(100));
    }

    #[test]
    fn ack_removes_and_samples_rtt() {
        let now = Instant::now();
        let mut rec = Recovery::new(Duration::from_millis(25));
        rec.on_packet_sent(SpaceId::Application, pkt(0, now, 1000));
        rec.on_packet_sent(SpaceId::Application, pkt(1, now, 1000));
        assert_eq!(rec.bytes_in_flight(), 2000);

        let (acked, lost) = rec.on_ack_received(
            SpaceId::Application,
            &ranges(&[0..2]),
            Duration::ZERO,
            now + Duration::from_millis(50),
        );
        assert_eq!(acked.len(), 2);
        assert!(lost.is_empty());
        assert_eq!(rec.bytes_in_flight(), 0);
        assert_eq!(rec.rtt().latest(), Duration::from_millis(50));
        // Slow start grew the window by the acked bytes.
        assert_eq!(rec.congestion_window(), INITIAL_WINDOW + 2000);
    }

    #[test]
    fn packet_threshold_loss() {
        let now = Instant::now();
        let mut rec = Recovery::new(Duration::from_millis(25));
        for pn in 0..5 {
            rec.on_packet_sent(SpaceId::Application, pkt(pn, now, 1000));
        }
        // Ack only pn 4: packets 0 and 1 are 3+ behind, 2 and 3 are not.
        let (acked, lost) = rec.on_ack_received(
            SpaceId::Application,
            &ranges(&[4..5]),
            Duration::ZERO,
            now + Duration::from_millis(10),
        );
        assert_eq!(acked.len(), 1);
        let lost_pns: Vec<u64> = lost.iter().map(|p| p.pn).collect();
        assert_eq!(lost_pns, vec![0, 1]);
        // Loss halved the window.
        assert_eq!(rec.congestion_window(), INITIAL_WINDOW / 2);
        // 2 and 3 wait on the time-threshold timer.
        assert!(rec.timeout().is_some());
    }

    #[test]
    fn time_threshold_fires_later() {
        let now = Instant::now();
        let mut rec = Recovery::new(Duration::from_millis(25));
        rec.on_packet_sent(SpaceId::Application, pkt(0, now, 1000));
        rec.on_packet_sent(SpaceId::Application, pkt(1, now, 1000));
        let (_, lost) = rec.on_ack_received(
            SpaceId::Application,
            &ranges(&[1..2]),
            Duration::ZERO,
            now + Duration::from_millis(10),
        );
        assert!(lost.is_empty());

        let deadline = rec.timeout().expect("loss timer armed");
        match rec.on_timeout(deadline) {
            TimerEvent::Lost(SpaceId::Application, lost) => {
                assert_eq!(lost.len(), 1);
                assert_eq!(lost[0].pn, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pto_probe_and_backoff() {
        let now = Instant::now();
        let mut rec = Recovery::new(Duration::from_millis(25));
        rec.on_packet_sent(SpaceId::Application, pkt(0, now, 1000));

        let first = rec.timeout().expect("pto armed");
        assert!(first > now);
        match rec.on_timeout(first) {
            TimerEvent::Probe(SpaceId::Application) => {}
            other => panic!("unexpected {other:?}"),
        }
        // Backoff doubles the next deadline's distance.
        let second = rec.timeout().expect("pto re-armed");
        assert!(second.duration_since(now) > first.duration_since(now));
    }

    #[test]
    fn discard_space_clears_flight() {
        let now = Instant::now();
        let mut rec = Recovery::new(Duration::from_millis(25));
        rec.on_packet_sent(SpaceId::Initial, pkt(0, now, 1200));
        rec.on_packet_sent(SpaceId::Application, pkt(0, now, 800));
        rec.discard_space(SpaceId::Initial);
        assert_eq!(rec.bytes_in_flight(), 800);
        assert_eq!(rec.lost_packets(), 0);
    }
}
