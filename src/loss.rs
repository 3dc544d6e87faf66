//! Loss detection and congestion control.
//!
//! Tracks sent packets per packet-number space, processes ACK frames into
//! RTT samples and loss events, computes the probe timeout, and owns a small
//! NewReno-style congestion controller.

use std::cmp;
use std::collections::BTreeMap;

use crate::frame;
use crate::range_set::RangeSet;
use crate::rtt::RttEstimator;
use crate::send::SendFlags;
use crate::space::{EncryptLevel, ENCRYPT_LEVELS, ENCRYPT_LEVEL_COUNT};
use crate::{StreamId, TransportError};

/// Packet reordering tolerated before earlier packets are declared lost.
const REORDERING_THRESHOLD: u64 = 3;
/// Smallest granularity used in time-threshold loss detection, µs.
const TIMER_GRANULARITY: u64 = 1_000;

/// Frames awaiting retransmission after their packet was declared lost.
#[derive(Debug, Clone, Default)]
pub struct Retransmits {
    pub crypto: Vec<frame::Crypto>,
    pub stream: Vec<frame::Stream>,
    pub reset_stream: Vec<(StreamId, u64, u64)>,
    pub stop_sending: Vec<(StreamId, u64)>,
    /// Flag-driven frames to re-queue wholesale.
    pub flags: SendFlags,
}

impl Retransmits {
    pub fn is_empty(&self) -> bool {
        self.crypto.is_empty()
            && self.stream.is_empty()
            && self.reset_stream.is_empty()
            && self.stop_sending.is_empty()
            && self.flags.is_empty()
    }

    pub fn merge(&mut self, other: Retransmits) {
        self.crypto.extend(other.crypto);
        self.stream.extend(other.stream);
        self.reset_stream.extend(other.reset_stream);
        self.stop_sending.extend(other.stop_sending);
        self.flags.insert(other.flags);
    }
}

/// Record of one transmitted packet, kept until acknowledged or lost.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub time: u64,
    /// 0 iff the packet was ack-only and does not count in flight.
    pub bytes: u16,
    pub ack_eliciting: bool,
    /// ACK ranges this packet advertised, pruned from the tracker when the
    /// packet itself is acknowledged.
    pub acks: RangeSet,
    pub retransmits: Retransmits,
}

impl SentPacket {
    pub fn ack_only(&self) -> bool {
        self.bytes == 0
    }
}

pub struct CongestionControl {
    pub window: u64,
    pub ssthresh: u64,
    recovery_start_time: u64,
    mss: u64,
    initial_window: u64,
    minimum_window: u64,
}

impl CongestionControl {
    pub fn new(mss: u64) -> Self {
        CongestionControl {
            window: 10 * mss,
            ssthresh: u64::MAX,
            recovery_start_time: 0,
            mss,
            initial_window: 10 * mss,
            minimum_window: 2 * mss,
        }
    }

    pub fn reset(&mut self) {
        self.window = self.initial_window;
        self.ssthresh = u64::MAX;
        self.recovery_start_time = 0;
    }

    fn on_ack(&mut self, sent_time: u64, bytes: u64) {
        if sent_time <= self.recovery_start_time {
            return;
        }
        if self.window < self.ssthresh {
            // Slow start.
            self.window += bytes;
        } else {
            // Congestion avoidance.
            self.window += self.mss * bytes / self.window;
        }
    }

    fn on_congestion_event(&mut self, now: u64, sent_time: u64) {
        if sent_time <= self.recovery_start_time {
            return;
        }
        self.recovery_start_time = now;
        self.window = cmp::max(self.window / 2, self.minimum_window);
        self.ssthresh = self.window;
    }
}

/// What an ACK frame did to our in-flight state.
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub rtt_updated: bool,
    /// ACK ranges carried by our now-acknowledged packets.
    pub acked_acks: Vec<RangeSet>,
    /// Frames from packets declared lost, to be re-queued.
    pub lost: Retransmits,
    pub newly_acked: bool,
    /// Largest newly acknowledged packet number, for key-phase confirmation.
    pub largest_newly_acked: Option<u64>,
}

/// The loss timer either fired a loss pass or asks for a probe.
pub enum LossTimerOutcome {
    /// Frames lost per encryption level, to be re-queued where they came
    /// from.
    Lost(Vec<(EncryptLevel, Retransmits)>),
    Probe,
}

pub struct LossDetection {
    sent: [BTreeMap<u64, SentPacket>; ENCRYPT_LEVEL_COUNT],
    largest_acked: [Option<u64>; ENCRYPT_LEVEL_COUNT],
    pub loss_time: Option<u64>,
    pub pto_count: u32,
    pub bytes_in_flight: u64,
    time_of_last_eliciting: u64,
    /// Peer's maximum ACK delay, µs.
    pub max_ack_delay: u64,
    pub congestion: CongestionControl,
}

impl LossDetection {
    pub fn new(mss: u64, max_ack_delay: u64) -> Self {
        LossDetection {
            sent: Default::default(),
            largest_acked: [None; ENCRYPT_LEVEL_COUNT],
            loss_time: None,
            pto_count: 0,
            bytes_in_flight: 0,
            time_of_last_eliciting: 0,
            max_ack_delay,
            congestion: CongestionControl::new(mss),
        }
    }

    pub fn largest_acked(&self, level: EncryptLevel) -> Option<u64> {
        self.largest_acked[level as usize]
    }

    pub fn has_eliciting_in_flight(&self) -> bool {
        self.sent
            .iter()
            .any(|space| space.values().any(|p| p.ack_eliciting))
    }

    pub fn on_packet_sent(&mut self, level: EncryptLevel, number: u64, packet: SentPacket) {
        if packet.bytes != 0 {
            self.bytes_in_flight += u64::from(packet.bytes);
            self.time_of_last_eliciting = packet.time;
        }
        self.sent[level as usize].insert(number, packet);
    }

    /// Apply a received ACK frame. `next_send_pn` bounds what the peer may
    /// legitimately acknowledge.
    pub fn on_ack_received(
        &mut self,
        level: EncryptLevel,
        ack: &frame::Ack,
        ack_delay_exponent: u8,
        next_send_pn: u64,
        now: u64,
        rtt: &mut RttEstimator,
    ) -> Result<AckOutcome, TransportError> {
        if ack.largest >= next_send_pn {
            // Acknowledging a packet we never sent.
            return Err(TransportError::PROTOCOL_VIOLATION);
        }
        let mut outcome = AckOutcome::default();
        let space = level as usize;
        self.largest_acked[space] = Some(
            self.largest_acked[space]
                .map_or(ack.largest, |x| cmp::max(x, ack.largest)),
        );

        if let Some(info) = self.sent[space].get(&ack.largest) {
            let latest = now.saturating_sub(info.time).max(1);
            let ack_delay = if level == EncryptLevel::OneRtt {
                cmp::min(ack.delay << ack_delay_exponent, self.max_ack_delay)
            } else {
                0
            };
            let adjusted = if latest > ack_delay && latest - ack_delay > rtt.min {
                latest - ack_delay
            } else {
                latest
            };
            outcome.rtt_updated = rtt.update(adjusted);
        }

        for range in ack.ranges.iter() {
            let in_range: Vec<u64> = self.sent[space]
                .range(range.clone())
                .map(|(&n, _)| n)
                .collect();
            for number in in_range {
                let info = self.sent[space].remove(&number).unwrap();
                if info.bytes != 0 {
                    self.bytes_in_flight -= u64::from(info.bytes);
                    self.congestion.on_ack(info.time, u64::from(info.bytes));
                }
                if !info.acks.is_empty() {
                    outcome.acked_acks.push(info.acks);
                }
                outcome.newly_acked = true;
                outcome.largest_newly_acked = Some(
                    outcome
                        .largest_newly_acked
                        .map_or(number, |x| cmp::max(x, number)),
                );
            }
        }

        if outcome.newly_acked {
            self.pto_count = 0;
        }

        outcome.lost = self.detect_lost(level, now, rtt);
        Ok(outcome)
    }

    /// Time-and-reordering loss pass over one space.
    pub fn detect_lost(&mut self, level: EncryptLevel, now: u64, rtt: &RttEstimator) -> Retransmits {
        let mut lost = Retransmits::default();
        let space = level as usize;
        let largest_acked = match self.largest_acked[space] {
            Some(x) => x,
            None => return lost,
        };
        let loss_delay = cmp::max(
            (9 * cmp::max(rtt.latest, rtt.smoothed)) / 8,
            TIMER_GRANULARITY,
        );
        self.loss_time = None;

        let candidates: Vec<u64> = self.sent[space]
            .range(..largest_acked)
            .map(|(&n, _)| n)
            .collect();
        let mut congestion_event: Option<u64> = None;
        for number in candidates {
            let info = &self.sent[space][&number];
            let time_lost = info.time + loss_delay;
            if time_lost <= now || largest_acked - number >= REORDERING_THRESHOLD {
                let info = self.sent[space].remove(&number).unwrap();
                if info.bytes != 0 {
                    self.bytes_in_flight -= u64::from(info.bytes);
                    congestion_event =
                        Some(congestion_event.map_or(info.time, |x| cmp::max(x, info.time)));
                }
                lost.merge(info.retransmits);
            } else {
                self.loss_time = Some(
                    self.loss_time
                        .map_or(time_lost, |x| cmp::min(x, time_lost)),
                );
            }
        }
        if let Some(sent_time) = congestion_event {
            self.congestion.on_congestion_event(now, sent_time);
        }
        lost
    }

    /// Base probe timeout, scaled linearly by `count`.
    pub fn probe_timeout(&self, rtt: &RttEstimator, count: u32) -> u64 {
        (rtt.smoothed + cmp::max(4 * rtt.variance, TIMER_GRANULARITY) + self.max_ack_delay)
            * u64::from(count)
    }

    /// Deadline for the loss-detection timer, if anything is in flight.
    pub fn next_timeout(&self, rtt: &RttEstimator) -> Option<u64> {
        if let Some(loss_time) = self.loss_time {
            return Some(loss_time);
        }
        if !self.has_eliciting_in_flight() {
            return None;
        }
        let pto = self.probe_timeout(rtt, 1) * (1u64 << self.pto_count.min(10));
        Some(self.time_of_last_eliciting + pto)
    }

    /// The loss-detection timer fired.
    pub fn on_timer_expired(&mut self, now: u64, rtt: &RttEstimator) -> LossTimerOutcome {
        if self.loss_time.is_some() {
            let mut lost = Vec::new();
            for &level in ENCRYPT_LEVELS.iter() {
                let frames = self.detect_lost(level, now, rtt);
                if !frames.is_empty() {
                    lost.push((level, frames));
                }
            }
            LossTimerOutcome::Lost(lost)
        } else {
            self.pto_count += 1;
            LossTimerOutcome::Probe
        }
    }

    /// Abandon a space when its keys are discarded.
    pub fn discard_space(&mut self, level: EncryptLevel) -> Retransmits {
        let mut abandoned = Retransmits::default();
        let space = ::std::mem::take(&mut self.sent[level as usize]);
        for (_, info) in space {
            if info.bytes != 0 {
                self.bytes_in_flight -= u64::from(info.bytes);
            }
            abandoned.merge(info.retransmits);
        }
        self.largest_acked[level as usize] = None;
        abandoned
    }

    pub fn reset(&mut self) {
        for space in &mut self.sent {
            space.clear();
        }
        self.largest_acked = [None; ENCRYPT_LEVEL_COUNT];
        self.loss_time = None;
        self.pto_count = 0;
        self.bytes_in_flight = 0;
        self.time_of_last_eliciting = 0;
        self.congestion.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sent(time: u64, bytes: u16) -> SentPacket {
        SentPacket {
            time,
            bytes,
            ack_eliciting: bytes != 0,
            acks: RangeSet::new(),
            retransmits: Retransmits::default(),
        }
    }

    fn ack(largest: u64) -> frame::Ack {
        let mut ranges = RangeSet::new();
        ranges.insert(0..largest + 1);
        frame::Ack {
            largest,
            delay: 0,
            ranges,
            ecn: None,
        }
    }

    #[test]
    fn ack_removes_and_samples_rtt() {
        let mut loss = LossDetection::new(1460, 25_000);
        let mut rtt = RttEstimator::new(100_000);
        loss.on_packet_sent(EncryptLevel::Initial, 0, sent(1_000, 100));
        loss.on_packet_sent(EncryptLevel::Initial, 1, sent(2_000, 100));
        assert_eq!(loss.bytes_in_flight, 200);

        let outcome = loss
            .on_ack_received(EncryptLevel::Initial, &ack(1), 3, 2, 32_000, &mut rtt)
            .unwrap();
        assert!(outcome.newly_acked);
        assert!(outcome.rtt_updated);
        assert_eq!(rtt.latest, 30_000);
        assert_eq!(loss.bytes_in_flight, 0);
        assert_eq!(loss.largest_acked(EncryptLevel::Initial), Some(1));
    }

    #[test]
    fn acking_unsent_packets_is_a_violation() {
        let mut loss = LossDetection::new(1460, 25_000);
        let mut rtt = RttEstimator::new(100_000);
        let err = loss
            .on_ack_received(EncryptLevel::Initial, &ack(5), 3, 3, 1_000, &mut rtt)
            .unwrap_err();
        assert_eq!(err, TransportError::PROTOCOL_VIOLATION);
    }

    #[test]
    fn reordering_threshold_declares_loss() {
        let mut loss = LossDetection::new(1460, 25_000);
        let mut rtt = RttEstimator::new(100_000);
        let mut retransmits = Retransmits::default();
        retransmits.crypto.push(frame::Crypto {
            offset: 0,
            data: Bytes::from_static(b"hello"),
        });
        loss.on_packet_sent(
            EncryptLevel::OneRtt,
            0,
            SentPacket {
                retransmits,
                ..sent(1_000, 100)
            },
        );
        for number in 1..5 {
            loss.on_packet_sent(EncryptLevel::OneRtt, number, sent(1_000 + number, 100));
        }
        let mut ranges = RangeSet::new();
        ranges.insert(4..5);
        let outcome = loss
            .on_ack_received(
                EncryptLevel::OneRtt,
                &frame::Ack {
                    largest: 4,
                    delay: 0,
                    ranges,
                    ecn: None,
                },
                3,
                5,
                10_000,
                &mut rtt,
            )
            .unwrap();
        // Packets 0 and 1 are at least three behind the largest acked.
        assert_eq!(outcome.lost.crypto.len(), 1);
        assert_eq!(&outcome.lost.crypto[0].data[..], b"hello");
    }

    #[test]
    fn pto_grows_with_variance_and_count() {
        let loss = LossDetection::new(1460, 25_000);
        let mut rtt = RttEstimator::new(100_000);
        rtt.update(40_000);
        let one = loss.probe_timeout(&rtt, 1);
        assert_eq!(one, 40_000 + 4 * 20_000 + 25_000);
        assert_eq!(loss.probe_timeout(&rtt, 3), 3 * one);
    }

    #[test]
    fn discard_space_returns_bytes() {
        let mut loss = LossDetection::new(1460, 25_000);
        loss.on_packet_sent(EncryptLevel::Initial, 0, sent(0, 500));
        loss.discard_space(EncryptLevel::Initial);
        assert_eq!(loss.bytes_in_flight, 0);
        assert!(!loss.has_eliciting_in_flight());
    }
}
