//! Per-encryption-level packet spaces and ACK tracking.

use crate::range_set::RangeSet;
use crate::Datagram;

/// Bounds memory spent remembering old packet numbers and pending ACK ranges.
const MAX_ACK_RANGES: usize = 64;
/// Ack-eliciting packets received before an ACK goes out without delay.
const ACK_ELICITING_THRESHOLD: u64 = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum EncryptLevel {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

pub const ENCRYPT_LEVEL_COUNT: usize = 4;

pub const ENCRYPT_LEVELS: [EncryptLevel; ENCRYPT_LEVEL_COUNT] = [
    EncryptLevel::Initial,
    EncryptLevel::ZeroRtt,
    EncryptLevel::Handshake,
    EncryptLevel::OneRtt,
];

impl EncryptLevel {
    pub fn from_index(index: usize) -> EncryptLevel {
        ENCRYPT_LEVELS[index]
    }
}

impl slog::Value for EncryptLevel {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

/// When the acknowledgement for a just-processed packet should go out.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AckTiming {
    /// Nothing ack-eliciting is outstanding.
    None,
    /// Start (or leave running) the delayed-ACK timer.
    Delayed,
    /// Flush an ACK frame without waiting.
    Immediate,
}

/// Tracks received packet numbers for duplicate detection and the set still
/// in need of acknowledgement.
#[derive(Default)]
pub struct AckTracker {
    received: RangeSet,
    pub to_ack: RangeSet,
    pub largest_received: Option<u64>,
    pub largest_received_time: u64,
    eliciting_since_ack: u64,
    pub ack_elicited: bool,
}

impl AckTracker {
    /// Record a decrypted packet number. Returns false for duplicates, which
    /// must be dropped without further processing.
    pub fn add(&mut self, number: u64) -> bool {
        if !self.received.insert_one(number) {
            return false;
        }
        if self.received.len() > MAX_ACK_RANGES {
            self.received.pop_min();
        }
        true
    }

    /// Mark a fully processed packet for acknowledgement.
    pub fn ack_packet(
        &mut self,
        number: u64,
        now: u64,
        ack_eliciting: bool,
        immediate: bool,
    ) -> AckTiming {
        self.to_ack.insert_one(number);
        if self.to_ack.len() > MAX_ACK_RANGES {
            self.to_ack.pop_min();
        }
        if self.largest_received.map_or(true, |x| number > x) {
            self.largest_received = Some(number);
            self.largest_received_time = now;
        }
        if !ack_eliciting {
            return if self.ack_elicited {
                AckTiming::Delayed
            } else {
                AckTiming::None
            };
        }
        self.ack_elicited = true;
        self.eliciting_since_ack += 1;
        if immediate || self.eliciting_since_ack >= ACK_ELICITING_THRESHOLD {
            AckTiming::Immediate
        } else {
            AckTiming::Delayed
        }
    }

    /// Called when an ACK frame for this space goes out.
    pub fn on_ack_sent(&mut self) {
        self.ack_elicited = false;
        self.eliciting_since_ack = 0;
    }

    /// The peer saw our ACK for these ranges; stop re-advertising them.
    pub fn ack_of_ack(&mut self, ranges: &RangeSet) {
        self.to_ack.subtract(ranges);
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.to_ack.is_empty()
    }

    fn reset(&mut self) {
        self.received.clear();
        self.to_ack.clear();
        self.largest_received = None;
        self.largest_received_time = 0;
        self.eliciting_since_ack = 0;
        self.ack_elicited = false;
    }
}

/// State owned by one encryption level.
#[derive(Default)]
pub struct PacketSpace {
    /// Expected next packet number; the basis for decompression.
    pub next_recv_pn: u64,
    pub ack_tracker: AckTracker,
    /// Datagrams parked until this level's read key arrives.
    pub deferred: Vec<Datagram>,
    pub next_send_pn: u64,
    pub largest_acked: Option<u64>,
    // 1-RTT key phase tracking; unused in other spaces.
    pub current_key_phase: bool,
    pub read_key_phase_start_pn: u64,
    pub key_phase_start_send_pn: u64,
    pub awaiting_key_phase_confirmation: bool,
}

impl PacketSpace {
    pub fn new() -> Self {
        Default::default()
    }

    /// Roll the space over for a handshake restart.
    pub fn reset(&mut self) {
        self.next_recv_pn = 0;
        self.ack_tracker.reset();
        self.deferred.clear();
        self.next_send_pn = 0;
        self.largest_acked = None;
        self.current_key_phase = false;
        self.read_key_phase_start_pn = 0;
        self.key_phase_start_send_pn = 0;
        self.awaiting_key_phase_confirmation = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_detection() {
        let mut tracker = AckTracker::default();
        assert!(tracker.add(3));
        assert!(!tracker.add(3));
        assert!(tracker.add(4));
    }

    #[test]
    fn ack_timing_threshold() {
        let mut tracker = AckTracker::default();
        tracker.add(0);
        assert_eq!(tracker.ack_packet(0, 10, true, false), AckTiming::Delayed);
        tracker.add(1);
        assert_eq!(tracker.ack_packet(1, 11, true, false), AckTiming::Immediate);
        tracker.on_ack_sent();
        tracker.add(2);
        assert_eq!(tracker.ack_packet(2, 12, true, false), AckTiming::Delayed);
        tracker.add(3);
        assert_eq!(tracker.ack_packet(3, 13, true, true), AckTiming::Immediate);
    }

    #[test]
    fn non_eliciting_packets_do_not_force_acks() {
        let mut tracker = AckTracker::default();
        tracker.add(0);
        assert_eq!(tracker.ack_packet(0, 10, false, false), AckTiming::None);
        assert!(tracker.has_pending_acks());
    }

    #[test]
    fn largest_received_tracking() {
        let mut tracker = AckTracker::default();
        tracker.add(5);
        tracker.ack_packet(5, 100, true, false);
        tracker.add(2);
        tracker.ack_packet(2, 200, true, false);
        assert_eq!(tracker.largest_received, Some(5));
        assert_eq!(tracker.largest_received_time, 100);
    }

    #[test]
    fn ack_of_ack_prunes() {
        let mut tracker = AckTracker::default();
        for pn in 0..4 {
            tracker.add(pn);
            tracker.ack_packet(pn, 0, true, false);
        }
        let mut acked = RangeSet::new();
        acked.insert(0..2);
        tracker.ack_of_ack(&acked);
        assert_eq!(tracker.to_ack.min(), Some(2));
    }
}
