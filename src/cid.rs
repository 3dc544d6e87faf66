//! Source and destination connection-ID lifecycle.
//!
//! Source CIDs are the ones peers use to address us; they live in insertion
//! order with the handshake-initial CID first. Destination CIDs are the ones
//! we address the peer with, ordered by sequence number, each optionally
//! carrying the peer's stateless reset token.

use constant_time_eq::constant_time_eq;
use rand::Rng;

use crate::packet::ConnectionId;
use crate::RESET_TOKEN_SIZE;

#[derive(Debug)]
pub struct SourceCid {
    pub id: ConnectionId,
    pub sequence: u64,
    pub is_initial: bool,
    pub needs_to_send: bool,
    pub used_by_peer: bool,
}

#[derive(Debug)]
pub struct DestCid {
    pub id: ConnectionId,
    pub sequence: u64,
    pub retired: bool,
    pub needs_to_send: bool,
    pub reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
}

/// Outcome of a local destination-CID retirement attempt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RetireOutcome {
    Retired(u64),
    /// The current CID is zero length and cannot be replaced.
    Irreplaceable,
    /// No spare CID exists to switch to.
    NoReplacement,
}

#[derive(Default)]
pub struct CidSet {
    source: Vec<SourceCid>,
    dest: Vec<DestCid>,
    next_source_sequence: u64,
    /// The client's first destination CID, kept around for Retry validation.
    pub orig_cid: Option<ConnectionId>,
}

impl CidSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push_source(&mut self, id: ConnectionId, is_initial: bool) -> &SourceCid {
        let sequence = self.next_source_sequence;
        self.next_source_sequence += 1;
        self.source.push(SourceCid {
            id,
            sequence,
            is_initial,
            // The handshake CID is implied; later ones must be announced.
            needs_to_send: sequence > 0,
            used_by_peer: false,
        });
        self.source.last().unwrap()
    }

    pub fn source_cids(&self) -> &[SourceCid] {
        &self.source
    }

    pub fn source_cids_mut(&mut self) -> &mut [SourceCid] {
        &mut self.source
    }

    pub fn source_count(&self) -> usize {
        self.source.len()
    }

    pub fn source_by_buf_mut(&mut self, buf: &[u8]) -> Option<&mut SourceCid> {
        self.source.iter_mut().find(|cid| &cid.id[..] == buf)
    }

    /// Remove the source CID the peer retired. Returns the removed entry and
    /// whether it was the last one we had.
    pub fn remove_source_by_seq(&mut self, sequence: u64) -> Option<(SourceCid, bool)> {
        let index = self.source.iter().position(|cid| cid.sequence == sequence)?;
        let removed = self.source.remove(index);
        Some((removed, self.source.is_empty()))
    }

    /// Discard a superseded initial source CID once the peer switched off it.
    pub fn remove_source(&mut self, sequence: u64) -> Option<SourceCid> {
        let index = self.source.iter().position(|cid| cid.sequence == sequence)?;
        Some(self.source.remove(index))
    }

    pub fn seed_dest<R: Rng>(&mut self, rng: &mut R, len: usize) -> ConnectionId {
        debug_assert!(self.dest.is_empty());
        let id = ConnectionId::random(rng, len);
        self.dest.push(DestCid {
            id,
            sequence: 0,
            retired: false,
            needs_to_send: false,
            reset_token: None,
        });
        id
    }

    pub fn set_dest(&mut self, id: ConnectionId) {
        debug_assert!(self.dest.is_empty());
        self.dest.push(DestCid {
            id,
            sequence: 0,
            retired: false,
            needs_to_send: false,
            reset_token: None,
        });
    }

    pub fn dest_cids(&self) -> &[DestCid] {
        &self.dest
    }

    pub fn dest_cids_mut(&mut self) -> &mut [DestCid] {
        &mut self.dest
    }

    pub fn dest_count(&self) -> usize {
        self.dest.len()
    }

    pub fn first_dest(&self) -> &DestCid {
        &self.dest[0]
    }

    pub fn first_dest_mut(&mut self) -> &mut DestCid {
        &mut self.dest[0]
    }

    /// The CID to put on outgoing packets: the lowest-sequence live one.
    pub fn current_dest(&self) -> &DestCid {
        self.dest
            .iter()
            .find(|cid| !cid.retired)
            .unwrap_or(&self.dest[0])
    }

    /// Replace the first destination CID with the peer's chosen source CID.
    /// Client handshake only. Returns whether the bytes actually changed.
    pub fn update_dest(&mut self, id: ConnectionId) -> bool {
        let first = &mut self.dest[0];
        if first.id == id {
            return false;
        }
        first.id = id;
        true
    }

    /// Store a peer-issued destination CID, keeping the list ordered by
    /// sequence. Returns false for sequence numbers we already track.
    pub fn add_dest(
        &mut self,
        id: ConnectionId,
        sequence: u64,
        reset_token: [u8; RESET_TOKEN_SIZE],
    ) -> bool {
        if self.dest.iter().any(|cid| cid.sequence == sequence) {
            return false;
        }
        let index = self
            .dest
            .iter()
            .position(|cid| cid.sequence > sequence)
            .unwrap_or(self.dest.len());
        self.dest.insert(
            index,
            DestCid {
                id,
                sequence,
                retired: false,
                needs_to_send: false,
                reset_token: Some(reset_token),
            },
        );
        true
    }

    /// Mark the current destination CID retired so a spare takes over.
    pub fn retire_current_dest(&mut self) -> RetireOutcome {
        for i in 0..self.dest.len() {
            if self.dest[i].id.is_empty() {
                return RetireOutcome::Irreplaceable;
            }
            if self.dest[i].retired {
                continue;
            }
            if i + 1 == self.dest.len() {
                return RetireOutcome::NoReplacement;
            }
            self.dest[i].retired = true;
            self.dest[i].needs_to_send = true;
            return RetireOutcome::Retired(self.dest[i].sequence);
        }
        RetireOutcome::NoReplacement
    }

    /// Constant-time search for a stateless reset token among stored dest
    /// CIDs.
    pub fn matches_reset_token(&self, token: &[u8; RESET_TOKEN_SIZE]) -> bool {
        let mut found = false;
        for cid in &self.dest {
            if let Some(ref stored) = cid.reset_token {
                found |= constant_time_eq(stored, token);
            }
        }
        found
    }

    /// Forget everything tied to the handshake dest CID; used on Retry.
    pub fn take_orig_for_retry(&mut self) -> ConnectionId {
        let orig = self.dest[0].id;
        self.orig_cid = Some(orig);
        orig
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn token(x: u8) -> [u8; RESET_TOKEN_SIZE] {
        [x; RESET_TOKEN_SIZE]
    }

    #[test]
    fn source_sequencing() {
        let mut set = CidSet::new();
        set.push_source(ConnectionId::new(&[1; 8]), true);
        let second = set.push_source(ConnectionId::new(&[2; 8]), false);
        assert_eq!(second.sequence, 1);
        assert!(second.needs_to_send);
        assert!(!set.source_cids()[0].needs_to_send);
        assert!(set.source_cids()[0].is_initial);
    }

    #[test]
    fn remove_source_reports_last() {
        let mut set = CidSet::new();
        set.push_source(ConnectionId::new(&[1; 8]), true);
        set.push_source(ConnectionId::new(&[2; 8]), false);
        let (removed, last) = set.remove_source_by_seq(0).unwrap();
        assert_eq!(removed.sequence, 0);
        assert!(!last);
        let (_, last) = set.remove_source_by_seq(1).unwrap();
        assert!(last);
    }

    #[test]
    fn dest_ordering_and_duplicates() {
        let mut set = CidSet::new();
        set.seed_dest(&mut OsRng, 8);
        assert!(set.add_dest(ConnectionId::new(&[3; 8]), 3, token(3)));
        assert!(set.add_dest(ConnectionId::new(&[1; 8]), 1, token(1)));
        assert!(!set.add_dest(ConnectionId::new(&[9; 8]), 3, token(9)));
        let seqs: Vec<u64> = set.dest_cids().iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, &[0, 1, 3]);
    }

    #[test]
    fn retirement_needs_replacement() {
        let mut set = CidSet::new();
        set.seed_dest(&mut OsRng, 8);
        assert_eq!(set.retire_current_dest(), RetireOutcome::NoReplacement);
        set.add_dest(ConnectionId::new(&[1; 8]), 1, token(1));
        assert_eq!(set.retire_current_dest(), RetireOutcome::Retired(0));
        assert!(set.dest_cids()[0].retired);
        assert_eq!(set.current_dest().sequence, 1);
        // Only one live CID again, so a further retirement must refuse.
        assert_eq!(set.retire_current_dest(), RetireOutcome::NoReplacement);
    }

    #[test]
    fn reset_token_matching() {
        let mut set = CidSet::new();
        set.seed_dest(&mut OsRng, 8);
        set.add_dest(ConnectionId::new(&[1; 8]), 1, token(0x5a));
        assert!(set.matches_reset_token(&token(0x5a)));
        assert!(!set.matches_reset_token(&token(0x5b)));
    }

    #[test]
    fn update_dest_replaces_bytes() {
        let mut set = CidSet::new();
        set.set_dest(ConnectionId::new(&[7; 8]));
        assert!(set.update_dest(ConnectionId::new(&[8; 4])));
        assert_eq!(&set.first_dest().id[..], &[8; 4]);
        assert!(!set.update_dest(ConnectionId::new(&[8; 4])));
    }
}
