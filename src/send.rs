//! Outbound send state: send flags, pending frame queues, and the
//! anti-amplification allowance.
//!
//! Packet assembly itself lives on the connection; this module owns what to
//! send and whether we are allowed to send it yet.

use std::collections::VecDeque;

use bytes::Bytes;
use fnv::FnvHashSet;

use crate::frame;
use crate::space::ENCRYPT_LEVEL_COUNT;
use crate::{StreamId, AMPLIFICATION_FACTOR};

/// Bit set of frame kinds waiting to be flushed.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SendFlags(u32);

impl SendFlags {
    pub const ACK: SendFlags = SendFlags(1 << 0);
    pub const CRYPTO: SendFlags = SendFlags(1 << 1);
    pub const PING: SendFlags = SendFlags(1 << 2);
    pub const CONNECTION_CLOSE: SendFlags = SendFlags(1 << 3);
    pub const APPLICATION_CLOSE: SendFlags = SendFlags(1 << 4);
    pub const PATH_RESPONSE: SendFlags = SendFlags(1 << 5);
    pub const NEW_CONNECTION_ID: SendFlags = SendFlags(1 << 6);
    pub const RETIRE_CONNECTION_ID: SendFlags = SendFlags(1 << 7);
    pub const MAX_DATA: SendFlags = SendFlags(1 << 8);
    pub const MAX_STREAMS_BIDI: SendFlags = SendFlags(1 << 9);
    pub const MAX_STREAMS_UNI: SendFlags = SendFlags(1 << 10);
    pub const STREAM: SendFlags = SendFlags(1 << 11);

    /// The only frames that may leave once the connection is closing.
    pub const CLOSING_MASK: SendFlags =
        SendFlags(Self::CONNECTION_CLOSE.0 | Self::APPLICATION_CLOSE.0);

    pub fn insert(&mut self, other: SendFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SendFlags) {
        self.0 &= !other.0;
    }

    pub fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: SendFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Restrict to what a closing connection may still transmit.
    pub fn restrict_to_closing(&mut self) {
        self.0 &= Self::CLOSING_MASK.0;
    }
}

pub struct Send {
    pub flags: SendFlags,
    /// Connection-level flow control ceiling granted by the peer.
    pub peer_max_data: u64,
    pub data_sent: u64,
    /// Receive allowance we advertise via MAX_DATA.
    pub max_data: u64,
    /// Anti-amplification budget; `u64::MAX` once the address is validated.
    pub allowance: u64,
    pub spin_bit: bool,
    /// Token to attach to outgoing Initial packets, from NEW_TOKEN or Retry.
    pub initial_token: Bytes,
    pub last_path_challenge: Option<[u8; 8]>,
    pub path_response: Option<[u8; 8]>,
    pub path_mtu: u16,
    /// Pending CRYPTO frames per encryption level.
    pub crypto: [VecDeque<frame::Crypto>; ENCRYPT_LEVEL_COUNT],
    pub stream: VecDeque<frame::Stream>,
    pub reset_stream: Vec<(StreamId, u64, u64)>,
    pub stop_sending: Vec<(StreamId, u64)>,
    pub max_stream_data: FnvHashSet<StreamId>,
}

impl Send {
    pub fn new(max_data: u64, path_mtu: u16) -> Self {
        Send {
            flags: SendFlags::default(),
            peer_max_data: 0,
            data_sent: 0,
            max_data,
            allowance: 0,
            spin_bit: false,
            initial_token: Bytes::new(),
            last_path_challenge: None,
            path_response: None,
            path_mtu,
            crypto: Default::default(),
            stream: VecDeque::new(),
            reset_stream: Vec::new(),
            stop_sending: Vec::new(),
            max_stream_data: FnvHashSet::default(),
        }
    }

    pub fn set_flag(&mut self, flag: SendFlags) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: SendFlags) {
        self.flags.remove(flag);
    }

    /// Grant send budget for received bytes, pre-validation.
    pub fn increment_allowance(&mut self, received: usize) {
        if self.allowance != u64::MAX {
            self.allowance = self
                .allowance
                .saturating_add(AMPLIFICATION_FACTOR * received as u64);
        }
    }

    /// The peer's address is validated; no more amplification limits.
    pub fn set_allowance_unlimited(&mut self) {
        self.allowance = u64::MAX;
    }

    pub fn on_bytes_sent(&mut self, bytes: usize) {
        if self.allowance != u64::MAX {
            self.allowance = self.allowance.saturating_sub(bytes as u64);
        }
    }

    pub fn allowance_permits(&self, bytes: usize) -> bool {
        self.allowance == u64::MAX || self.allowance >= bytes as u64
    }

    pub fn has_pending_crypto(&self) -> bool {
        self.crypto.iter().any(|q| !q.is_empty())
    }

    /// Anything at all waiting to go out?
    pub fn has_pending(&self) -> bool {
        !self.flags.is_empty()
            || self.has_pending_crypto()
            || !self.stream.is_empty()
            || !self.reset_stream.is_empty()
            || !self.stop_sending.is_empty()
            || !self.max_stream_data.is_empty()
    }

    /// Roll back to a blank slate for a handshake restart. The Initial token
    /// survives; a Retry installs it immediately before the restart.
    pub fn reset(&mut self) {
        self.flags.clear();
        self.data_sent = 0;
        self.spin_bit = false;
        self.last_path_challenge = None;
        self.path_response = None;
        for queue in &mut self.crypto {
            queue.clear();
        }
        self.stream.clear();
        self.reset_stream.clear();
        self.stop_sending.clear();
        self.max_stream_data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_operations() {
        let mut flags = SendFlags::default();
        flags.insert(SendFlags::ACK);
        flags.insert(SendFlags::PING);
        assert!(flags.contains(SendFlags::ACK));
        assert!(flags.intersects(SendFlags::PING));
        flags.remove(SendFlags::ACK);
        assert!(!flags.contains(SendFlags::ACK));
        assert!(!flags.is_empty());
    }

    #[test]
    fn closing_mask_drops_data_frames() {
        let mut flags = SendFlags::default();
        flags.insert(SendFlags::STREAM);
        flags.insert(SendFlags::MAX_DATA);
        flags.insert(SendFlags::CONNECTION_CLOSE);
        flags.restrict_to_closing();
        assert!(flags.contains(SendFlags::CONNECTION_CLOSE));
        assert!(!flags.intersects(SendFlags::STREAM));
        assert!(!flags.intersects(SendFlags::MAX_DATA));
    }

    #[test]
    fn allowance_accounting() {
        let mut send = Send::new(1 << 20, 1200);
        send.increment_allowance(100);
        assert_eq!(send.allowance, 300);
        assert!(send.allowance_permits(300));
        assert!(!send.allowance_permits(301));
        send.on_bytes_sent(250);
        assert_eq!(send.allowance, 50);
        send.set_allowance_unlimited();
        send.on_bytes_sent(10_000);
        assert!(send.allowance_permits(usize::MAX));
    }

    #[test]
    fn reset_preserves_initial_token() {
        let mut send = Send::new(1 << 20, 1200);
        send.initial_token = Bytes::from_static(b"retry token");
        send.set_flag(SendFlags::PING);
        send.stream.push_back(frame::Stream {
            id: StreamId(0),
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"x"),
        });
        send.reset();
        assert!(!send.has_pending());
        assert_eq!(&send.initial_token[..], b"retry token");
    }
}
