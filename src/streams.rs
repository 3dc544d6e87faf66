//! The stream set: lookup, peer-initiated creation under limits, stream
//! count accounting, and closed-stream cleanup.

use fnv::FnvHashMap;

use crate::stream::{Recv, RecvState, Send, SendState, Stream};
use crate::{Directionality, Side, StreamId, TransportError};

fn dir_index(directionality: Directionality) -> usize {
    match directionality {
        Directionality::Bi => 0,
        Directionality::Uni => 1,
    }
}

pub struct StreamSet {
    streams: FnvHashMap<StreamId, Stream>,
    side: Side,
    /// Receive window given to each incoming stream.
    stream_window: u64,
    /// Next locally initiated index, per directionality.
    next: [u64; 2],
    /// How many streams the peer lets us initiate.
    max: [u64; 2],
    /// How many streams we let the peer initiate.
    max_remote: [u64; 2],
    /// Lowest peer index not yet implicitly opened.
    next_remote: [u64; 2],
    /// Send window for streams we initiate, from the peer's parameters.
    peer_window_local: [u64; 2],
    /// Send window for bidi streams the peer initiates.
    peer_window_remote_bidi: u64,
    /// Fully closed streams awaiting the post-drain sweep.
    closed: Vec<StreamId>,
}

impl StreamSet {
    pub fn new(side: Side, stream_window: u64, max_remote_bi: u64, max_remote_uni: u64) -> Self {
        StreamSet {
            streams: FnvHashMap::default(),
            side,
            stream_window,
            next: [0, 0],
            max: [0, 0],
            max_remote: [max_remote_bi, max_remote_uni],
            next_remote: [0, 0],
            peer_window_local: [0, 0],
            peer_window_remote_bidi: 0,
            closed: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn max_remote(&self, directionality: Directionality) -> u64 {
        self.max_remote[dir_index(directionality)]
    }

    /// Reconfigure how many streams the peer may initiate. Only effective
    /// before the limit has been advertised.
    pub fn set_max_remote(&mut self, directionality: Directionality, count: u64) {
        self.max_remote[dir_index(directionality)] = count;
    }

    /// Apply the peer's transport parameters to stream creation limits.
    pub fn apply_peer_parameters(
        &mut self,
        max_bidi: u64,
        max_uni: u64,
        window_bidi: u64,
        window_uni: u64,
        window_remote_bidi: u64,
    ) {
        self.max[0] = self.max[0].max(max_bidi);
        self.max[1] = self.max[1].max(max_uni);
        self.peer_window_local = [window_bidi, window_uni];
        self.peer_window_remote_bidi = window_remote_bidi;
        for (id, stream) in &mut self.streams {
            if let Some(send) = stream.send_mut() {
                let window = if id.initiator() == self.side {
                    self.peer_window_local[dir_index(id.directionality())]
                } else {
                    window_remote_bidi
                };
                send.max_data = send.max_data.max(window);
            }
        }
    }

    /// Raise the peer-granted initiation limit. Returns whether it moved.
    pub fn update_max_streams(&mut self, directionality: Directionality, count: u64) -> bool {
        let limit = &mut self.max[dir_index(directionality)];
        if count > *limit {
            *limit = count;
            true
        } else {
            false
        }
    }

    pub fn open(&mut self, directionality: Directionality) -> Option<StreamId> {
        let index = dir_index(directionality);
        if self.next[index] >= self.max[index] {
            return None;
        }
        let id = StreamId::new(self.side, directionality, self.next[index]);
        self.next[index] += 1;
        let mut stream = match directionality {
            Directionality::Uni => Stream::from(Send::new()),
            Directionality::Bi => Stream::new_bi(self.stream_window),
        };
        stream.send_mut().unwrap().max_data = self.peer_window_local[index];
        self.streams.insert(id, stream);
        Some(id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Look up the stream a peer frame refers to, creating peer-initiated
    /// streams on demand subject to the advertised limits.
    ///
    /// `Ok(None)` means the stream existed once and is gone; the frame should
    /// be skipped.
    pub fn get_for_peer(&mut self, id: StreamId) -> Result<Option<&mut Stream>, TransportError> {
        let index = dir_index(id.directionality());
        if id.initiator() == self.side {
            if id.index() >= self.next[index] {
                // A frame for a stream we never opened.
                return Err(TransportError::STREAM_STATE_ERROR);
            }
            return Ok(self.streams.get_mut(&id));
        }

        if id.index() >= self.max_remote[index] {
            return Err(TransportError::STREAM_LIMIT_ERROR);
        }
        // Stream IDs open implicitly: everything below this index exists too.
        while self.next_remote[index] <= id.index() {
            let new_id = StreamId::new(!self.side, id.directionality(), self.next_remote[index]);
            let mut stream = match id.directionality() {
                Directionality::Uni => Stream::from(Recv::new(self.stream_window)),
                Directionality::Bi => Stream::new_bi(self.stream_window),
            };
            if let Some(send) = stream.send_mut() {
                send.max_data = self.peer_window_remote_bidi;
            }
            self.streams.insert(new_id, stream);
            self.next_remote[index] += 1;
        }
        Ok(self.streams.get_mut(&id))
    }

    pub fn note_closed(&mut self, id: StreamId) {
        if !self.closed.contains(&id) {
            self.closed.push(id);
        }
    }

    /// Force every stream into a terminal state; run on first close.
    pub fn shutdown_all(&mut self) {
        let ids: Vec<StreamId> = self.streams.keys().cloned().collect();
        for id in ids {
            let stream = self.streams.get_mut(&id).unwrap();
            if let Some(send) = stream.send_mut() {
                if !send.is_closed() {
                    send.state = SendState::ResetRecvd { stop_reason: None };
                }
            }
            if let Some(recv) = stream.recv_mut() {
                if !recv.is_closed() {
                    recv.state = RecvState::Closed;
                }
            }
            self.note_closed(id);
        }
    }

    /// Sweep fully closed streams out of the table. Returns how many remote
    /// initiation slots opened up per directionality, so the caller can
    /// announce new MAX_STREAMS values.
    pub fn drain_closed(&mut self) -> [u64; 2] {
        let mut replenished = [0; 2];
        let closed = ::std::mem::take(&mut self.closed);
        for id in closed {
            let fully_closed = self.streams.get(&id).map_or(false, Stream::is_closed);
            if !fully_closed {
                self.closed.push(id);
                continue;
            }
            self.streams.remove(&id);
            if id.initiator() != self.side {
                let index = dir_index(id.directionality());
                self.max_remote[index] += 1;
                replenished[index] += 1;
            }
        }
        replenished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> StreamSet {
        let mut set = StreamSet::new(Side::Server, 1024, 2, 1);
        set.apply_peer_parameters(3, 3, 2048, 2048, 2048);
        set
    }

    #[test]
    fn peer_streams_open_implicitly_up_to_limit() {
        let mut set = set();
        let id = StreamId::new(Side::Client, Directionality::Bi, 1);
        assert!(set.get_for_peer(id).unwrap().is_some());
        // Index 0 was created implicitly.
        let id0 = StreamId::new(Side::Client, Directionality::Bi, 0);
        assert!(set.get_mut(id0).is_some());
        // Index 2 exceeds what we advertised.
        let id2 = StreamId::new(Side::Client, Directionality::Bi, 2);
        assert_eq!(
            set.get_for_peer(id2),
            Err(TransportError::STREAM_LIMIT_ERROR)
        );
    }

    #[test]
    fn frames_for_unopened_local_streams_are_errors() {
        let mut set = set();
        let id = StreamId::new(Side::Server, Directionality::Bi, 0);
        assert_eq!(
            set.get_for_peer(id),
            Err(TransportError::STREAM_STATE_ERROR)
        );
        set.open(Directionality::Bi).unwrap();
        assert!(set.get_for_peer(id).unwrap().is_some());
    }

    #[test]
    fn open_respects_peer_limit() {
        let mut set = set();
        assert!(set.open(Directionality::Bi).is_some());
        assert!(set.open(Directionality::Bi).is_some());
        assert!(set.open(Directionality::Bi).is_some());
        assert!(set.open(Directionality::Bi).is_none());
        assert!(set.update_max_streams(Directionality::Bi, 4));
        assert!(set.open(Directionality::Bi).is_some());
    }

    #[test]
    fn drain_replenishes_remote_slots() {
        let mut set = set();
        let id = StreamId::new(Side::Client, Directionality::Uni, 0);
        set.get_for_peer(id).unwrap().unwrap();
        set.shutdown_all();
        let replenished = set.drain_closed();
        assert_eq!(replenished, [0, 1]);
        assert_eq!(set.max_remote(Directionality::Uni), 2);
        assert!(set.is_empty());
    }

    #[test]
    fn new_streams_get_peer_send_window() {
        let mut set = set();
        let id = set.open(Directionality::Uni).unwrap();
        assert_eq!(set.get_mut(id).unwrap().send().unwrap().max_data, 2048);
    }
}
