//! Per-stream send and receive state machines.

use std::collections::BTreeMap;

use bytes::Bytes;
use failure::Fail;

use crate::range_set::RangeSet;

#[derive(Debug, PartialEq)]
pub enum Stream {
    Send(Send),
    Recv(Recv),
    Both(Send, Recv),
}

impl Stream {
    pub fn new_bi(window: u64) -> Self {
        Stream::Both(Send::new(), Recv::new(window))
    }

    pub fn send(&self) -> Option<&Send> {
        match *self {
            Stream::Send(ref x) | Stream::Both(ref x, _) => Some(x),
            _ => None,
        }
    }

    pub fn recv(&self) -> Option<&Recv> {
        match *self {
            Stream::Recv(ref x) | Stream::Both(_, ref x) => Some(x),
            _ => None,
        }
    }

    pub fn send_mut(&mut self) -> Option<&mut Send> {
        match *self {
            Stream::Send(ref mut x) | Stream::Both(ref mut x, _) => Some(x),
            _ => None,
        }
    }

    pub fn recv_mut(&mut self) -> Option<&mut Recv> {
        match *self {
            Stream::Recv(ref mut x) | Stream::Both(_, ref mut x) => Some(x),
            _ => None,
        }
    }

    /// Both halves have run to completion; the stream can be discarded.
    pub fn is_closed(&self) -> bool {
        self.send().map_or(true, Send::is_closed) && self.recv().map_or(true, Recv::is_closed)
    }
}

impl From<Send> for Stream {
    fn from(x: Send) -> Stream {
        Stream::Send(x)
    }
}

impl From<Recv> for Stream {
    fn from(x: Recv) -> Stream {
        Stream::Recv(x)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendState {
    Ready,
    DataSent,
    ResetSent { stop_reason: Option<u64> },
    DataRecvd,
    ResetRecvd { stop_reason: Option<u64> },
}

impl SendState {
    pub fn was_reset(self) -> bool {
        matches!(
            self,
            SendState::ResetSent { .. } | SendState::ResetRecvd { .. }
        )
    }
}

#[derive(Debug, PartialEq)]
pub struct Send {
    pub offset: u64,
    /// Peer-granted limit on `offset`.
    pub max_data: u64,
    pub state: SendState,
    pub bytes_in_flight: u64,
}

impl Send {
    pub fn new() -> Self {
        Send {
            offset: 0,
            max_data: 0,
            state: SendState::Ready,
            bytes_in_flight: 0,
        }
    }

    pub fn write_budget(&mut self) -> Result<u64, WriteError> {
        match self.state {
            SendState::ResetSent { stop_reason } | SendState::ResetRecvd { stop_reason } => {
                if let Some(error_code) = stop_reason {
                    return Err(WriteError::Stopped { error_code });
                }
                Err(WriteError::Blocked)
            }
            _ if self.offset >= self.max_data => Err(WriteError::Blocked),
            _ => Ok(self.max_data - self.offset),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.state,
            SendState::DataRecvd | SendState::ResetRecvd { .. }
        )
    }
}

impl Default for Send {
    fn default() -> Self {
        Send::new()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvState {
    Recv { size: Option<u64> },
    DataRecvd { size: u64 },
    ResetRecvd { size: u64, error_code: u64 },
    Closed,
}

#[derive(Debug, PartialEq)]
pub struct Recv {
    pub state: RecvState,
    /// Ranges of the stream we have seen, including gaps in the buffer.
    pub recvd: RangeSet,
    buffered: BTreeMap<u64, Bytes>,
    read_offset: u64,
    /// Our advertised limit on the peer's send offset.
    pub max_data: u64,
    /// True until the first readable event is surfaced.
    pub fresh: bool,
}

impl Recv {
    pub fn new(window: u64) -> Self {
        Recv {
            state: RecvState::Recv { size: None },
            recvd: RangeSet::new(),
            buffered: BTreeMap::new(),
            read_offset: 0,
            max_data: window,
            fresh: true,
        }
    }

    /// Highest contiguous-or-not offset seen so far.
    pub fn limit(&self) -> u64 {
        self.recvd.max().map_or(0, |x| x + 1)
    }

    pub fn final_size(&self) -> Option<u64> {
        match self.state {
            RecvState::Recv { size } => size,
            RecvState::DataRecvd { size } | RecvState::ResetRecvd { size, .. } => Some(size),
            RecvState::Closed => None,
        }
    }

    pub fn buffer(&mut self, offset: u64, data: Bytes) {
        let end = offset + data.len() as u64;
        self.recvd.insert(offset..end);
        if end > self.read_offset {
            self.buffered.entry(offset).or_insert(data);
        }
        if let RecvState::Recv { size: Some(size) } = self.state {
            if self.recvd.len() == 1 && self.recvd.iter().next() == Some(0..size) {
                self.state = RecvState::DataRecvd { size };
            }
        }
    }

    /// Pull contiguous data for the application.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        let mut filled = 0;
        while filled < buf.len() {
            let (start, chunk) = match self.buffered.iter().next() {
                Some((&start, chunk)) if start <= self.read_offset => (start, chunk.clone()),
                _ => break,
            };
            let chunk_end = start + chunk.len() as u64;
            if chunk_end > self.read_offset {
                let skip = (self.read_offset - start) as usize;
                let available = &chunk[skip..];
                let n = available.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&available[..n]);
                filled += n;
                self.read_offset += n as u64;
                if self.read_offset < chunk_end {
                    break;
                }
            }
            self.buffered.remove(&start);
        }
        if filled > 0 {
            return Ok(filled);
        }
        match self.state {
            RecvState::ResetRecvd { error_code, .. } => Err(ReadError::Reset { error_code }),
            RecvState::DataRecvd { size } if self.read_offset >= size => Err(ReadError::Finished),
            _ => Err(ReadError::Blocked),
        }
    }

    pub fn receiving_unknown_size(&self) -> bool {
        matches!(self.state, RecvState::Recv { size: None })
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self.state, RecvState::Recv { .. })
    }

    pub fn is_closed(&self) -> bool {
        match self.state {
            RecvState::Closed | RecvState::ResetRecvd { .. } => true,
            RecvState::DataRecvd { size } => self.read_offset >= size,
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum ReadError {
    /// No data is currently available.
    #[fail(display = "blocked")]
    Blocked,
    /// The peer abandoned the stream.
    #[fail(display = "reset by peer: error {}", error_code)]
    Reset { error_code: u64 },
    /// All data has been read.
    #[fail(display = "finished")]
    Finished,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum WriteError {
    /// Flow control or congestion forbids writing now.
    #[fail(display = "blocked")]
    Blocked,
    /// The peer asked us to stop sending.
    #[fail(display = "stopped by peer: error {}", error_code)]
    Stopped { error_code: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_read() {
        let mut recv = Recv::new(1024);
        recv.buffer(0, Bytes::from_static(b"hello "));
        recv.buffer(6, Bytes::from_static(b"world"));
        let mut buf = [0; 16];
        let n = recv.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        assert_eq!(recv.read(&mut buf), Err(ReadError::Blocked));
    }

    #[test]
    fn out_of_order_waits_for_gap() {
        let mut recv = Recv::new(1024);
        recv.buffer(6, Bytes::from_static(b"world"));
        let mut buf = [0; 16];
        assert_eq!(recv.read(&mut buf), Err(ReadError::Blocked));
        recv.buffer(0, Bytes::from_static(b"hello "));
        let n = recv.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn fin_transitions_to_data_recvd() {
        let mut recv = Recv::new(1024);
        recv.state = RecvState::Recv { size: Some(4) };
        recv.buffer(0, Bytes::from_static(b"done"));
        assert_eq!(recv.state, RecvState::DataRecvd { size: 4 });
        let mut buf = [0; 8];
        assert_eq!(recv.read(&mut buf), Ok(4));
        assert_eq!(recv.read(&mut buf), Err(ReadError::Finished));
        assert!(recv.is_closed());
    }

    #[test]
    fn write_budget_tracks_limits() {
        let mut send = Send::new();
        send.max_data = 10;
        assert_eq!(send.write_budget(), Ok(10));
        send.offset = 10;
        assert_eq!(send.write_budget(), Err(WriteError::Blocked));
        send.state = SendState::ResetSent {
            stop_reason: Some(7),
        };
        assert_eq!(send.write_budget(), Err(WriteError::Stopped { error_code: 7 }));
    }
}
