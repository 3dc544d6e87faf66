//! QUIC v1 frames: decoding iterator and encoders.

use std::fmt;

use bytes::{Buf, BufMut, Bytes};

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::packet::ConnectionId;
use crate::range_set::RangeSet;
use crate::{Directionality, StreamId, RESET_TOKEN_SIZE};

/// A frame type code. Stream frames occupy a range, so this is not an enum.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Type(pub u64);

impl Type {
    pub const PADDING: Type = Type(0x00);
    pub const PING: Type = Type(0x01);
    pub const ACK: Type = Type(0x02);
    pub const ACK_ECN: Type = Type(0x03);
    pub const RESET_STREAM: Type = Type(0x04);
    pub const STOP_SENDING: Type = Type(0x05);
    pub const CRYPTO: Type = Type(0x06);
    pub const NEW_TOKEN: Type = Type(0x07);
    pub const STREAM: Type = Type(0x08);
    pub const MAX_DATA: Type = Type(0x10);
    pub const MAX_STREAM_DATA: Type = Type(0x11);
    pub const MAX_STREAMS_BIDI: Type = Type(0x12);
    pub const MAX_STREAMS_UNI: Type = Type(0x13);
    pub const DATA_BLOCKED: Type = Type(0x14);
    pub const STREAM_DATA_BLOCKED: Type = Type(0x15);
    pub const STREAMS_BLOCKED_BIDI: Type = Type(0x16);
    pub const STREAMS_BLOCKED_UNI: Type = Type(0x17);
    pub const NEW_CONNECTION_ID: Type = Type(0x18);
    pub const RETIRE_CONNECTION_ID: Type = Type(0x19);
    pub const PATH_CHALLENGE: Type = Type(0x1a);
    pub const PATH_RESPONSE: Type = Type(0x1b);
    pub const CONNECTION_CLOSE: Type = Type(0x1c);
    pub const APPLICATION_CLOSE: Type = Type(0x1d);

    const STREAM_OFF: u64 = 0x04;
    const STREAM_LEN: u64 = 0x02;
    const STREAM_FIN: u64 = 0x01;

    fn is_stream(self) -> bool {
        self.0 >= 0x08 && self.0 <= 0x0f
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl slog::Value for Type {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream {
        id: StreamId,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        id: StreamId,
        error_code: u64,
    },
    Crypto(Crypto),
    NewToken {
        token: Bytes,
    },
    Stream(Stream),
    MaxData(u64),
    MaxStreamData {
        id: StreamId,
        offset: u64,
    },
    MaxStreams {
        directionality: Directionality,
        count: u64,
    },
    DataBlocked {
        offset: u64,
    },
    StreamDataBlocked {
        id: StreamId,
        offset: u64,
    },
    StreamsBlocked {
        directionality: Directionality,
        limit: u64,
    },
    NewConnectionId(NewConnectionId),
    RetireConnectionId {
        sequence: u64,
    },
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    ConnectionClose(ConnectionClose),
    ApplicationClose(ApplicationClose),
    /// Unrecognized or malformed; terminates iteration.
    Invalid(Type),
}

impl Frame {
    pub fn ty(&self) -> Type {
        use self::Frame::*;
        match *self {
            Padding => Type::PADDING,
            Ping => Type::PING,
            Ack(_) => Type::ACK,
            ResetStream { .. } => Type::RESET_STREAM,
            StopSending { .. } => Type::STOP_SENDING,
            Crypto(_) => Type::CRYPTO,
            NewToken { .. } => Type::NEW_TOKEN,
            Stream(ref s) => {
                let mut ty = Type::STREAM.0 | Type::STREAM_LEN;
                if s.offset != 0 {
                    ty |= Type::STREAM_OFF;
                }
                if s.fin {
                    ty |= Type::STREAM_FIN;
                }
                Type(ty)
            }
            MaxData(_) => Type::MAX_DATA,
            MaxStreamData { .. } => Type::MAX_STREAM_DATA,
            MaxStreams {
                directionality: Directionality::Bi,
                ..
            } => Type::MAX_STREAMS_BIDI,
            MaxStreams { .. } => Type::MAX_STREAMS_UNI,
            DataBlocked { .. } => Type::DATA_BLOCKED,
            StreamDataBlocked { .. } => Type::STREAM_DATA_BLOCKED,
            StreamsBlocked {
                directionality: Directionality::Bi,
                ..
            } => Type::STREAMS_BLOCKED_BIDI,
            StreamsBlocked { .. } => Type::STREAMS_BLOCKED_UNI,
            NewConnectionId(_) => Type::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => Type::RETIRE_CONNECTION_ID,
            PathChallenge(_) => Type::PATH_CHALLENGE,
            PathResponse(_) => Type::PATH_RESPONSE,
            ConnectionClose(_) => Type::CONNECTION_CLOSE,
            ApplicationClose(_) => Type::APPLICATION_CLOSE,
            Invalid(ty) => ty,
        }
    }

    /// Whether receipt of this frame obligates an acknowledgement.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            *self,
            Frame::Padding | Frame::Ack(_) | Frame::ConnectionClose(_) | Frame::ApplicationClose(_)
        )
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

#[derive(Debug, Clone)]
pub struct Ack {
    pub largest: u64,
    /// Raw wire value; scale by the peer's ack-delay exponent.
    pub delay: u64,
    pub ranges: RangeSet,
    pub ecn: Option<EcnCounts>,
}

impl Ack {
    pub fn encode<W: BufMut>(delay: u64, ranges: &RangeSet, buf: &mut W) {
        debug_assert!(!ranges.is_empty());
        buf.put_var(Type::ACK.0);
        let mut iter = ranges.iter().rev();
        let first = iter.next().unwrap();
        let largest = first.end - 1;
        buf.put_var(largest);
        buf.put_var(delay);
        buf.put_var(ranges.len() as u64 - 1);
        buf.put_var(first.end - first.start - 1);
        let mut prev_start = first.start;
        for range in iter {
            buf.put_var(prev_start - range.end - 1); // gap
            buf.put_var(range.end - range.start - 1); // length
            prev_start = range.start;
        }
    }

    fn decode<B: Buf>(buf: &mut B, ecn: bool) -> Result<Self, UnexpectedEnd> {
        let largest = buf.get_var()?;
        let delay = buf.get_var()?;
        let count = buf.get_var()?;
        let first = buf.get_var()?;
        let mut ranges = RangeSet::new();
        let mut smallest = largest.checked_sub(first).ok_or(UnexpectedEnd)?;
        ranges.insert(smallest..largest + 1);
        for _ in 0..count {
            let gap = buf.get_var()?;
            let len = buf.get_var()?;
            let end = smallest.checked_sub(gap + 2).ok_or(UnexpectedEnd)?;
            smallest = end.checked_sub(len).ok_or(UnexpectedEnd)?;
            ranges.insert(smallest..end + 1);
        }
        let ecn = if ecn {
            Some(EcnCounts {
                ect0: buf.get_var()?,
                ect1: buf.get_var()?,
                ce: buf.get_var()?,
            })
        } else {
            None
        };
        Ok(Ack {
            largest,
            delay,
            ranges,
            ecn,
        })
    }

    pub fn iter(&self) -> crate::range_set::Iter<'_> {
        self.ranges.iter()
    }
}

#[derive(Debug, Clone)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.put_var(Type::CRYPTO.0);
        buf.put_var(self.offset);
        buf.put_var(self.data.len() as u64);
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl Stream {
    pub fn encode<W: BufMut>(&self, include_len: bool, buf: &mut W) {
        let mut ty = Type::STREAM.0;
        if self.offset != 0 {
            ty |= Type::STREAM_OFF;
        }
        if include_len {
            ty |= Type::STREAM_LEN;
        }
        if self.fin {
            ty |= Type::STREAM_FIN;
        }
        buf.put_var(ty);
        buf.put_var(self.id.0);
        if self.offset != 0 {
            buf.put_var(self.offset);
        }
        if include_len {
            buf.put_var(self.data.len() as u64);
        }
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub struct NewConnectionId {
    pub sequence: u64,
    pub retire_prior_to: u64,
    pub id: ConnectionId,
    pub reset_token: [u8; RESET_TOKEN_SIZE],
}

impl NewConnectionId {
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.put_var(Type::NEW_CONNECTION_ID.0);
        buf.put_var(self.sequence);
        buf.put_var(self.retire_prior_to);
        buf.put_u8(self.id.len() as u8);
        buf.put_slice(&self.id);
        buf.put_slice(&self.reset_token);
    }
}

/// Transport-initiated close (frame type 0x1c).
#[derive(Debug, Clone)]
pub struct ConnectionClose {
    pub error_code: u64,
    pub frame_type: u64,
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.error_code)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl ConnectionClose {
    pub fn encode<W: BufMut>(&self, buf: &mut W, max_len: usize) {
        buf.put_var(Type::CONNECTION_CLOSE.0);
        buf.put_var(self.error_code);
        buf.put_var(self.frame_type);
        let reason = bound_reason(&self.reason, max_len);
        buf.put_var(reason.len() as u64);
        buf.put_slice(reason);
    }
}

/// Application-initiated close (frame type 0x1d).
#[derive(Debug, Clone)]
pub struct ApplicationClose {
    pub error_code: u64,
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.error_code)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl ApplicationClose {
    pub fn encode<W: BufMut>(&self, buf: &mut W, max_len: usize) {
        buf.put_var(Type::APPLICATION_CLOSE.0);
        buf.put_var(self.error_code);
        let reason = bound_reason(&self.reason, max_len);
        buf.put_var(reason.len() as u64);
        buf.put_slice(reason);
    }
}

fn bound_reason(reason: &Bytes, max_len: usize) -> &[u8] {
    if reason.len() > max_len {
        &reason[..max_len]
    } else {
        &reason[..]
    }
}

/// Walks the frames of a decrypted payload. Yields `Frame::Invalid` and
/// stops on the first malformed frame.
pub struct Iter {
    bytes: Bytes,
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Iter { bytes: payload }
    }

    fn try_next(&mut self) -> Result<Frame, UnexpectedEnd> {
        let ty = Type(self.bytes.get_var()?);
        Ok(match ty {
            Type::PADDING => {
                // Consume the whole run in one step.
                while self.bytes.has_remaining() && self.bytes[0] == 0 {
                    self.bytes.advance(1);
                }
                Frame::Padding
            }
            Type::PING => Frame::Ping,
            Type::ACK => Frame::Ack(Ack::decode(&mut self.bytes, false)?),
            Type::ACK_ECN => Frame::Ack(Ack::decode(&mut self.bytes, true)?),
            Type::RESET_STREAM => Frame::ResetStream {
                id: StreamId(self.bytes.get_var()?),
                error_code: self.bytes.get_var()?,
                final_size: self.bytes.get_var()?,
            },
            Type::STOP_SENDING => Frame::StopSending {
                id: StreamId(self.bytes.get_var()?),
                error_code: self.bytes.get_var()?,
            },
            Type::CRYPTO => {
                let offset = self.bytes.get_var()?;
                let len = self.bytes.get_var()? as usize;
                Frame::Crypto(Crypto {
                    offset,
                    data: self.bytes.take_checked(len)?,
                })
            }
            Type::NEW_TOKEN => {
                let len = self.bytes.get_var()? as usize;
                if len == 0 {
                    return Err(UnexpectedEnd);
                }
                Frame::NewToken {
                    token: self.bytes.take_checked(len)?,
                }
            }
            Type::MAX_DATA => Frame::MaxData(self.bytes.get_var()?),
            Type::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_BIDI => Frame::MaxStreams {
                directionality: Directionality::Bi,
                count: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_UNI => Frame::MaxStreams {
                directionality: Directionality::Uni,
                count: self.bytes.get_var()?,
            },
            Type::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var()?,
            },
            Type::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            Type::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                directionality: Directionality::Bi,
                limit: self.bytes.get_var()?,
            },
            Type::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                directionality: Directionality::Uni,
                limit: self.bytes.get_var()?,
            },
            Type::NEW_CONNECTION_ID => {
                let sequence = self.bytes.get_var()?;
                let retire_prior_to = self.bytes.get_var()?;
                let len = self.bytes.get_u8_checked()? as usize;
                if len < crate::MIN_CID_SIZE || len > crate::MAX_CID_SIZE {
                    return Err(UnexpectedEnd);
                }
                let id = ConnectionId::new(&self.bytes.take_checked(len)?);
                let mut reset_token = [0; RESET_TOKEN_SIZE];
                reset_token.copy_from_slice(&self.bytes.take_checked(RESET_TOKEN_SIZE)?);
                Frame::NewConnectionId(NewConnectionId {
                    sequence,
                    retire_prior_to,
                    id,
                    reset_token,
                })
            }
            Type::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: self.bytes.get_var()?,
            },
            Type::PATH_CHALLENGE => {
                let mut data = [0; 8];
                data.copy_from_slice(&self.bytes.take_checked(8)?);
                Frame::PathChallenge(data)
            }
            Type::PATH_RESPONSE => {
                let mut data = [0; 8];
                data.copy_from_slice(&self.bytes.take_checked(8)?);
                Frame::PathResponse(data)
            }
            Type::CONNECTION_CLOSE => {
                let error_code = self.bytes.get_var()?;
                let frame_type = self.bytes.get_var()?;
                let len = self.bytes.get_var()? as usize;
                Frame::ConnectionClose(ConnectionClose {
                    error_code,
                    frame_type,
                    reason: self.bytes.take_checked(len)?,
                })
            }
            Type::APPLICATION_CLOSE => {
                let error_code = self.bytes.get_var()?;
                let len = self.bytes.get_var()? as usize;
                Frame::ApplicationClose(ApplicationClose {
                    error_code,
                    reason: self.bytes.take_checked(len)?,
                })
            }
            _ if ty.is_stream() => {
                let id = StreamId(self.bytes.get_var()?);
                let offset = if ty.0 & Type::STREAM_OFF != 0 {
                    self.bytes.get_var()?
                } else {
                    0
                };
                let data = if ty.0 & Type::STREAM_LEN != 0 {
                    let len = self.bytes.get_var()? as usize;
                    self.bytes.take_checked(len)?
                } else {
                    self.bytes.split_to(self.bytes.len())
                };
                Frame::Stream(Stream {
                    id,
                    offset,
                    fin: ty.0 & Type::STREAM_FIN != 0,
                    data,
                })
            }
            _ => {
                self.bytes.clear();
                return Ok(Frame::Invalid(ty));
            }
        })
    }
}

impl Iterator for Iter {
    type Item = Frame;
    fn next(&mut self) -> Option<Frame> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(frame) => Some(frame),
            Err(UnexpectedEnd) => {
                self.bytes.clear();
                Some(Frame::Invalid(Type::PADDING))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn frames(buf: Vec<u8>) -> Vec<Frame> {
        Iter::new(Bytes::from(buf)).collect()
    }

    #[test]
    fn ack_round_trip() {
        let mut ranges = RangeSet::new();
        ranges.insert(0..3);
        ranges.insert(5..6);
        ranges.insert(9..12);
        let mut buf = Vec::new();
        Ack::encode(42, &ranges, &mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        match decoded[0] {
            Frame::Ack(ref ack) => {
                assert_eq!(ack.largest, 11);
                assert_eq!(ack.delay, 42);
                assert_eq!(ack.ranges, ranges);
                assert!(ack.ecn.is_none());
            }
            ref x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn new_connection_id_round_trip() {
        let frame = NewConnectionId {
            sequence: 3,
            retire_prior_to: 1,
            id: ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]),
            reset_token: [0xaa; RESET_TOKEN_SIZE],
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_matches!(
            frames(buf).as_slice(),
            [Frame::NewConnectionId(ref got)] if got.sequence == 3
                && got.retire_prior_to == 1
                && got.id == frame.id
                && got.reset_token == frame.reset_token
        );
    }

    #[test]
    fn connection_close_reason_is_bounded() {
        let close = ConnectionClose {
            error_code: 0xA,
            frame_type: 0,
            reason: Bytes::from_static(b"detailed explanation"),
        };
        let mut buf = Vec::new();
        close.encode(&mut buf, 8);
        match frames(buf).pop().unwrap() {
            Frame::ConnectionClose(got) => {
                assert_eq!(got.error_code, 0xA);
                assert_eq!(&got.reason[..], b"detailed");
            }
            x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn stream_implicit_length_consumes_rest() {
        let frame = Stream {
            id: StreamId(4),
            offset: 10,
            fin: true,
            data: Bytes::from_static(b"tail"),
        };
        let mut buf = Vec::new();
        frame.encode(false, &mut buf);
        match frames(buf).pop().unwrap() {
            Frame::Stream(got) => {
                assert_eq!(got.id, StreamId(4));
                assert_eq!(got.offset, 10);
                assert!(got.fin);
                assert_eq!(&got.data[..], b"tail");
            }
            x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn padding_runs_collapse() {
        let mut buf = vec![0u8; 7];
        buf.push(Type::PING.0 as u8);
        let got = frames(buf);
        assert_matches!(got.as_slice(), [Frame::Padding, Frame::Ping]);
    }

    #[test]
    fn truncated_frame_is_invalid() {
        let buf = vec![Type::CRYPTO.0 as u8, 0x00, 0x4f];
        let got = frames(buf);
        assert_matches!(got.as_slice(), [Frame::Invalid(_)]);
    }
}
