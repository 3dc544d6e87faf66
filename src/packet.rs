//! QUIC v1 packet headers: encoding, invariant parsing, and packet numbers.

use std::fmt;
use std::ops;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use failure::Fail;
use rand::Rng;

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::crypto::PacketKey;
use crate::{AEAD_TAG_SIZE, HP_SAMPLE_SIZE, MAX_CID_SIZE, RESET_TOKEN_SIZE, VERSION};

/// An opaque connection identifier of up to 20 bytes.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(data: &[u8]) -> Self {
        debug_assert!(data.len() <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        ConnectionId {
            len: data.len() as u8,
            bytes,
        }
    }

    pub fn random<R: Rng>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rng.fill(&mut bytes[..len]);
        ConnectionId {
            len: len as u8,
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl slog::Value for ConnectionId {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// A truncated packet number, encoded relative to the largest acknowledged.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U32(u32),
}

impl PacketNumber {
    pub fn new(n: u64, largest_acked: u64) -> Self {
        // Twice the unacknowledged range must be representable.
        let range = (n.saturating_sub(largest_acked)) * 2;
        if range < 1 << 8 {
            PacketNumber::U8(n as u8)
        } else if range < 1 << 16 {
            PacketNumber::U16(n as u16)
        } else {
            PacketNumber::U32(n as u32)
        }
    }

    pub fn len(self) -> usize {
        match self {
            PacketNumber::U8(_) => 1,
            PacketNumber::U16(_) => 2,
            PacketNumber::U32(_) => 4,
        }
    }

    pub fn encode<W: BufMut>(self, buf: &mut W) {
        match self {
            PacketNumber::U8(x) => buf.put_u8(x),
            PacketNumber::U16(x) => buf.put_u16(x),
            PacketNumber::U32(x) => buf.put_u32(x),
        }
    }
}

/// Expand a truncated packet number to the full number nearest `expected`
/// whose low `len` bytes match `truncated`.
pub fn decompress(expected: u64, truncated: u64, len: usize) -> u64 {
    debug_assert!(len >= 1 && len <= 4);
    let win = 1u64 << (8 * len as u32);
    let hwin = win >> 1;
    let mask = win - 1;
    let candidate = (expected & !mask) | truncated;
    if expected > hwin && candidate <= expected - hwin && candidate < (1u64 << 62) - win {
        candidate + win
    } else if candidate > expected + hwin && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

/// Long header packet types.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0x0 => LongType::Initial,
            0x1 => LongType::ZeroRtt,
            0x2 => LongType::Handshake,
            _ => LongType::Retry,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            LongType::Initial => 0x0,
            LongType::ZeroRtt => 0x1,
            LongType::Handshake => 0x2,
            LongType::Retry => 0x3,
        }
    }
}

impl slog::Value for LongType {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

/// An outgoing packet header.
#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        odcid: ConnectionId,
        token: Bytes,
    },
    Short {
        dst_cid: ConnectionId,
        number: PacketNumber,
        spin: bool,
        key_phase: bool,
    },
}

impl Header {
    /// Write the header. Packet-number bytes and (for long headers) the
    /// length field are finalized later via the returned [`PartialEncode`].
    pub fn encode(&self, buf: &mut Vec<u8>) -> PartialEncode {
        use self::Header::*;
        match *self {
            Initial {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
            } => {
                buf.put_u8(0xc0 | (number.len() as u8 - 1));
                buf.put_u32(VERSION);
                Self::put_cid(buf, dst_cid);
                Self::put_cid(buf, src_cid);
                buf.put_var(token.len() as u64);
                buf.extend_from_slice(token);
                let len_pos = buf.len();
                buf.put_u16(0x4000);
                let pn_pos = buf.len();
                number.encode(buf);
                PartialEncode {
                    pn_pos: Some(pn_pos),
                    pn_len: number.len(),
                    len_pos: Some(len_pos),
                    is_short: false,
                }
            }
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                debug_assert!(ty != LongType::Initial && ty != LongType::Retry);
                buf.put_u8(0xc0 | (ty.to_bits() << 4) | (number.len() as u8 - 1));
                buf.put_u32(VERSION);
                Self::put_cid(buf, dst_cid);
                Self::put_cid(buf, src_cid);
                let len_pos = buf.len();
                buf.put_u16(0x4000);
                let pn_pos = buf.len();
                number.encode(buf);
                PartialEncode {
                    pn_pos: Some(pn_pos),
                    pn_len: number.len(),
                    len_pos: Some(len_pos),
                    is_short: false,
                }
            }
            Retry {
                ref dst_cid,
                ref src_cid,
                ref odcid,
                ref token,
            } => {
                buf.put_u8(0xf0);
                buf.put_u32(VERSION);
                Self::put_cid(buf, dst_cid);
                Self::put_cid(buf, src_cid);
                buf.put_u8(odcid.len() as u8);
                buf.extend_from_slice(odcid);
                buf.extend_from_slice(token);
                PartialEncode {
                    pn_pos: None,
                    pn_len: 0,
                    len_pos: None,
                    is_short: false,
                }
            }
            Short {
                ref dst_cid,
                number,
                spin,
                key_phase,
            } => {
                buf.put_u8(
                    0x40 | ((spin as u8) << 5)
                        | ((key_phase as u8) << 2)
                        | (number.len() as u8 - 1),
                );
                buf.extend_from_slice(dst_cid);
                let pn_pos = buf.len();
                number.encode(buf);
                PartialEncode {
                    pn_pos: Some(pn_pos),
                    pn_len: number.len(),
                    len_pos: None,
                    is_short: true,
                }
            }
        }
    }

    fn put_cid(buf: &mut Vec<u8>, cid: &ConnectionId) {
        buf.put_u8(cid.len() as u8);
        buf.extend_from_slice(cid);
    }
}

/// Book-keeping for finalizing an encoded header once the payload is known.
#[derive(Debug, Copy, Clone)]
pub struct PartialEncode {
    pub pn_pos: Option<usize>,
    pub pn_len: usize,
    pub len_pos: Option<usize>,
    pub is_short: bool,
}

impl PartialEncode {
    /// Fill in a long header's length field. Called with the buffer holding
    /// header plus plaintext payload, before the AEAD tag is appended.
    pub fn set_payload_length(&self, buf: &mut [u8]) {
        let len_pos = self.len_pos.expect("not a long header");
        let pn_pos = self.pn_pos.unwrap();
        let length = buf.len() - pn_pos + AEAD_TAG_SIZE;
        debug_assert!(length < (1 << 14));
        buf[len_pos] = 0x40 | (length >> 8) as u8;
        buf[len_pos + 1] = length as u8;
    }

    /// Apply header protection. Called after the payload has been sealed.
    pub fn finish(&self, buf: &mut [u8], key: &PacketKey) {
        let pn_pos = self.pn_pos.expect("unprotected header");
        let sample_start = pn_pos + 4;
        let mask = key.hp_mask(&buf[sample_start..sample_start + HP_SAMPLE_SIZE]);
        if self.is_short {
            buf[0] ^= mask[0] & 0x1f;
        } else {
            buf[0] ^= mask[0] & 0x0f;
        }
        for i in 0..self.pn_len {
            buf[pn_pos + i] ^= mask[1 + i];
        }
    }
}

#[derive(Debug, Fail)]
pub enum PacketDecodeError {
    #[fail(display = "unsupported version {:#x}", version)]
    UnsupportedVersion { version: u32 },
    #[fail(display = "invalid header: {}", _0)]
    InvalidHeader(&'static str),
}

impl From<UnexpectedEnd> for PacketDecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        PacketDecodeError::InvalidHeader("unexpected end of packet")
    }
}

/// One QUIC packet split out of a datagram, parsed up to (but not including)
/// header-protection removal.
#[derive(Debug)]
pub struct PartialDecode {
    pub is_short: bool,
    pub long_ty: Option<LongType>,
    pub version: u32,
    pub dst_cid: ConnectionId,
    pub src_cid: ConnectionId,
    /// Initial token, or the Retry token for Retry packets.
    pub token: Bytes,
    /// Original destination CID echoed inside a Retry packet.
    pub retry_odcid: Option<ConnectionId>,
    /// Integrity tag trailing a Retry packet.
    pub retry_tag: [u8; RESET_TOKEN_SIZE],
    /// Offset of the (protected) packet number within `packet`.
    pub pn_offset: usize,
    /// Exactly this packet's bytes.
    pub packet: BytesMut,
    pub spin: bool,
    pub key_phase: bool,
}

impl PartialDecode {
    /// Split the first QUIC packet off `data` and validate its invariant
    /// header. Returns the parse and any remaining coalesced bytes.
    pub fn new(
        data: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = ::std::io::Cursor::new(&data[..]);
        let first = buf.get_u8_checked()?;
        let pos = buf.position() as usize;
        if first & 0x80 != 0 {
            Self::new_long(first, data, pos)
        } else {
            Self::new_short(first, data, local_cid_len)
        }
    }

    fn new_long(
        first: u8,
        mut data: BytesMut,
        start: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = ::std::io::Cursor::new(&data[..]);
        buf.advance(start);
        let version = buf.get_u32_checked()?;
        let dst_cid = Self::get_cid(&mut buf)?;
        let src_cid = Self::get_cid(&mut buf)?;
        if version != VERSION {
            return Err(PacketDecodeError::UnsupportedVersion { version });
        }
        if first & 0x40 == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit not set"));
        }
        let ty = LongType::from_bits(first >> 4);
        match ty {
            LongType::Retry => {
                // version byte layout: odcid length, odcid, token, 16-byte tag
                let odcid_len = buf.get_u8_checked()? as usize;
                if odcid_len > MAX_CID_SIZE {
                    return Err(PacketDecodeError::InvalidHeader("oversized ODCID"));
                }
                let odcid = ConnectionId::new(&buf.take_checked(odcid_len)?);
                let rest = buf.remaining();
                if rest < RESET_TOKEN_SIZE {
                    return Err(PacketDecodeError::InvalidHeader("no room for retry tag"));
                }
                let token = buf.take_checked(rest - RESET_TOKEN_SIZE)?;
                let mut retry_tag = [0; RESET_TOKEN_SIZE];
                retry_tag.copy_from_slice(&buf.take_checked(RESET_TOKEN_SIZE)?);
                Ok((
                    PartialDecode {
                        is_short: false,
                        long_ty: Some(LongType::Retry),
                        version,
                        dst_cid,
                        src_cid,
                        token,
                        retry_odcid: Some(odcid),
                        retry_tag,
                        pn_offset: 0,
                        packet: data,
                        spin: false,
                        key_phase: false,
                    },
                    None,
                ))
            }
            _ => {
                let token = if let LongType::Initial = ty {
                    let token_len = buf.get_var()?;
                    if token_len > buf.remaining() as u64 {
                        return Err(PacketDecodeError::InvalidHeader("token too long"));
                    }
                    buf.take_checked(token_len as usize)?
                } else {
                    Bytes::new()
                };
                let length = buf.get_var()?;
                let pn_offset = buf.position() as usize;
                let end = pn_offset
                    .checked_add(length as usize)
                    .ok_or(PacketDecodeError::InvalidHeader("length overflow"))?;
                if end > data.len() {
                    return Err(PacketDecodeError::InvalidHeader("payload longer than packet"));
                }
                let packet = data.split_to(end);
                let rest = if data.is_empty() { None } else { Some(data) };
                Ok((
                    PartialDecode {
                        is_short: false,
                        long_ty: Some(ty),
                        version,
                        dst_cid,
                        src_cid,
                        token,
                        retry_odcid: None,
                        retry_tag: [0; RESET_TOKEN_SIZE],
                        pn_offset,
                        packet,
                        spin: false,
                        key_phase: false,
                    },
                    rest,
                ))
            }
        }
    }

    fn new_short(
        first: u8,
        data: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        if first & 0x40 == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit not set"));
        }
        if data.len() < 1 + local_cid_len {
            return Err(PacketDecodeError::InvalidHeader("truncated destination CID"));
        }
        let dst_cid = ConnectionId::new(&data[1..1 + local_cid_len]);
        // Spin and key phase bits are only meaningful after unmasking; carry
        // the raw values for callers that re-read them post-decryption.
        Ok((
            PartialDecode {
                is_short: true,
                long_ty: None,
                version: 0,
                dst_cid,
                src_cid: ConnectionId::new(&[]),
                token: Bytes::new(),
                retry_odcid: None,
                retry_tag: [0; RESET_TOKEN_SIZE],
                pn_offset: 1 + local_cid_len,
                packet: data,
                spin: first & 0x20 != 0,
                key_phase: first & 0x04 != 0,
            },
            None,
        ))
    }

    fn get_cid(buf: &mut ::std::io::Cursor<&[u8]>) -> Result<ConnectionId, PacketDecodeError> {
        let len = buf.get_u8_checked()? as usize;
        if len > MAX_CID_SIZE {
            return Err(PacketDecodeError::InvalidHeader("oversized CID"));
        }
        Ok(ConnectionId::new(&buf.take_checked(len)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pn_decompress_nearest() {
        // RFC 9000 appendix A.3: largest acked 0xa82f30ea, 16-bit 0x9b32.
        assert_eq!(decompress(0xa82f_30eb, 0x9b32, 2), 0xa82f_9b32);
        // Wraps forward across the window boundary.
        assert_eq!(decompress(0x1_00, 0x01, 1), 0x1_01);
        assert_eq!(decompress(0x1_ff, 0x01, 1), 0x2_01);
        // Low expectations never underflow.
        assert_eq!(decompress(0, 0x05, 1), 0x05);
    }

    #[test]
    fn pn_decompress_matches_low_bytes() {
        for &expected in &[0u64, 255, 256, 0xfffe, 0x12_3456, 0xdead_beef] {
            for &len in &[1usize, 2, 4] {
                let truncated = expected & ((1u64 << (8 * len as u32)) - 1);
                let got = decompress(expected, truncated, len);
                assert_eq!(got & ((1u64 << (8 * len as u32)) - 1), truncated);
            }
        }
    }

    #[test]
    fn packet_number_len() {
        assert_eq!(PacketNumber::new(5, 0).len(), 1);
        assert_eq!(PacketNumber::new(500, 0).len(), 2);
        assert_eq!(PacketNumber::new(1 << 20, 0).len(), 4);
    }

    #[test]
    fn initial_header_round_trip() {
        let dst_cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let src_cid = ConnectionId::new(&[9, 10, 11, 12]);
        let header = Header::Initial {
            dst_cid,
            src_cid,
            token: Bytes::from_static(b"tok"),
            number: PacketNumber::U8(0),
        };
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        // Fake payload so the length field covers something real.
        buf.extend_from_slice(&[0; 32]);
        partial.set_payload_length(&mut buf);

        let (decode, rest) = PartialDecode::new(BytesMut::from(&buf[..]), 8).unwrap();
        assert!(rest.is_none());
        assert!(!decode.is_short);
        assert_eq!(decode.long_ty, Some(LongType::Initial));
        assert_eq!(decode.dst_cid, dst_cid);
        assert_eq!(decode.src_cid, src_cid);
        assert_eq!(&decode.token[..], b"tok");
        assert_eq!(decode.pn_offset, partial.pn_pos.unwrap());
    }

    #[test]
    fn short_header_round_trip() {
        let dst_cid = ConnectionId::new(&[0xab; 8]);
        let header = Header::Short {
            dst_cid,
            number: PacketNumber::U16(77),
            spin: true,
            key_phase: false,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        buf.extend_from_slice(&[0; 24]);
        let (decode, rest) = PartialDecode::new(BytesMut::from(&buf[..]), 8).unwrap();
        assert!(rest.is_none());
        assert!(decode.is_short);
        assert_eq!(decode.dst_cid, dst_cid);
        assert!(decode.spin);
        assert_eq!(decode.pn_offset, 9);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buf = vec![0xc0];
        buf.extend_from_slice(&0xdead_beefu32.to_be_bytes());
        buf.extend_from_slice(&[0, 0]); // empty cids
        match PartialDecode::new(BytesMut::from(&buf[..]), 0) {
            Err(PacketDecodeError::UnsupportedVersion { version }) => {
                assert_eq!(version, 0xdead_beef)
            }
            x => panic!("unexpected result: {:?}", x.map(|_| ())),
        }
    }
}
