//! Primitive and variable-length integer codecs used by the wire format.

use bytes::{Buf, BufMut};
use failure::Fail;

use crate::VAR_INT_MAX;

/// Decoding ran off the end of the buffer or hit an illegal encoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
#[fail(display = "unexpected end of buffer")]
pub struct UnexpectedEnd;

pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

pub trait BufExt {
    fn get_u8_checked(&mut self) -> Result<u8>;
    fn get_u16_checked(&mut self) -> Result<u16>;
    fn get_u32_checked(&mut self) -> Result<u32>;
    /// Decode a variable-length integer with a 2-bit length prefix.
    fn get_var(&mut self) -> Result<u64>;
    fn take_checked(&mut self, n: usize) -> Result<bytes::Bytes>;
}

impl<T: Buf> BufExt for T {
    fn get_u8_checked(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u8())
    }

    fn get_u16_checked(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u16())
    }

    fn get_u32_checked(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u32())
    }

    fn get_var(&mut self) -> Result<u64> {
        if self.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        let first = self.get_u8();
        let len = 1 << (first >> 6);
        let mut x = u64::from(first & 0x3f);
        if self.remaining() < len - 1 {
            return Err(UnexpectedEnd);
        }
        for _ in 1..len {
            x = (x << 8) | u64::from(self.get_u8());
        }
        Ok(x)
    }

    fn take_checked(&mut self, n: usize) -> Result<bytes::Bytes> {
        if self.remaining() < n {
            return Err(UnexpectedEnd);
        }
        Ok(self.copy_to_bytes(n))
    }
}

pub trait BufMutExt {
    /// Encode a variable-length integer. Panics on values above
    /// [`VAR_INT_MAX`], which cannot be represented.
    fn put_var(&mut self, x: u64);
}

impl<T: BufMut> BufMutExt for T {
    fn put_var(&mut self, x: u64) {
        assert!(x <= VAR_INT_MAX, "var int too large");
        if x < 1 << 6 {
            self.put_u8(x as u8);
        } else if x < 1 << 14 {
            self.put_u16(0x4000 | x as u16);
        } else if x < 1 << 30 {
            self.put_u32(0x8000_0000 | x as u32);
        } else {
            self.put_u64(0xc000_0000_0000_0000 | x);
        }
    }
}

/// Number of bytes the var-int encoding of `x` occupies.
pub fn var_len(x: u64) -> usize {
    if x < 1 << 6 {
        1
    } else if x < 1 << 14 {
        2
    } else if x < 1 << 30 {
        4
    } else {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(x: u64) -> (usize, u64) {
        let mut buf = Vec::new();
        buf.put_var(x);
        let len = buf.len();
        let mut cur = Cursor::new(buf);
        (len, cur.get_var().unwrap())
    }

    #[test]
    fn var_int_boundaries() {
        for &(x, len) in &[
            (0u64, 1usize),
            (63, 1),
            (64, 2),
            (16_383, 2),
            (16_384, 4),
            ((1 << 30) - 1, 4),
            (1 << 30, 8),
            (VAR_INT_MAX, 8),
        ] {
            let (encoded_len, decoded) = round_trip(x);
            assert_eq!(encoded_len, len, "length for {}", x);
            assert_eq!(decoded, x);
            assert_eq!(var_len(x), len);
        }
    }

    #[test]
    fn var_int_known_vectors() {
        // Examples from RFC 9000 appendix A.1
        let mut cur = Cursor::new(&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c][..]);
        assert_eq!(cur.get_var().unwrap(), 151_288_809_941_952_652);
        let mut cur = Cursor::new(&[0x9d, 0x7f, 0x3e, 0x7d][..]);
        assert_eq!(cur.get_var().unwrap(), 494_878_333);
        let mut cur = Cursor::new(&[0x7b, 0xbd][..]);
        assert_eq!(cur.get_var().unwrap(), 15_293);
        let mut cur = Cursor::new(&[0x25][..]);
        assert_eq!(cur.get_var().unwrap(), 37);
    }

    #[test]
    fn truncated_var_int() {
        let mut cur = Cursor::new(&[0x40][..]);
        assert_eq!(cur.get_var(), Err(UnexpectedEnd));
    }
}
