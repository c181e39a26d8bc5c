use bytes::{Buf, BufMut};

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
#[fail(display = "unexpected end of buffer")]
pub struct UnexpectedEnd;

pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

pub trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u8> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u16> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16_be())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_be(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u32> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32_be())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_be(*self);
    }
}

impl Codec for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u64> {
        if buf.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u64_be())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_be(*self);
    }
}

pub trait BufExt {
    fn get<T: Codec>(&mut self) -> Result<T>;
    /// Decode a variable-length integer
    fn get_var(&mut self) -> Result<u64>;
}

impl<T: Buf> BufExt for T {
    fn get<U: Codec>(&mut self) -> Result<U> {
        U::decode(self)
    }

    fn get_var(&mut self) -> Result<u64> {
        if !self.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let first = self.get_u8();
        let len = 1 << (first >> 6);
        let mut x = u64::from(first & 0x3f);
        if self.remaining() < len - 1 {
            return Err(UnexpectedEnd);
        }
        for _ in 1..len {
            x = x << 8 | u64::from(self.get_u8());
        }
        Ok(x)
    }
}

pub trait BufMutExt {
    fn write<T: Codec>(&mut self, x: T);
    /// Encode a variable-length integer
    ///
    /// # Panics
    /// - if `x` exceeds 2^62-1
    fn write_var(&mut self, x: u64);
}

impl<T: BufMut> BufMutExt for T {
    fn write<U: Codec>(&mut self, x: U) {
        x.encode(self);
    }

    fn write_var(&mut self, x: u64) {
        if x < 2u64.pow(6) {
            self.put_u8(x as u8);
        } else if x < 2u64.pow(14) {
            self.put_u16_be(0b01 << 14 | x as u16);
        } else if x < 2u64.pow(30) {
            self.put_u32_be(0b10 << 30 | x as u32);
        } else if x < 2u64.pow(62) {
            self.put_u64_be(0b11 << 62 | x);
        } else {
            panic!("varint exceeds 62 bits");
        }
    }
}

/// Number of bytes `write_var` will use for `x`
pub fn varint_size(x: u64) -> usize {
    if x < 2u64.pow(6) {
        1
    } else if x < 2u64.pow(14) {
        2
    } else if x < 2u64.pow(30) {
        4
    } else {
        8
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(x: u64) -> u64 {
        let mut buf = Vec::new();
        buf.write_var(x);
        assert_eq!(buf.len(), varint_size(x));
        Cursor::new(buf).get_var().unwrap()
    }

    #[test]
    fn varint() {
        for &x in &[
            0,
            1,
            63,
            64,
            15_293,
            16_383,
            16_384,
            494_878_333,
            1_073_741_823,
            1_073_741_824,
            151_288_809_941_952_652,
            2u64.pow(62) - 1,
        ] {
            assert_eq!(roundtrip(x), x);
        }
    }

    #[test]
    fn varint_wire() {
        // sample encodings from RFC 9000 appendix A
        let mut buf = Vec::new();
        buf.write_var(151_288_809_941_952_652);
        assert_eq!(buf, hex!("c2197c5eff14e88c"));
        let mut buf = Vec::new();
        buf.write_var(494_878_333);
        assert_eq!(buf, hex!("9d7f3e7d"));
        let mut buf = Vec::new();
        buf.write_var(15_293);
        assert_eq!(buf, hex!("7bbd"));
    }

    #[test]
    fn truncated() {
        let mut buf = Cursor::new(hex!("c2197c5eff14e8").to_vec());
        assert_eq!(buf.get_var(), Err(UnexpectedEnd));
    }
}
