use std::{fmt, io};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;

use coding::{self, BufExt, BufMutExt};
use crypto::HeaderKey;
use {MAX_CID_SIZE, VERSION};

pub const AEAD_TAG_SIZE: usize = 16;

/// Short opaque identifier routing datagrams to a session independently of
/// addressing
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(data: &[u8]) -> Self {
        debug_assert!(data.len() <= MAX_CID_SIZE);
        let mut x = ConnectionId {
            len: data.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        x.bytes[..data.len()].copy_from_slice(data);
        x
    }

    pub fn random<R: Rng>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut x = ConnectionId {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut x.bytes[..len]);
        x
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl ::slog::Value for ConnectionId {
    fn serialize(
        &self,
        _: &::slog::Record,
        key: ::slog::Key,
        serializer: &mut ::slog::Serializer,
    ) -> ::slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Handshake,
    ZeroRtt,
}

#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Bytes,
    },
    Short {
        dst_cid: ConnectionId,
        number: PacketNumber,
        key_phase: bool,
    },
    VersionNegotiate {
        random: u8,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
}

impl Header {
    /// Write the header, leaving a placeholder for long-header payload
    /// lengths to be patched by `set_payload_length`
    pub fn encode(&self, buf: &mut Vec<u8>) -> PartialEncode {
        use self::Header::*;
        match *self {
            Initial {
                ref src_cid,
                ref dst_cid,
                ref token,
                number,
            } => {
                buf.write::<u8>(0b1100_0000 | number.len() as u8 - 1);
                buf.write(VERSION);
                Self::encode_cids(buf, dst_cid, src_cid);
                buf.write_var(token.len() as u64);
                buf.put_slice(token);
                buf.write::<u16>(0b01 << 14); // length placeholder
                let pn_offset = buf.len();
                number.encode(buf);
                PartialEncode {
                    pn_offset: Some(pn_offset),
                    pn_len: number.len(),
                    short: false,
                }
            }
            Long {
                ty,
                ref src_cid,
                ref dst_cid,
                number,
            } => {
                let ty_bits = match ty {
                    LongType::ZeroRtt => 0b01,
                    LongType::Handshake => 0b10,
                };
                buf.write::<u8>(0b1100_0000 | ty_bits << 4 | number.len() as u8 - 1);
                buf.write(VERSION);
                Self::encode_cids(buf, dst_cid, src_cid);
                buf.write::<u16>(0b01 << 14); // length placeholder
                let pn_offset = buf.len();
                number.encode(buf);
                PartialEncode {
                    pn_offset: Some(pn_offset),
                    pn_len: number.len(),
                    short: false,
                }
            }
            Retry {
                ref src_cid,
                ref dst_cid,
                ref token,
            } => {
                buf.write::<u8>(0b1111_0000);
                buf.write(VERSION);
                Self::encode_cids(buf, dst_cid, src_cid);
                buf.put_slice(token);
                PartialEncode {
                    pn_offset: None,
                    pn_len: 0,
                    short: false,
                }
            }
            Short {
                ref dst_cid,
                number,
                key_phase,
            } => {
                buf.write::<u8>(
                    0b0100_0000 | (key_phase as u8) << 2 | number.len() as u8 - 1,
                );
                buf.put_slice(dst_cid);
                let pn_offset = buf.len();
                number.encode(buf);
                PartialEncode {
                    pn_offset: Some(pn_offset),
                    pn_len: number.len(),
                    short: true,
                }
            }
            VersionNegotiate {
                random,
                ref src_cid,
                ref dst_cid,
            } => {
                buf.write::<u8>(0b1000_0000 | random & 0x7f);
                buf.write::<u32>(0);
                Self::encode_cids(buf, dst_cid, src_cid);
                PartialEncode {
                    pn_offset: None,
                    pn_len: 0,
                    short: false,
                }
            }
        }
    }

    fn encode_cids(buf: &mut Vec<u8>, dst_cid: &ConnectionId, src_cid: &ConnectionId) {
        buf.write::<u8>(dst_cid.len() as u8);
        buf.put_slice(dst_cid);
        buf.write::<u8>(src_cid.len() as u8);
        buf.put_slice(src_cid);
    }
}

/// Records where the packet number landed so header protection can be
/// applied once the payload has been sealed
#[derive(Debug, Copy, Clone)]
pub struct PartialEncode {
    pn_offset: Option<usize>,
    pn_len: usize,
    short: bool,
}

impl PartialEncode {
    /// Mask the first byte's low bits and the packet number. The sealed
    /// payload must extend at least `4 - pn_len + 16` bytes past the packet
    /// number so a sample exists.
    pub fn finish(&self, buf: &mut [u8], header_key: &HeaderKey) {
        let pn_offset = match self.pn_offset {
            Some(x) => x,
            None => return,
        };
        let sample_offset = pn_offset + 4;
        debug_assert!(buf.len() >= sample_offset + ::crypto::HP_SAMPLE_SIZE);
        let mask = {
            let sample = &buf[sample_offset..sample_offset + ::crypto::HP_SAMPLE_SIZE];
            header_key.mask(sample)
        };
        buf[0] ^= mask[0] & if self.short { 0x1f } else { 0x0f };
        for i in 0..self.pn_len {
            buf[pn_offset + i] ^= mask[1 + i];
        }
    }
}

/// Patch a long header's length field once the payload is known. `header_len`
/// is the offset one past the packet number.
pub fn set_payload_length(buf: &mut [u8], header_len: usize, pn_len: usize) {
    let len = buf.len() - header_len + pn_len + AEAD_TAG_SIZE;
    assert!(len < 2usize.pow(14));
    BigEndian::write_u16(
        &mut buf[header_len - pn_len - 2..],
        len as u16 | 0b01 << 14,
    );
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub fn new(n: u64, largest_acked: u64) -> Self {
        if largest_acked == 0 {
            return PacketNumber::U32(n as u32);
        }
        let range = (n - largest_acked) / 2;
        if range < 1 << 7 {
            PacketNumber::U8(n as u8)
        } else if range < 1 << 15 {
            PacketNumber::U16(n as u16)
        } else if range < 1 << 31 {
            PacketNumber::U32(n as u32)
        } else {
            panic!("packet number too large to encode")
        }
    }

    pub fn len(self) -> usize {
        use self::PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    fn encode<W: BufMut>(self, w: &mut W) {
        use self::PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => {
                w.write::<u8>((x >> 16) as u8);
                w.write::<u16>(x as u16);
            }
            U32(x) => w.write(x),
        }
    }

    fn decode(len: usize, r: &mut io::Cursor<&[u8]>) -> coding::Result<Self> {
        use self::PacketNumber::*;
        Ok(match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            3 => {
                let hi: u8 = r.get()?;
                let lo: u16 = r.get()?;
                U24(u32::from(hi) << 16 | u32::from(lo))
            }
            4 => U32(r.get()?),
            _ => unreachable!(),
        })
    }

    /// Recover the full packet number given the largest successfully
    /// processed packet number
    pub fn expand(self, largest: u64) -> u64 {
        use self::PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) | U32(x) => u64::from(x),
        };
        let nbits = self.len() as u64 * 8;
        let expected = largest + 1;
        let win = 1u64 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        let candidate = (expected & !mask) | truncated;
        if candidate + hwin <= expected && candidate + win < 1 << 62 {
            candidate + win
        } else if candidate > expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

pub struct Packet {
    pub header: Header,
    /// The bytes the header occupied, with protection removed; AEAD
    /// associated data
    pub header_data: Bytes,
    pub payload: BytesMut,
}

#[derive(Debug, Fail)]
pub enum PacketDecodeError {
    #[fail(display = "unsupported version")]
    UnsupportedVersion {
        source: ConnectionId,
        destination: ConnectionId,
    },
    #[fail(display = "invalid header: {}", _0)]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        PacketDecodeError::InvalidHeader("unexpected end of packet")
    }
}

enum PlainHeader {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        len: u64,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
    Short {
        dst_cid: ConnectionId,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

/// A datagram prefix parsed up to the packet number, sufficient to route it
/// and select keys; `finish` removes header protection and isolates the
/// payload
pub struct PartialDecode {
    plain: PlainHeader,
    /// Offset of the packet number (or, for unprotected headers, the body)
    off: usize,
    buf: BytesMut,
}

impl PartialDecode {
    pub fn new(buf: BytesMut, local_cid_len: usize) -> Result<Self, PacketDecodeError> {
        let (plain, off) = {
            let mut r = io::Cursor::new(&buf[..]);
            let first: u8 = r.get()?;
            if first & 0x80 != 0 {
                // long form
                let version: u32 = r.get()?;
                let dst_cid = Self::get_cid(&mut r)?;
                let src_cid = Self::get_cid(&mut r)?;
                if version == 0 {
                    (
                        PlainHeader::VersionNegotiate {
                            random: first & 0x7f,
                            dst_cid,
                            src_cid,
                        },
                        r.position() as usize,
                    )
                } else if version != VERSION {
                    return Err(PacketDecodeError::UnsupportedVersion {
                        source: src_cid,
                        destination: dst_cid,
                    });
                } else {
                    match (first >> 4) & 0b11 {
                        0b00 => {
                            let token_len = r.get_var()? as usize;
                            if token_len > r.remaining() {
                                return Err(PacketDecodeError::InvalidHeader("token too long"));
                            }
                            let token_off = r.position() as usize;
                            r.set_position((token_off + token_len) as u64);
                            let token =
                                Bytes::from(&buf[token_off..token_off + token_len]);
                            let len = r.get_var()?;
                            (
                                PlainHeader::Initial {
                                    dst_cid,
                                    src_cid,
                                    token,
                                    len,
                                },
                                r.position() as usize,
                            )
                        }
                        0b01 => {
                            let len = r.get_var()?;
                            (
                                PlainHeader::Long {
                                    ty: LongType::ZeroRtt,
                                    dst_cid,
                                    src_cid,
                                    len,
                                },
                                r.position() as usize,
                            )
                        }
                        0b10 => {
                            let len = r.get_var()?;
                            (
                                PlainHeader::Long {
                                    ty: LongType::Handshake,
                                    dst_cid,
                                    src_cid,
                                    len,
                                },
                                r.position() as usize,
                            )
                        }
                        0b11 => (
                            PlainHeader::Retry { dst_cid, src_cid },
                            r.position() as usize,
                        ),
                        _ => unreachable!(),
                    }
                }
            } else {
                if first & 0x40 == 0 {
                    return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
                }
                if r.remaining() < local_cid_len {
                    return Err(PacketDecodeError::InvalidHeader("destination id truncated"));
                }
                let pos = r.position() as usize;
                let dst_cid = ConnectionId::new(&buf[pos..pos + local_cid_len]);
                (PlainHeader::Short { dst_cid }, pos + local_cid_len)
            }
        };
        Ok(PartialDecode { plain, off, buf })
    }

    pub fn has_long_header(&self) -> bool {
        match self.plain {
            PlainHeader::Short { .. } => false,
            _ => true,
        }
    }

    pub fn is_initial(&self) -> bool {
        match self.plain {
            PlainHeader::Initial { .. } => true,
            _ => false,
        }
    }

    pub fn is_handshake(&self) -> bool {
        match self.plain {
            PlainHeader::Long {
                ty: LongType::Handshake,
                ..
            } => true,
            _ => false,
        }
    }

    pub fn is_0rtt(&self) -> bool {
        match self.plain {
            PlainHeader::Long {
                ty: LongType::ZeroRtt,
                ..
            } => true,
            _ => false,
        }
    }

    pub fn is_retry(&self) -> bool {
        match self.plain {
            PlainHeader::Retry { .. } => true,
            _ => false,
        }
    }

    pub fn is_version_negotiate(&self) -> bool {
        match self.plain {
            PlainHeader::VersionNegotiate { .. } => true,
            _ => false,
        }
    }

    /// The address-validation token of an Initial packet
    pub fn token(&self) -> Option<Bytes> {
        match self.plain {
            PlainHeader::Initial { ref token, .. } => Some(token.clone()),
            _ => None,
        }
    }

    pub fn dst_cid(&self) -> ConnectionId {
        use self::PlainHeader::*;
        match self.plain {
            Initial { dst_cid, .. }
            | Long { dst_cid, .. }
            | Retry { dst_cid, .. }
            | Short { dst_cid }
            | VersionNegotiate { dst_cid, .. } => dst_cid,
        }
    }

    /// The source CID, absent on short headers
    pub fn src_cid(&self) -> Option<ConnectionId> {
        use self::PlainHeader::*;
        match self.plain {
            Initial { src_cid, .. }
            | Long { src_cid, .. }
            | Retry { src_cid, .. }
            | VersionNegotiate { src_cid, .. } => Some(src_cid),
            Short { .. } => None,
        }
    }

    /// Remove header protection, expand the packet number, and split off any
    /// coalesced packets that follow. `header_key` may be omitted only for
    /// headers that carry no packet number.
    pub fn finish(
        self,
        header_key: Option<&HeaderKey>,
    ) -> Result<(Packet, Option<BytesMut>), PacketDecodeError> {
        let PartialDecode { plain, off, mut buf } = self;
        match plain {
            PlainHeader::VersionNegotiate {
                random,
                dst_cid,
                src_cid,
            } => {
                let header_data = Bytes::from(&buf[..off]);
                let payload = buf.split_off(off);
                Ok((
                    Packet {
                        header: Header::VersionNegotiate {
                            random,
                            src_cid,
                            dst_cid,
                        },
                        header_data,
                        payload,
                    },
                    None,
                ))
            }
            PlainHeader::Retry { dst_cid, src_cid } => {
                if buf.len() < off + AEAD_TAG_SIZE {
                    return Err(PacketDecodeError::InvalidHeader("retry too short"));
                }
                let tag_start = buf.len() - AEAD_TAG_SIZE;
                let token = Bytes::from(&buf[off..tag_start]);
                let header_data = Bytes::from(&buf[..tag_start]);
                let payload = buf.split_off(tag_start);
                Ok((
                    Packet {
                        header: Header::Retry {
                            src_cid,
                            dst_cid,
                            token,
                        },
                        header_data,
                        payload,
                    },
                    None,
                ))
            }
            PlainHeader::Initial { len, .. } | PlainHeader::Long { len, .. } => {
                let key = header_key.expect("protected header without key");
                let (number, pn_len) = Self::unprotect(&mut buf, off, key, false)?;
                if len as usize > buf.len() - off || (len as usize) < pn_len + AEAD_TAG_SIZE {
                    return Err(PacketDecodeError::InvalidHeader("bad payload length"));
                }
                let rest = {
                    let end = off + len as usize;
                    if end < buf.len() {
                        Some(buf.split_off(end))
                    } else {
                        None
                    }
                };
                let header_data = Bytes::from(&buf[..off + pn_len]);
                let payload = buf.split_off(off + pn_len);
                let header = match plain {
                    PlainHeader::Initial {
                        dst_cid,
                        src_cid,
                        token,
                        ..
                    } => Header::Initial {
                        src_cid,
                        dst_cid,
                        token,
                        number,
                    },
                    PlainHeader::Long {
                        ty,
                        dst_cid,
                        src_cid,
                        ..
                    } => Header::Long {
                        ty,
                        src_cid,
                        dst_cid,
                        number,
                    },
                    _ => unreachable!(),
                };
                Ok((
                    Packet {
                        header,
                        header_data,
                        payload,
                    },
                    rest,
                ))
            }
            PlainHeader::Short { dst_cid } => {
                let key = header_key.expect("protected header without key");
                let (number, pn_len) = Self::unprotect(&mut buf, off, key, true)?;
                let key_phase = buf[0] & 0x04 != 0;
                let header_data = Bytes::from(&buf[..off + pn_len]);
                let payload = buf.split_off(off + pn_len);
                Ok((
                    Packet {
                        header: Header::Short {
                            dst_cid,
                            number,
                            key_phase,
                        },
                        header_data,
                        payload,
                    },
                    None,
                ))
            }
        }
    }

    fn unprotect(
        buf: &mut BytesMut,
        pn_offset: usize,
        key: &HeaderKey,
        short: bool,
    ) -> Result<(PacketNumber, usize), PacketDecodeError> {
        if buf.len() < pn_offset + 4 + ::crypto::HP_SAMPLE_SIZE {
            return Err(PacketDecodeError::InvalidHeader("packet too short to sample"));
        }
        let mask = {
            let sample = &buf[pn_offset + 4..pn_offset + 4 + ::crypto::HP_SAMPLE_SIZE];
            key.mask(sample)
        };
        buf[0] ^= mask[0] & if short { 0x1f } else { 0x0f };
        let pn_len = (buf[0] & 0x03) as usize + 1;
        for i in 0..pn_len {
            buf[pn_offset + i] ^= mask[1 + i];
        }
        let number = {
            let mut r = io::Cursor::new(&buf[pn_offset..pn_offset + pn_len]);
            PacketNumber::decode(pn_len, &mut r)?
        };
        Ok((number, pn_len))
    }

    fn get_cid(r: &mut io::Cursor<&[u8]>) -> Result<ConnectionId, PacketDecodeError> {
        let len: u8 = r.get()?;
        if len as usize > MAX_CID_SIZE || r.remaining() < len as usize {
            return Err(PacketDecodeError::InvalidHeader("malformed connection id"));
        }
        let pos = r.position() as usize;
        let cid = ConnectionId::new(&r.get_ref()[pos..pos + len as usize]);
        r.set_position((pos + len as usize) as u64);
        Ok(cid)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crypto::HeaderKey;

    #[test]
    fn pn_expansion() {
        // expected-window recovery per RFC 9000 appendix A
        assert_eq!(
            PacketNumber::U16(0x9b32).expand(0xa82f_30ea),
            0xa82f_9b32
        );
        assert_eq!(PacketNumber::U8(0).expand(0xff), 0x100);
        assert_eq!(PacketNumber::U32(12).expand(11), 12);
    }

    #[test]
    fn pn_roundtrip() {
        for &(n, largest) in &[(5u64, 0u64), (300, 259), (70_000, 69_000), (2u64.pow(40), 2u64.pow(40) - 100)] {
            let pn = PacketNumber::new(n, largest);
            assert_eq!(pn.expand(largest), n);
        }
    }

    #[test]
    fn header_roundtrip() {
        let hp = HeaderKey::from_bytes([7; 16]);
        let dst_cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let number = PacketNumber::U16(42);
        let header = Header::Short {
            dst_cid,
            number,
            key_phase: true,
        };
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        let header_len = buf.len();
        buf.extend_from_slice(&[0xau8; 32]); // stand-in for sealed payload
        let unprotected = buf.clone();
        partial.finish(&mut buf, &hp);
        assert_ne!(buf[..header_len], unprotected[..header_len]);

        let decode = PartialDecode::new(buf.into(), dst_cid.len()).unwrap();
        assert!(!decode.has_long_header());
        assert_eq!(decode.dst_cid(), dst_cid);
        let (packet, rest) = decode.finish(Some(&hp)).unwrap();
        assert!(rest.is_none());
        assert_eq!(&packet.header_data[..], &unprotected[..header_len]);
        match packet.header {
            Header::Short {
                number: got,
                key_phase,
                ..
            } => {
                assert_eq!(got, number);
                assert!(key_phase);
            }
            _ => panic!("wrong header form"),
        }
    }

    #[test]
    fn long_header_splits_coalesced() {
        let hp = HeaderKey::from_bytes([3; 16]);
        let dst_cid = ConnectionId::new(&[9; 8]);
        let src_cid = ConnectionId::new(&[4; 8]);
        let header = Header::Initial {
            src_cid,
            dst_cid,
            token: Bytes::new(),
            number: PacketNumber::U8(1),
        };
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        let header_len = buf.len();
        buf.extend_from_slice(&[0u8; 4]); // payload stand-in
        set_payload_length(&mut buf, header_len, 1);
        buf.extend_from_slice(&[0u8; AEAD_TAG_SIZE]); // tag stand-in
        partial.finish(&mut buf, &hp);
        let packet_len = buf.len();
        buf.extend_from_slice(&[0x40, 0, 0, 0]); // trailing coalesced packet

        let decode = PartialDecode::new(buf.into(), 8).unwrap();
        assert!(decode.is_initial());
        let (packet, rest) = decode.finish(Some(&hp)).unwrap();
        assert_eq!(rest.as_ref().map(|x| x.len()), Some(4));
        assert_eq!(packet.payload.len() + packet.header_data.len(), packet_len);
    }
}
