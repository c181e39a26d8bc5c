use std::ops::Range;
use std::{fmt, io, mem};

use bytes::{Buf, BufMut, Bytes};

use coding::{self, BufExt, BufMutExt};
use packet::ConnectionId;
use range_set::RangeSet;
use stream::StreamId;
use {Directionality, TransportError, MAX_CID_SIZE, RESET_TOKEN_SIZE};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Type(pub u64);

pub mod ty {
    pub const PADDING: u64 = 0x00;
    pub const PING: u64 = 0x01;
    pub const ACK: u64 = 0x02;
    pub const RESET_STREAM: u64 = 0x04;
    pub const STOP_SENDING: u64 = 0x05;
    pub const CRYPTO: u64 = 0x06;
    pub const STREAM_BASE: u64 = 0x08;
    pub const MAX_DATA: u64 = 0x10;
    pub const MAX_STREAM_DATA: u64 = 0x11;
    pub const MAX_STREAMS_BIDI: u64 = 0x12;
    pub const MAX_STREAMS_UNI: u64 = 0x13;
    pub const DATA_BLOCKED: u64 = 0x14;
    pub const STREAM_DATA_BLOCKED: u64 = 0x15;
    pub const STREAMS_BLOCKED_BIDI: u64 = 0x16;
    pub const STREAMS_BLOCKED_UNI: u64 = 0x17;
    pub const NEW_CONNECTION_ID: u64 = 0x18;
    pub const RETIRE_CONNECTION_ID: u64 = 0x19;
    pub const PATH_CHALLENGE: u64 = 0x1a;
    pub const PATH_RESPONSE: u64 = 0x1b;
    pub const CONNECTION_CLOSE: u64 = 0x1c;
    pub const APPLICATION_CLOSE: u64 = 0x1d;
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::ty::*;
        let name = match self.0 {
            PADDING => "PADDING",
            PING => "PING",
            ACK => "ACK",
            RESET_STREAM => "RESET_STREAM",
            STOP_SENDING => "STOP_SENDING",
            CRYPTO => "CRYPTO",
            x if x & !0b111 == STREAM_BASE => "STREAM",
            MAX_DATA => "MAX_DATA",
            MAX_STREAM_DATA => "MAX_STREAM_DATA",
            MAX_STREAMS_BIDI | MAX_STREAMS_UNI => "MAX_STREAMS",
            DATA_BLOCKED => "DATA_BLOCKED",
            STREAM_DATA_BLOCKED => "STREAM_DATA_BLOCKED",
            STREAMS_BLOCKED_BIDI | STREAMS_BLOCKED_UNI => "STREAMS_BLOCKED",
            NEW_CONNECTION_ID => "NEW_CONNECTION_ID",
            RETIRE_CONNECTION_ID => "RETIRE_CONNECTION_ID",
            PATH_CHALLENGE => "PATH_CHALLENGE",
            PATH_RESPONSE => "PATH_RESPONSE",
            CONNECTION_CLOSE => "CONNECTION_CLOSE",
            APPLICATION_CLOSE => "APPLICATION_CLOSE",
            _ => return write!(f, "<unknown {:02x}>", self.0),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending { id: StreamId, error_code: u16 },
    Crypto(Crypto),
    Stream(Stream),
    MaxData(u64),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { directionality: Directionality, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { directionality: Directionality, limit: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    ConnectionClose(ConnectionClose),
    ApplicationClose(ApplicationClose),
    Invalid(u64),
}

impl Frame {
    pub fn ty(&self) -> Type {
        use self::Frame::*;
        Type(match *self {
            Padding => ty::PADDING,
            Ping => ty::PING,
            Ack(_) => ty::ACK,
            ResetStream(_) => ty::RESET_STREAM,
            StopSending { .. } => ty::STOP_SENDING,
            Crypto(_) => ty::CRYPTO,
            Stream(ref x) => {
                let mut t = ty::STREAM_BASE;
                if x.offset != 0 {
                    t |= 0x04;
                }
                if x.fin {
                    t |= 0x01;
                }
                t
            }
            MaxData(_) => ty::MAX_DATA,
            MaxStreamData { .. } => ty::MAX_STREAM_DATA,
            MaxStreams {
                directionality: Directionality::Bi,
                ..
            } => ty::MAX_STREAMS_BIDI,
            MaxStreams { .. } => ty::MAX_STREAMS_UNI,
            DataBlocked { .. } => ty::DATA_BLOCKED,
            StreamDataBlocked { .. } => ty::STREAM_DATA_BLOCKED,
            StreamsBlocked {
                directionality: Directionality::Bi,
                ..
            } => ty::STREAMS_BLOCKED_BIDI,
            StreamsBlocked { .. } => ty::STREAMS_BLOCKED_UNI,
            NewConnectionId(_) => ty::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => ty::RETIRE_CONNECTION_ID,
            PathChallenge(_) => ty::PATH_CHALLENGE,
            PathResponse(_) => ty::PATH_RESPONSE,
            ConnectionClose(_) => ty::CONNECTION_CLOSE,
            ApplicationClose(_) => ty::APPLICATION_CLOSE,
            Invalid(x) => x,
        })
    }

    /// Whether loss of the packet carrying this frame calls for
    /// retransmission
    pub fn is_ack_eliciting(&self) -> bool {
        match *self {
            Frame::Ack(_) | Frame::Padding | Frame::ConnectionClose(_)
            | Frame::ApplicationClose(_) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ack {
    pub largest: u64,
    /// Raw value; scale by the negotiated exponent
    pub delay: u64,
    pub ranges: Vec<Range<u64>>,
}

impl Ack {
    pub fn encode<W: BufMut>(delay: u64, ranges: &RangeSet, buf: &mut W) {
        debug_assert!(!ranges.is_empty());
        let mut iter = ranges.iter().rev();
        let first = iter.next().unwrap();
        let largest = first.end - 1;
        buf.write_var(ty::ACK);
        buf.write_var(largest);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(first.end - first.start - 1);
        let mut prev = first.start;
        for block in iter {
            buf.write_var(prev - block.end - 1); // gap
            buf.write_var(block.end - block.start - 1);
            prev = block.start;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.ranges.iter().cloned()
    }

    fn decode<R: Buf>(r: &mut R) -> Result<Ack, IterErr> {
        let largest = r.get_var()?;
        let delay = r.get_var()?;
        let extra_blocks = r.get_var()?;
        let first = r.get_var()?;
        if first > largest {
            return Err(IterErr::Malformed);
        }
        let mut ranges = Vec::with_capacity(extra_blocks as usize + 1);
        let mut smallest = largest - first;
        ranges.push(smallest..largest + 1);
        for _ in 0..extra_blocks {
            let gap = r.get_var()?;
            let len = r.get_var()?;
            if gap + 2 > smallest {
                return Err(IterErr::Malformed);
            }
            let end = smallest - gap - 2;
            if len > end {
                return Err(IterErr::Malformed);
            }
            smallest = end - len;
            ranges.push(smallest..end + 1);
        }
        Ok(Ack {
            largest,
            delay,
            ranges,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStream {
    pub id: StreamId,
    pub error_code: u16,
    pub final_offset: u64,
}

impl ResetStream {
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write_var(ty::RESET_STREAM);
        buf.write_var(self.id.0);
        buf.write_var(u64::from(self.error_code));
        buf.write_var(self.final_offset);
    }
}

#[derive(Debug, Clone)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    pub const SIZE_BOUND: usize = 1 + 8 + 8;

    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write_var(ty::CRYPTO);
        buf.write_var(self.offset);
        buf.write_var(self.data.len() as u64);
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
    /// Bytes of overhead before payload, assuming an explicit length
    pub const SIZE_BOUND: usize = 1 + 8 + 8 + 8;

    pub fn encode<W: BufMut>(&self, length: bool, buf: &mut W) {
        let mut ty = ty::STREAM_BASE;
        if self.offset != 0 {
            ty |= 0x04;
        }
        if length {
            ty |= 0x02;
        }
        if self.fin {
            ty |= 0x01;
        }
        buf.write_var(ty);
        buf.write_var(self.id.0);
        if self.offset != 0 {
            buf.write_var(self.offset);
        }
        if length {
            buf.write_var(self.data.len() as u64);
        }
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewConnectionId {
    pub sequence: u64,
    pub retire_prior_to: u64,
    pub id: ConnectionId,
    pub reset_token: [u8; RESET_TOKEN_SIZE],
}

impl NewConnectionId {
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write_var(ty::NEW_CONNECTION_ID);
        buf.write_var(self.sequence);
        buf.write_var(self.retire_prior_to);
        buf.write::<u8>(self.id.len() as u8);
        buf.put_slice(&self.id);
        buf.put_slice(&self.reset_token);
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionClose {
    pub error_code: TransportError,
    pub frame_type: Option<Type>,
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.error_code.fmt(f)?;
        if !self.reason.is_empty() {
            f.write_str(": ")?;
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl From<TransportError> for ConnectionClose {
    fn from(x: TransportError) -> Self {
        ConnectionClose {
            error_code: x,
            frame_type: None,
            reason: Bytes::new(),
        }
    }
}

impl ConnectionClose {
    pub fn encode<W: BufMut>(&self, buf: &mut W, max_len: usize) {
        buf.write_var(ty::CONNECTION_CLOSE);
        buf.write_var(u64::from(self.error_code.0));
        buf.write_var(self.frame_type.map_or(0, |x| x.0));
        let max_reason = max_len.saturating_sub(1 + 8 + 8 + 8);
        let reason_len = self.reason.len().min(max_reason);
        buf.write_var(reason_len as u64);
        buf.put_slice(&self.reason[..reason_len]);
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationClose {
    pub error_code: u16,
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error_code)?;
        if !self.reason.is_empty() {
            f.write_str(": ")?;
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl ApplicationClose {
    pub fn encode<W: BufMut>(&self, buf: &mut W, max_len: usize) {
        buf.write_var(ty::APPLICATION_CLOSE);
        buf.write_var(u64::from(self.error_code));
        let max_reason = max_len.saturating_sub(1 + 8 + 8);
        let reason_len = self.reason.len().min(max_reason);
        buf.write_var(reason_len as u64);
        buf.put_slice(&self.reason[..reason_len]);
    }
}

pub struct Iter {
    bytes: io::Cursor<Bytes>,
    last_ty: Option<Type>,
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Iter {
            bytes: io::Cursor::new(payload),
            last_ty: None,
        }
    }

    fn take_remaining(&mut self) -> Bytes {
        let pos = self.bytes.position() as usize;
        let rest = self.bytes.get_mut().split_off(pos);
        mem::replace(self.bytes.get_mut(), Bytes::new());
        self.bytes.set_position(0);
        rest
    }

    fn take_len(&mut self) -> Result<Bytes, IterErr> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(IterErr::UnexpectedEnd);
        }
        let start = self.bytes.position() as usize;
        self.bytes.set_position(start as u64 + len);
        Ok(self.bytes.get_ref().slice(start, start + len as usize))
    }

    fn try_next(&mut self) -> Result<Frame, IterErr> {
        let ty = self.bytes.get_var()?;
        self.last_ty = Some(Type(ty));
        Ok(match ty {
            ty::PADDING => Frame::Padding,
            ty::PING => Frame::Ping,
            ty::ACK => Frame::Ack(Ack::decode(&mut self.bytes)?),
            ty::RESET_STREAM => Frame::ResetStream(ResetStream {
                id: StreamId(self.bytes.get_var()?),
                error_code: self.get_u16_var()?,
                final_offset: self.bytes.get_var()?,
            }),
            ty::STOP_SENDING => Frame::StopSending {
                id: StreamId(self.bytes.get_var()?),
                error_code: self.get_u16_var()?,
            },
            ty::CRYPTO => {
                let offset = self.bytes.get_var()?;
                Frame::Crypto(Crypto {
                    offset,
                    data: self.take_len()?,
                })
            }
            ty::MAX_DATA => Frame::MaxData(self.bytes.get_var()?),
            ty::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            ty::MAX_STREAMS_BIDI => Frame::MaxStreams {
                directionality: Directionality::Bi,
                count: self.bytes.get_var()?,
            },
            ty::MAX_STREAMS_UNI => Frame::MaxStreams {
                directionality: Directionality::Uni,
                count: self.bytes.get_var()?,
            },
            ty::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var()?,
            },
            ty::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            ty::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                directionality: Directionality::Bi,
                limit: self.bytes.get_var()?,
            },
            ty::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                directionality: Directionality::Uni,
                limit: self.bytes.get_var()?,
            },
            ty::NEW_CONNECTION_ID => {
                let sequence = self.bytes.get_var()?;
                let retire_prior_to = self.bytes.get_var()?;
                let len: u8 = self.bytes.get()?;
                if len as usize > MAX_CID_SIZE || self.bytes.remaining() < len as usize {
                    return Err(IterErr::Malformed);
                }
                let pos = self.bytes.position() as usize;
                let id = ConnectionId::new(&self.bytes.get_ref()[pos..pos + len as usize]);
                self.bytes.set_position((pos + len as usize) as u64);
                if self.bytes.remaining() < RESET_TOKEN_SIZE {
                    return Err(IterErr::UnexpectedEnd);
                }
                let mut reset_token = [0; RESET_TOKEN_SIZE];
                self.bytes.copy_to_slice(&mut reset_token);
                Frame::NewConnectionId(NewConnectionId {
                    sequence,
                    retire_prior_to,
                    id,
                    reset_token,
                })
            }
            ty::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: self.bytes.get_var()?,
            },
            ty::PATH_CHALLENGE => Frame::PathChallenge(self.bytes.get()?),
            ty::PATH_RESPONSE => Frame::PathResponse(self.bytes.get()?),
            ty::CONNECTION_CLOSE => {
                let error_code = TransportError(self.get_u16_var()?);
                let frame_type = self.bytes.get_var()?;
                Frame::ConnectionClose(ConnectionClose {
                    error_code,
                    frame_type: if frame_type == 0 {
                        None
                    } else {
                        Some(Type(frame_type))
                    },
                    reason: self.take_len()?,
                })
            }
            ty::APPLICATION_CLOSE => Frame::ApplicationClose(ApplicationClose {
                error_code: self.get_u16_var()?,
                reason: self.take_len()?,
            }),
            x if x & !0b111 == ty::STREAM_BASE => {
                let id = StreamId(self.bytes.get_var()?);
                let offset = if x & 0x04 != 0 {
                    self.bytes.get_var()?
                } else {
                    0
                };
                let data = if x & 0x02 != 0 {
                    self.take_len()?
                } else {
                    self.take_remaining()
                };
                Frame::Stream(Stream {
                    id,
                    offset,
                    fin: x & 0x01 != 0,
                    data,
                })
            }
            _ => return Err(IterErr::InvalidType(ty)),
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
            Ok(x) => Some(x),
            Err(IterErr::InvalidType(ty)) => {
                // surface to the state machine, which closes the connection
                self.take_remaining();
                Some(Frame::Invalid(ty))
            }
            Err(_) => {
                let ty = self.last_ty.map_or(0, |x| x.0);
                self.take_remaining();
                Some(Frame::Invalid(ty))
            }
        }
    }
}

impl Iter {
    fn get_u16_var(&mut self) -> Result<u16, IterErr> {
        let x = self.bytes.get_var()?;
        if x > u64::from(u16::max_value()) {
            return Err(IterErr::Malformed);
        }
        Ok(x as u16)
    }
}

enum IterErr {
    UnexpectedEnd,
    InvalidType(u64),
    Malformed,
}

impl From<coding::UnexpectedEnd> for IterErr {
    fn from(_: coding::UnexpectedEnd) -> Self {
        IterErr::UnexpectedEnd
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frames(buf: Vec<u8>) -> Vec<Frame> {
        Iter::new(Bytes::from(buf)).collect()
    }

    #[test]
    fn ack_roundtrip() {
        let mut ranges = RangeSet::new();
        ranges.insert(1..12);
        ranges.insert(20..26);
        ranges.insert_one(30);
        let mut buf = Vec::new();
        Ack::encode(7, &ranges, &mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        match decoded[0] {
            Frame::Ack(ref ack) => {
                assert_eq!(ack.largest, 30);
                assert_eq!(ack.delay, 7);
                let mut got: Vec<_> = ack.iter().collect();
                got.sort_by_key(|x| x.start);
                assert_eq!(got, vec![1..12, 20..26, 30..31]);
            }
            ref x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn stream_roundtrip() {
        let frame = Stream {
            id: StreamId(3),
            offset: 1000,
            fin: true,
            data: Bytes::from_static(b"stream payload"),
        };
        let mut buf = Vec::new();
        frame.encode(true, &mut buf);
        buf.write_var(ty::PING);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 2);
        match decoded[0] {
            Frame::Stream(ref got) => {
                assert_eq!(got.id, StreamId(3));
                assert_eq!(got.offset, 1000);
                assert!(got.fin);
                assert_eq!(&got.data[..], b"stream payload");
            }
            ref x => panic!("unexpected frame {:?}", x),
        }
        assert_matches!(decoded[1], Frame::Ping);
    }

    #[test]
    fn crypto_and_close_roundtrip() {
        let mut buf = Vec::new();
        Crypto {
            offset: 9,
            data: Bytes::from_static(b"tls bytes"),
        }.encode(&mut buf);
        ConnectionClose {
            error_code: TransportError::PROTOCOL_VIOLATION,
            frame_type: None,
            reason: Bytes::from_static(b"bad peer"),
        }.encode(&mut buf, 1000);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 2);
        assert_matches!(decoded[0], Frame::Crypto(ref x) if x.offset == 9);
        match decoded[1] {
            Frame::ConnectionClose(ref close) => {
                assert_eq!(close.error_code, TransportError::PROTOCOL_VIOLATION);
                assert_eq!(&close.reason[..], b"bad peer");
            }
            ref x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn new_connection_id_roundtrip() {
        let frame = NewConnectionId {
            sequence: 4,
            retire_prior_to: 1,
            id: ConnectionId::new(&[0xfe; 8]),
            reset_token: [0xaa; RESET_TOKEN_SIZE],
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let decoded = frames(buf);
        assert_matches!(decoded[0], Frame::NewConnectionId(got) if got == frame);
    }

    #[test]
    fn invalid_type_terminates() {
        let mut buf = Vec::new();
        buf.write_var(0x2f);
        buf.write_var(ty::PING);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        assert_matches!(decoded[0], Frame::Invalid(0x2f));
    }
}
