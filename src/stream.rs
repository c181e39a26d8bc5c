use std::cmp;
use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use fnv::FnvHashMap;

use buffer::ChunkedSendBuffer;
use range_set::RangeSet;
use {Directionality, Side, TransportError};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, directionality: Directionality, index: u64) -> Self {
        let mut id = index << 2;
        if directionality == Directionality::Uni {
            id |= 0b10;
        }
        if initiator == Side::Server {
            id |= 0b01;
        }
        StreamId(id)
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0b01 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn directionality(self) -> Directionality {
        if self.0 & 0b10 == 0 {
            Directionality::Bi
        } else {
            Directionality::Uni
        }
    }

    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ::slog::Value for StreamId {
    fn serialize(
        &self,
        _: &::slog::Record,
        key: ::slog::Key,
        serializer: &mut ::slog::Serializer,
    ) -> ::slog::Result {
        serializer.emit_u64(key, self.0)
    }
}

#[derive(Debug, Fail, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// No data is currently available; more may arrive
    #[fail(display = "blocked")]
    Blocked,
    /// The peer abandoned the stream
    #[fail(display = "reset by peer: code {}", error_code)]
    Reset { error_code: u16 },
    /// Every byte the peer will ever send has been read
    #[fail(display = "finished")]
    Finished,
}

#[derive(Debug, Fail, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// Flow control or congestion forbids writing now
    #[fail(display = "unable to accept further writes")]
    Blocked,
    /// The peer asked us to stop sending
    #[fail(display = "stopped by peer: code {}", error_code)]
    Stopped { error_code: u16 },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendState {
    Ready,
    DataSent,
    DataRecvd,
    ResetSent { stop_reason: Option<u16> },
    ResetRecvd { stop_reason: Option<u16> },
}

impl SendState {
    pub fn was_reset(self) -> bool {
        match self {
            SendState::ResetSent { .. } | SendState::ResetRecvd { .. } => true,
            _ => false,
        }
    }
}

/// Outbound half of a stream. Application chunks queue in `queue` and are
/// credited back to their write groups as the peer acknowledges them.
pub struct Send {
    /// Next offset to hand to the packetizer
    pub offset: u64,
    /// Peer-granted limit
    pub max_data: u64,
    pub state: SendState,
    pub queue: ChunkedSendBuffer,
    pub bytes_in_flight: u64,
    /// Offsets the peer has acknowledged, possibly with gaps
    pub acked: RangeSet,
    /// Contiguously acknowledged prefix; the queue is consumed up to here
    pub acked_offset: u64,
    pub fin_pending: bool,
}

impl Send {
    pub fn new() -> Self {
        Send {
            offset: 0,
            max_data: 0,
            state: SendState::Ready,
            queue: ChunkedSendBuffer::new(),
            bytes_in_flight: 0,
            acked: RangeSet::new(),
            acked_offset: 0,
            fin_pending: false,
        }
    }

    /// Record an acknowledged extent and return how far the contiguous
    /// acked prefix advanced
    pub fn ack(&mut self, offset: u64, len: u64) -> u64 {
        if len > 0 {
            self.acked.insert(offset..offset + len);
        }
        let mut advanced = 0;
        while let Some(range) = self.acked.pop_min() {
            if range.start > self.acked_offset {
                self.acked.insert(range);
                break;
            }
            if range.end > self.acked_offset {
                advanced += range.end - self.acked_offset;
                self.acked_offset = range.end;
            }
        }
        advanced
    }

    /// How many further bytes stream-level flow control permits
    pub fn write_budget(&mut self) -> Result<u64, WriteError> {
        if let SendState::ResetSent {
            stop_reason: Some(error_code),
        } = self.state
        {
            return Err(WriteError::Stopped { error_code });
        }
        if self.state.was_reset() {
            return Err(WriteError::Stopped { error_code: 0 });
        }
        if self.offset >= self.max_data {
            return Err(WriteError::Blocked);
        }
        Ok(self.max_data - self.offset)
    }

    pub fn is_closed(&self) -> bool {
        match self.state {
            SendState::DataRecvd => true,
            SendState::ResetRecvd { .. } => true,
            _ => false,
        }
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
    ResetRecvd { size: u64, error_code: u16 },
    Closed,
}

/// Inbound half of a stream
pub struct Recv {
    pub state: RecvState,
    /// Offsets received, for completion and duplicate detection
    pub recvd: RangeSet,
    pub assembler: Assembler,
    /// Credit advertised to the peer
    pub max_data: u64,
    /// Cleared after the first readable event is surfaced
    pub fresh: bool,
}

impl Recv {
    pub fn new(max_data: u64) -> Self {
        Recv {
            state: RecvState::Recv { size: None },
            recvd: RangeSet::new(),
            assembler: Assembler::new(),
            max_data,
            fresh: true,
        }
    }

    /// One past the highest offset received so far
    pub fn limit(&self) -> u64 {
        self.recvd.max().map_or(0, |x| x + 1)
    }

    pub fn final_offset(&self) -> Option<u64> {
        match self.state {
            RecvState::Recv { size } => size,
            RecvState::DataRecvd { size } => Some(size),
            RecvState::ResetRecvd { size, .. } => Some(size),
            RecvState::Closed => None,
        }
    }

    pub fn receiving_unknown_size(&self) -> bool {
        match self.state {
            RecvState::Recv { size: None } => true,
            _ => false,
        }
    }

    /// No further data will arrive
    pub fn is_finished(&self) -> bool {
        match self.state {
            RecvState::Recv { .. } => false,
            _ => true,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == RecvState::Closed
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        let read = self.assembler.read(buf);
        if read > 0 {
            return Ok(read);
        }
        self.blocked_error()
    }

    pub fn read_unordered(&mut self) -> Result<(Bytes, u64), ReadError> {
        if let Some((data, offset)) = self.assembler.read_unordered() {
            return Ok((data, offset));
        }
        self.blocked_error().map(|_: usize| unreachable!())
    }

    fn blocked_error(&mut self) -> Result<usize, ReadError> {
        match self.state {
            RecvState::ResetRecvd { error_code, .. } => {
                self.state = RecvState::Closed;
                Err(ReadError::Reset { error_code })
            }
            RecvState::DataRecvd { size } if self.assembler.offset() == size => {
                self.state = RecvState::Closed;
                Err(ReadError::Finished)
            }
            _ => Err(ReadError::Blocked),
        }
    }
}

/// Reorders stream payloads into contiguous data
pub struct Assembler {
    offset: u64,
    data: BTreeMap<u64, Bytes>,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler {
            offset: 0,
            data: BTreeMap::new(),
        }
    }

    /// Bytes delivered in order so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn insert(&mut self, offset: u64, data: &Bytes) {
        if data.is_empty() || offset + data.len() as u64 <= self.offset {
            return;
        }
        match self.data.get(&offset) {
            Some(existing) if existing.len() >= data.len() => return,
            _ => {}
        }
        self.data.insert(offset, data.clone());
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut read = 0;
        while read < buf.len() {
            let (start, chunk) = match self.data.iter().next() {
                Some((&start, chunk)) => (start, chunk.clone()),
                None => break,
            };
            if start > self.offset {
                break; // gap
            }
            let skip = (self.offset - start) as usize;
            if skip >= chunk.len() {
                self.data.remove(&start);
                continue;
            }
            let n = cmp::min(buf.len() - read, chunk.len() - skip);
            buf[read..read + n].copy_from_slice(&chunk[skip..skip + n]);
            read += n;
            self.offset += n as u64;
            if skip + n == chunk.len() {
                self.data.remove(&start);
            }
        }
        read
    }

    /// Pop any buffered segment, disregarding ordering. Returns the data and
    /// its stream offset; segments may overlap previously returned data.
    pub fn read_unordered(&mut self) -> Option<(Bytes, u64)> {
        let start = *self.data.keys().next()?;
        let data = self.data.remove(&start).unwrap();
        if start + data.len() as u64 > self.offset {
            let skip = self.offset.saturating_sub(start) as usize;
            let out = data.slice_from(skip);
            let offset = start + skip as u64;
            self.offset = cmp::max(self.offset, start + data.len() as u64);
            Some((out, offset))
        } else {
            self.read_unordered()
        }
    }
}

pub struct Stream {
    send: Option<Send>,
    recv: Option<Recv>,
}

impl Stream {
    pub fn new_bi(recv_window: u64) -> Self {
        Stream {
            send: Some(Send::new()),
            recv: Some(Recv::new(recv_window)),
        }
    }

    pub fn new_send() -> Self {
        Stream {
            send: Some(Send::new()),
            recv: None,
        }
    }

    pub fn new_recv(recv_window: u64) -> Self {
        Stream {
            send: None,
            recv: Some(Recv::new(recv_window)),
        }
    }

    pub fn send(&self) -> Option<&Send> {
        self.send.as_ref()
    }

    pub fn recv(&self) -> Option<&Recv> {
        self.recv.as_ref()
    }

    pub fn send_mut(&mut self) -> Option<&mut Send> {
        self.send.as_mut()
    }

    pub fn recv_mut(&mut self) -> Option<&mut Recv> {
        self.recv.as_mut()
    }

    /// Safe to free the state
    pub fn is_closed(&self) -> bool {
        self.send.as_ref().map_or(true, |x| x.is_closed())
            && self.recv.as_ref().map_or(true, |x| x.is_closed())
    }
}

/// Stream-id to stream mapping with open/close lifecycle and limit
/// accounting for both initiators
pub struct StreamTable {
    pub streams: FnvHashMap<StreamId, Stream>,
    next_uni: u64,
    next_bi: u64,
    /// Locally initiated, peer-granted
    pub max_uni: u64,
    pub max_bi: u64,
    /// Remotely initiated, locally granted
    pub max_remote_uni: u64,
    pub max_remote_bi: u64,
    opened_remote_uni: u64,
    opened_remote_bi: u64,
    /// Streams whose final outbound byte was acknowledged since last poll
    pub finished: Vec<StreamId>,
}

impl StreamTable {
    pub fn new(max_remote_bi: u64, max_remote_uni: u64) -> Self {
        StreamTable {
            streams: FnvHashMap::default(),
            next_uni: 0,
            next_bi: 0,
            max_uni: 0,
            max_bi: 0,
            max_remote_uni,
            max_remote_bi,
            opened_remote_uni: 0,
            opened_remote_bi: 0,
            finished: Vec::new(),
        }
    }

    /// Open a locally initiated stream if limits allow
    pub fn open(
        &mut self,
        side: Side,
        directionality: Directionality,
        send_window: u64,
        recv_window: u64,
    ) -> Option<StreamId> {
        let (next, limit) = match directionality {
            Directionality::Uni => (&mut self.next_uni, self.max_uni),
            Directionality::Bi => (&mut self.next_bi, self.max_bi),
        };
        if *next >= limit {
            return None;
        }
        let id = StreamId::new(side, directionality, *next);
        *next += 1;
        let mut stream = match directionality {
            Directionality::Uni => Stream::new_send(),
            Directionality::Bi => Stream::new_bi(recv_window),
        };
        stream.send_mut().unwrap().max_data = send_window;
        let old = self.streams.insert(id, stream);
        debug_assert!(old.is_none());
        Some(id)
    }

    /// Look up the stream a peer-sent frame refers to, creating remotely
    /// initiated streams on first reference. Returns the number of streams
    /// implicitly opened.
    pub fn ensure_remote(
        &mut self,
        side: Side,
        id: StreamId,
        send_window: u64,
        recv_window: u64,
    ) -> Result<u64, TransportError> {
        if id.initiator() == side {
            match id.directionality() {
                Directionality::Uni => return Err(TransportError::STREAM_STATE_ERROR),
                Directionality::Bi => {
                    if id.index() >= self.next_bi {
                        return Err(TransportError::STREAM_STATE_ERROR);
                    }
                }
            }
            return Ok(0);
        }
        let (opened, limit) = match id.directionality() {
            Directionality::Uni => (&mut self.opened_remote_uni, self.max_remote_uni),
            Directionality::Bi => (&mut self.opened_remote_bi, self.max_remote_bi),
        };
        if id.index() >= limit {
            return Err(TransportError::STREAM_LIMIT_ERROR);
        }
        let mut created = 0;
        while *opened <= id.index() {
            let new_id = StreamId::new(!side, id.directionality(), *opened);
            let mut stream = match id.directionality() {
                Directionality::Uni => Stream::new_recv(recv_window),
                Directionality::Bi => Stream::new_bi(recv_window),
            };
            if let Some(send) = stream.send_mut() {
                send.max_data = send_window;
            }
            self.streams.insert(new_id, stream);
            *opened += 1;
            created += 1;
        }
        Ok(created)
    }

    pub fn get_recv_mut(&mut self, id: &StreamId) -> Option<&mut Recv> {
        self.streams.get_mut(id)?.recv_mut()
    }

    pub fn get_send_mut(&mut self, id: &StreamId) -> Option<&mut Send> {
        self.streams.get_mut(id)?.send_mut()
    }

    /// Discard state for a stream if it's fully closed; returns whether a
    /// remote-stream credit became free
    pub fn maybe_cleanup(&mut self, side: Side, id: StreamId) -> bool {
        let closed = self
            .streams
            .get(&id)
            .map_or(false, |stream| stream.is_closed());
        if !closed {
            return false;
        }
        self.streams.remove(&id);
        id.initiator() != side
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn clear(&mut self) {
        for (_, stream) in self.streams.iter_mut() {
            if let Some(send) = stream.send_mut() {
                send.queue.cancel();
            }
        }
        self.streams.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_id_layout() {
        let id = StreamId::new(Side::Client, Directionality::Bi, 0);
        assert_eq!(id, StreamId(0));
        let id = StreamId::new(Side::Server, Directionality::Uni, 3);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.directionality(), Directionality::Uni);
        assert_eq!(id.index(), 3);
    }

    #[test]
    fn assembler_reorders() {
        let mut assembler = Assembler::new();
        assembler.insert(5, &Bytes::from_static(b"world"));
        let mut buf = [0; 16];
        assert_eq!(assembler.read(&mut buf), 0);
        assembler.insert(0, &Bytes::from_static(b"hello"));
        let n = assembler.read(&mut buf);
        assert_eq!(&buf[..n], b"helloworld");
    }

    #[test]
    fn assembler_skips_duplicates() {
        let mut assembler = Assembler::new();
        assembler.insert(0, &Bytes::from_static(b"abc"));
        let mut buf = [0; 8];
        assert_eq!(assembler.read(&mut buf), 3);
        assembler.insert(0, &Bytes::from_static(b"abc"));
        assert_eq!(assembler.read(&mut buf), 0);
        assembler.insert(1, &Bytes::from_static(b"bcde"));
        let n = assembler.read(&mut buf);
        assert_eq!(&buf[..n], b"de");
    }

    #[test]
    fn open_respects_limits() {
        let mut table = StreamTable::new(0, 0);
        table.max_bi = 1;
        assert_eq!(
            table.open(Side::Client, Directionality::Bi, 100, 100),
            Some(StreamId(0))
        );
        assert_eq!(table.open(Side::Client, Directionality::Bi, 100, 100), None);
        table.max_bi = 2;
        assert_eq!(
            table.open(Side::Client, Directionality::Bi, 100, 100),
            Some(StreamId(4))
        );
    }

    #[test]
    fn remote_streams_open_implicitly() {
        let mut table = StreamTable::new(2, 0);
        let id = StreamId::new(Side::Client, Directionality::Bi, 1);
        let created = table.ensure_remote(Side::Server, id, 100, 100).unwrap();
        assert_eq!(created, 2);
        assert!(table.streams.contains_key(&StreamId::new(
            Side::Client,
            Directionality::Bi,
            0
        )));

        let over = StreamId::new(Side::Client, Directionality::Bi, 2);
        assert_eq!(
            table.ensure_remote(Side::Server, over, 100, 100),
            Err(TransportError::STREAM_LIMIT_ERROR)
        );
    }

    #[test]
    fn frames_for_unopened_local_stream_rejected() {
        let mut table = StreamTable::new(1, 1);
        // peer claims data on a bidi stream we never opened
        let id = StreamId::new(Side::Server, Directionality::Bi, 0);
        assert_eq!(
            table.ensure_remote(Side::Server, id, 100, 100),
            Err(TransportError::STREAM_STATE_ERROR)
        );
        // peer references our send-only stream
        let id = StreamId::new(Side::Server, Directionality::Uni, 0);
        assert_eq!(
            table.ensure_remote(Side::Server, id, 100, 100),
            Err(TransportError::STREAM_STATE_ERROR)
        );
    }
}
