use std::cmp;
use std::collections::VecDeque;
use std::mem;

use bytes::Bytes;
use slab::Slab;

/// Status passed to a write-group completion when the group was dropped by
/// `cancel` before every byte was consumed. Negative per POSIX convention.
pub const CANCELED: i32 = -125;

/// Require the visitor to run before `pull` returns
pub const PULL_SYNC: u32 = 0b01;
/// Report `PullStatus::End` once the buffer has been ended
pub const PULL_END: u32 = 0b10;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PullStatus {
    /// More data may become visible later
    More,
    /// The buffer was ended and every visible byte was offered
    End,
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
#[fail(display = "push after end of stream")]
pub struct Ended;

type Completion = Box<dyn FnOnce(i32)>;

struct Group {
    outstanding: usize,
    on_complete: Option<Completion>,
}

struct Chunk {
    data: Bytes,
    /// Bytes dropped from the front by `consume`
    consumed: usize,
    /// Bytes already offered through `pull` and committed by the visitor
    pulled: usize,
    /// Made visible by `seek` (or born visible, for owned chunks)
    read: bool,
    group: Option<usize>,
}

impl Chunk {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn unconsumed(&self) -> usize {
        self.len() - self.consumed
    }
}

/// FIFO of byte chunks with three cursors: chunks are appended at the tail,
/// made visible to `pull` by advancing the read cursor with `seek`, and
/// released from the head by `consume`. Chunks pushed together form a write
/// group whose completion fires exactly once: with `0` when the group's last
/// byte is consumed past the read cursor, or with `CANCELED` on `cancel`.
pub struct ChunkedSendBuffer {
    chunks: VecDeque<Chunk>,
    groups: Slab<Group>,
    length: usize,
    remaining: usize,
    ended: bool,
}

impl Default for ChunkedSendBuffer {
    fn default() -> Self {
        ChunkedSendBuffer {
            chunks: VecDeque::new(),
            groups: Slab::new(),
            length: 0,
            remaining: 0,
            ended: false,
        }
    }
}

impl ChunkedSendBuffer {
    pub fn new() -> Self {
        Default::default()
    }

    /// Bytes pushed and not yet consumed or canceled
    pub fn length(&self) -> usize {
        self.length
    }

    /// Bytes visible to `pull` and not yet handed off
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Append `chunks` as a single write group. Empty chunks are skipped; a
    /// group with no bytes completes immediately.
    pub fn push<F>(&mut self, chunks: &[Bytes], on_complete: F) -> Result<(), Ended>
    where
        F: FnOnce(i32) + 'static,
    {
        if self.ended {
            return Err(Ended);
        }
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        if total == 0 {
            on_complete(0);
            return Ok(());
        }
        let group = self.groups.insert(Group {
            outstanding: total,
            on_complete: Some(Box::new(on_complete)),
        });
        for data in chunks {
            if data.is_empty() {
                continue;
            }
            self.length += data.len();
            self.chunks.push_back(Chunk {
                data: data.clone(),
                consumed: 0,
                pulled: 0,
                read: false,
                group: Some(group),
            });
        }
        Ok(())
    }

    /// Append a single chunk with no completion. Owned chunks are born
    /// visible; no `seek` is needed before `pull` or `consume` sees them.
    pub fn push_owned(&mut self, data: Bytes) -> Result<(), Ended> {
        if self.ended {
            return Err(Ended);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.length += data.len();
        self.remaining += data.len();
        self.chunks.push_back(Chunk {
            data,
            consumed: 0,
            pulled: 0,
            read: true,
            group: None,
        });
        Ok(())
    }

    /// Mark the buffer end-of-stream. Later pushes are rejected.
    pub fn end(&mut self) {
        self.ended = true;
    }

    /// Advance the read cursor over at most `amount` unread chunks, making
    /// them visible to `pull` and eligible for completion credit. Returns the
    /// number of chunks passed. Each step costs one byte of the handed-off
    /// gauge.
    pub fn seek(&mut self, amount: usize) -> usize {
        let mut seeked = 0;
        for chunk in self.chunks.iter_mut() {
            if seeked == amount {
                break;
            }
            if chunk.read {
                continue;
            }
            chunk.read = true;
            self.remaining += chunk.data.len();
            seeked += 1;
        }
        self.remaining -= cmp::min(self.remaining, seeked);
        seeked
    }

    /// Drop up to `amount` bytes from the head. Bytes ahead of the read
    /// cursor are dropped without crediting their group; the group is
    /// credited once the chunk has also been seeked. Returns bytes dropped.
    pub fn consume(&mut self, amount: usize) -> usize {
        let mut left = amount;
        for chunk in self.chunks.iter_mut() {
            if left == 0 {
                break;
            }
            let eaten = cmp::min(left, chunk.unconsumed());
            chunk.consumed += eaten;
            left -= eaten;
            self.length -= eaten;
        }
        self.retire();
        amount - left
    }

    /// Fire every unfired completion with `CANCELED` and drop all chunks
    pub fn cancel(&mut self) {
        self.chunks.clear();
        self.length = 0;
        self.remaining = 0;
        let groups = mem::replace(&mut self.groups, Slab::new());
        for (_, group) in groups {
            if let Some(cb) = group.on_complete {
                cb(CANCELED);
            }
        }
    }

    /// Offer the visitor a borrowed vectored view of up to `max_vecs` visible
    /// chunks past the handed-off offset. The visitor returns the number of
    /// bytes it committed, which advances that offset. With `PULL_END` set
    /// and the buffer ended, the visitor sees `PullStatus::End` provided the
    /// view was not truncated.
    pub fn pull<F>(&mut self, options: u32, max_vecs: usize, visit: F) -> PullStatus
    where
        F: FnOnce(PullStatus, &[Bytes]) -> usize,
    {
        let mut vecs = Vec::with_capacity(cmp::min(max_vecs, self.chunks.len()));
        let mut truncated = false;
        for chunk in &self.chunks {
            if !chunk.read {
                truncated = true;
                break;
            }
            if chunk.pulled == chunk.len() {
                continue;
            }
            if vecs.len() == max_vecs {
                truncated = true;
                break;
            }
            vecs.push(chunk.data.slice_from(chunk.pulled));
        }
        let status = if self.ended && !truncated && options & PULL_END != 0 {
            PullStatus::End
        } else {
            PullStatus::More
        };
        let handed = visit(status, &vecs);
        self.advance_pulled(handed);
        status
    }

    fn advance_pulled(&mut self, amount: usize) {
        let mut left = amount;
        for chunk in self.chunks.iter_mut() {
            if left == 0 {
                break;
            }
            if !chunk.read {
                break;
            }
            let n = cmp::min(left, chunk.len() - chunk.pulled);
            chunk.pulled += n;
            left -= n;
        }
        let committed = amount - left;
        self.remaining -= cmp::min(self.remaining, committed);
    }

    /// Pop fully consumed, seeked chunks from the head and credit their
    /// groups; a group's completion fires when its last byte is credited.
    fn retire(&mut self) {
        loop {
            {
                let front = match self.chunks.front() {
                    Some(x) => x,
                    None => return,
                };
                if front.consumed < front.len() || !front.read {
                    return;
                }
            }
            let chunk = self.chunks.pop_front().unwrap();
            if let Some(idx) = chunk.group {
                self.groups[idx].outstanding -= chunk.len();
                if self.groups[idx].outstanding == 0 {
                    let group = self.groups.remove(idx);
                    if let Some(cb) = group.on_complete {
                        cb(0);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn chunk(len: usize) -> Bytes {
        Bytes::from(vec![0; len])
    }

    struct Flag(Rc<Cell<Option<i32>>>);

    impl Flag {
        fn new() -> (Flag, impl FnOnce(i32) + 'static) {
            let cell = Rc::new(Cell::new(None));
            let writer = cell.clone();
            (Flag(cell), move |status| {
                assert!(writer.get().is_none(), "completion fired twice");
                writer.set(Some(status));
            })
        }

        fn status(&self) -> Option<i32> {
            self.0.get()
        }
    }

    #[test]
    fn consume_before_seek_drops_without_completion() {
        let mut buf = ChunkedSendBuffer::new();
        let (flag, cb) = Flag::new();
        buf.push(&[chunk(100)], cb).unwrap();

        buf.consume(100);
        assert_eq!(buf.length(), 0);
        assert_eq!(flag.status(), None);

        // the read cursor has to pass the chunk before it can complete
        buf.seek(1);
        buf.consume(100);
        assert_eq!(flag.status(), Some(0));
        assert_eq!(buf.length(), 0);
    }

    #[test]
    fn consume_more_than_buffered() {
        let mut buf = ChunkedSendBuffer::new();
        let (flag, cb) = Flag::new();
        buf.push(&[chunk(100)], cb).unwrap();

        buf.seek(1);
        assert_eq!(buf.consume(150), 100);
        assert_eq!(flag.status(), Some(0));
        assert_eq!(buf.length(), 0);
    }

    #[test]
    fn multiple_chunks() {
        let mut buf = ChunkedSendBuffer::new();
        let (flag, cb) = Flag::new();
        buf.push(
            &[
                Bytes::from_static(b"abcdefghijklmnopqrstuvwxyz"),
                Bytes::from_static(b"zyxwvutsrqponmlkjihgfedcba"),
            ],
            cb,
        ).unwrap();

        buf.seek(2);
        assert_eq!(buf.remaining(), 50);
        assert_eq!(buf.length(), 52);

        buf.consume(25);
        assert_eq!(buf.length(), 27);
        buf.consume(25);
        assert_eq!(buf.length(), 2);
        buf.consume(25);
        assert_eq!(buf.length(), 0);
        buf.consume(25);
        assert_eq!(buf.length(), 0);
        assert_eq!(flag.status(), Some(0));
    }

    #[test]
    fn group_completes_once() {
        let mut buf = ChunkedSendBuffer::new();
        let (flag, cb) = Flag::new();
        buf.push(&[chunk(50), chunk(50)], cb).unwrap();
        buf.seek(2);

        buf.consume(25);
        assert_eq!(buf.length(), 75);
        buf.consume(25);
        assert_eq!(buf.length(), 50);
        assert_eq!(flag.status(), None);
        buf.consume(25);
        assert_eq!(buf.length(), 25);
        buf.consume(25);
        assert_eq!(buf.length(), 0);
        // the Flag callback asserts it only fired once
        assert_eq!(flag.status(), Some(0));
    }

    #[test]
    fn cancel_fires_once_with_canceled() {
        let mut buf = ChunkedSendBuffer::new();
        let (flag, cb) = Flag::new();
        buf.push(&[chunk(50), chunk(50)], cb).unwrap();

        buf.seek(1);
        buf.consume(25);
        assert_eq!(buf.length(), 75);
        buf.cancel();
        assert_eq!(buf.length(), 0);
        assert_eq!(flag.status(), Some(CANCELED));
    }

    #[test]
    fn move_preserves_bytes() {
        let mut a = ChunkedSendBuffer::new();
        a.push_owned(chunk(100)).unwrap();
        assert_eq!(a.length(), 100);

        let b = mem::replace(&mut a, ChunkedSendBuffer::new());
        assert_eq!(a.length(), 0);
        assert_eq!(b.length(), 100);
    }

    #[test]
    fn pull_owned_chunk_to_end() {
        let mut buf = ChunkedSendBuffer::new();
        buf.push_owned(Bytes::from(vec![1; 100])).unwrap();
        buf.end();
        assert_eq!(buf.length(), 100);
        assert_eq!(buf.remaining(), 100);

        let status = buf.pull(PULL_SYNC | PULL_END, 2, |status, vecs| {
            assert_eq!(status, PullStatus::End);
            assert_eq!(vecs.len(), 1);
            assert_eq!(vecs[0].len(), 100);
            100
        });
        assert_eq!(status, PullStatus::End);
        assert_eq!(buf.remaining(), 0);

        buf.consume(50);
        assert_eq!(buf.length(), 50);
        buf.consume(50);
        assert_eq!(buf.length(), 0);
    }

    #[test]
    fn push_without_seek_is_invisible() {
        let mut buf = ChunkedSendBuffer::new();
        let (_flag, cb) = Flag::new();
        buf.push(&[chunk(10)], cb).unwrap();
        assert_ne!(buf.length(), 0);
        assert_eq!(buf.remaining(), 0);
        buf.pull(PULL_SYNC, 4, |status, vecs| {
            assert_eq!(status, PullStatus::More);
            assert!(vecs.is_empty());
            0
        });
    }

    #[test]
    fn push_after_end_rejected() {
        let mut buf = ChunkedSendBuffer::new();
        buf.push_owned(chunk(1)).unwrap();
        buf.end();
        assert_eq!(buf.push_owned(chunk(1)), Err(Ended));
    }

    #[test]
    fn completions_fire_in_consume_order() {
        let mut buf = ChunkedSendBuffer::new();
        let order = Rc::new(Cell::new(0u32));
        for i in 1..=3u32 {
            let order = order.clone();
            buf.push(&[chunk(10)], move |status| {
                assert_eq!(status, 0);
                assert_eq!(order.get(), i - 1);
                order.set(i);
            }).unwrap();
        }
        buf.seek(3);
        buf.consume(30);
        assert_eq!(order.get(), 3);
    }

    #[test]
    fn seek_does_not_pass_tail() {
        let mut buf = ChunkedSendBuffer::new();
        let (_flag, cb) = Flag::new();
        buf.push(&[chunk(5), chunk(5)], cb).unwrap();
        assert_eq!(buf.seek(7), 2);
        assert_eq!(buf.seek(1), 0);
    }
}
