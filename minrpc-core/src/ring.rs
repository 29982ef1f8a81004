//! Byte ring buffer shared by the read (R) and write (W) sides of an endpoint.
//!
//! The buffer is a FIFO of `Bytes` segments. Appending is always zero-copy
//! (just a refcount bump); draining a prefix that lies entirely within the
//! front segment is zero-copy too. A prefix spanning several segments is
//! copied into one contiguous allocation, which only happens when the
//! transport delivered a message in more pieces than it was framed in.
//!
//! This type has no internal locking. The endpoint facade's mutex plus the
//! single-threaded discipline of the drive loop are what make it safe to
//! share between a client call and the state machine.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// An unbounded FIFO byte buffer built from `Bytes` segments.
#[derive(Debug, Default)]
pub struct RingBuffer {
    segs: VecDeque<Bytes>,
    len: usize,
}

impl RingBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segs: VecDeque::new(),
            len: 0,
        }
    }

    /// Bytes currently queued and available to read.
    #[inline]
    #[must_use]
    pub const fn bytes_available(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ensure the buffer can absorb at least `n` more bytes without the next
    /// `push`/`write` needing to grow an intermediate allocation.
    ///
    /// Segments are independently-owned `Bytes`, so there is no backing array
    /// to resize; this reserves capacity in the staging buffer used by
    /// [`RingBuffer::write`] for values that don't arrive as a ready-made
    /// `Bytes`.
    pub fn reserve(&mut self, n: usize) {
        self.segs.reserve(n.div_ceil(64).max(1));
    }

    /// Append a segment. Empty segments are dropped immediately.
    #[inline]
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segs.push_back(bytes);
    }

    /// Copy `src` into the buffer as a new segment.
    pub fn write(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        self.push(Bytes::copy_from_slice(src));
    }

    /// Hand up to `n` contiguous bytes to `f`, then consume however many
    /// bytes `f` reports as accepted.
    ///
    /// `f` receives a slice of at most `n` bytes drawn from the *front*
    /// segment only (never a copy spanning segments), so the transport can
    /// perform a partial write without an intermediate buffer. If the front
    /// segment is smaller than `n` the slice handed to `f` is shorter than
    /// `n`; callers loop until `bytes_available()` is drained.
    pub fn read_with_callback(&mut self, n: usize, f: impl FnOnce(&[u8]) -> usize) -> usize {
        let Some(front) = self.segs.front() else {
            return 0;
        };
        let take = n.min(front.len());
        let accepted = f(&front[..take]).min(take);
        if accepted > 0 {
            self.advance(accepted);
        }
        accepted
    }

    /// Ask `f` to fill up to `n` bytes into a scratch buffer, then enqueue
    /// however many bytes `f` reports as written.
    ///
    /// This mirrors [`RingBuffer::read_with_callback`] for the inbound
    /// direction: the transport fills a temporary buffer via a partial read
    /// and the accepted count becomes a new segment.
    pub fn write_with_callback(&mut self, n: usize, f: impl FnOnce(&mut [u8]) -> usize) -> usize {
        let mut scratch = vec![0u8; n];
        let written = f(&mut scratch).min(n);
        if written > 0 {
            scratch.truncate(written);
            self.push(Bytes::from(scratch));
        }
        written
    }

    /// Copy the first `n` bytes into `dst` without consuming them.
    ///
    /// Returns `false` if fewer than `n` bytes are buffered.
    pub fn copy_prefix(&self, n: usize, dst: &mut [u8]) -> bool {
        if n > self.len || dst.len() < n {
            return false;
        }

        let mut remaining = n;
        let mut out_off = 0;
        for seg in &self.segs {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(seg.len());
            dst[out_off..out_off + take].copy_from_slice(&seg[..take]);
            out_off += take;
            remaining -= take;
        }
        true
    }

    /// Read exactly `n` bytes into `dst`, consuming them.
    ///
    /// Returns `false` (and leaves the buffer untouched) if fewer than `n`
    /// bytes are available.
    pub fn read(&mut self, dst: &mut [u8], n: usize) -> bool {
        if !self.copy_prefix(n, dst) {
            return false;
        }
        self.advance(n);
        true
    }

    /// Drop the first `n` bytes from the queue, freeing fully-consumed
    /// segments.
    ///
    /// # Panics
    ///
    /// Panics if `n > bytes_available()`.
    pub fn advance(&mut self, mut n: usize) {
        assert!(n <= self.len, "advance past end of ring buffer");
        self.len -= n;

        while n > 0 {
            let Some(mut front) = self.segs.pop_front() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                continue;
            }
            front.advance(n);
            self.segs.push_front(front);
            break;
        }
    }

    /// Take exactly `n` bytes from the front of the queue.
    ///
    /// Zero-copy when the first segment alone covers `n` bytes; otherwise
    /// copies into a contiguous buffer.
    pub fn take_bytes(&mut self, n: usize) -> Option<Bytes> {
        if n == 0 {
            return Some(Bytes::new());
        }
        if n > self.len {
            return None;
        }

        let front = self.segs.front_mut()?;

        if front.len() >= n {
            self.len -= n;
            let out = front.split_to(n);
            if front.is_empty() {
                self.segs.pop_front();
            }
            return Some(out);
        }

        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let seg = self.segs.pop_front().expect("len check ensures segments exist");
            let take = remaining.min(seg.len());
            out.extend_from_slice(&seg[..take]);
            remaining -= take;
            self.len -= take;
            if take < seg.len() {
                let mut rest = seg;
                rest.advance(take);
                self.segs.push_front(rest);
            }
        }

        Some(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_drain_single_segment() {
        let mut rb = RingBuffer::new();
        rb.push(Bytes::from_static(b"hello"));
        assert_eq!(rb.bytes_available(), 5);
        let out = rb.take_bytes(5).unwrap();
        assert_eq!(&out[..], b"hello");
        assert!(rb.is_empty());
    }

    #[test]
    fn take_bytes_spans_segments_via_copy() {
        let mut rb = RingBuffer::new();
        rb.push(Bytes::from_static(b"ab"));
        rb.push(Bytes::from_static(b"cdef"));
        let out = rb.take_bytes(5).unwrap();
        assert_eq!(&out[..], b"abcde");
        assert_eq!(rb.bytes_available(), 1);
        assert_eq!(&rb.take_bytes(1).unwrap()[..], b"f");
    }

    #[test]
    fn copy_prefix_does_not_consume() {
        let mut rb = RingBuffer::new();
        rb.push(Bytes::from_static(b"12345"));
        let mut dst = [0u8; 3];
        assert!(rb.copy_prefix(3, &mut dst));
        assert_eq!(&dst, b"123");
        assert_eq!(rb.bytes_available(), 5);
    }

    #[test]
    fn read_consumes_exact_prefix() {
        let mut rb = RingBuffer::new();
        rb.push(Bytes::from_static(b"abcdef"));
        let mut dst = [0u8; 4];
        assert!(rb.read(&mut dst, 4));
        assert_eq!(&dst, b"abcd");
        assert_eq!(rb.bytes_available(), 2);
    }

    #[test]
    fn read_fails_when_insufficient() {
        let mut rb = RingBuffer::new();
        rb.push(Bytes::from_static(b"ab"));
        let mut dst = [0u8; 4];
        assert!(!rb.read(&mut dst, 4));
        assert_eq!(rb.bytes_available(), 2);
    }

    #[test]
    fn advance_partially_consumes_front_segment() {
        let mut rb = RingBuffer::new();
        rb.push(Bytes::from_static(b"abcdef"));
        rb.advance(2);
        assert_eq!(rb.bytes_available(), 4);
        assert_eq!(&rb.take_bytes(4).unwrap()[..], b"cdef");
    }

    #[test]
    fn write_with_callback_enqueues_accepted_bytes() {
        let mut rb = RingBuffer::new();
        let source = b"incoming-bytes".to_vec();
        let mut cursor = 0usize;
        let n = rb.write_with_callback(8, |dst| {
            let take = dst.len().min(source.len() - cursor);
            dst[..take].copy_from_slice(&source[cursor..cursor + take]);
            cursor += take;
            take
        });
        assert_eq!(n, 8);
        assert_eq!(rb.bytes_available(), 8);
    }

    #[test]
    fn read_with_callback_respects_front_segment_boundary() {
        let mut rb = RingBuffer::new();
        rb.push(Bytes::from_static(b"ab"));
        rb.push(Bytes::from_static(b"cdef"));
        let mut sunk = Vec::new();
        let n = rb.read_with_callback(10, |buf| {
            sunk.extend_from_slice(buf);
            buf.len()
        });
        assert_eq!(n, 2);
        assert_eq!(sunk, b"ab");
        assert_eq!(rb.bytes_available(), 4);
    }
}
