use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// a byte queue built from owned segments
///
/// append and drain-from-front are cheap; peeking returns the first
/// contiguous segment without copying. used for wire input, codec output
/// and buffered filter data alike.
#[derive(Debug, Default)]
pub struct Buffer {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            segments: VecDeque::new(),
            len: 0,
        }
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        let mut buffer = Buffer::new();
        buffer.append(bytes);
        buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segments.push_back(bytes);
    }

    pub fn append_slice(&mut self, slice: &[u8]) {
        self.append(Bytes::copy_from_slice(slice));
    }

    /// move the whole of `other` onto the end of this buffer
    pub fn move_from(&mut self, other: &mut Buffer) {
        self.len += other.len;
        other.len = 0;
        self.segments.append(&mut other.segments);
    }

    /// put `other` in front of the existing content
    pub fn prepend(&mut self, other: Buffer) {
        self.len += other.len;
        for segment in other.segments.into_iter().rev() {
            self.segments.push_front(segment);
        }
    }

    /// first contiguous segment, if any
    pub fn first_slice(&self) -> Option<&[u8]> {
        self.segments.front().map(|segment| segment.as_ref())
    }

    /// drop `count` bytes off the front
    pub fn advance(&mut self, mut count: usize) {
        debug_assert!(count <= self.len);
        self.len -= count.min(self.len);
        while count > 0 {
            let Some(front) = self.segments.front_mut() else {
                return;
            };
            if front.len() > count {
                front.advance_impl(count);
                return;
            }
            count -= front.len();
            self.segments.pop_front();
        }
    }

    /// take up to `count` bytes off the front as one contiguous block
    pub fn split_to(&mut self, count: usize) -> Bytes {
        let count = count.min(self.len);
        if count == 0 {
            return Bytes::new();
        }
        // fast path when the first segment covers the request
        if let Some(front) = self.segments.front_mut() {
            if front.len() >= count {
                let out = front.split_to(count);
                if front.is_empty() {
                    self.segments.pop_front();
                }
                self.len -= count;
                return out;
            }
        }
        let mut out = BytesMut::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            let front = self.segments.front_mut().expect("len accounting broken");
            if front.len() <= remaining {
                remaining -= front.len();
                out.extend_from_slice(front);
                self.segments.pop_front();
            } else {
                out.extend_from_slice(&front[..remaining]);
                front.advance_impl(remaining);
                remaining = 0;
            }
        }
        self.len -= count;
        out.freeze()
    }

    /// drain everything as one contiguous block
    pub fn take_all(&mut self) -> Bytes {
        let len = self.len;
        self.split_to(len)
    }

    /// copy the whole content without draining, for inspection in tests
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }
}

trait AdvanceBytes {
    fn advance_impl(&mut self, count: usize);
}

impl AdvanceBytes for Bytes {
    fn advance_impl(&mut self, count: usize) {
        *self = self.slice(count..);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_drain() {
        let mut buffer = Buffer::new();
        buffer.append_slice(b"hello ");
        buffer.append_slice(b"world");
        assert_eq!(buffer.len(), 11);
        assert_eq!(buffer.first_slice(), Some(b"hello ".as_ref()));
        buffer.advance(6);
        assert_eq!(buffer.take_all(), Bytes::from_static(b"world"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn split_across_segments() {
        let mut buffer = Buffer::new();
        buffer.append_slice(b"abc");
        buffer.append_slice(b"def");
        let front = buffer.split_to(4);
        assert_eq!(front, Bytes::from_static(b"abcd"));
        assert_eq!(buffer.take_all(), Bytes::from_static(b"ef"));
    }

    #[test]
    fn prepend_keeps_order() {
        let mut buffer = Buffer::new();
        buffer.append_slice(b"tail");
        let mut front = Buffer::new();
        front.append_slice(b"head ");
        buffer.prepend(front);
        assert_eq!(buffer.copy_to_vec(), b"head tail");
    }

    #[test]
    fn advance_partial_segment() {
        let mut buffer = Buffer::new();
        buffer.append_slice(b"abcdef");
        buffer.advance(2);
        assert_eq!(buffer.first_slice(), Some(b"cdef".as_ref()));
        assert_eq!(buffer.len(), 4);
    }
}
