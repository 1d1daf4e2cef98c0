//! Bounded byte ring buffer for process output.
//!
//! Writes beyond capacity drop the oldest bytes in place, so the last
//! `capacity` bytes are always retained exactly. Reads address the logical
//! stream: `total_written` counts every byte ever written, and offsets below
//! `start_offset` have been truncated away.

use std::collections::VecDeque;

/// Default per-process capture cap (10 MiB).
pub const DEFAULT_BUFFER_MAX_BYTES: usize = 10 * 1024 * 1024;

pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
    total_written: u64,
}

/// One read from the ring. `truncated` is set when the requested offset
/// preceded the retained window.
#[derive(Debug, Clone)]
pub struct Slice {
    pub data: Vec<u8>,
    /// Logical offset of `data[0]` in the full stream.
    pub offset: u64,
    pub truncated: bool,
    pub total_written: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity: capacity.max(1),
            total_written: 0,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.total_written += bytes.len() as u64;

        // oversized writes only keep their own tail
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };

        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(bytes);
        debug_assert!(self.buf.len() <= self.capacity);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Logical offset of the oldest retained byte.
    pub fn start_offset(&self) -> u64 {
        self.total_written - self.buf.len() as u64
    }

    /// Read up to `limit` bytes starting at logical `offset`.
    pub fn read(&self, offset: u64, limit: usize) -> Slice {
        let start = self.start_offset();
        let truncated = offset < start;
        let effective = offset.max(start);

        if effective >= self.total_written {
            return Slice {
                data: Vec::new(),
                offset: self.total_written,
                truncated,
                total_written: self.total_written,
            };
        }

        let skip = (effective - start) as usize;
        let data: Vec<u8> = self.buf.iter().skip(skip).take(limit).copied().collect();
        Slice {
            data,
            offset: effective,
            truncated,
            total_written: self.total_written,
        }
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_MAX_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_capacity() {
        let mut ring = RingBuffer::new(8);
        for _ in 0..100 {
            ring.write(b"abc");
        }
        assert!(ring.len() <= 8);
        assert_eq!(ring.total_written(), 300);
    }

    #[test]
    fn overflow_drops_oldest_keeps_last_n_exactly() {
        let mut ring = RingBuffer::new(4);
        ring.write(b"0123456789");
        let slice = ring.read(0, 16);
        assert!(slice.truncated);
        assert_eq!(slice.data, b"6789");
        assert_eq!(slice.offset, 6);
    }

    #[test]
    fn single_write_larger_than_capacity_keeps_tail() {
        let mut ring = RingBuffer::new(4);
        ring.write(b"abcdefgh");
        ring.write(b"Z");
        assert_eq!(ring.read(ring.start_offset(), 16).data, b"fghZ");
    }

    #[test]
    fn read_from_valid_offset_is_exact() {
        let mut ring = RingBuffer::new(64);
        ring.write(b"hello world");
        let slice = ring.read(6, 5);
        assert!(!slice.truncated);
        assert_eq!(slice.data, b"world");
        assert_eq!(slice.offset, 6);
    }

    #[test]
    fn read_past_end_is_empty() {
        let mut ring = RingBuffer::new(64);
        ring.write(b"abc");
        let slice = ring.read(10, 5);
        assert!(slice.data.is_empty());
        assert_eq!(slice.total_written, 3);
    }

    #[test]
    fn limit_caps_read() {
        let mut ring = RingBuffer::new(64);
        ring.write(b"abcdefgh");
        assert_eq!(ring.read(0, 3).data, b"abc");
    }
}
