//! Bounded output history addressed by absolute byte offsets.

use std::collections::VecDeque;

use super::error::SessionError;

/// Ring buffer over a session's output.
///
/// Offsets count every byte ever pushed, so a cursor stays meaningful after
/// eviction. The buffer never holds more than `capacity` bytes; when full the
/// oldest bytes go first.
#[derive(Debug)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    /// Absolute offset of `data[0]`.
    start: u64,
}

impl OutputBuffer {
    /// Creates an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            start: 0,
        }
    }

    /// Appends a chunk, evicting from the front as needed.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            // Only the newest `capacity` bytes of this chunk survive.
            let skip = chunk.len() - self.capacity;
            self.start += (self.data.len() + skip) as u64;
            self.data.clear();
            self.data.extend(&chunk[skip..]);
            return;
        }

        let overflow = (self.data.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.data.drain(..overflow);
            self.start += overflow as u64;
        }
        self.data.extend(chunk);
    }

    /// Reads up to `max` bytes starting at `cursor`.
    ///
    /// Returns the bytes and the cursor to pass next time. A cursor past the
    /// tail is clamped to the tail; one that was already evicted fails with
    /// [`SessionError::Truncated`].
    pub fn read_from(&self, cursor: u64, max: usize) -> Result<(Vec<u8>, u64), SessionError> {
        if cursor < self.start {
            return Err(SessionError::Truncated {
                requested: cursor,
                oldest: self.start,
            });
        }

        let cursor = cursor.min(self.end_offset());
        let from = (cursor - self.start) as usize;
        let to = self.data.len().min(from.saturating_add(max));

        let bytes: Vec<u8> = self.data.range(from..to).copied().collect();
        let next = cursor + bytes.len() as u64;
        Ok((bytes, next))
    }

    /// The last `n` retained bytes.
    pub fn tail(&self, n: usize) -> Vec<u8> {
        let from = self.data.len().saturating_sub(n);
        self.data.range(from..).copied().collect()
    }

    /// Oldest offset still retained.
    pub fn oldest_offset(&self) -> u64 {
        self.start
    }

    /// Offset one past the newest byte.
    pub fn end_offset(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    /// Bytes currently retained.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum bytes retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_read() {
        let mut buf = OutputBuffer::new(16);
        buf.push(b"hello ");
        buf.push(b"world");

        let (bytes, next) = buf.read_from(0, usize::MAX).unwrap();
        assert_eq!(bytes, b"hello world");
        assert_eq!(next, 11);
    }

    #[test]
    fn test_unchanged_cursor_returns_empty() {
        let mut buf = OutputBuffer::new(16);
        buf.push(b"abc");
        let (_, cursor) = buf.read_from(0, usize::MAX).unwrap();

        for _ in 0..3 {
            let (bytes, next) = buf.read_from(cursor, usize::MAX).unwrap();
            assert!(bytes.is_empty());
            assert_eq!(next, cursor);
        }
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut buf = OutputBuffer::new(10);
        for i in 0..100u8 {
            buf.push(&[i; 3]);
            assert!(buf.len() <= buf.capacity());
        }
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.end_offset(), 300);
        assert_eq!(buf.oldest_offset(), 290);
    }

    #[test]
    fn test_overflow_keeps_newest_tail() {
        let mut buf = OutputBuffer::new(4);
        buf.push(b"ab");
        buf.push(b"cdefgh");
        assert_eq!(buf.tail(usize::MAX), b"efgh");
        assert_eq!(buf.oldest_offset(), 4);

        buf.push(b"ij");
        assert_eq!(buf.tail(usize::MAX), b"ghij");
        assert_eq!(buf.tail(2), b"ij");
    }

    #[test]
    fn test_evicted_cursor_is_truncated() {
        let mut buf = OutputBuffer::new(4);
        buf.push(b"0123456789");

        match buf.read_from(2, usize::MAX) {
            Err(SessionError::Truncated { requested, oldest }) => {
                assert_eq!(requested, 2);
                assert_eq!(oldest, 6);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }

        // Resynchronize from the reported oldest offset.
        let (bytes, next) = buf.read_from(6, usize::MAX).unwrap();
        assert_eq!(bytes, b"6789");
        assert_eq!(next, 10);
    }

    #[test]
    fn test_cursor_ahead_is_clamped() {
        let mut buf = OutputBuffer::new(8);
        buf.push(b"abc");
        let (bytes, next) = buf.read_from(100, usize::MAX).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(next, 3);
    }

    #[test]
    fn test_limited_read() {
        let mut buf = OutputBuffer::new(32);
        buf.push(b"abcdefgh");
        let (bytes, next) = buf.read_from(2, 3).unwrap();
        assert_eq!(bytes, b"cde");
        assert_eq!(next, 5);
    }

    #[test]
    fn test_independent_cursors() {
        let mut buf = OutputBuffer::new(32);
        buf.push(b"one");
        let (_, a) = buf.read_from(0, usize::MAX).unwrap();
        buf.push(b"two");

        let (from_a, _) = buf.read_from(a, usize::MAX).unwrap();
        let (from_zero, _) = buf.read_from(0, usize::MAX).unwrap();
        assert_eq!(from_a, b"two");
        assert_eq!(from_zero, b"onetwo");
    }
}
