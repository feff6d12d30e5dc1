//! Bounded scrollback window
//!
//! Keeps the most recent `capacity` bytes of a session's output so that late
//! or reconnecting observers can be replayed recent history. Trimming is
//! byte-granular: the retained bytes are always a suffix of everything ever
//! appended.

use std::collections::VecDeque;

/// A fixed-capacity byte window that discards from the head.
#[derive(Debug, Clone)]
pub struct ScrollbackBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl ScrollbackBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append at the tail, trimming the oldest bytes beyond capacity.
    pub fn append(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }

        if data.len() >= self.capacity {
            self.buf.clear();
            self.buf
                .extend(&data[data.len() - self.capacity..]);
            return;
        }

        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(data);
    }

    /// Current window in chronological order.
    pub fn snapshot(&self) -> Vec<u8> {
        let (head, tail) = self.buf.as_slices();
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        out
    }

    /// Discard all retained bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
impl ScrollbackBuffer {
    fn len(&self) -> usize {
        self.buf.len()
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
