use bytes::Bytes;
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Fixed-capacity chunk buffer that discards its oldest chunks on overflow.
///
/// Buffered bytes never exceed `capacity`. A single chunk larger than the
/// whole buffer keeps only its trailing `capacity` bytes.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    chunks: VecDeque<Bytes>,
    size: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            chunks: VecDeque::new(),
            size: 0,
        }
    }

    /// Append a chunk, evicting the oldest data until it fits.
    ///
    /// Returns `true` if anything was dropped to make room.
    pub fn push(&mut self, data: Bytes) -> bool {
        if data.is_empty() {
            return false;
        }

        if data.len() > self.capacity {
            self.chunks.clear();
            self.size = 0;
            if self.capacity > 0 {
                let tail = data.slice(data.len() - self.capacity..);
                self.size = tail.len();
                self.chunks.push_back(tail);
            }
            return true;
        }

        let mut dropped = false;
        while self.size + data.len() > self.capacity {
            match self.chunks.pop_front() {
                Some(oldest) => {
                    self.size -= oldest.len();
                    dropped = true;
                }
                None => break,
            }
        }

        self.size += data.len();
        self.chunks.push_back(data);
        dropped
    }

    /// Bytes currently buffered
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
