//! # Inbound Frame Buffer
//!
//! Bounded queue of the most recent microphone frames for one connection.
//! When full, pushing a new frame evicts the oldest one, so memory stays
//! fixed no matter how long a user talks without a silence flush.

use bytes::Bytes;
use std::collections::VecDeque;

/// Fixed-capacity, drop-oldest frame queue.
///
/// Owned by a single connection's session record; no internal locking.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    frames: VecDeque<Bytes>,
    capacity: usize,
    /// Frames evicted since the last clear
    dropped: usize,
}

impl FrameBuffer {
    /// Create a buffer holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append a frame, evicting the oldest when the buffer is full.
    ///
    /// Returns `true` if a frame was evicted.
    pub fn push(&mut self, frame: Bytes) -> bool {
        let evicted = if self.frames.len() == self.capacity {
            self.frames.pop_front();
            self.dropped += 1;
            true
        } else {
            false
        };
        self.frames.push_back(frame);
        evicted
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Total bytes currently buffered.
    pub fn byte_len(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum()
    }

    /// Buffered audio joined into one contiguous payload, oldest frame first.
    pub fn to_contiguous(&self) -> Vec<u8> {
        let frames: Vec<&[u8]> = self.frames.iter().map(|f| f.as_ref()).collect();
        crate::audio::processor::concat(&frames)
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.dropped = 0;
    }
}
