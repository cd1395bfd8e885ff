// src/connection/outbound.rs

use std::collections::VecDeque;

/// A bounded FIFO of encoded frames waiting to be written. When full, the
/// oldest unsent frame makes room for the newest.
///
/// The bound covers waiting frames only. A frame the writer has popped is
/// already on its way to the socket and can no longer be evicted.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<String>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Appends `frame`, returning the frame evicted to make room, if any.
    pub fn push(&mut self, frame: String) -> Option<String> {
        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    pub fn pop(&mut self) -> Option<String> {
        self.frames.pop_front()
    }

    /// Removes and returns every queued frame, oldest first.
    pub fn take_all(&mut self) -> Vec<String> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
