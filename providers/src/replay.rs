use relay_core::AudioFrame;
use std::collections::VecDeque;

/// Bounded FIFO of outbound audio kept while a connection is not ready.
///
/// When full, the oldest frame is dropped to make room.
#[derive(Debug)]
pub struct ReplayBuffer {
    frames: VecDeque<AudioFrame>,
    capacity: usize,
    dropped: u64
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0
        }
    }

    /// Append a frame. Returns `true` when an older frame was evicted.
    pub fn push(&mut self, frame: AudioFrame) -> bool {
        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_front();
            self.dropped += 1;
            true
        } else {
            false
        };
        self.frames.push_back(frame);
        evicted
    }

    /// Take every buffered frame, oldest first.
    pub fn drain(&mut self) -> Vec<AudioFrame> {
        self.frames.drain(..).collect()
    }

    /// Put back frames that were drained but could not be delivered. They
    /// go ahead of anything buffered since; overflow still drops the oldest.
    /// Returns the number of frames lost to overflow.
    pub fn restore_front(&mut self, frames: Vec<AudioFrame>) -> usize {
        for frame in frames.into_iter().rev() {
            self.frames.push_front(frame);
        }
        let mut lost = 0;
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
            lost += 1;
        }
        self.dropped += lost as u64;
        lost
    }

    /// Throw away everything buffered. Returns how many frames were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.frames.len();
        self.frames.clear();
        self.dropped += discarded as u64;
        discarded
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

    /// Frames evicted over the buffer's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
