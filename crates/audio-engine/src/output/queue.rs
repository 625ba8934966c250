//! Bounded sample queue between the engine thread and the cpal callback.
//!
//! Unlike a decode pipeline queue, nothing here ever blocks: the engine thread pushes what
//! fits and retries later, and the callback pops what is there and plays silence otherwise.
//! The number of frames the queue can hold is the device buffer the engine fills.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Interleaved `f32` samples with a channel count that changes only on reset.
pub struct PcmQueue {
    inner: Mutex<QueueInner>,
    capacity_frames: usize,
}

struct QueueInner {
    samples: VecDeque<f32>,
    channels: usize,
}

impl PcmQueue {
    pub fn new(channels: usize, capacity_frames: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                samples: VecDeque::new(),
                channels: channels.max(1),
            }),
            capacity_frames,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channels(&self) -> usize {
        self.lock().channels
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Current buffered frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        let g = self.lock();
        g.samples.len() / g.channels
    }

    /// Frames that can be pushed right now.
    pub fn free_frames(&self) -> usize {
        self.capacity_frames.saturating_sub(self.len_frames())
    }

    /// Push as many whole frames from `samples` as fit. Returns the number of frames taken.
    pub fn push_frames(&self, samples: &[f32]) -> usize {
        let mut g = self.lock();
        let channels = g.channels;
        let free = self
            .capacity_frames
            .saturating_sub(g.samples.len() / channels);
        let frames = (samples.len() / channels).min(free);
        g.samples.extend(&samples[..frames * channels]);
        frames
    }

    /// Pop up to `max_frames` whole frames, or `None` if the queue is empty.
    pub fn pop_up_to(&self, max_frames: usize) -> Option<(usize, Vec<f32>)> {
        let mut g = self.lock();
        let channels = g.channels;
        let frames = (g.samples.len() / channels).min(max_frames);
        if frames == 0 {
            return None;
        }
        let out: Vec<f32> = g.samples.drain(..frames * channels).collect();
        Some((channels, out))
    }

    pub fn clear(&self) {
        self.lock().samples.clear();
    }

    /// Drop everything queued and switch to a new channel layout.
    pub fn reset(&self, channels: usize) {
        let mut g = self.lock();
        g.samples.clear();
        g.channels = channels.max(1);
    }
}
