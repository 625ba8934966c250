use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Counters published by the engine thread after every request and loop iteration.
///
/// Readers on other threads get a best-effort view; values can change right after a load.
#[derive(Debug, Default)]
pub struct EngineStatus {
    pub(crate) paused: AtomicBool,
    pub(crate) play_pending: AtomicBool,
    pub(crate) sample_rate: AtomicU32,
    pub(crate) frames_written: AtomicU64,
    pub(crate) frames_played: AtomicU64,
    pub(crate) next_frames_written: AtomicU64,
    pub(crate) has_current: AtomicBool,
    pub(crate) has_next: AtomicBool,
    pub(crate) crossover: AtomicBool,
    pub(crate) buffer_held: AtomicBool,
    pub(crate) underruns: AtomicU64,
}

/// Point-in-time copy of [`EngineStatus`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub paused: bool,
    pub play_pending: bool,
    pub sample_rate: u32,
    pub frames_written: u64,
    pub frames_played: u64,
    pub next_frames_written: u64,
    pub has_current: bool,
    pub has_next: bool,
    pub crossover: bool,
    pub buffer_held: bool,
    pub underruns: u64,
}

impl StatusSnapshot {
    /// Playback position of the current source in milliseconds.
    pub fn position_ms(&self) -> Option<u64> {
        if self.sample_rate == 0 {
            return None;
        }
        Some(self.frames_played.saturating_mul(1000) / self.sample_rate as u64)
    }

    /// Frames written to the device but not yet played.
    pub fn buffered_frames(&self) -> u64 {
        self.frames_written.saturating_sub(self.frames_played)
    }

    /// Nothing is loaded and the device is released.
    pub fn is_idle(&self) -> bool {
        self.paused && !self.has_current && self.sample_rate == 0
    }
}

impl EngineStatus {
    pub fn shared() -> Arc<Self> {
        let status = Self::default();
        status.paused.store(true, Ordering::Relaxed);
        Arc::new(status)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            paused: self.paused.load(Ordering::Relaxed),
            play_pending: self.play_pending.load(Ordering::Relaxed),
            sample_rate: self.sample_rate.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            next_frames_written: self.next_frames_written.load(Ordering::Relaxed),
            has_current: self.has_current.load(Ordering::Relaxed),
            has_next: self.has_next.load(Ordering::Relaxed),
            crossover: self.crossover.load(Ordering::Relaxed),
            buffer_held: self.buffer_held.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_status_starts_paused_and_idle() {
        let status = EngineStatus::shared();
        let snap = status.snapshot();
        assert!(snap.paused);
        assert!(snap.is_idle());
        assert_eq!(snap.position_ms(), None);
    }

    #[test]
    fn snapshot_reports_position_and_buffered_frames() {
        let status = EngineStatus::shared();
        status.sample_rate.store(48_000, Ordering::Relaxed);
        status.frames_played.store(96_000, Ordering::Relaxed);
        status.frames_written.store(100_000, Ordering::Relaxed);

        let snap = status.snapshot();
        assert_eq!(snap.position_ms(), Some(2000));
        assert_eq!(snap.buffered_frames(), 4000);
    }
}
