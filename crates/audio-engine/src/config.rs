use std::time::Duration;

use serde::Deserialize;

/// Frames per second used to size the device buffer when the host does not report one.
const ONE_SECOND_FRAMES: u32 = 48_000;

/// Engine tuning parameters.
///
/// The defaults were picked for a one second device buffer at 48 kHz; devices with very
/// different buffer sizes may want a different low-water mark and backoff.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Below this many buffered-ahead frames, resume re-enters buffering instead of
    /// starting the device right away.
    pub low_water_frames: u64,
    /// Wait used when the device buffer is full and after an underrun.
    pub backoff_ms: u64,
    /// Time given to a decoder to produce data after a seek.
    pub seek_grace_ms: u64,
    /// How long a caller waits for the engine to answer a request.
    pub request_timeout_ms: u64,
    /// Device buffer size handed to the output binding on init. `None` derives it from
    /// the host period size.
    pub buffer_size_frames: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            low_water_frames: 512,
            backoff_ms: 30,
            seek_grace_ms: 30,
            request_timeout_ms: 30_000,
            buffer_size_frames: None,
        }
    }
}

impl EngineConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn seek_grace(&self) -> Duration {
        Duration::from_millis(self.seek_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Device buffer size for a host period of `period_frames`.
    ///
    /// Roughly one second of audio, rounded up to a whole number of periods.
    pub fn effective_buffer_size(&self, period_frames: Option<u32>) -> u32 {
        if let Some(frames) = self.buffer_size_frames.filter(|f| *f > 0) {
            return frames;
        }
        device_buffer_frames(period_frames.unwrap_or(0))
    }
}

/// Round one second of frames up to a multiple of `period_frames`.
fn device_buffer_frames(period_frames: u32) -> u32 {
    if period_frames == 0 {
        return ONE_SECOND_FRAMES;
    }
    ONE_SECOND_FRAMES.div_ceil(period_frames) * period_frames
}
