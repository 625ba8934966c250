//! Locked wrapper around the output binding.
//!
//! The binding is touched from the engine thread (create/write/release) and from caller
//! threads (volume), so every call goes through one mutex. The wrapper also remembers the
//! sample rate the device was created for and the volume to re-apply after each create.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::binding::{MILLIBEL_MIN, OutputBinding};
use crate::error::{EngineError, Result, check_status};

/// PCM from decoder sources is little-endian; big-endian hosts have to swap.
const NEEDS_BYTE_SWAP: bool = cfg!(target_endian = "big");

pub struct OutputDevice {
    inner: Mutex<DeviceInner>,
}

struct DeviceInner {
    binding: Box<dyn OutputBinding>,
    sample_rate: u32,
    volume_millibels: i32,
}

impl OutputDevice {
    pub fn new(binding: Box<dyn OutputBinding>) -> Self {
        Self {
            inner: Mutex::new(DeviceInner {
                binding,
                sample_rate: 0,
                volume_millibels: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn period_frames(&self) -> Option<u32> {
        self.lock().binding.period_frames()
    }

    pub fn init(&self, buffer_size_frames: u32) -> Result<()> {
        let status = self.lock().binding.init(buffer_size_frames);
        check_status(status).map_err(|e| EngineError::Init { code: e.code() })
    }

    pub fn terminate(&self) {
        let mut g = self.lock();
        g.binding.terminate();
        g.sample_rate = 0;
    }

    /// Sample rate of the currently created stream, `0` when released.
    pub fn sample_rate(&self) -> u32 {
        self.lock().sample_rate
    }

    /// Create the device for `sample_rate` unless it already runs at that rate.
    ///
    /// Returns `true` when a new stream was created.
    pub fn ensure_created(&self, sample_rate: u32) -> Result<bool> {
        let mut g = self.lock();
        if g.sample_rate == sample_rate {
            return Ok(false);
        }
        check_status(g.binding.create(sample_rate))?;
        g.sample_rate = sample_rate;
        let volume = g.volume_millibels;
        g.binding.set_volume_millibels(volume);
        tracing::debug!(rate_hz = sample_rate, volume_mb = volume, "output device created");
        Ok(true)
    }

    pub fn release(&self) {
        let mut g = self.lock();
        g.binding.release();
        g.sample_rate = 0;
    }

    pub fn play(&self) -> Result<()> {
        check_status(self.lock().binding.play())
    }

    pub fn pause(&self) -> Result<()> {
        check_status(self.lock().binding.pause())
    }

    pub fn stop_and_flush(&self) -> Result<()> {
        check_status(self.lock().binding.stop_and_flush())
    }

    /// Write what the device accepts right now; `Ok(0)` means its buffer is full.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let written = self.lock().binding.write_direct(data, NEEDS_BYTE_SWAP);
        if written < 0 {
            return Err(EngineError::Io {
                code: written.unsigned_abs(),
            });
        }
        Ok(written as usize)
    }

    pub fn head_position_frames(&self) -> u32 {
        self.lock().binding.head_position_frames()
    }

    pub fn reset_filters_and_write_position(&self, channels: u16) {
        self.lock().binding.reset_filters_and_write_position(channels);
    }

    /// Set the output volume. Safe to call from any thread at any time.
    pub fn set_volume_millibels(&self, millibels: i32) {
        let millibels = millibels.clamp(MILLIBEL_MIN, 0);
        let mut g = self.lock();
        g.volume_millibels = millibels;
        g.binding.set_volume_millibels(millibels);
    }

    pub fn volume_millibels(&self) -> i32 {
        self.lock().volume_millibels
    }
}
