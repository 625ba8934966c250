//! Raw output binding contract.
//!
//! Mirrors a native audio output API: every control call returns an integer status where
//! `0` means success and any other value is a backend specific error code. The engine never
//! talks to a binding directly; it goes through [`crate::device::OutputDevice`], which owns the
//! device lock and turns statuses into [`crate::EngineError`]s.

/// Lowest volume accepted by [`OutputBinding::set_volume_millibels`] (silence).
pub const MILLIBEL_MIN: i32 = -32768;

/// Native audio output control surface.
///
/// PCM handed to [`write_direct`](OutputBinding::write_direct) is interleaved signed 16-bit
/// little-endian, in the channel layout last passed to
/// [`reset_filters_and_write_position`](OutputBinding::reset_filters_and_write_position).
pub trait OutputBinding: Send {
    /// Host period size in frames, when the backend knows it.
    fn period_frames(&self) -> Option<u32> {
        None
    }

    fn init(&mut self, buffer_size_frames: u32) -> i32;
    fn terminate(&mut self);

    /// Open the device for `sample_rate`, replacing any previously created stream.
    fn create(&mut self, sample_rate: u32) -> i32;
    fn release(&mut self);

    fn play(&mut self) -> i32;
    fn pause(&mut self) -> i32;
    fn stop_and_flush(&mut self) -> i32;

    /// Write as many bytes of `data` as the device accepts right now.
    ///
    /// Returns the number of bytes taken (`0` when the device buffer is full) or a negative
    /// error code. Must not block.
    fn write_direct(&mut self, data: &[u8], needs_byte_swap: bool) -> i32;

    /// Frames consumed by the device read cursor since the stream was created. Wraps.
    fn head_position_frames(&self) -> u32;

    fn set_volume_millibels(&mut self, millibels: i32);

    /// Reset per-stream filter state and the write cursor for a source with `channels`.
    fn reset_filters_and_write_position(&mut self, channels: u16);
}
