//! cpal output stream and its realtime callback.
//!
//! The callback:
//! - outputs silence without draining anything while paused
//! - pulls queued frames without blocking and counts them on the head position once played
//! - drops frames it already pulled when the binding flushed in the meantime
//! - applies channel mapping (mono↔stereo, best-effort otherwise) and the volume gain
//! - converts `f32` samples to the device sample format

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use super::queue::PcmQueue;

/// State shared by the binding (engine thread) and the stream callback.
pub struct StreamShared {
    pub queue: PcmQueue,
    /// Source frames consumed by the device since init. Wraps around.
    pub head_frames: AtomicU32,
    /// Linear gain as `f32` bits.
    gain_bits: AtomicU32,
    pub paused: AtomicBool,
    pub underrun_events: AtomicU64,
    /// Bumped on every flush; the callback discards frames pulled before it.
    flush_generation: AtomicU64,
}

impl StreamShared {
    pub fn new(channels: usize, capacity_frames: usize) -> Self {
        Self {
            queue: PcmQueue::new(channels, capacity_frames),
            head_frames: AtomicU32::new(0),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            paused: AtomicBool::new(true),
            underrun_events: AtomicU64::new(0),
            flush_generation: AtomicU64::new(0),
        }
    }

    /// Drop everything queued, including frames the callback holds but has not played.
    pub fn flush(&self) {
        self.flush_generation.fetch_add(1, Ordering::AcqRel);
        self.queue.clear();
    }

    /// Flush and switch the queue to a new channel count.
    pub fn reset(&self, channels: usize) {
        self.flush_generation.fetch_add(1, Ordering::AcqRel);
        self.queue.reset(channels);
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }
}

/// Frames pulled from the queue per refill.
const REFILL_MAX_FRAMES: usize = 1024;

/// Build a cpal output stream fed from `shared.queue`.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    shared: &Arc<StreamShared>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, shared),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, shared),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, shared),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, shared),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: &Arc<StreamShared>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = usize::from(config.channels).max(1);
    let state = Mutex::new(CallbackState::default());
    let shared_cb = shared.clone();
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
            render(&shared_cb, &mut st, channels_out, data);
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Fill one device period from the queue.
///
/// The head position advances by the frames actually written to `data`, never by frames
/// merely pulled from the queue.
fn render<T>(shared: &StreamShared, st: &mut CallbackState, channels_out: usize, data: &mut [T])
where
    T: cpal::Sample + cpal::FromSample<f32>,
{
    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
    if shared.paused.load(Ordering::Relaxed) {
        data.fill(silence);
        return;
    }
    let generation = shared.flush_generation.load(Ordering::Acquire);
    if st.generation != generation {
        st.generation = generation;
        st.pos = 0;
        st.src.clear();
    }

    let gain = shared.gain();
    let frames = data.len() / channels_out;
    let mut played: u32 = 0;
    for frame in 0..frames {
        if st.pos >= st.src.len() {
            st.pos = 0;
            st.src.clear();
            match shared.queue.pop_up_to(REFILL_MAX_FRAMES) {
                Some((src_channels, samples)) => {
                    st.src_channels = src_channels;
                    st.src = samples;
                }
                None => {
                    shared.underrun_events.fetch_add(1, Ordering::Relaxed);
                    data[frame * channels_out..].fill(silence);
                    break;
                }
            }
        }
        for ch in 0..channels_out {
            let sample = next_sample_mapped(st, channels_out, ch) * gain;
            data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
        }
        played += 1;
    }
    if played > 0 {
        shared.head_frames.fetch_add(played, Ordering::Relaxed);
    }
}

/// Samples popped from the queue but not yet played.
#[derive(Default)]
struct CallbackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
    /// Flush generation `src` was pulled under.
    generation: u64,
}

/// Read one output sample for `dst_ch`, applying a simple channel mapping.
///
/// `st.pos` advances once per destination frame (after the last channel).
fn next_sample_mapped(st: &mut CallbackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &CallbackState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (1, 1) => get_src(0, st),
        (2, 2) => get_src(dst_ch.min(1), st),
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, 2) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels.max(1);
    }
    out
}

/// Decode 16-bit little-endian PCM into `f32` samples.
///
/// `needs_byte_swap` is set on hosts whose native order differs from the data.
pub fn pcm16_to_f32(bytes: &[u8], needs_byte_swap: bool, out: &mut Vec<f32>) {
    out.clear();
    out.extend(bytes.chunks_exact(2).map(|b| {
        let raw = i16::from_ne_bytes([b[0], b[1]]);
        let sample = if needs_byte_swap { raw.swap_bytes() } else { raw };
        f32::from(sample) / 32_768.0
    }));
}

/// Linear gain for an attenuation in millibels; the minimum is treated as silence.
pub fn millibels_to_gain(millibels: i32) -> f32 {
    if millibels <= crate::binding::MILLIBEL_MIN {
        return 0.0;
    }
    10f32.powf(millibels.min(0) as f32 / 2000.0)
}
