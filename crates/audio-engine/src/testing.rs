//! Test doubles for the output binding and decoder sources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};

use crate::binding::OutputBinding;
use crate::buffer::OutputBuffer;
use crate::error::EngineError;
use crate::source::{BufferingInfo, DecoderSource};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BindingCall {
    Init(u32),
    Terminate,
    Create(u32),
    Release,
    Play,
    Pause,
    StopAndFlush,
    Write(usize),
    SetVolume(i32),
    ResetFilters(u16),
}

struct DeviceState {
    calls: Vec<BindingCall>,
    init_status: i32,
    create_status: i32,
    play_status: i32,
    write_status: Option<i32>,
    capacity_bytes: usize,
    queued_bytes: usize,
    frame_bytes: usize,
    head_frames: u32,
    playing: bool,
    auto_drain: bool,
}

/// Shared view of what a [`MockBinding`] was asked to do, plus knobs to script failures.
pub(crate) struct BindingLog {
    state: Mutex<DeviceState>,
}

impl BindingLog {
    pub(crate) fn calls(&self) -> Vec<BindingCall> {
        lock(&self.state).calls.clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&BindingCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| pred(c)).count()
    }

    pub(crate) fn last_volume(&self) -> Option<i32> {
        lock(&self.state).calls.iter().rev().find_map(|c| match c {
            BindingCall::SetVolume(mb) => Some(*mb),
            _ => None,
        })
    }

    pub(crate) fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub(crate) fn fail_init(&self, status: i32) {
        lock(&self.state).init_status = status;
    }

    pub(crate) fn fail_create(&self, status: i32) {
        lock(&self.state).create_status = status;
    }

    pub(crate) fn fail_play(&self, status: i32) {
        lock(&self.state).play_status = status;
    }

    /// Every following write returns `status` (negative byte count).
    pub(crate) fn fail_writes(&self, status: i32) {
        lock(&self.state).write_status = Some(status);
    }

    /// With auto drain on, everything queued is played as soon as the head is polled
    /// while the device is playing.
    pub(crate) fn set_auto_drain(&self, on: bool) {
        lock(&self.state).auto_drain = on;
    }

    pub(crate) fn is_playing(&self) -> bool {
        lock(&self.state).playing
    }
}

pub(crate) struct MockBinding {
    log: Arc<BindingLog>,
}

impl MockBinding {
    pub(crate) fn new() -> (Self, Arc<BindingLog>) {
        let log = Arc::new(BindingLog {
            state: Mutex::new(DeviceState {
                calls: Vec::new(),
                init_status: 0,
                create_status: 0,
                play_status: 0,
                write_status: None,
                capacity_bytes: 4096,
                queued_bytes: 0,
                frame_bytes: 4,
                head_frames: 0,
                playing: false,
                auto_drain: true,
            }),
        });
        (Self { log: log.clone() }, log)
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.log.state)
    }
}

impl OutputBinding for MockBinding {
    fn period_frames(&self) -> Option<u32> {
        Some(480)
    }

    fn init(&mut self, buffer_size_frames: u32) -> i32 {
        let mut s = self.state();
        s.calls.push(BindingCall::Init(buffer_size_frames));
        s.init_status
    }

    fn terminate(&mut self) {
        self.state().calls.push(BindingCall::Terminate);
    }

    fn create(&mut self, sample_rate: u32) -> i32 {
        let mut s = self.state();
        s.calls.push(BindingCall::Create(sample_rate));
        s.create_status
    }

    fn release(&mut self) {
        let mut s = self.state();
        s.calls.push(BindingCall::Release);
        s.playing = false;
        s.queued_bytes = 0;
    }

    fn play(&mut self) -> i32 {
        let mut s = self.state();
        s.calls.push(BindingCall::Play);
        if s.play_status == 0 {
            s.playing = true;
        }
        s.play_status
    }

    fn pause(&mut self) -> i32 {
        let mut s = self.state();
        s.calls.push(BindingCall::Pause);
        s.playing = false;
        0
    }

    fn stop_and_flush(&mut self) -> i32 {
        let mut s = self.state();
        s.calls.push(BindingCall::StopAndFlush);
        s.playing = false;
        s.queued_bytes = 0;
        0
    }

    fn write_direct(&mut self, data: &[u8], _needs_byte_swap: bool) -> i32 {
        let mut s = self.state();
        if let Some(status) = s.write_status {
            return status;
        }
        let free = s.capacity_bytes.saturating_sub(s.queued_bytes);
        let accepted = data.len().min(free) / s.frame_bytes * s.frame_bytes;
        s.queued_bytes += accepted;
        s.calls.push(BindingCall::Write(accepted));
        accepted as i32
    }

    fn head_position_frames(&self) -> u32 {
        let mut s = self.state();
        if s.playing && s.auto_drain {
            let frames = s.queued_bytes / s.frame_bytes;
            s.head_frames = s.head_frames.wrapping_add(frames as u32);
            s.queued_bytes = 0;
        }
        s.head_frames
    }

    fn set_volume_millibels(&mut self, millibels: i32) {
        self.state().calls.push(BindingCall::SetVolume(millibels));
    }

    fn reset_filters_and_write_position(&mut self, channels: u16) {
        let mut s = self.state();
        s.calls.push(BindingCall::ResetFilters(channels));
        s.frame_bytes = 2 * usize::from(channels.max(1));
    }
}

/// Consumer hook invocations recorded by [`MockSource`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HookCall {
    Completion,
    Error(String),
    SeekComplete,
    Info(BufferingInfo),
}

/// Buffers handed out but not yet released, across every source sharing the counter.
#[derive(Default)]
pub(crate) struct Outstanding {
    now: AtomicUsize,
    max: AtomicUsize,
}

impl Outstanding {
    fn acquire(&self) {
        let now = self.now.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn release(&self) {
        self.now.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct SourceState {
    produced: usize,
    position_frames: u64,
    used_since_reset: bool,
    stalled: bool,
    fail_next_buffer: Option<&'static str>,
    fail_reset: Option<&'static str>,
    fail_seek: Option<&'static str>,
    released: Vec<usize>,
    hooks: Vec<HookCall>,
    underruns: usize,
    started_as_next: usize,
    seeks: Vec<u64>,
    last_position_ms: Option<u64>,
}

pub(crate) struct MockSource {
    sample_rate: u32,
    channels: u16,
    live: bool,
    chunks: usize,
    chunk_bytes: usize,
    duration_ms: u64,
    outstanding: Arc<Outstanding>,
    state: Mutex<SourceState>,
}

pub(crate) struct MockSourceBuilder {
    sample_rate: u32,
    channels: u16,
    live: bool,
    chunks: usize,
    chunk_bytes: usize,
    position_frames: u64,
    outstanding: Option<Arc<Outstanding>>,
}

impl MockSourceBuilder {
    pub(crate) fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub(crate) fn live(mut self) -> Self {
        self.live = true;
        self
    }

    /// Produce `count` buffers of `bytes` each, the last one flagged as terminal.
    pub(crate) fn chunks(mut self, count: usize, bytes: usize) -> Self {
        self.chunks = count;
        self.chunk_bytes = bytes;
        self
    }

    pub(crate) fn position_frames(mut self, frames: u64) -> Self {
        self.position_frames = frames;
        self
    }

    pub(crate) fn outstanding(mut self, counter: Arc<Outstanding>) -> Self {
        self.outstanding = Some(counter);
        self
    }

    pub(crate) fn build(self) -> Arc<MockSource> {
        let frame_bytes = 2 * u64::from(self.channels.max(1));
        let total_frames = (self.chunks * self.chunk_bytes) as u64 / frame_bytes;
        Arc::new(MockSource {
            sample_rate: self.sample_rate,
            channels: self.channels,
            live: self.live,
            chunks: self.chunks,
            chunk_bytes: self.chunk_bytes,
            duration_ms: total_frames * 1000 / u64::from(self.sample_rate.max(1)),
            outstanding: self.outstanding.unwrap_or_default(),
            state: Mutex::new(SourceState {
                position_frames: self.position_frames,
                ..SourceState::default()
            }),
        })
    }
}

impl MockSource {
    pub(crate) fn builder() -> MockSourceBuilder {
        MockSourceBuilder {
            sample_rate: 44_100,
            channels: 2,
            live: false,
            chunks: 4,
            chunk_bytes: 1024,
            position_frames: 0,
            outstanding: None,
        }
    }

    fn state(&self) -> MutexGuard<'_, SourceState> {
        lock(&self.state)
    }

    pub(crate) fn released_indices(&self) -> Vec<usize> {
        self.state().released.clone()
    }

    pub(crate) fn hooks(&self) -> Vec<HookCall> {
        self.state().hooks.clone()
    }

    pub(crate) fn underruns(&self) -> usize {
        self.state().underruns
    }

    pub(crate) fn started_as_next_count(&self) -> usize {
        self.state().started_as_next
    }

    pub(crate) fn seeks(&self) -> Vec<u64> {
        self.state().seeks.clone()
    }

    pub(crate) fn last_position_ms(&self) -> Option<u64> {
        self.state().last_position_ms
    }

    /// While stalled the source hands out nothing, as a decoder that fell behind.
    pub(crate) fn set_stalled(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    pub(crate) fn fail_next_buffer(&self, msg: &'static str) {
        self.state().fail_next_buffer = Some(msg);
    }

    pub(crate) fn fail_reset(&self, msg: &'static str) {
        self.state().fail_reset = Some(msg);
    }

    pub(crate) fn fail_seek(&self, msg: &'static str) {
        self.state().fail_seek = Some(msg);
    }
}

impl DecoderSource for MockSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channel_count(&self) -> u16 {
        self.channels
    }

    fn current_position_frames(&self) -> u64 {
        self.state().position_frames
    }

    fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    fn is_output_over(&self) -> bool {
        self.state().produced >= self.chunks
    }

    fn is_live_stream(&self) -> bool {
        self.live
    }

    fn reset_decoder_if_output_already_used(&self) -> Result<()> {
        let mut s = self.state();
        if let Some(msg) = s.fail_reset {
            bail!(msg);
        }
        if s.used_since_reset {
            s.produced = 0;
            s.used_since_reset = false;
        }
        Ok(())
    }

    fn next_output_buffer(&self, buffer: &mut OutputBuffer) -> Result<()> {
        let mut s = self.state();
        if let Some(msg) = s.fail_next_buffer {
            bail!(msg);
        }
        if s.produced >= self.chunks {
            buffer.mark_stream_over();
            return Ok(());
        }
        if s.stalled {
            return Ok(());
        }
        let index = s.produced;
        s.produced += 1;
        s.used_since_reset = true;
        let last = s.produced == self.chunks;
        self.outstanding.acquire();
        buffer.fill(index, vec![0; self.chunk_bytes], last);
        Ok(())
    }

    fn release_output_buffer(&self, index: usize) {
        self.state().released.push(index);
        self.outstanding.release();
    }

    fn do_seek(&self, ms: u64) -> Result<()> {
        let mut s = self.state();
        if let Some(msg) = s.fail_seek {
            bail!(msg);
        }
        s.seeks.push(ms);
        s.position_frames = ms * u64::from(self.sample_rate) / 1000;
        s.produced = 0;
        Ok(())
    }

    fn notify_underrun(&self) {
        self.state().underruns += 1;
    }

    fn started_as_next(&self) {
        self.state().started_as_next += 1;
    }

    fn set_current_position(&self, ms: u64) {
        self.state().last_position_ms = Some(ms);
    }

    fn on_completion(&self) {
        self.state().hooks.push(HookCall::Completion);
    }

    fn on_error(&self, error: &EngineError) {
        self.state().hooks.push(HookCall::Error(error.to_string()));
    }

    fn on_seek_complete(&self) {
        self.state().hooks.push(HookCall::SeekComplete);
    }

    fn on_info(&self, info: BufferingInfo) {
        self.state().hooks.push(HookCall::Info(info));
    }
}
