//! cpal-backed [`OutputBinding`].
//!
//! cpal streams are not `Send` on every host, so a dedicated stream-owner thread creates,
//! starts, pauses and drops the stream on command. Everything the engine thread needs at
//! write speed (the sample queue, head counter, gain and pause flag) lives in
//! [`StreamShared`] and never goes through that thread.

mod queue;
pub mod select;
mod stream;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::binding::OutputBinding;
pub use select::{DeviceInfo, list_devices};
use stream::{StreamShared, build_output_stream, millibels_to_gain, pcm16_to_f32};

/// `init` could not find or open the output device.
pub const STATUS_NO_DEVICE: i32 = -1;
/// The device cannot run at the requested sample rate.
pub const STATUS_UNSUPPORTED_RATE: i32 = -2;
/// cpal failed to build, start or pause the stream.
pub const STATUS_STREAM: i32 = -3;
/// Called before `init` or after `terminate`.
pub const STATUS_NOT_INITIALIZED: i32 = -4;

enum StreamCommand {
    Create { rate: u32, reply: Sender<i32> },
    Play { reply: Sender<i32> },
    Pause { reply: Sender<i32> },
    Release,
}

pub struct CpalBinding {
    device_name: Option<String>,
    period: Option<u32>,
    shared: Arc<StreamShared>,
    commands: Option<Sender<StreamCommand>>,
    owner: Option<JoinHandle<()>>,
    pcm: Vec<f32>,
}

impl CpalBinding {
    /// Binding for the output device whose name contains `device_name`, or the default one.
    ///
    /// Only checks that the device exists; the stream is created later by the engine.
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = select::pick_device(&host, device_name)?;
        let name = device
            .description()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let period = select::default_period_frames(&device);
        tracing::info!(device = %name, period_frames = ?period, "output device selected");

        Ok(Self {
            device_name: device_name.map(str::to_string),
            period,
            shared: Arc::new(StreamShared::new(2, 0)),
            commands: None,
            owner: None,
            pcm: Vec::new(),
        })
    }

    fn request(&self, make: impl FnOnce(Sender<i32>) -> StreamCommand) -> i32 {
        let Some(commands) = &self.commands else {
            return STATUS_NOT_INITIALIZED;
        };
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if commands.send(make(reply_tx)).is_err() {
            return STATUS_NOT_INITIALIZED;
        }
        reply_rx.recv().unwrap_or(STATUS_NOT_INITIALIZED)
    }
}

impl OutputBinding for CpalBinding {
    fn period_frames(&self) -> Option<u32> {
        self.period
    }

    fn init(&mut self, buffer_size_frames: u32) -> i32 {
        if self.commands.is_some() {
            return 0;
        }
        self.shared = Arc::new(StreamShared::new(2, buffer_size_frames as usize));
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let shared = self.shared.clone();
        let device_name = self.device_name.clone();

        let spawned = std::thread::Builder::new()
            .name("audio-engine-cpal".to_string())
            .spawn(move || {
                let device = match select::pick_device(&cpal::default_host(), device_name.as_deref())
                {
                    Ok(device) => device,
                    Err(err) => {
                        tracing::error!(error = %err, "output device disappeared");
                        let _ = ready_tx.send(STATUS_NO_DEVICE);
                        return;
                    }
                };
                let _ = ready_tx.send(0);
                stream_owner_main(device, shared, buffer_size_frames, cmd_rx);
            });
        let owner = match spawned {
            Ok(owner) => owner,
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn stream owner thread");
                return STATUS_NO_DEVICE;
            }
        };

        let status = ready_rx.recv().unwrap_or(STATUS_NO_DEVICE);
        if status != 0 {
            let _ = owner.join();
            return status;
        }
        self.commands = Some(cmd_tx);
        self.owner = Some(owner);
        tracing::debug!(buffer_size_frames, "cpal binding initialized");
        0
    }

    fn terminate(&mut self) {
        self.release();
        let underruns = self.shared.underrun_events.load(Ordering::Relaxed);
        if self.commands.is_some() && underruns > 0 {
            tracing::info!(underruns, "device ran dry while playing");
        }
        // Dropping the sender ends the owner thread's command loop.
        self.commands = None;
        if let Some(owner) = self.owner.take() {
            if owner.join().is_err() {
                tracing::error!("stream owner thread panicked");
            }
        }
    }

    fn create(&mut self, sample_rate: u32) -> i32 {
        self.shared.paused.store(true, Ordering::Relaxed);
        self.shared.flush();
        self.request(|reply| StreamCommand::Create {
            rate: sample_rate,
            reply,
        })
    }

    fn release(&mut self) {
        self.shared.paused.store(true, Ordering::Relaxed);
        self.shared.flush();
        if let Some(commands) = &self.commands {
            let _ = commands.send(StreamCommand::Release);
        }
    }

    fn play(&mut self) -> i32 {
        let status = self.request(|reply| StreamCommand::Play { reply });
        if status == 0 {
            self.shared.paused.store(false, Ordering::Relaxed);
        }
        status
    }

    fn pause(&mut self) -> i32 {
        self.shared.paused.store(true, Ordering::Relaxed);
        self.request(|reply| StreamCommand::Pause { reply })
    }

    fn stop_and_flush(&mut self) -> i32 {
        self.shared.paused.store(true, Ordering::Relaxed);
        self.shared.flush();
        if self.commands.is_none() {
            return STATUS_NOT_INITIALIZED;
        }
        0
    }

    fn write_direct(&mut self, data: &[u8], needs_byte_swap: bool) -> i32 {
        let channels = self.shared.queue.channels();
        let frame_bytes = 2 * channels;
        let frames = (data.len() / frame_bytes).min(self.shared.queue.free_frames());
        if frames == 0 {
            return 0;
        }
        pcm16_to_f32(&data[..frames * frame_bytes], needs_byte_swap, &mut self.pcm);
        let pushed = self.shared.queue.push_frames(&self.pcm);
        (pushed * frame_bytes) as i32
    }

    fn head_position_frames(&self) -> u32 {
        self.shared.head_frames.load(Ordering::Relaxed)
    }

    fn set_volume_millibels(&mut self, millibels: i32) {
        self.shared.set_gain(millibels_to_gain(millibels));
    }

    fn reset_filters_and_write_position(&mut self, channels: u16) {
        self.shared.reset(usize::from(channels));
    }
}

impl Drop for CpalBinding {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Owns the cpal stream for the binding's lifetime.
fn stream_owner_main(
    device: cpal::Device,
    shared: Arc<StreamShared>,
    buffer_size_frames: u32,
    commands: Receiver<StreamCommand>,
) {
    let mut stream: Option<cpal::Stream> = None;

    for command in commands.iter() {
        match command {
            StreamCommand::Create { rate, reply } => {
                stream = None;
                let status = match open_stream(&device, rate, buffer_size_frames, &shared) {
                    Ok(s) => {
                        stream = Some(s);
                        0
                    }
                    Err(StreamError::Rate(err)) => {
                        tracing::warn!(rate_hz = rate, error = %err, "sample rate not supported");
                        STATUS_UNSUPPORTED_RATE
                    }
                    Err(StreamError::Stream(err)) => {
                        tracing::error!(rate_hz = rate, error = %err, "failed to open output stream");
                        STATUS_STREAM
                    }
                };
                let _ = reply.send(status);
            }
            StreamCommand::Play { reply } => {
                let status = match &stream {
                    Some(s) => match s.play() {
                        Ok(()) => 0,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to start stream");
                            STATUS_STREAM
                        }
                    },
                    None => STATUS_NOT_INITIALIZED,
                };
                let _ = reply.send(status);
            }
            StreamCommand::Pause { reply } => {
                let status = match &stream {
                    Some(s) => match s.pause() {
                        Ok(()) => 0,
                        // Some hosts cannot pause; the callback already outputs silence.
                        Err(err) => {
                            tracing::debug!(error = %err, "stream pause not supported");
                            0
                        }
                    },
                    None => 0,
                };
                let _ = reply.send(status);
            }
            StreamCommand::Release => {
                if stream.take().is_some() {
                    tracing::debug!("output stream released");
                }
            }
        }
    }
    tracing::debug!("stream owner thread exiting");
}

enum StreamError {
    Rate(anyhow::Error),
    Stream(anyhow::Error),
}

fn open_stream(
    device: &cpal::Device,
    rate: u32,
    buffer_size_frames: u32,
    shared: &Arc<StreamShared>,
) -> std::result::Result<cpal::Stream, StreamError> {
    let config = select::pick_output_config(device, rate).map_err(StreamError::Rate)?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = select::pick_buffer_size(&config, buffer_size_frames) {
        stream_config.buffer_size = buf;
    }
    tracing::info!(
        rate_hz = stream_config.sample_rate,
        channels = stream_config.channels,
        buffer_size = ?stream_config.buffer_size,
        format = ?config.sample_format(),
        "device output config"
    );

    let stream = build_output_stream(device, &stream_config, config.sample_format(), shared)
        .context("build output stream")
        .map_err(StreamError::Stream)?;
    // Built streams may start running right away on some hosts.
    if let Err(err) = stream.pause() {
        tracing::debug!(error = %err, "could not pause new stream");
    }
    Ok(stream)
}

/// Describe the output devices of the default host.
pub fn output_devices() -> Result<Vec<DeviceInfo>> {
    list_devices(&cpal::default_host())
}
