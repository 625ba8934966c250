//! File-backed decoder source.
//!
//! Uses Symphonia to:
//! - probe the file once for sample rate, channels and duration
//! - decode packets into interleaved 16-bit little-endian PCM on a background thread
//! - hand the chunks to the engine without ever blocking the engine thread
//!
//! Seeking and re-arming throw the running decode session away and start a fresh one.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use anyhow::{Context, Result, anyhow};
use audio_engine::{BufferingInfo, DecoderSource, EngineError, OutputBuffer};
use crossbeam_channel::{Receiver, TryRecvError};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

/// Decoded chunks buffered ahead of the engine.
const CHUNKS_AHEAD: usize = 32;

/// Stream parameters captured while probing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_ms: Option<u64>,
}

pub struct FileSource {
    path: PathBuf,
    label: String,
    info: StreamInfo,
    state: Mutex<DecodeState>,
    position_ms: AtomicU64,
}

struct DecodeState {
    session: DecodeSession,
    /// Frames handed to the engine since the session started.
    frames_out: u64,
    over: bool,
    used: bool,
    next_index: usize,
}

impl FileSource {
    /// Probe `path` and start decoding from the beginning.
    pub fn open(path: &Path) -> Result<Self> {
        let (format, params) = probe(path)?;
        drop(format);
        let info = stream_info(&params)?;
        let session = DecodeSession::start(path, 0, info)?;
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        tracing::debug!(
            file = %label,
            rate_hz = info.sample_rate,
            channels = info.channels,
            duration_ms = ?info.duration_ms,
            "opened source"
        );

        Ok(Self {
            path: path.to_path_buf(),
            label,
            info,
            state: Mutex::new(DecodeState {
                session,
                frames_out: 0,
                over: false,
                used: false,
                next_index: 0,
            }),
            position_ms: AtomicU64::new(0),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn info(&self) -> StreamInfo {
        self.info
    }

    /// Last playback position the engine published.
    pub fn position_ms(&self) -> u64 {
        self.position_ms.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, DecodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn restart(&self, state: &mut DecodeState, start_ms: u64) -> Result<()> {
        state.session = DecodeSession::start(&self.path, start_ms, self.info)?;
        state.frames_out = 0;
        state.over = false;
        state.used = false;
        Ok(())
    }

    fn frame_bytes(&self) -> usize {
        2 * usize::from(self.info.channels.max(1))
    }
}

impl DecoderSource for FileSource {
    fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    fn channel_count(&self) -> u16 {
        self.info.channels
    }

    fn current_position_frames(&self) -> u64 {
        let state = self.lock();
        state.session.start_frame + state.frames_out
    }

    fn duration_ms(&self) -> u64 {
        self.info.duration_ms.unwrap_or_else(|| self.position_ms())
    }

    fn is_output_over(&self) -> bool {
        self.lock().over
    }

    fn is_live_stream(&self) -> bool {
        false
    }

    fn reset_decoder_if_output_already_used(&self) -> Result<()> {
        let mut state = self.lock();
        if state.used {
            tracing::debug!(file = %self.label, "rewinding decoder");
            self.restart(&mut state, 0)?;
        }
        Ok(())
    }

    fn next_output_buffer(&self, buffer: &mut OutputBuffer) -> Result<()> {
        let mut state = self.lock();
        if state.over {
            buffer.mark_stream_over();
            return Ok(());
        }
        match state.session.chunks.try_recv() {
            Ok(Ok(bytes)) => {
                let index = state.next_index;
                state.next_index = state.next_index.wrapping_add(1);
                state.frames_out += (bytes.len() / self.frame_bytes()) as u64;
                state.used = true;
                buffer.fill(index, bytes, false);
                Ok(())
            }
            Ok(Err(err)) => {
                state.over = true;
                Err(err.context(format!("decode {}", self.label)))
            }
            // Decoder still working; nothing to hand out yet.
            Err(TryRecvError::Empty) => Ok(()),
            Err(TryRecvError::Disconnected) => {
                state.over = true;
                buffer.mark_stream_over();
                Ok(())
            }
        }
    }

    fn do_seek(&self, ms: u64) -> Result<()> {
        let mut state = self.lock();
        self.restart(&mut state, ms)?;
        self.position_ms.store(ms, Ordering::Relaxed);
        Ok(())
    }

    fn notify_underrun(&self) {
        tracing::debug!(file = %self.label, "decoder fell behind");
    }

    fn started_as_next(&self) {
        tracing::info!(file = %self.label, "gapless transition");
    }

    fn set_current_position(&self, ms: u64) {
        self.position_ms.store(ms, Ordering::Relaxed);
    }

    fn on_completion(&self) {
        tracing::info!(file = %self.label, "finished");
    }

    fn on_error(&self, error: &EngineError) {
        tracing::error!(file = %self.label, error = %error, "playback error");
    }

    fn on_seek_complete(&self) {
        tracing::debug!(file = %self.label, position_ms = self.position_ms(), "seek complete");
    }

    fn on_info(&self, info: BufferingInfo) {
        match info {
            BufferingInfo::Start => tracing::debug!(file = %self.label, "buffering"),
            BufferingInfo::End => tracing::info!(file = %self.label, "playing"),
        }
    }
}

/// One background decode run. Dropping it stops the decode thread at its next chunk.
struct DecodeSession {
    chunks: Receiver<Result<Vec<u8>>>,
    start_frame: u64,
}

impl DecodeSession {
    fn start(path: &Path, start_ms: u64, info: StreamInfo) -> Result<Self> {
        let (mut format, params) = probe(path)?;
        let track_id = format
            .default_track()
            .map(|t| t.id)
            .ok_or_else(|| anyhow!("No default audio track"))?;

        let mut start_frame = 0;
        if start_ms > 0 {
            let time = Time::new(start_ms / 1000, (start_ms % 1000) as f64 / 1000.0);
            format
                .seek(
                    SeekMode::Accurate,
                    SeekTo::Time {
                        time,
                        track_id: Some(track_id),
                    },
                )
                .with_context(|| format!("seek to {start_ms} ms"))?;
            start_frame = start_ms * u64::from(info.sample_rate) / 1000;
        }

        let (tx, rx) = crossbeam_channel::bounded(CHUNKS_AHEAD);
        thread::Builder::new()
            .name("decode".to_string())
            .spawn(move || {
                if let Err(err) = decode_loop(format, track_id, params, &tx) {
                    tracing::debug!("decoder thread error: {err:#}");
                    let _ = tx.send(Err(err));
                }
            })
            .context("spawn decode thread")?;

        Ok(Self {
            chunks: rx,
            start_frame,
        })
    }
}

fn probe(path: &Path) -> Result<(Box<dyn FormatReader>, CodecParameters)> {
    let file = File::open(path).with_context(|| format!("open {:?}", path))?;
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("probe {:?}", path))?;

    let params = probed
        .format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?
        .codec_params
        .clone();
    Ok((probed.format, params))
}

fn stream_info(params: &CodecParameters) -> Result<StreamInfo> {
    let channels = params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?
        .count();
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    Ok(StreamInfo {
        sample_rate,
        channels: u16::try_from(channels).context("channel count")?,
        duration_ms: duration_ms_from_codec_params(params),
    })
}

/// Decode packets of `track_id` and send them as 16-bit little-endian PCM.
///
/// Returns on end of stream or once the session has been dropped.
fn decode_loop(
    mut format: Box<dyn FormatReader>,
    track_id: u32,
    params: CodecParameters,
    tx: &crossbeam_channel::Sender<Result<Vec<u8>>>,
) -> Result<()> {
    let mut decoder = symphonia::default::get_codecs().make(&params, &DecoderOptions::default())?;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(SymphoniaError::ResetRequired) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(msg)) => {
                tracing::debug!("skipping undecodable packet: {msg}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if decoded.frames() == 0 {
            continue;
        }

        let mut sample_buf = SampleBuffer::<i16>::new(decoded.frames() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);
        if tx.send(Ok(pcm16_le_bytes(sample_buf.samples()))).is_err() {
            return Ok(());
        }
    }
}

fn pcm16_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    /// Write a 16-bit PCM WAV file with `frames` frames of a ramp.
    pub(crate) fn write_wav(name: &str, rate: u32, channels: u16, frames: u32) -> PathBuf {
        let path = std::env::temp_dir().join(format!("player-cli-{}-{name}.wav", std::process::id()));
        let data_len = frames * u32::from(channels) * 2;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&(rate * u32::from(channels) * 2).to_le_bytes());
        bytes.extend_from_slice(&(channels * 2).to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames * u32::from(channels) {
            bytes.extend_from_slice(&((i % 1000) as i16).to_le_bytes());
        }
        std::fs::write(&path, bytes).unwrap();
        path
    }

    /// Pull every chunk until the source reports the end.
    fn drain(source: &FileSource) -> usize {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut bytes = 0;
        let mut buffer = OutputBuffer::new();
        loop {
            assert!(Instant::now() < deadline, "source never finished");
            source.next_output_buffer(&mut buffer).unwrap();
            bytes += buffer.remaining_bytes();
            if buffer.is_stream_over() {
                return bytes;
            }
            if !buffer.is_held() {
                std::thread::sleep(Duration::from_millis(1));
            }
            buffer.release();
        }
    }

    #[test]
    fn probes_wav_parameters() {
        let path = write_wav("probe", 22_050, 1, 22_050);
        let source = FileSource::open(&path).unwrap();
        assert_eq!(
            source.info(),
            StreamInfo {
                sample_rate: 22_050,
                channels: 1,
                duration_ms: Some(1000),
            }
        );
        assert!(!source.is_live_stream());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn decodes_whole_file_then_reports_over() {
        let path = write_wav("drain", 8_000, 2, 4_000);
        let source = FileSource::open(&path).unwrap();
        assert_eq!(drain(&source), 4_000 * 4);
        assert!(source.is_output_over());
        assert_eq!(source.current_position_frames(), 4_000);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn reset_after_use_rewinds_to_start() {
        let path = write_wav("rewind", 8_000, 1, 2_000);
        let source = FileSource::open(&path).unwrap();
        drain(&source);
        source.reset_decoder_if_output_already_used().unwrap();
        assert!(!source.is_output_over());
        assert_eq!(source.current_position_frames(), 0);
        assert_eq!(drain(&source), 2_000 * 2);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn seek_moves_start_position() {
        let path = write_wav("seek", 8_000, 1, 8_000);
        let source = FileSource::open(&path).unwrap();
        source.do_seek(500).unwrap();
        assert_eq!(source.current_position_frames(), 4_000);
        assert_eq!(source.position_ms(), 500);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_fails_to_open() {
        assert!(FileSource::open(Path::new("/nonexistent/track.flac")).is_err());
    }

    #[test]
    fn pcm_is_little_endian() {
        assert_eq!(pcm16_le_bytes(&[1, -2]), vec![1, 0, 0xFE, 0xFF]);
    }
}
