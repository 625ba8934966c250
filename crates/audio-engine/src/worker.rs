//! Engine thread state machine.
//!
//! The worker owns every piece of playback state. It alternates between servicing at most
//! one request and running one iteration of the write loop, so a request never observes a
//! half-finished write.
//!
//! Slots:
//! - `current` drives the published position and receives completion.
//! - `next` is queued for a gapless continuation.
//! - `output` is whichever of the two currently feeds bytes. It differs from `current` only
//!   during a crossover, after the current source handed out its last buffer.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use crate::buffer::OutputBuffer;
use crate::config::EngineConfig;
use crate::device::OutputDevice;
use crate::error::{EngineError, Result};
use crate::events::EventSender;
use crate::request::{Action, Mailbox, Request};
use crate::source::{SourceRef, SourceSlot};
use crate::status::EngineStatus;

/// PCM handed out by decoder sources is 16-bit.
const BYTES_PER_SAMPLE: usize = 2;

pub(crate) struct Worker {
    cfg: EngineConfig,
    device: Arc<OutputDevice>,
    mailbox: Arc<Mailbox>,
    events: EventSender,
    status: Arc<EngineStatus>,

    paused: bool,
    play_pending: bool,
    sample_rate: u32,
    last_head_position: u32,
    frames_written: u64,
    frames_played: u64,
    next_frames_written: u64,
    underruns: u64,

    current: SourceSlot,
    next: SourceSlot,
    output: SourceSlot,
    buffer: OutputBuffer,
    seek_pending: Option<(SourceRef, u64)>,
}

impl Worker {
    pub(crate) fn new(
        cfg: EngineConfig,
        device: Arc<OutputDevice>,
        mailbox: Arc<Mailbox>,
        events: EventSender,
        status: Arc<EngineStatus>,
    ) -> Self {
        Self {
            cfg,
            device,
            mailbox,
            events,
            status,
            paused: true,
            play_pending: false,
            sample_rate: 0,
            last_head_position: 0,
            frames_written: 0,
            frames_played: 0,
            next_frames_written: 0,
            underruns: 0,
            current: SourceSlot::empty(),
            next: SourceSlot::empty(),
            output: SourceSlot::empty(),
            buffer: OutputBuffer::new(),
            seek_pending: None,
        }
    }

    /// Engine thread main loop. Returns once the mailbox is shut down.
    pub(crate) fn run(mut self) {
        tracing::info!("engine thread running");
        self.publish();
        while self.mailbox.is_alive() {
            let request = if self.paused {
                self.mailbox.wait_for_request()
            } else {
                self.mailbox.try_take()
            };
            if !self.mailbox.is_alive() {
                if let Some(request) = request {
                    self.mailbox.reply(request.ticket, Err(EngineError::NotRunning));
                }
                break;
            }

            if let Some(request) = request {
                self.service(request);
                self.publish();
                continue;
            }
            if self.paused {
                continue;
            }

            if let Err(err) = self.tick() {
                self.recover_from_tick_error(err);
            }
            self.publish();
        }

        self.buffer.release();
        self.device.release();
        self.mailbox.reject_pending();
        tracing::info!("engine thread stopped");
    }

    fn service(&mut self, request: Request) {
        let Request {
            ticket,
            action,
            requester,
        } = request;
        let name = action.name();

        let outcome = match action {
            Action::Play => self.play(&requester),
            Action::Pause => self.pause(&requester),
            Action::Resume => self.resume(&requester),
            Action::Seek { ms } => self.seek(&requester, ms),
            Action::SetNext { next } => self.set_next(&requester, next),
            Action::Reset => self.reset(&requester),
        };

        match &outcome {
            Ok(()) => tracing::debug!(action = name, "request serviced"),
            Err(err) if err.is_request_error() => {
                tracing::debug!(action = name, error = %err, "request rejected");
            }
            Err(err) => {
                tracing::warn!(action = name, error = %err, "request failed; tearing down");
                self.teardown_to_idle();
                self.events.error(requester.clone(), err.clone());
            }
        }
        self.publish();
        self.mailbox.reply(ticket, outcome);

        if let Some((source, ms)) = self.seek_pending.take() {
            if let Err(err) = self.complete_seek(&source, ms) {
                tracing::warn!(seek_ms = ms, error = %err, "seek failed; tearing down");
                self.teardown_to_idle();
                self.events.error(source, err);
            }
        }
    }

    fn play(&mut self, source: &SourceRef) -> Result<()> {
        self.device.stop_and_flush()?;
        self.buffer.release();
        self.current = SourceSlot::from_ref(source);
        self.next = SourceSlot::empty();
        self.output = self.current.clone();

        source.reset_decoder_if_output_already_used()?;
        let position = source.current_position_frames();
        self.frames_written = position;
        self.frames_played = position;
        self.next_frames_written = 0;

        let rate = source.sample_rate();
        if rate == 0 {
            return Err(anyhow::anyhow!("source reports no sample rate").into());
        }
        if self.device.ensure_created(rate)? {
            tracing::info!(rate_hz = rate, "output device opened");
        }
        self.sample_rate = rate;

        self.play_pending = true;
        self.events.buffering_start(source.clone());
        self.device
            .reset_filters_and_write_position(source.channel_count());
        self.last_head_position = self.device.head_position_frames();
        self.paused = false;
        Ok(())
    }

    fn pause(&mut self, source: &SourceRef) -> Result<()> {
        if !self.current.is(source) {
            return Err(EngineError::IllegalState(
                "cannot pause a source other than the current one",
            ));
        }
        self.device.pause()?;
        self.paused = true;
        Ok(())
    }

    fn resume(&mut self, source: &SourceRef) -> Result<()> {
        if !self.current.is(source) {
            return Err(EngineError::IllegalState(
                "cannot resume a source other than the current one",
            ));
        }
        let buffered = self.frames_written.saturating_sub(self.frames_played);
        if buffered < self.cfg.low_water_frames {
            tracing::debug!(buffered_frames = buffered, "resume below low-water mark; rebuffering");
            self.play_pending = true;
            self.events.buffering_start(source.clone());
        } else {
            self.device.play()?;
        }
        self.paused = false;
        Ok(())
    }

    fn seek(&mut self, source: &SourceRef, ms: u64) -> Result<()> {
        if self.current.is_some() && !self.current.is(source) {
            return Err(EngineError::IllegalState(
                "cannot seek a source other than the current one",
            ));
        }
        if !self.paused {
            return Err(EngineError::IllegalState("cannot seek while playing"));
        }
        self.device.stop_and_flush()?;
        self.seek_pending = Some((source.clone(), ms));
        Ok(())
    }

    /// Second half of a seek, run after the caller got its reply.
    fn complete_seek(&mut self, source: &SourceRef, ms: u64) -> Result<()> {
        self.buffer.release();
        if self.current.is(source) {
            self.output = self.current.clone();
        }
        self.device
            .reset_filters_and_write_position(source.channel_count());
        self.last_head_position = self.device.head_position_frames();

        if self.next.is_some() {
            match self.next.get() {
                Some(next) => {
                    if let Err(err) = next.reset_decoder_if_output_already_used() {
                        self.next.clear();
                        self.events.error(next, err.into());
                    }
                }
                None => self.next.clear(),
            }
            self.next_frames_written = 0;
        }

        source.do_seek(ms)?;
        // Give the decoder a moment to produce data at the new position.
        thread::sleep(self.cfg.seek_grace());
        self.events.seek_complete(source.clone());

        let position = source.current_position_frames();
        self.frames_written = position;
        self.frames_played = position;
        tracing::debug!(seek_ms = ms, position_frames = position, "seek complete");
        Ok(())
    }

    fn set_next(&mut self, source: &SourceRef, candidate: Option<SourceRef>) -> Result<()> {
        if !self.current.is(source) {
            return Ok(());
        }
        let requested = candidate
            .as_ref()
            .map(SourceSlot::from_ref)
            .unwrap_or_default();
        if self.next.same_as(&requested) {
            return Ok(());
        }

        let current = self.current.require()?;
        if current.is_output_over() {
            tracing::debug!("current source already drained; too late to queue next");
            self.drop_next();
            return Ok(());
        }

        self.drop_next();
        let Some(candidate) = candidate else {
            return Ok(());
        };
        if current.is_live_stream() || candidate.is_live_stream() {
            tracing::debug!("live streams cannot be queued gaplessly");
            return Ok(());
        }
        if candidate.sample_rate() != self.sample_rate {
            tracing::debug!(
                rate_hz = self.sample_rate,
                next_rate_hz = candidate.sample_rate(),
                "sample rate mismatch; next source discarded"
            );
            return Ok(());
        }
        match candidate.reset_decoder_if_output_already_used() {
            Ok(()) => {
                self.next = requested;
                tracing::debug!("next source queued");
            }
            Err(err) => self.events.error(candidate, err.into()),
        }
        Ok(())
    }

    fn reset(&mut self, source: &SourceRef) -> Result<()> {
        if self.current.is(source) {
            self.teardown_to_idle();
            tracing::debug!("current source reset; engine idle");
        } else if self.next.is(source) {
            self.drop_next();
        }
        Ok(())
    }

    /// Forget the queued next source, switching output back to current if the crossover
    /// had already begun.
    fn drop_next(&mut self) {
        if self.next.is_some() && self.output.same_as(&self.next) {
            self.buffer.release();
            self.output = self.current.clone();
        }
        self.next.clear();
        self.next_frames_written = 0;
    }

    /// Release the device and every slot; the engine ends up paused with nothing loaded.
    fn teardown_to_idle(&mut self) {
        self.release_current();
        self.next.clear();
        self.output.clear();
        self.next_frames_written = 0;
        self.seek_pending = None;
    }

    /// Close the device and forget the current source. `next` is left to the caller.
    fn release_current(&mut self) {
        self.device.release();
        self.sample_rate = 0;
        self.buffer.release();
        self.paused = true;
        self.play_pending = false;
        self.current.clear();
        self.frames_written = 0;
        self.frames_played = 0;
    }

    fn start_after_buffering(&mut self, output: &SourceRef) -> Result<()> {
        self.play_pending = false;
        self.device.play()?;
        self.events.buffering_end(output.clone());
        tracing::debug!(
            buffered_frames = self.frames_written.saturating_sub(self.frames_played),
            "buffering complete; device started"
        );
        Ok(())
    }

    /// One iteration of the write loop.
    fn tick(&mut self) -> Result<()> {
        let current = self.current.require()?;
        let output = self.output.require()?;

        let head = self.device.head_position_frames();
        self.frames_played += u64::from(head.wrapping_sub(self.last_head_position));
        self.last_head_position = head;
        if self.sample_rate > 0 {
            current.set_current_position(self.frames_played * 1000 / u64::from(self.sample_rate));
        }

        if !self.buffer.is_held() {
            self.buffer.acquire_from(&output);
            output.next_output_buffer(&mut self.buffer)?;
        }

        let mut wrote = false;

        if self.buffer.remaining_bytes() > 0 {
            let written = self.device.write(self.buffer.pending())?;
            if written == 0 {
                if self.play_pending {
                    self.start_after_buffering(&output)?;
                }
                self.mailbox.backoff(self.cfg.backoff());
                return Ok(());
            }
            let frames = frames_for_bytes(written, output.channel_count());
            if self.output.same_as(&self.current) {
                self.frames_written += frames;
            } else {
                self.next_frames_written += frames;
            }
            self.buffer.advance(written);
            wrote = true;
        } else if self.play_pending && current.is_output_over() {
            // Very short source: decoding finished before the device buffer ever filled.
            self.start_after_buffering(&output)?;
        }

        if self.buffer.remaining_bytes() == 0 {
            let stream_over = self.buffer.is_stream_over();
            self.buffer.release();
            if stream_over && self.output.same_as(&self.current) && self.next.is_some() {
                tracing::debug!("current source drained; output continues from next");
                self.output = self.next.clone();
            }
        }

        if self.frames_played >= self.frames_written {
            if current.is_output_over() {
                self.finish_current(current);
            } else {
                // Nothing has been written yet at all: the decoder is still warming up, which
                // does not count as an underrun.
                if self.frames_written != 0 {
                    self.underruns += 1;
                    tracing::debug!(underruns = self.underruns, "underrun");
                    current.notify_underrun();
                }
                self.mailbox.backoff(self.cfg.backoff());
            }
        } else if !wrote && self.output.is(&output) {
            // Nothing to write this round; the device still holds queued frames.
            self.mailbox.backoff(self.cfg.backoff());
        }
        Ok(())
    }

    /// The current source played out completely: hand over to next or go idle.
    fn finish_current(&mut self, finished: SourceRef) {
        finished.set_current_position(finished.duration_ms());
        let next = self.next.get();
        match &next {
            None => {
                self.release_current();
                tracing::info!("playback finished; engine idle");
            }
            Some(_) => {
                self.frames_played -= self.frames_written;
                self.frames_written = self.next_frames_written;
                self.current = self.next.clone();
                tracing::info!("gapless transition to next source");
            }
        }
        self.events.completion(finished);
        if let Some(next) = next {
            next.started_as_next();
        }
        self.next.clear();
        self.next_frames_written = 0;
        self.output = self.current.clone();
    }

    fn recover_from_tick_error(&mut self, err: EngineError) {
        self.buffer.release();
        let failing = self.output.get();
        if self.output.same_as(&self.current) {
            tracing::warn!(error = %err, "output failed; tearing down");
            self.release_current();
        } else {
            tracing::warn!(error = %err, "next source failed; dropping it");
        }
        match failing {
            Some(source) => self.events.error(source, err),
            None => tracing::warn!("failing source was already dropped"),
        }
        self.next.clear();
        self.next_frames_written = 0;
        self.output = self.current.clone();
    }

    fn publish(&self) {
        let s = &self.status;
        s.paused.store(self.paused, Ordering::Relaxed);
        s.play_pending.store(self.play_pending, Ordering::Relaxed);
        s.sample_rate.store(self.sample_rate, Ordering::Relaxed);
        s.frames_written.store(self.frames_written, Ordering::Relaxed);
        s.frames_played.store(self.frames_played, Ordering::Relaxed);
        s.next_frames_written
            .store(self.next_frames_written, Ordering::Relaxed);
        s.has_current.store(self.current.is_some(), Ordering::Relaxed);
        s.has_next.store(self.next.is_some(), Ordering::Relaxed);
        s.crossover.store(
            self.output.is_some() && !self.output.same_as(&self.current),
            Ordering::Relaxed,
        );
        s.buffer_held.store(self.buffer.is_held(), Ordering::Relaxed);
        s.underruns.store(self.underruns, Ordering::Relaxed);
    }
}

/// Whole frames contained in `bytes` of 16-bit PCM with `channels`.
fn frames_for_bytes(bytes: usize, channels: u16) -> u64 {
    let frame_bytes = BYTES_PER_SAMPLE * usize::from(channels.max(1));
    (bytes / frame_bytes) as u64
}
