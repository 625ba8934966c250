//! Public handle to a running engine thread.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::binding::OutputBinding;
use crate::config::EngineConfig;
use crate::device::OutputDevice;
use crate::error::{EngineError, Result};
use crate::events::{self, EventReceiver};
use crate::realtime::enable_realtime_audio_thread;
use crate::request::{Action, Mailbox};
use crate::source::SourceRef;
use crate::status::{EngineStatus, StatusSnapshot};
use crate::worker::Worker;

const THREAD_NAME: &str = "audio-engine-output";

/// Owns the engine thread. Every control method blocks until the engine thread has
/// serviced the request or the configured request timeout expires.
///
/// Dropping the handle stops the thread, releases the device and terminates the binding.
pub struct Engine {
    mailbox: Arc<Mailbox>,
    device: Arc<OutputDevice>,
    status: Arc<EngineStatus>,
    request_timeout: Duration,
    thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Initialize `binding` on a new engine thread and wait until it is ready.
    pub fn start(
        binding: Box<dyn OutputBinding>,
        config: EngineConfig,
    ) -> Result<(Engine, EventReceiver)> {
        let alive = Arc::new(AtomicBool::new(true));
        let mailbox = Arc::new(Mailbox::new(alive.clone()));
        let (events_tx, events_rx) = events::channel(alive);
        let device = Arc::new(OutputDevice::new(binding));
        let status = EngineStatus::shared();
        let request_timeout = config.request_timeout();

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let worker = Worker::new(
            config.clone(),
            device.clone(),
            mailbox.clone(),
            events_tx,
            status.clone(),
        );
        let thread_device = device.clone();
        let thread = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                enable_realtime_audio_thread();
                let buffer_size = config.effective_buffer_size(thread_device.period_frames());
                tracing::debug!(buffer_size_frames = buffer_size, "initializing output device");
                let init = thread_device.init(buffer_size);
                let ok = init.is_ok();
                let _ = ready_tx.send(init);
                if ok {
                    worker.run();
                }
            })
            .map_err(|e| EngineError::Spawn(Arc::new(e)))?;

        let init = ready_rx.recv().unwrap_or(Err(EngineError::NotRunning));
        if let Err(err) = init {
            tracing::error!(error = %err, "output device failed to initialize");
            mailbox.shut_down();
            let _ = thread.join();
            device.terminate();
            return Err(err);
        }
        tracing::info!("audio engine started");

        Ok((
            Engine {
                mailbox,
                device,
                status,
                request_timeout,
                thread: Some(thread),
            },
            events_rx,
        ))
    }

    fn submit(&self, action: Action, source: &SourceRef) -> Result<()> {
        self.mailbox
            .submit(action, source.clone(), self.request_timeout)
    }

    /// Make `source` current and start playing it from its decode position.
    pub fn play(&self, source: &SourceRef) -> Result<()> {
        self.submit(Action::Play, source)
    }

    pub fn pause(&self, source: &SourceRef) -> Result<()> {
        self.submit(Action::Pause, source)
    }

    pub fn resume(&self, source: &SourceRef) -> Result<()> {
        self.submit(Action::Resume, source)
    }

    /// Seek a paused source. Returns once the device is flushed; the seek itself finishes
    /// on the engine thread and is reported by a seek-complete event.
    pub fn seek(&self, source: &SourceRef, ms: u64) -> Result<()> {
        self.submit(Action::Seek { ms }, source)
    }

    /// Queue `next` to follow `source` without a gap, or clear the queue with `None`.
    ///
    /// A candidate that cannot be played gaplessly is silently discarded.
    pub fn set_next(&self, source: &SourceRef, next: Option<&SourceRef>) -> Result<()> {
        self.submit(
            Action::SetNext {
                next: next.cloned(),
            },
            source,
        )
    }

    /// Drop `source` from the engine, whether it is current or queued as next.
    pub fn reset(&self, source: &SourceRef) -> Result<()> {
        self.submit(Action::Reset, source)
    }

    /// Applied immediately, without going through the engine thread.
    pub fn set_volume_millibels(&self, millibels: i32) {
        self.device.set_volume_millibels(millibels);
    }

    pub fn volume_millibels(&self) -> i32 {
        self.device.volume_millibels()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    pub fn is_alive(&self) -> bool {
        self.mailbox.is_alive()
    }

    /// Stop the engine thread and terminate the binding.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.mailbox.shut_down();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("engine thread panicked");
            }
        }
        self.device.terminate();
        tracing::info!("audio engine stopped");
    }
}
