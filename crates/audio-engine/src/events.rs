//! Engine event delivery.
//!
//! The engine thread posts events into an unbounded channel and never waits for the
//! consumer. A single consumer drains them in emission order and either inspects them or
//! calls [`EventReceiver::dispatch`] to forward each one to its source's hooks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::EngineError;
use crate::source::{BufferingInfo, SourceRef};

pub enum EngineEvent {
    Completion(SourceRef),
    Error { source: SourceRef, error: EngineError },
    SeekComplete(SourceRef),
    BufferingStart(SourceRef),
    BufferingEnd(SourceRef),
}

impl EngineEvent {
    pub fn source(&self) -> &SourceRef {
        match self {
            EngineEvent::Completion(source)
            | EngineEvent::Error { source, .. }
            | EngineEvent::SeekComplete(source)
            | EngineEvent::BufferingStart(source)
            | EngineEvent::BufferingEnd(source) => source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Completion(_) => "completion",
            EngineEvent::Error { .. } => "error",
            EngineEvent::SeekComplete(_) => "seek_complete",
            EngineEvent::BufferingStart(_) => "buffering_start",
            EngineEvent::BufferingEnd(_) => "buffering_end",
        }
    }

    /// Invoke the matching consumer hook on the event's source.
    pub fn deliver(&self) {
        match self {
            EngineEvent::Completion(source) => source.on_completion(),
            EngineEvent::Error { source, error } => source.on_error(error),
            EngineEvent::SeekComplete(source) => source.on_seek_complete(),
            EngineEvent::BufferingStart(source) => source.on_info(BufferingInfo::Start),
            EngineEvent::BufferingEnd(source) => source.on_info(BufferingInfo::End),
        }
    }
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::Error { error, .. } => write!(f, "Error({error})"),
            other => f.write_str(other.kind()),
        }
    }
}

/// Engine-side half of the event channel.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: Sender<EngineEvent>,
    alive: Arc<AtomicBool>,
}

impl EventSender {
    pub(crate) fn post(&self, event: EngineEvent) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        if let EngineEvent::Error { error, .. } = &event {
            tracing::warn!(error = %error, "engine error event");
        } else {
            tracing::trace!(kind = event.kind(), "engine event");
        }
        // The receiver may already be gone; nobody is left to tell.
        let _ = self.tx.send(event);
    }

    pub(crate) fn completion(&self, source: SourceRef) {
        self.post(EngineEvent::Completion(source));
    }

    pub(crate) fn error(&self, source: SourceRef, error: EngineError) {
        self.post(EngineEvent::Error { source, error });
    }

    pub(crate) fn seek_complete(&self, source: SourceRef) {
        self.post(EngineEvent::SeekComplete(source));
    }

    pub(crate) fn buffering_start(&self, source: SourceRef) {
        self.post(EngineEvent::BufferingStart(source));
    }

    pub(crate) fn buffering_end(&self, source: SourceRef) {
        self.post(EngineEvent::BufferingEnd(source));
    }
}

/// Consumer-side half of the event channel. Meant for one thread.
pub struct EventReceiver {
    rx: Receiver<EngineEvent>,
    alive: Arc<AtomicBool>,
}

impl EventReceiver {
    /// Block until the next event. `None` once the engine is gone and the channel drained.
    pub fn recv(&self) -> Option<EngineEvent> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<EngineEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<EngineEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Forward every queued event to its source's hooks without blocking.
    ///
    /// Events still queued after the engine shut down are dropped. Returns how many events
    /// were delivered.
    pub fn dispatch_pending(&self) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.try_recv() {
            if self.dispatch(&event) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver one event. Returns `false` when the engine is no longer alive.
    pub fn dispatch(&self, event: &EngineEvent) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        event.deliver();
        true
    }

    /// Underlying channel, for use with `crossbeam_channel::select!`.
    pub fn channel(&self) -> &Receiver<EngineEvent> {
        &self.rx
    }
}

pub(crate) fn channel(alive: Arc<AtomicBool>) -> (EventSender, EventReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        EventSender {
            tx,
            alive: alive.clone(),
        },
        EventReceiver { rx, alive },
    )
}
