//! Decoder source capability.
//!
//! A decoder source is owned by the caller. The engine only keeps weak references to it and
//! calls into it from the engine thread once a request naming it has been accepted; the
//! consumer-facing hooks (`on_*`) are only invoked by [`crate::events::EventReceiver::dispatch`]
//! on the event consumer's thread.

use std::sync::{Arc, Weak};

use anyhow::Result;

use crate::buffer::OutputBuffer;
use crate::error::EngineError;

/// Buffering notifications delivered through [`DecoderSource::on_info`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferingInfo {
    Start,
    End,
}

pub trait DecoderSource: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn channel_count(&self) -> u16;
    /// Decode position in frames, used to seed the engine's frame counters.
    fn current_position_frames(&self) -> u64;
    fn duration_ms(&self) -> u64;

    /// Whether the decoder has produced its last buffer.
    fn is_output_over(&self) -> bool;
    /// Live streams cannot take part in gapless transitions.
    fn is_live_stream(&self) -> bool;

    /// Re-arm the decoder if any of its output was consumed since the last reset.
    fn reset_decoder_if_output_already_used(&self) -> Result<()>;

    /// Fill `buffer` with the next chunk of decoded PCM, if one is ready.
    ///
    /// Leaving the buffer unfilled means nothing is available yet.
    fn next_output_buffer(&self, buffer: &mut OutputBuffer) -> Result<()>;

    /// Take back a buffer index previously handed out by `next_output_buffer`.
    fn release_output_buffer(&self, _index: usize) {}

    fn do_seek(&self, ms: u64) -> Result<()>;

    fn notify_underrun(&self) {}
    /// Called when the source took over from the previous one without a gap.
    fn started_as_next(&self) {}
    /// Playback position published by the engine, in milliseconds.
    fn set_current_position(&self, _ms: u64) {}

    fn on_completion(&self) {}
    fn on_error(&self, _error: &EngineError) {}
    fn on_seek_complete(&self) {}
    fn on_info(&self, _info: BufferingInfo) {}
}

/// Shared handle callers pass to the engine.
pub type SourceRef = Arc<dyn DecoderSource>;

/// Weak slot the engine keeps for current/next/output sources.
#[derive(Clone, Default)]
pub(crate) struct SourceSlot(Option<Weak<dyn DecoderSource>>);

impl SourceSlot {
    pub(crate) fn empty() -> Self {
        Self(None)
    }

    pub(crate) fn from_ref(source: &SourceRef) -> Self {
        Self(Some(Arc::downgrade(source)))
    }

    pub(crate) fn is_some(&self) -> bool {
        self.0.is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.0 = None;
    }

    /// Upgrade to a strong reference for the duration of one operation.
    pub(crate) fn get(&self) -> Option<SourceRef> {
        self.0.as_ref().and_then(Weak::upgrade)
    }

    /// Like [`get`](Self::get), but a dropped source is an error.
    pub(crate) fn require(&self) -> Result<SourceRef, EngineError> {
        self.get().ok_or(EngineError::SourceDropped)
    }

    /// Pointer identity with a caller supplied source.
    pub(crate) fn is(&self, source: &SourceRef) -> bool {
        match &self.0 {
            Some(weak) => std::ptr::addr_eq(weak.as_ptr(), Arc::as_ptr(source)),
            None => false,
        }
    }

    pub(crate) fn same_as(&self, other: &SourceSlot) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => std::ptr::addr_eq(a.as_ptr(), b.as_ptr()),
            (None, None) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSource;

    #[test]
    fn slot_identity_follows_allocation() {
        let a: SourceRef = MockSource::builder().build();
        let b: SourceRef = MockSource::builder().build();
        let slot = SourceSlot::from_ref(&a);
        assert!(slot.is(&a));
        assert!(!slot.is(&b));
        assert!(slot.same_as(&SourceSlot::from_ref(&a)));
        assert!(!slot.same_as(&SourceSlot::empty()));
        assert!(SourceSlot::empty().same_as(&SourceSlot::empty()));
    }

    #[test]
    fn slot_does_not_keep_source_alive() {
        let a: SourceRef = MockSource::builder().build();
        let slot = SourceSlot::from_ref(&a);
        drop(a);
        assert!(slot.is_some());
        assert!(slot.get().is_none());
        assert!(matches!(slot.require(), Err(EngineError::SourceDropped)));
    }
}
