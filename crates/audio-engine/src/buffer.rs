//! Reusable output buffer handle.
//!
//! One `OutputBuffer` lives inside the engine for its whole lifetime. A decoder source fills
//! it from [`DecoderSource::next_output_buffer`], the engine drains it into the device a few
//! bytes at a time, and releasing it hands the index back to the source that filled it.

use std::sync::{Arc, Weak};

use crate::source::DecoderSource;

#[derive(Default)]
pub struct OutputBuffer {
    index: Option<usize>,
    data: Vec<u8>,
    offset_bytes: usize,
    remaining_bytes: usize,
    stream_over: bool,
    owner: Option<Weak<dyn DecoderSource>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the handle with the source's buffer `index` holding `data`.
    ///
    /// `stream_over` marks the last buffer the source will ever produce; it may be empty.
    pub fn fill(&mut self, index: usize, data: Vec<u8>, stream_over: bool) {
        self.index = Some(index);
        self.remaining_bytes = data.len();
        self.offset_bytes = 0;
        self.data = data;
        self.stream_over = stream_over;
    }

    /// Mark the source as finished without handing out a buffer.
    pub fn mark_stream_over(&mut self) {
        self.stream_over = true;
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn is_held(&self) -> bool {
        self.index.is_some()
    }

    pub fn remaining_bytes(&self) -> usize {
        self.remaining_bytes
    }

    pub fn offset_bytes(&self) -> usize {
        self.offset_bytes
    }

    pub fn is_stream_over(&self) -> bool {
        self.stream_over
    }

    /// Bytes not yet written to the device.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.offset_bytes..self.offset_bytes + self.remaining_bytes]
    }

    /// Record that `bytes` more were accepted by the device.
    pub fn advance(&mut self, bytes: usize) {
        let bytes = bytes.min(self.remaining_bytes);
        self.offset_bytes += bytes;
        self.remaining_bytes -= bytes;
    }

    /// Remember which source this handle has to be returned to.
    pub(crate) fn acquire_from(&mut self, source: &Arc<dyn DecoderSource>) {
        self.reset();
        self.owner = Some(Arc::downgrade(source));
    }

    /// Give the held buffer back to its source and clear the handle.
    ///
    /// Idempotent; releasing an empty handle only clears the stream-over flag.
    pub fn release(&mut self) {
        let index = self.index.take();
        if let (Some(index), Some(owner)) = (index, self.owner.as_ref().and_then(Weak::upgrade)) {
            owner.release_output_buffer(index);
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.index = None;
        self.data.clear();
        self.offset_bytes = 0;
        self.remaining_bytes = 0;
        self.stream_over = false;
        self.owner = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSource;

    #[test]
    fn advance_tracks_offset_and_remaining() {
        let mut buf = OutputBuffer::new();
        buf.fill(3, vec![1, 2, 3, 4, 5, 6, 7, 8], false);
        buf.advance(4);
        assert_eq!(buf.offset_bytes(), 4);
        assert_eq!(buf.remaining_bytes(), 4);
        assert_eq!(buf.pending(), &[5, 6, 7, 8]);
        buf.advance(100);
        assert_eq!(buf.remaining_bytes(), 0);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn release_returns_index_to_owner_once() {
        let source = MockSource::builder().build();
        let dyn_source: Arc<dyn DecoderSource> = source.clone();
        let mut buf = OutputBuffer::new();
        buf.acquire_from(&dyn_source);
        buf.fill(7, vec![0; 4], true);
        assert!(buf.is_held());

        buf.release();
        buf.release();

        assert!(!buf.is_held());
        assert!(!buf.is_stream_over());
        assert_eq!(source.released_indices(), vec![7]);
    }

    #[test]
    fn release_after_owner_dropped_is_harmless() {
        let mut buf = OutputBuffer::new();
        {
            let source: Arc<dyn DecoderSource> = MockSource::builder().build();
            buf.acquire_from(&source);
            buf.fill(1, vec![0; 2], false);
        }
        buf.release();
        assert!(!buf.is_held());
    }
}
