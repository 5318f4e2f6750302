use crate::trace::{ContextKey, Segment, SegmentSink};
use std::sync::{Arc, Mutex, PoisonError};

/// A [`SegmentSink`] that keeps every sealed segment in memory, in sealing
/// order.
///
/// Clones share the same storage, so a clone can be handed to the engine and
/// the original inspected by the test.
#[derive(Clone, Debug, Default)]
pub struct InMemorySegmentSink {
    segments: Arc<Mutex<Vec<(ContextKey, Segment)>>>,
}

impl InMemorySegmentSink {
    /// Sealed segments, oldest first.
    pub fn finished_segments(&self) -> Vec<Segment> {
        self.segments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, segment)| segment.clone())
            .collect()
    }

    /// Context that sealed each segment, in the same order.
    pub fn producers(&self) -> Vec<ContextKey> {
        self.segments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, _)| *key)
            .collect()
    }

    /// Clears the stored segments.
    pub fn reset(&self) {
        self.segments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl SegmentSink for InMemorySegmentSink {
    fn on_sealed(&self, producer: ContextKey, segment: Segment) {
        self.segments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((producer, segment));
    }
}
