use super::{ContextKey, Segment};
use std::fmt::Debug;

/// Receives each segment exactly once, when its context seals it.
///
/// Called on the application thread that stopped the last span, so
/// implementations must return quickly and must not call back into the
/// engine for the same context.
pub trait SegmentSink: Send + Sync + Debug {
    /// Takes ownership of a sealed segment. `producer` is the context that
    /// recorded it.
    fn on_sealed(&self, producer: ContextKey, segment: Segment);
}

/// Sink that drops every segment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSegmentSink;

impl SegmentSink for NoopSegmentSink {
    fn on_sealed(&self, _producer: ContextKey, _segment: Segment) {}
}
