use sniffer::propagation::CorrelationContext;
use sniffer::{SegmentId, TraceId};

/// Immutable capture of a context's position, handed to another thread so
/// its work joins the same trace.
///
/// Snapshots never leave the process. Cloning one is cheap, and the same
/// snapshot may be continued by any number of tasks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextSnapshot {
    parent: Option<Parent>,
    parent_endpoint: String,
    correlation: CorrelationContext,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Parent {
    trace_id: TraceId,
    segment_id: SegmentId,
    span_index: u32,
}

impl ContextSnapshot {
    /// The snapshot of a context that records nothing. Continuing it is a
    /// no-op.
    pub fn empty() -> Self {
        ContextSnapshot::default()
    }

    pub(crate) fn new(
        trace_id: TraceId,
        segment_id: SegmentId,
        span_index: u32,
        parent_endpoint: String,
        correlation: CorrelationContext,
    ) -> Self {
        ContextSnapshot {
            parent: Some(Parent {
                trace_id,
                segment_id,
                span_index,
            }),
            parent_endpoint,
            correlation,
        }
    }

    /// Whether the snapshot names a span to link to.
    pub fn is_valid(&self) -> bool {
        self.parent.as_ref().is_some_and(|parent| {
            !parent.trace_id.is_empty() && !parent.segment_id.is_empty()
        })
    }

    /// Trace of the capturing context.
    pub fn trace_id(&self) -> Option<&TraceId> {
        self.parent.as_ref().map(|parent| &parent.trace_id)
    }

    /// Segment of the capturing context.
    pub fn segment_id(&self) -> Option<&SegmentId> {
        self.parent.as_ref().map(|parent| &parent.segment_id)
    }

    /// Span that was active when the snapshot was taken.
    pub fn span_index(&self) -> Option<u32> {
        self.parent.as_ref().map(|parent| parent.span_index)
    }

    /// Operation name of the capturing segment's first span.
    pub fn parent_endpoint(&self) -> &str {
        &self.parent_endpoint
    }

    /// Correlation values at capture time.
    pub fn correlation(&self) -> &CorrelationContext {
        &self.correlation
    }

    /// Whether the snapshot was taken inside `segment_id`.
    pub(crate) fn is_from_segment(&self, segment_id: &SegmentId) -> bool {
        self.segment_id() == Some(segment_id)
    }
}
