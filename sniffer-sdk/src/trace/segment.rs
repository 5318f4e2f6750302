use super::ContextSnapshot;
use sniffer::propagation::ContextCarrier;
use sniffer::{SegmentId, TraceId};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::SystemTime;

/// Role of a span within its segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpanKind {
    /// Work received from another process.
    Entry,
    /// A call leaving the process.
    Exit,
    /// In-process work.
    Local,
}

/// Technology layer of a span, used by the backend for analysis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SpanLayer {
    /// Not classified.
    #[default]
    Unknown,
    /// Database access.
    Database,
    /// RPC framework.
    RpcFramework,
    /// HTTP.
    Http,
    /// Message queue.
    Mq,
    /// Cache access.
    Cache,
    /// Function as a service.
    Faas,
}

/// How a segment is linked to its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefType {
    /// Parent segment runs in another process and the link came through a
    /// carrier.
    CrossProcess,
    /// Parent segment runs in this process and the link came through a
    /// snapshot.
    CrossThread,
}

/// A link from a segment to the span that caused it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentReference {
    /// How the link was made.
    pub ref_type: RefType,
    /// Trace the parent belongs to.
    pub trace_id: TraceId,
    /// Parent segment.
    pub parent_segment_id: SegmentId,
    /// Parent span within the parent segment.
    pub parent_span_index: u32,
    /// Service of the parent segment.
    pub parent_service: String,
    /// Service instance of the parent segment.
    pub parent_service_instance: String,
    /// Operation name of the parent segment's first span.
    pub parent_endpoint: String,
    /// Address the parent used to reach this process. Empty for
    /// cross-thread links.
    pub network_address_used_at_peer: String,
}

impl SegmentReference {
    /// Builds a cross-process reference. `None` unless the carrier names
    /// its parent segment and span.
    pub fn from_carrier(carrier: &ContextCarrier) -> Option<Self> {
        if !carrier.has_parent_span() {
            return None;
        }
        Some(SegmentReference {
            ref_type: RefType::CrossProcess,
            trace_id: carrier.trace_id.clone()?,
            parent_segment_id: carrier.parent_segment_id.clone()?,
            parent_span_index: carrier.parent_span_index?,
            parent_service: carrier.parent_service.clone(),
            parent_service_instance: carrier.parent_service_instance.clone(),
            parent_endpoint: carrier.parent_endpoint.clone(),
            network_address_used_at_peer: carrier.address_used_at_client.clone(),
        })
    }

    /// Builds a cross-thread reference. The parent runs in this process, so
    /// it shares the local service identity. `None` for an empty snapshot.
    pub fn from_snapshot(
        snapshot: &ContextSnapshot,
        service: &str,
        service_instance: &str,
    ) -> Option<Self> {
        if !snapshot.is_valid() {
            return None;
        }
        Some(SegmentReference {
            ref_type: RefType::CrossThread,
            trace_id: snapshot.trace_id()?.clone(),
            parent_segment_id: snapshot.segment_id()?.clone(),
            parent_span_index: snapshot.span_index()?,
            parent_service: service.to_string(),
            parent_service_instance: service_instance.to_string(),
            parent_endpoint: snapshot.parent_endpoint().to_string(),
            network_address_used_at_peer: String::new(),
        })
    }
}

/// A timestamped set of fields recorded on a span.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEvent {
    /// When the event was recorded.
    pub timestamp: SystemTime,
    /// Event fields, in insertion order.
    pub fields: Vec<(Cow<'static, str>, String)>,
}

/// A finished span as reported inside a [`Segment`].
#[derive(Clone, Debug, PartialEq)]
pub struct SpanRecord {
    /// Index of the span in its segment. Doubles as the span id.
    pub span_index: u32,
    /// Index of the parent span, `None` for the segment's first span.
    pub parent_span_index: Option<u32>,
    /// Operation name.
    pub operation_name: String,
    /// Role of the span.
    pub kind: SpanKind,
    /// Technology layer.
    pub layer: SpanLayer,
    /// Component (library) that created the span.
    pub component_id: u16,
    /// Start time.
    pub start_time: SystemTime,
    /// End time.
    pub end_time: SystemTime,
    /// Tags, in insertion order.
    pub tags: Vec<(Cow<'static, str>, String)>,
    /// Log events, in insertion order.
    pub logs: Vec<LogEvent>,
    /// Whether the span recorded an error.
    pub is_error: bool,
    /// Remote peer of an exit span.
    pub peer: Option<String>,
    /// Parents of an entry or task span.
    pub refs: Vec<SegmentReference>,
    /// The backend should skip analyzing this span.
    pub skip_analysis: bool,
}

/// All spans recorded by one context between the first create and the last
/// stop. Immutable once sealed.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    /// Trace the segment belongs to.
    pub trace_id: TraceId,
    /// Identifier of this segment.
    pub segment_id: SegmentId,
    /// Reporting service.
    pub service: Arc<str>,
    /// Reporting service instance.
    pub service_instance: Arc<str>,
    /// Spans ordered by span index.
    pub spans: Vec<SpanRecord>,
    /// Parents of this segment, in the order they were linked.
    pub refs: Vec<SegmentReference>,
    /// Whether spans were dropped because the segment hit its span limit.
    pub size_limited: bool,
}

impl Segment {
    /// The segment's root span.
    pub fn first_span(&self) -> Option<&SpanRecord> {
        self.spans.first()
    }

    /// The span at `index`.
    pub fn span(&self, index: u32) -> Option<&SpanRecord> {
        self.spans.get(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_require_a_parent_span() {
        let mut carrier = ContextCarrier::new();
        carrier.trace_id = Some(TraceId::from("t1"));
        assert!(SegmentReference::from_carrier(&carrier).is_none());

        carrier.parent_segment_id = Some(SegmentId::from("s1"));
        carrier.parent_span_index = Some(2);
        carrier.address_used_at_client = "10.0.0.2:80".into();
        let reference = SegmentReference::from_carrier(&carrier).unwrap();
        assert_eq!(reference.ref_type, RefType::CrossProcess);
        assert_eq!(reference.parent_span_index, 2);
        assert_eq!(reference.network_address_used_at_peer, "10.0.0.2:80");
    }

    #[test]
    fn empty_snapshots_link_nothing() {
        assert!(SegmentReference::from_snapshot(&ContextSnapshot::empty(), "svc", "i").is_none());
    }
}
