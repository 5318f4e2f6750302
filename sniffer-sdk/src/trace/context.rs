use super::segment::{Segment, SegmentReference, SpanKind};
use super::span_stack::{Pushed, SpanStack};
use super::status::ErrorStatusChecker;
use super::ContextSnapshot;
use sniffer::propagation::{ContextCarrier, CorrelationContext, ExtensionContext};
use sniffer::{SegmentId, TraceId};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Tag holding the carrier transmission latency, in milliseconds.
pub(crate) const TRANSMISSION_LATENCY_TAG: &str = "transmission.latency";

/// State kept by the engine for one context with an open stack.
#[derive(Debug)]
pub(crate) enum TracingContext {
    /// Spans are recorded into a segment.
    Recording(Box<RecordingContext>),
    /// Nothing is recorded; only create/stop balance is tracked.
    Ignored { depth: usize },
}

#[derive(Debug)]
pub(crate) struct RecordingContext {
    trace_id: TraceId,
    // the trace id came from a carrier or snapshot, not from this segment
    trace_propagated: bool,
    segment_id: SegmentId,
    stack: SpanStack,
    refs: Vec<SegmentReference>,
    correlation: CorrelationContext,
    skip_analysis: bool,
}

/// Service identity stamped on references, carriers and sealed segments.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Identity<'a> {
    pub(crate) service: &'a Arc<str>,
    pub(crate) service_instance: &'a Arc<str>,
}

impl RecordingContext {
    pub(crate) fn new(
        trace_id: TraceId,
        trace_propagated: bool,
        segment_id: SegmentId,
        span_limit: usize,
        status: ErrorStatusChecker,
    ) -> Self {
        RecordingContext {
            trace_id,
            trace_propagated,
            segment_id,
            stack: SpanStack::new(span_limit, status),
            refs: Vec::new(),
            correlation: CorrelationContext::new(),
            skip_analysis: false,
        }
    }

    pub(crate) fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    pub(crate) fn segment_id(&self) -> &SegmentId {
        &self.segment_id
    }

    pub(crate) fn stack(&self) -> &SpanStack {
        &self.stack
    }

    pub(crate) fn stack_mut(&mut self) -> &mut SpanStack {
        &mut self.stack
    }

    pub(crate) fn correlation_mut(&mut self) -> &mut CorrelationContext {
        &mut self.correlation
    }

    pub(crate) fn push(&mut self, kind: SpanKind, operation_name: String, now: SystemTime) -> Pushed {
        self.stack.push(kind, operation_name, now)
    }

    /// Joins the trace described by an incoming carrier. The reference goes
    /// on the segment and on the entry span just pushed.
    pub(crate) fn extract(&mut self, carrier: &ContextCarrier, pushed: Pushed, now: SystemTime) {
        let Some(trace_id) = carrier.trace_id.as_ref().filter(|id| !id.is_empty()) else {
            return;
        };
        self.adopt_trace(trace_id);
        self.correlation.extend_from(&carrier.correlation);
        if carrier.extension.skip_analysis {
            self.skip_analysis = true;
        }

        let reference = SegmentReference::from_carrier(carrier);
        if let Some(reference) = &reference {
            self.add_segment_ref(reference.clone());
        }

        let Some(index) = pushed.span_index() else {
            return;
        };
        let Some(span) = self.stack.top_mut().filter(|span| span.span_index() == index) else {
            return;
        };
        if let Some(reference) = reference {
            span.add_ref(reference);
        }
        if carrier.extension.skip_analysis {
            span.skip_analysis();
        }
        if let Some(latency) = carrier.extension.transmission_latency(unix_millis(now)) {
            span.tag(TRANSMISSION_LATENCY_TAG, latency.to_string());
        }
    }

    /// Links this segment to the span captured in `snapshot`. Snapshots
    /// taken inside this segment link nothing.
    pub(crate) fn continued(&mut self, snapshot: &ContextSnapshot, identity: Identity<'_>) -> bool {
        if snapshot.is_from_segment(&self.segment_id) {
            return false;
        }
        let Some(reference) =
            SegmentReference::from_snapshot(snapshot, identity.service, identity.service_instance)
        else {
            return false;
        };

        self.adopt_trace(&reference.trace_id);
        self.correlation.extend_from(snapshot.correlation());
        if let Some(span) = self.stack.tip_mut() {
            span.add_ref(reference.clone());
        }
        self.add_segment_ref(reference);
        true
    }

    pub(crate) fn capture(&self) -> ContextSnapshot {
        let Some(tip) = self.stack.tip() else {
            return ContextSnapshot::empty();
        };
        ContextSnapshot::new(
            self.trace_id.clone(),
            self.segment_id.clone(),
            tip.span_index(),
            self.endpoint().to_string(),
            self.correlation.clone(),
        )
    }

    /// Fills `carrier` for a call leaving the process from the current tip.
    /// The peer of an exit tip becomes the address used at the client.
    pub(crate) fn inject(
        &self,
        carrier: &mut ContextCarrier,
        identity: Identity<'_>,
        now: SystemTime,
    ) -> bool {
        let Some(tip) = self.stack.tip() else {
            return false;
        };
        carrier.trace_id = Some(self.trace_id.clone());
        carrier.parent_segment_id = Some(self.segment_id.clone());
        carrier.parent_span_index = Some(tip.span_index());
        carrier.sampled = true;
        carrier.parent_service = identity.service.to_string();
        carrier.parent_service_instance = identity.service_instance.to_string();
        carrier.parent_endpoint = self.endpoint().to_string();
        carrier.address_used_at_client = tip.peer().unwrap_or_default().to_string();
        carrier.extension = ExtensionContext {
            skip_analysis: self.skip_analysis,
            send_timestamp: Some(unix_millis(now)),
        };
        carrier.correlation = self.correlation.clone();
        true
    }

    pub(crate) fn seal(self, identity: Identity<'_>) -> Segment {
        let size_limited = self.stack.is_size_limited();
        Segment {
            trace_id: self.trace_id,
            segment_id: self.segment_id,
            service: identity.service.clone(),
            service_instance: identity.service_instance.clone(),
            spans: self
                .stack
                .into_spans()
                .into_iter()
                .map(|span| span.into_record())
                .collect(),
            refs: self.refs,
            size_limited,
        }
    }

    fn endpoint(&self) -> &str {
        self.stack
            .first()
            .map(|span| span.operation_name())
            .unwrap_or_default()
    }

    fn adopt_trace(&mut self, trace_id: &TraceId) {
        if !self.trace_propagated {
            self.trace_id = trace_id.clone();
            self.trace_propagated = true;
        }
    }

    fn add_segment_ref(&mut self, reference: SegmentReference) {
        if !self.refs.contains(&reference) {
            self.refs.push(reference);
        }
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as u64)
        .unwrap_or_default()
}
