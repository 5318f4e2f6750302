use super::segment::{LogEvent, SegmentReference, SpanKind, SpanLayer, SpanRecord};
use super::status::ErrorStatusChecker;
use std::any;
use std::borrow::Cow;
use std::time::SystemTime;

/// A span that is still open.
///
/// Obtained through [`ContextEngine::with_active_span`]; the engine finishes
/// it when the matching stop is called.
///
/// [`ContextEngine::with_active_span`]: crate::trace::ContextEngine::with_active_span
#[derive(Debug)]
pub struct ActiveSpan {
    index: u32,
    parent: Option<u32>,
    kind: SpanKind,
    layer: SpanLayer,
    component_id: u16,
    operation_name: String,
    start_time: SystemTime,
    end_time: Option<SystemTime>,
    tags: Vec<(Cow<'static, str>, String)>,
    logs: Vec<LogEvent>,
    is_error: bool,
    peer: Option<String>,
    refs: Vec<SegmentReference>,
    skip_analysis: bool,
    status: ErrorStatusChecker,
}

impl ActiveSpan {
    fn new(
        index: u32,
        parent: Option<u32>,
        kind: SpanKind,
        operation_name: String,
        start_time: SystemTime,
        status: ErrorStatusChecker,
    ) -> Self {
        ActiveSpan {
            index,
            parent,
            kind,
            layer: SpanLayer::Unknown,
            component_id: 0,
            operation_name,
            start_time,
            end_time: None,
            tags: Vec::new(),
            logs: Vec::new(),
            is_error: false,
            peer: None,
            refs: Vec::new(),
            skip_analysis: false,
            status,
        }
    }

    /// Index of the span in its segment.
    pub fn span_index(&self) -> u32 {
        self.index
    }

    /// Index of the parent span.
    pub fn parent_span_index(&self) -> Option<u32> {
        self.parent
    }

    /// Role of the span.
    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    /// Operation name.
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// Renames the span.
    pub fn set_operation_name(&mut self, name: impl Into<String>) {
        self.operation_name = name.into();
    }

    /// Sets the technology layer.
    pub fn set_layer(&mut self, layer: SpanLayer) -> &mut Self {
        self.layer = layer;
        self
    }

    /// Sets the component id.
    pub fn set_component(&mut self, component_id: u16) -> &mut Self {
        self.component_id = component_id;
        self
    }

    /// Remote peer of an exit span.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Sets the remote peer.
    pub fn set_peer(&mut self, peer: impl Into<String>) -> &mut Self {
        self.peer = Some(peer.into());
        self
    }

    /// Adds a tag. Tags keep insertion order and may repeat a key.
    pub fn tag(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) -> &mut Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Value of the last tag recorded under `key`.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Records a log event made of `fields`.
    pub fn log<I, K, V>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Cow<'static, str>>,
        V: Into<String>,
    {
        self.logs.push(LogEvent {
            timestamp: SystemTime::now(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        });
        self
    }

    /// Logs `err` and marks the span as failed, unless the type of `err` is
    /// one of the configured ignored errors.
    ///
    /// The type is taken from `E`, so pass the concrete error rather than a
    /// `dyn Error` when ignored errors are configured.
    pub fn log_error<E>(&mut self, err: &E) -> &mut Self
    where
        E: std::error::Error + ?Sized,
    {
        let kind = any::type_name::<E>();
        if self.status.marks_error(kind) {
            self.is_error = true;
        }
        self.log([
            ("event", "error".to_string()),
            ("message", err.to_string()),
            ("error.kind", kind.to_string()),
        ])
    }

    /// Marks the span as failed.
    pub fn error_occurred(&mut self) -> &mut Self {
        self.is_error = true;
        self
    }

    /// Whether the span recorded an error.
    pub fn is_error(&self) -> bool {
        self.is_error
    }

    /// Asks the backend not to analyze this span.
    pub fn skip_analysis(&mut self) -> &mut Self {
        self.skip_analysis = true;
        self
    }

    /// Parents linked to this span.
    pub fn refs(&self) -> &[SegmentReference] {
        &self.refs
    }

    pub(crate) fn add_ref(&mut self, reference: SegmentReference) {
        if !self.refs.contains(&reference) {
            self.refs.push(reference);
        }
    }

    fn finish(&mut self, end_time: SystemTime) {
        self.end_time = Some(end_time);
    }

    pub(crate) fn into_record(self) -> SpanRecord {
        SpanRecord {
            span_index: self.index,
            parent_span_index: self.parent,
            operation_name: self.operation_name,
            kind: self.kind,
            layer: self.layer,
            component_id: self.component_id,
            start_time: self.start_time,
            end_time: self.end_time.unwrap_or(self.start_time),
            tags: self.tags,
            logs: self.logs,
            is_error: self.is_error,
            peer: self.peer,
            refs: self.refs,
            skip_analysis: self.skip_analysis,
        }
    }
}

/// One open frame on the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Frame {
    /// A span created by the matching create call.
    Span(u32),
    /// A nested entry call collapsed onto the entry span below.
    Reentry(u32),
    /// A create call that records nothing.
    Noop,
}

/// Outcome of [`SpanStack::push`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Pushed {
    Created(u32),
    Reentered(u32),
    Noop,
}

impl Pushed {
    pub(crate) fn span_index(self) -> Option<u32> {
        match self {
            Pushed::Created(index) | Pushed::Reentered(index) => Some(index),
            Pushed::Noop => None,
        }
    }
}

/// The open spans of one context plus every span its segment has recorded
/// so far. Stops are LIFO.
#[derive(Debug)]
pub(crate) struct SpanStack {
    spans: Vec<ActiveSpan>,
    frames: Vec<Frame>,
    limit: usize,
    entry: Option<u32>,
    size_limited: bool,
    status: ErrorStatusChecker,
}

impl SpanStack {
    pub(crate) fn new(limit: usize, status: ErrorStatusChecker) -> Self {
        SpanStack {
            spans: Vec::new(),
            frames: Vec::new(),
            limit,
            entry: None,
            size_limited: false,
            status,
        }
    }

    /// Number of create calls not yet matched by a stop.
    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn is_size_limited(&self) -> bool {
        self.size_limited
    }

    /// Opens a frame for a create call.
    ///
    /// An entry call on top of an open entry span re-enters it and takes the
    /// new operation name. Any other entry call in a segment that already
    /// has an entry span, and any call past the span limit, opens a frame
    /// that records nothing.
    pub(crate) fn push(&mut self, kind: SpanKind, operation_name: String, start: SystemTime) -> Pushed {
        if kind == SpanKind::Entry {
            if let Some(Frame::Span(index) | Frame::Reentry(index)) = self.frames.last().copied() {
                let top = &mut self.spans[index as usize];
                if top.kind == SpanKind::Entry {
                    top.set_operation_name(operation_name);
                    self.frames.push(Frame::Reentry(index));
                    return Pushed::Reentered(index);
                }
            }
            if self.entry.is_some() {
                self.frames.push(Frame::Noop);
                return Pushed::Noop;
            }
        }

        if self.spans.len() >= self.limit {
            self.size_limited = true;
            self.frames.push(Frame::Noop);
            return Pushed::Noop;
        }

        let index = self.spans.len() as u32;
        let parent = self.tip().map(ActiveSpan::span_index);
        self.spans.push(ActiveSpan::new(
            index,
            parent,
            kind,
            operation_name,
            start,
            self.status.clone(),
        ));
        self.frames.push(Frame::Span(index));
        if kind == SpanKind::Entry {
            self.entry = Some(index);
        }
        Pushed::Created(index)
    }

    /// Closes the top frame. Returns `false` when no frame was open.
    pub(crate) fn pop(&mut self, end: SystemTime) -> bool {
        match self.frames.pop() {
            Some(Frame::Span(index)) => {
                self.spans[index as usize].finish(end);
                true
            }
            Some(Frame::Reentry(_) | Frame::Noop) => true,
            None => false,
        }
    }

    /// Span of the top frame, `None` when that frame records nothing.
    pub(crate) fn top_mut(&mut self) -> Option<&mut ActiveSpan> {
        match self.frames.last().copied()? {
            Frame::Span(index) | Frame::Reentry(index) => self.spans.get_mut(index as usize),
            Frame::Noop => None,
        }
    }

    /// Innermost open span that records, skipping no-op frames.
    pub(crate) fn tip(&self) -> Option<&ActiveSpan> {
        self.frames.iter().rev().find_map(|frame| match *frame {
            Frame::Span(index) | Frame::Reentry(index) => self.spans.get(index as usize),
            Frame::Noop => None,
        })
    }

    pub(crate) fn tip_mut(&mut self) -> Option<&mut ActiveSpan> {
        let index = self.tip()?.span_index();
        self.spans.get_mut(index as usize)
    }

    /// The segment's root span.
    pub(crate) fn first(&self) -> Option<&ActiveSpan> {
        self.spans.first()
    }

    pub(crate) fn into_spans(self) -> Vec<ActiveSpan> {
        self.spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigCell;
    use std::sync::Arc;

    fn push(stack: &mut SpanStack, kind: SpanKind, name: &str) -> Pushed {
        stack.push(kind, name.to_string(), SystemTime::now())
    }

    #[test]
    fn parents_follow_nesting() {
        let mut stack = SpanStack::new(300, ErrorStatusChecker::default());
        assert_eq!(push(&mut stack, SpanKind::Entry, "GET /a"), Pushed::Created(0));
        assert_eq!(push(&mut stack, SpanKind::Local, "work"), Pushed::Created(1));
        assert_eq!(push(&mut stack, SpanKind::Exit, "db"), Pushed::Created(2));
        assert!(stack.pop(SystemTime::now()));
        assert_eq!(push(&mut stack, SpanKind::Exit, "cache"), Pushed::Created(3));
        assert_eq!(stack.depth(), 3);

        let spans = stack.into_spans();
        let parents = spans
            .iter()
            .map(ActiveSpan::parent_span_index)
            .collect::<Vec<_>>();
        assert_eq!(parents, vec![None, Some(0), Some(1), Some(1)]);
    }

    #[test]
    fn nested_entry_reenters_the_top_entry() {
        let mut stack = SpanStack::new(300, ErrorStatusChecker::default());
        push(&mut stack, SpanKind::Entry, "outer");
        assert_eq!(push(&mut stack, SpanKind::Entry, "inner"), Pushed::Reentered(0));
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.tip().map(ActiveSpan::operation_name), Some("inner"));

        assert!(stack.pop(SystemTime::now()));
        assert_eq!(stack.depth(), 1);
        assert!(stack.tip().is_some(), "entry span is still open");
        assert!(stack.pop(SystemTime::now()));
        assert!(stack.is_empty());
        assert_eq!(stack.into_spans().len(), 1);
    }

    #[test]
    fn entry_below_the_top_turns_entries_into_noops() {
        let mut stack = SpanStack::new(300, ErrorStatusChecker::default());
        push(&mut stack, SpanKind::Entry, "outer");
        push(&mut stack, SpanKind::Local, "work");
        assert_eq!(push(&mut stack, SpanKind::Entry, "inner"), Pushed::Noop);
        assert_eq!(stack.depth(), 3);
        assert!(stack.top_mut().is_none());
        assert_eq!(stack.tip().map(ActiveSpan::span_index), Some(1));
    }

    #[test]
    fn limit_marks_the_stack() {
        let mut stack = SpanStack::new(2, ErrorStatusChecker::default());
        push(&mut stack, SpanKind::Local, "a");
        push(&mut stack, SpanKind::Local, "b");
        assert_eq!(push(&mut stack, SpanKind::Exit, "c"), Pushed::Noop);
        assert!(stack.is_size_limited());
        assert_eq!(stack.depth(), 3);
    }

    #[test]
    fn pop_on_empty_stack_reports_underflow() {
        let mut stack = SpanStack::new(300, ErrorStatusChecker::default());
        assert!(!stack.pop(SystemTime::now()));
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn finished_spans_keep_their_end_time() {
        let mut stack = SpanStack::new(300, ErrorStatusChecker::default());
        let start = SystemTime::now();
        stack.push(SpanKind::Local, "a".into(), start);
        let end = start + std::time::Duration::from_millis(5);
        stack.pop(end);
        let record = stack.into_spans().remove(0).into_record();
        assert_eq!(record.end_time, end);
    }

    #[test]
    fn error_logs_mark_the_span() {
        let mut stack = SpanStack::new(300, ErrorStatusChecker::default());
        push(&mut stack, SpanKind::Exit, "db");
        let err = std::io::Error::other("connection reset");
        let span = stack.top_mut().unwrap();
        span.tag("db.type", "sql").log_error(&err);

        assert!(span.is_error());
        assert_eq!(span.tag_value("db.type"), Some("sql"));
        let record = stack.into_spans().remove(0).into_record();
        assert_eq!(record.logs[0].fields[1].1, "connection reset");
        assert!(record.logs[0].fields[2].1.starts_with("std::io"));
    }

    fn ignoring(names: &[&str]) -> SpanStack {
        let names = names.iter().map(|name| name.to_string()).collect::<Vec<_>>();
        let cell = Arc::new(ConfigCell::new(Arc::from(names)));
        SpanStack::new(300, ErrorStatusChecker::new(cell))
    }

    #[test]
    fn ignored_errors_are_logged_without_marking_the_span() {
        let mut stack = ignoring(&["std::io"]);
        push(&mut stack, SpanKind::Exit, "db");
        let span = stack.top_mut().unwrap();
        span.log_error(&std::io::Error::other("connection reset"));

        assert!(!span.is_error());
        let record = stack.into_spans().remove(0).into_record();
        assert!(!record.is_error);
        assert_eq!(record.logs.len(), 1);
        assert_eq!(record.logs[0].fields[1].1, "connection reset");
    }

    #[test]
    fn errors_outside_the_ignored_list_still_mark_the_span() {
        let mut stack = ignoring(&["NotFound"]);
        push(&mut stack, SpanKind::Exit, "db");
        let span = stack.top_mut().unwrap();
        span.log_error(&std::fmt::Error);
        assert!(span.is_error());
    }

    #[test]
    fn error_occurred_ignores_the_status_check() {
        let mut stack = ignoring(&["std"]);
        push(&mut stack, SpanKind::Local, "work");
        let span = stack.top_mut().unwrap();
        span.error_occurred();
        assert!(span.is_error());
    }
}
