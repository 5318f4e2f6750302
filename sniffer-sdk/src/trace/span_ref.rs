use super::span_stack::Pushed;
use super::{ContextEngine, ContextKey};

/// Handle returned by the create operations of [`ContextEngine`].
///
/// It is a plain value: dropping it does nothing. Use [`SpanGuard`] to stop
/// spans on scope exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanRef {
    key: ContextKey,
    span_index: Option<u32>,
    depth: usize,
    reentered: bool,
}

impl SpanRef {
    pub(crate) fn recording(key: ContextKey, pushed: Pushed, depth: usize) -> Self {
        SpanRef {
            key,
            span_index: pushed.span_index(),
            depth,
            reentered: matches!(pushed, Pushed::Reentered(_)),
        }
    }

    pub(crate) fn noop(key: ContextKey, depth: usize) -> Self {
        SpanRef {
            key,
            span_index: None,
            depth,
            reentered: false,
        }
    }

    /// Context the span was created in.
    pub fn key(&self) -> ContextKey {
        self.key
    }

    /// Index of the span in its segment, `None` for a no-op span.
    pub fn span_index(&self) -> Option<u32> {
        self.span_index
    }

    /// Whether anything is recorded for this span.
    pub fn is_recording(&self) -> bool {
        self.span_index.is_some()
    }

    /// Whether the create call collapsed onto an already open entry span.
    pub fn is_reentry(&self) -> bool {
        self.reentered
    }

    /// Stack depth right after the create call.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Stops its span when dropped, including during unwinding.
///
/// Created by [`ContextEngine::enter_entry_span`],
/// [`ContextEngine::enter_local_span`] and
/// [`ContextEngine::enter_exit_span`].
#[derive(Debug)]
#[must_use = "dropping the guard stops the span immediately"]
pub struct SpanGuard<'a> {
    engine: &'a ContextEngine,
    span: SpanRef,
}

impl<'a> SpanGuard<'a> {
    pub(crate) fn new(engine: &'a ContextEngine, span: SpanRef) -> Self {
        SpanGuard { engine, span }
    }

    /// The guarded span.
    pub fn span(&self) -> &SpanRef {
        &self.span
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        self.engine.stop_span(self.span.key);
    }
}
