use super::context::{Identity, RecordingContext, TracingContext};
use super::id_generator::{GlobalIdGenerator, IdGenerator};
use super::sampler::SamplingService;
use super::segment::SpanKind;
use super::span_ref::{SpanGuard, SpanRef};
use super::span_stack::{ActiveSpan, Pushed};
use super::{ContextKey, ContextSnapshot, SegmentSink, TracedTask};
use crate::config::AgentConfig;
use sniffer::propagation::ContextCarrier;
use sniffer::{sniffer_debug, sniffer_warn, SegmentId, TraceId};
use std::borrow::Cow;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

const DEFAULT_SHARDS: usize = 64;

type ContextShard = Mutex<HashMap<ContextKey, TracingContext>>;

/// Owns the tracing state of every execution context.
///
/// Each context is addressed by a [`ContextKey`]. Contexts live in a sharded
/// map, so contexts in different shards never contend, and a context is
/// only ever mutated through its own key.
///
/// No operation returns an error or panics into the caller: inconsistent
/// calls degrade to no-ops and are counted.
///
/// # Examples
///
/// ```
/// use sniffer_sdk::trace::{ContextEngine, ContextKey, NoopSegmentSink};
/// use std::sync::Arc;
///
/// let engine = ContextEngine::builder(Arc::new(NoopSegmentSink)).build();
/// let key = ContextKey::current_thread();
///
/// engine.create_entry_span(key, "GET /orders", None);
/// engine.create_exit_span(key, "SELECT orders", "db:5432", None);
/// engine.stop_span(key);
/// engine.stop_span(key);
/// assert!(!engine.is_active(key));
/// ```
pub struct ContextEngine {
    shards: Box<[ContextShard]>,
    config: AgentConfig,
    sampler: SamplingService,
    id_generator: Box<dyn IdGenerator>,
    sink: Arc<dyn SegmentSink>,
    underflows: AtomicU64,
    sealed: AtomicU64,
    ignored: AtomicU64,
}

impl fmt::Debug for ContextEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextEngine")
            .field("shards", &self.shards.len())
            .field("config", &self.config)
            .field("id_generator", &self.id_generator)
            .field("sink", &self.sink)
            .field("underflows", &self.underflow_count())
            .finish()
    }
}

impl ContextEngine {
    /// Create a builder delivering sealed segments to `sink`.
    pub fn builder(sink: Arc<dyn SegmentSink>) -> ContextEngineBuilder {
        ContextEngineBuilder {
            config: None,
            id_generator: None,
            sink,
            shards: DEFAULT_SHARDS,
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Creates an entry span for work received from another process.
    ///
    /// Without an open stack a new segment is started. A valid `carrier`
    /// joins its trace and links the segment and the span to the sender; a
    /// sampled carrier bypasses local sampling. Otherwise a new trace is
    /// started.
    ///
    /// When the top of the stack is already an entry span the call re-enters
    /// it: depth grows, the operation name is replaced and no span is added.
    pub fn create_entry_span(
        &self,
        key: ContextKey,
        operation_name: impl Into<Cow<'static, str>>,
        carrier: Option<&ContextCarrier>,
    ) -> SpanRef {
        self.create_span(
            key,
            SpanKind::Entry,
            operation_name.into(),
            carrier.filter(|carrier| carrier.is_valid()),
            None,
            None,
        )
    }

    /// Creates a local span. Without an open stack the span becomes the root
    /// of a new segment.
    pub fn create_local_span(
        &self,
        key: ContextKey,
        operation_name: impl Into<Cow<'static, str>>,
    ) -> SpanRef {
        self.create_span(key, SpanKind::Local, operation_name.into(), None, None, None)
    }

    /// Creates an exit span towards `peer`. When `carrier` is given it is
    /// filled so the callee can continue the trace.
    pub fn create_exit_span(
        &self,
        key: ContextKey,
        operation_name: impl Into<Cow<'static, str>>,
        peer: &str,
        carrier: Option<&mut ContextCarrier>,
    ) -> SpanRef {
        self.create_span(
            key,
            SpanKind::Exit,
            operation_name.into(),
            None,
            Some(peer),
            carrier,
        )
    }

    fn create_span(
        &self,
        key: ContextKey,
        kind: SpanKind,
        operation_name: Cow<'static, str>,
        carrier_in: Option<&ContextCarrier>,
        peer: Option<&str>,
        carrier_out: Option<&mut ContextCarrier>,
    ) -> SpanRef {
        let now = SystemTime::now();
        let mut contexts = self.shard(key);
        let context = match contexts.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.new_context(&operation_name, carrier_in)),
        };

        let cx = match context {
            TracingContext::Ignored { depth } => {
                *depth += 1;
                return SpanRef::noop(key, *depth);
            }
            TracingContext::Recording(cx) => cx,
        };

        let pushed = cx.push(kind, operation_name.into_owned(), now);
        if let Some(carrier) = carrier_in {
            cx.extract(carrier, pushed, now);
        }
        if let (Some(peer), Some(index)) = (peer, pushed.span_index()) {
            if let Some(span) = cx
                .stack_mut()
                .top_mut()
                .filter(|span| span.span_index() == index)
            {
                span.set_peer(peer);
            }
        }
        if let Some(carrier) = carrier_out {
            cx.inject(carrier, self.identity(), now);
        }
        SpanRef::recording(key, pushed, cx.stack().depth())
    }

    fn new_context(&self, operation_name: &str, carrier: Option<&ContextCarrier>) -> TracingContext {
        if !self.config.enabled.current_value() || self.is_ignored_operation(operation_name) {
            return self.ignored_context();
        }

        let propagated = carrier.and_then(|carrier| carrier.trace_id.clone());
        let sampled = match carrier {
            Some(carrier) if carrier.sampled => {
                self.sampler.force_sampled();
                true
            }
            _ => self.sampler.try_sample(),
        };
        if !sampled {
            return self.ignored_context();
        }

        let trace_propagated = propagated.is_some();
        let trace_id = propagated.unwrap_or_else(|| self.id_generator.new_trace_id());
        TracingContext::Recording(Box::new(RecordingContext::new(
            trace_id,
            trace_propagated,
            self.id_generator.new_segment_id(),
            self.config.span_limit,
            self.config.status_checker(),
        )))
    }

    fn ignored_context(&self) -> TracingContext {
        self.ignored.fetch_add(1, Ordering::Relaxed);
        TracingContext::Ignored { depth: 0 }
    }

    fn is_ignored_operation(&self, operation_name: &str) -> bool {
        let Some(dot) = operation_name.rfind('.') else {
            return false;
        };
        let suffix = &operation_name[dot..];
        self.config
            .ignore_suffix
            .current_value()
            .iter()
            .any(|ignored| ignored == suffix)
    }

    /// Stops the innermost open span of `key`.
    ///
    /// When the stack becomes empty the segment is sealed and handed to the
    /// sink, and the context is retired. Stopping a context with no open
    /// span does nothing besides incrementing [`underflow_count`].
    ///
    /// [`underflow_count`]: ContextEngine::underflow_count
    pub fn stop_span(&self, key: ContextKey) {
        let now = SystemTime::now();
        let sealed = {
            let mut contexts = self.shard(key);
            let Some(context) = contexts.get_mut(&key) else {
                drop(contexts);
                self.record_underflow(key);
                return;
            };

            let retire = match context {
                TracingContext::Ignored { depth } => {
                    *depth = depth.saturating_sub(1);
                    *depth == 0
                }
                TracingContext::Recording(cx) => {
                    cx.stack_mut().pop(now);
                    cx.stack().is_empty()
                }
            };
            if !retire {
                return;
            }
            match contexts.remove(&key) {
                Some(TracingContext::Recording(cx)) => Some(cx.seal(self.identity())),
                _ => None,
            }
        };

        if let Some(segment) = sealed {
            self.sealed.fetch_add(1, Ordering::Relaxed);
            sniffer_debug!(
                name: "ContextEngine.SegmentSealed",
                segment_id = segment.segment_id.to_string(),
                spans = segment.spans.len() as u64
            );
            self.sink.on_sealed(key, segment);
        }
    }

    fn record_underflow(&self, key: ContextKey) {
        if self.underflows.fetch_add(1, Ordering::Relaxed) == 0 {
            sniffer_warn!(
                name: "ContextEngine.StopWithoutSpan",
                key = format!("{key:?}"),
                message = "stop_span called with no open span. Further occurrences are only counted."
            );
        }
    }

    /// Captures the position of `key` for another thread. Contexts that
    /// record nothing yield [`ContextSnapshot::empty`].
    pub fn capture(&self, key: ContextKey) -> ContextSnapshot {
        match self.shard(key).get(&key) {
            Some(TracingContext::Recording(cx)) => cx.capture(),
            _ => ContextSnapshot::empty(),
        }
    }

    /// Links the open segment of `key` to the span captured in `snapshot`,
    /// joining its trace.
    ///
    /// Empty snapshots, contexts without an open stack and snapshots taken
    /// inside the same segment are ignored, so continuing a context's own
    /// snapshot is a no-op.
    pub fn continued(&self, key: ContextKey, snapshot: &ContextSnapshot) {
        if !snapshot.is_valid() {
            return;
        }
        if let Some(TracingContext::Recording(cx)) = self.shard(key).get_mut(&key) {
            cx.continued(snapshot, self.identity());
        }
    }

    /// Fills `carrier` from the innermost recording span of `key`. Returns
    /// `false`, leaving the carrier untouched, when nothing is recorded.
    pub fn inject(&self, key: ContextKey, carrier: &mut ContextCarrier) -> bool {
        match self.shard(key).get(&key) {
            Some(TracingContext::Recording(cx)) => {
                cx.inject(carrier, self.identity(), SystemTime::now())
            }
            _ => false,
        }
    }

    /// Runs `f` on the span of the top frame of `key`. Returns `None` when
    /// that frame records nothing.
    ///
    /// `f` runs while the context is locked and must not call back into the
    /// engine.
    pub fn with_active_span<F, R>(&self, key: ContextKey, f: F) -> Option<R>
    where
        F: FnOnce(&mut ActiveSpan) -> R,
    {
        match self.shard(key).get_mut(&key) {
            Some(TracingContext::Recording(cx)) => cx.stack_mut().top_mut().map(f),
            _ => None,
        }
    }

    /// Handle of the top frame of `key`, `None` without an open stack.
    pub fn active_span_ref(&self, key: ContextKey) -> Option<SpanRef> {
        match self.shard(key).get_mut(&key)? {
            TracingContext::Ignored { depth } => Some(SpanRef::noop(key, *depth)),
            TracingContext::Recording(cx) => {
                let depth = cx.stack().depth();
                Some(match cx.stack_mut().top_mut() {
                    Some(span) => {
                        SpanRef::recording(key, Pushed::Created(span.span_index()), depth)
                    }
                    None => SpanRef::noop(key, depth),
                })
            }
        }
    }

    /// Trace of the open segment of `key`.
    pub fn trace_id(&self, key: ContextKey) -> Option<TraceId> {
        match self.shard(key).get(&key) {
            Some(TracingContext::Recording(cx)) => Some(cx.trace_id().clone()),
            _ => None,
        }
    }

    /// Open segment of `key`.
    pub fn segment_id(&self, key: ContextKey) -> Option<SegmentId> {
        match self.shard(key).get(&key) {
            Some(TracingContext::Recording(cx)) => Some(cx.segment_id().clone()),
            _ => None,
        }
    }

    /// Number of create calls of `key` not yet matched by a stop.
    pub fn depth(&self, key: ContextKey) -> usize {
        match self.shard(key).get(&key) {
            Some(TracingContext::Recording(cx)) => cx.stack().depth(),
            Some(TracingContext::Ignored { depth }) => *depth,
            None => 0,
        }
    }

    /// Whether `key` has an open stack, recording or not.
    pub fn is_active(&self, key: ContextKey) -> bool {
        self.shard(key).contains_key(&key)
    }

    /// Whether `key` has an open stack that records spans.
    pub fn is_recording(&self, key: ContextKey) -> bool {
        matches!(
            self.shard(key).get(&key),
            Some(TracingContext::Recording(_))
        )
    }

    /// Stores a correlation value that follows the trace across threads and
    /// processes. Returns `false` when nothing is recorded or the value is
    /// rejected by the correlation limits.
    pub fn put_correlation(&self, key: ContextKey, name: &str, value: &str) -> bool {
        match self.shard(key).get_mut(&key) {
            Some(TracingContext::Recording(cx)) => cx.correlation_mut().put(name, value),
            _ => false,
        }
    }

    /// Correlation value stored under `name`.
    pub fn correlation(&self, key: ContextKey, name: &str) -> Option<String> {
        match self.shard(key).get_mut(&key) {
            Some(TracingContext::Recording(cx)) => {
                cx.correlation_mut().get(name).map(str::to_string)
            }
            _ => None,
        }
    }

    /// Number of stops that found no open span.
    pub fn underflow_count(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    /// Number of segments handed to the sink.
    pub fn sealed_count(&self) -> u64 {
        self.sealed.load(Ordering::Relaxed)
    }

    /// Number of contexts that were opened as ignored.
    pub fn ignored_count(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Number of contexts with an open stack.
    pub fn active_contexts(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Like [`create_entry_span`](Self::create_entry_span), stopping the span
    /// when the guard drops.
    pub fn enter_entry_span(
        &self,
        key: ContextKey,
        operation_name: impl Into<Cow<'static, str>>,
        carrier: Option<&ContextCarrier>,
    ) -> SpanGuard<'_> {
        SpanGuard::new(self, self.create_entry_span(key, operation_name, carrier))
    }

    /// Like [`create_local_span`](Self::create_local_span), stopping the span
    /// when the guard drops.
    pub fn enter_local_span(
        &self,
        key: ContextKey,
        operation_name: impl Into<Cow<'static, str>>,
    ) -> SpanGuard<'_> {
        SpanGuard::new(self, self.create_local_span(key, operation_name))
    }

    /// Like [`create_exit_span`](Self::create_exit_span), stopping the span
    /// when the guard drops.
    pub fn enter_exit_span(
        &self,
        key: ContextKey,
        operation_name: impl Into<Cow<'static, str>>,
        peer: &str,
        carrier: Option<&mut ContextCarrier>,
    ) -> SpanGuard<'_> {
        SpanGuard::new(self, self.create_exit_span(key, operation_name, peer, carrier))
    }

    /// Captures `key` now and wraps `task` so that, wherever it runs, its
    /// work is recorded as a local span continuing this context.
    pub fn wrap<F, R>(
        self: &Arc<Self>,
        key: ContextKey,
        operation_name: impl Into<Cow<'static, str>>,
        task: F,
    ) -> TracedTask<F>
    where
        F: FnOnce() -> R,
    {
        TracedTask::new(self.clone(), self.capture(key), operation_name, task)
    }

    fn shard(&self, key: ContextKey) -> MutexGuard<'_, HashMap<ContextKey, TracingContext>> {
        self.shards[key.bucket(self.shards.len())]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn identity(&self) -> Identity<'_> {
        Identity {
            service: &self.config.service_name,
            service_instance: &self.config.service_instance,
        }
    }
}

/// Builder for [`ContextEngine`].
#[derive(Debug)]
pub struct ContextEngineBuilder {
    config: Option<AgentConfig>,
    id_generator: Option<Box<dyn IdGenerator>>,
    sink: Arc<dyn SegmentSink>,
    shards: usize,
}

impl ContextEngineBuilder {
    /// Use `config` instead of [`AgentConfig::default`].
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use `id_generator` instead of [`GlobalIdGenerator`].
    pub fn with_id_generator<T: IdGenerator + 'static>(mut self, id_generator: T) -> Self {
        self.id_generator = Some(Box::new(id_generator));
        self
    }

    pub(crate) fn with_boxed_id_generator(mut self, id_generator: Box<dyn IdGenerator>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    /// Number of independently locked context shards. The default is 64.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> ContextEngine {
        let config = self.config.unwrap_or_default();
        ContextEngine {
            shards: (0..self.shards).map(|_| Mutex::new(HashMap::new())).collect(),
            sampler: SamplingService::new(config.sample_n_per_3_secs.clone()),
            config,
            id_generator: self
                .id_generator
                .unwrap_or_else(|| Box::new(GlobalIdGenerator::default())),
            sink: self.sink,
            underflows: AtomicU64::new(0),
            sealed: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
        }
    }
}
