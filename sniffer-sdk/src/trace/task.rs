use super::{ContextEngine, ContextKey, ContextSnapshot};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// A unit of work that carries the context it was created in.
///
/// Created with [`ContextEngine::wrap`] on the submitting thread. When run,
/// the work is recorded as a local span linked to the captured span, and the
/// span is stopped even if the work panics.
///
/// # Examples
///
/// ```
/// use sniffer_sdk::trace::{ContextEngine, ContextKey, NoopSegmentSink};
/// use std::sync::Arc;
///
/// let engine = Arc::new(ContextEngine::builder(Arc::new(NoopSegmentSink)).build());
/// let key = ContextKey::current_thread();
///
/// let _request = engine.enter_entry_span(key, "GET /report", None);
/// let task = engine.wrap(key, "render", || 6 * 7);
///
/// let answer = std::thread::spawn(move || task.run_on_current_thread())
///     .join()
///     .unwrap();
/// assert_eq!(answer, 42);
/// ```
pub struct TracedTask<F> {
    engine: Arc<ContextEngine>,
    snapshot: ContextSnapshot,
    operation_name: Cow<'static, str>,
    task: F,
}

impl<F> fmt::Debug for TracedTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedTask")
            .field("snapshot", &self.snapshot)
            .field("operation_name", &self.operation_name)
            .finish()
    }
}

impl<F, R> TracedTask<F>
where
    F: FnOnce() -> R,
{
    /// Wraps `task` with an already captured snapshot.
    pub fn new(
        engine: Arc<ContextEngine>,
        snapshot: ContextSnapshot,
        operation_name: impl Into<Cow<'static, str>>,
        task: F,
    ) -> Self {
        TracedTask {
            engine,
            snapshot,
            operation_name: operation_name.into(),
            task,
        }
    }

    /// Snapshot the task continues.
    pub fn snapshot(&self) -> &ContextSnapshot {
        &self.snapshot
    }

    /// Runs the task in the context `key`.
    ///
    /// With an empty snapshot, captured where nothing was recorded, the task
    /// runs untraced.
    pub fn run(self, key: ContextKey) -> R {
        if !self.snapshot.is_valid() {
            return (self.task)();
        }
        let _span = self.engine.enter_local_span(key, self.operation_name);
        self.engine.continued(key, &self.snapshot);
        (self.task)()
    }

    /// Runs the task in the context of the calling thread.
    pub fn run_on_current_thread(self) -> R {
        self.run(ContextKey::current_thread())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::AgentConfig;
    use crate::testing::trace::InMemorySegmentSink;
    use crate::trace::{ContextEngine, ContextKey, RefType};
    use std::sync::Arc;

    fn engine() -> (Arc<ContextEngine>, InMemorySegmentSink) {
        let sink = InMemorySegmentSink::default();
        let engine = ContextEngine::builder(Arc::new(sink.clone()))
            .with_config(AgentConfig::builder().with_sample_n_per_3_secs(-1).build())
            .build();
        (Arc::new(engine), sink)
    }

    #[test]
    fn task_joins_the_submitting_trace() {
        let (engine, sink) = engine();
        let submitter = ContextKey::new(1);
        engine.create_entry_span(submitter, "GET /jobs", None);
        let task = engine.wrap(submitter, "job", || "done");

        let worker = ContextKey::new(2);
        assert_eq!(task.run(worker), "done");
        engine.stop_span(submitter);

        let segments = sink.finished_segments();
        assert_eq!(segments.len(), 2);
        let (job, request) = (&segments[0], &segments[1]);
        assert_eq!(job.spans[0].operation_name, "job");
        assert_eq!(job.trace_id, request.trace_id);
        assert_eq!(job.refs[0].ref_type, RefType::CrossThread);
        assert_eq!(job.refs[0].parent_endpoint, "GET /jobs");
    }

    #[test]
    fn empty_snapshot_runs_untraced() {
        let (engine, sink) = engine();
        let task = engine.wrap(ContextKey::new(3), "job", || 1);
        assert!(!task.snapshot().is_valid());
        assert_eq!(task.run(ContextKey::new(4)), 1);
        assert!(sink.finished_segments().is_empty());
    }

    #[test]
    fn panicking_task_still_seals_its_segment() {
        let (engine, sink) = engine();
        let submitter = ContextKey::new(5);
        engine.create_local_span(submitter, "submit");
        let task = engine.wrap(submitter, "job", || -> u8 { panic!("job failed") });

        let worker = ContextKey::new(6);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run(worker)));
        assert!(result.is_err());
        assert!(!engine.is_active(worker));
        assert_eq!(sink.finished_segments().len(), 1);
        engine.stop_span(submitter);
    }
}
