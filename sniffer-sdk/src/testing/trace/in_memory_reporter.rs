use crate::export::{ReportError, ReportResult, SegmentReporter};
use crate::trace::Segment;
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// A [`SegmentReporter`] that stores delivered batches in memory.
///
/// Failures and delays can be scripted per call, in order, to exercise the
/// dispatcher's retry and timeout handling. A batch is stored only when its
/// call completes successfully; a call that is abandoned by a timeout stores
/// nothing.
#[derive(Clone, Debug)]
pub struct InMemoryReporter {
    batches: Arc<Mutex<Vec<Vec<Segment>>>>,
    failures: Arc<Mutex<VecDeque<ReportError>>>,
    delays: Arc<Mutex<VecDeque<Duration>>>,
    calls: Arc<AtomicUsize>,
    is_shutdown: Arc<AtomicBool>,
}

impl Default for InMemoryReporter {
    fn default() -> Self {
        InMemoryReporterBuilder::new().build()
    }
}

/// Builder for [`InMemoryReporter`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryReporterBuilder {
    failures: VecDeque<ReportError>,
    delays: VecDeque<Duration>,
}

impl InMemoryReporterBuilder {
    /// Creates a new instance of the `InMemoryReporterBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// The first calls fail with these errors, one per call.
    pub fn with_failures(mut self, failures: impl IntoIterator<Item = ReportError>) -> Self {
        self.failures.extend(failures);
        self
    }

    /// The first calls wait for these durations, one per call, before
    /// answering.
    pub fn with_delays(mut self, delays: impl IntoIterator<Item = Duration>) -> Self {
        self.delays.extend(delays);
        self
    }

    /// Creates a new instance of the `InMemoryReporter`.
    pub fn build(self) -> InMemoryReporter {
        InMemoryReporter {
            batches: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(self.failures)),
            delays: Arc::new(Mutex::new(self.delays)),
            calls: Arc::new(AtomicUsize::new(0)),
            is_shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl InMemoryReporter {
    /// Every successfully delivered segment, in delivery order.
    pub fn get_reported_segments(&self) -> Vec<Segment> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Sizes of the successfully delivered batches.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Vec::len)
            .collect()
    }

    /// Number of `send` calls, successful or not.
    pub fn send_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether `shutdown` was called.
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Clears stored batches.
    pub fn reset(&self) {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl SegmentReporter for InMemoryReporter {
    fn send(&self, batch: &[Segment]) -> BoxFuture<'static, ReportResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let delay = self
            .delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let batches = self.batches.clone();
        let batch = batch.to_vec();

        Box::pin(async move {
            if let Some(delay) = delay {
                futures_timer::Delay::new(delay).await;
            }
            if let Some(failure) = failure {
                return Err(failure);
            }
            batches
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(batch);
            Ok(())
        })
    }

    fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::SeqCst);
    }
}
