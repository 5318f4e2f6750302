//! # Segment dispatcher
//!
//! A fixed pool of named worker threads moves segments from the
//! [`SegmentBuffer`] to a [`SegmentReporter`]. With `n` workers, worker `i`
//! owns every partition `p` where `p % n == i`, so no two workers ever poll
//! the same partition.
//!
//! Each worker accumulates a batch until it holds `max_batch_size` segments
//! or `scheduled_delay` has passed since its first segment, then reports it
//! under `reporter_timeout`. Definite failures are retried following the
//! [`RetryPolicy`]; a timed out batch is sent once more at most; a batch that
//! still fails is dropped and counted.
mod retry;
mod worker;

pub use retry::RetryPolicy;

use crate::buffer::SegmentBuffer;
use crate::error::{SdkError, SdkResult};
use crate::export::SegmentReporter;
use sniffer::{sniffer_debug, sniffer_info, sniffer_warn};
use std::env;
use std::mem;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use retry::ShutdownDeadline;
use worker::{Control, Counters, Shared, Worker};

/// Number of worker threads.
pub(crate) const SW_DISPATCHER_CONSUMERS: &str = "SW_DISPATCHER_CONSUMERS";
/// Default number of worker threads.
pub(crate) const SW_DISPATCHER_CONSUMERS_DEFAULT: usize = 1;
/// Segments per reported batch.
pub(crate) const SW_DISPATCHER_MAX_BATCH_SIZE: &str = "SW_DISPATCHER_MAX_BATCH_SIZE";
/// Default batch size.
pub(crate) const SW_DISPATCHER_MAX_BATCH_SIZE_DEFAULT: usize = 512;
/// Milliseconds a batch may wait for more segments before it is reported.
pub(crate) const SW_DISPATCHER_SCHEDULED_DELAY: &str = "SW_DISPATCHER_SCHEDULED_DELAY";
/// Default scheduled delay.
pub(crate) const SW_DISPATCHER_SCHEDULED_DELAY_DEFAULT: u64 = 20;
/// Milliseconds an idle worker parks before polling again.
pub(crate) const SW_DISPATCHER_POLL_WAIT: &str = "SW_DISPATCHER_POLL_WAIT";
/// Default poll wait.
pub(crate) const SW_DISPATCHER_POLL_WAIT_DEFAULT: u64 = 50;
/// Milliseconds one reporter call may take.
pub(crate) const SW_REPORTER_TIMEOUT: &str = "SW_REPORTER_TIMEOUT";
/// Default reporter timeout.
pub(crate) const SW_REPORTER_TIMEOUT_DEFAULT: u64 = 30_000;
/// Retries after a definite reporter failure.
pub(crate) const SW_REPORTER_MAX_RETRIES: &str = "SW_REPORTER_MAX_RETRIES";
/// Default retries.
pub(crate) const SW_REPORTER_MAX_RETRIES_DEFAULT: usize = 2;
/// Milliseconds shutdown waits for the buffer to drain.
pub(crate) const SW_SHUTDOWN_TIMEOUT: &str = "SW_SHUTDOWN_TIMEOUT";
/// Default shutdown timeout.
pub(crate) const SW_SHUTDOWN_TIMEOUT_DEFAULT: u64 = 5_000;

const WORKER_EXIT_GRACE: Duration = Duration::from_millis(50);

/// Dispatcher configuration.
/// Use [`DispatcherConfigBuilder`] to configure your own instance.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of worker threads, clamped to the number of partitions when
    /// the dispatcher starts.
    pub(crate) consumers: usize,

    /// Maximum number of segments in one reported batch.
    pub(crate) max_batch_size: usize,

    /// Longest time a started batch waits for more segments.
    pub(crate) scheduled_delay: Duration,

    /// Longest time an idle worker parks on a partition.
    pub(crate) poll_wait: Duration,

    /// Time budget of one reporter call.
    pub(crate) reporter_timeout: Duration,

    pub(crate) retry: RetryPolicy,

    /// Grace period for draining on shutdown, also used as the flush
    /// timeout.
    pub(crate) shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfigBuilder::default().build()
    }
}

impl DispatcherConfig {
    /// Number of worker threads requested.
    pub fn consumers(&self) -> usize {
        self.consumers
    }

    /// Maximum number of segments in one reported batch.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

/// A builder for creating [`DispatcherConfig`] instances.
#[derive(Debug)]
pub struct DispatcherConfigBuilder {
    consumers: usize,
    max_batch_size: usize,
    scheduled_delay: Duration,
    poll_wait: Duration,
    reporter_timeout: Duration,
    retry: RetryPolicy,
    shutdown_timeout: Duration,
}

impl Default for DispatcherConfigBuilder {
    /// Create a new [`DispatcherConfigBuilder`] with default values,
    /// overridden by environment variables when set:
    /// * `SW_DISPATCHER_CONSUMERS`
    /// * `SW_DISPATCHER_MAX_BATCH_SIZE`
    /// * `SW_DISPATCHER_SCHEDULED_DELAY`
    /// * `SW_DISPATCHER_POLL_WAIT`
    /// * `SW_REPORTER_TIMEOUT`
    /// * `SW_REPORTER_MAX_RETRIES`
    /// * `SW_SHUTDOWN_TIMEOUT`
    fn default() -> Self {
        DispatcherConfigBuilder {
            consumers: SW_DISPATCHER_CONSUMERS_DEFAULT,
            max_batch_size: SW_DISPATCHER_MAX_BATCH_SIZE_DEFAULT,
            scheduled_delay: Duration::from_millis(SW_DISPATCHER_SCHEDULED_DELAY_DEFAULT),
            poll_wait: Duration::from_millis(SW_DISPATCHER_POLL_WAIT_DEFAULT),
            reporter_timeout: Duration::from_millis(SW_REPORTER_TIMEOUT_DEFAULT),
            retry: RetryPolicy {
                max_retries: SW_REPORTER_MAX_RETRIES_DEFAULT,
                ..RetryPolicy::default()
            },
            shutdown_timeout: Duration::from_millis(SW_SHUTDOWN_TIMEOUT_DEFAULT),
        }
        .init_from_env_vars()
    }
}

impl DispatcherConfigBuilder {
    /// Set the number of worker threads. The default is 1.
    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers;
        self
    }

    /// Set the maximum number of segments in one batch. The default is 512.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Set how long a started batch waits for more segments. The default is
    /// 20 milliseconds.
    pub fn with_scheduled_delay(mut self, scheduled_delay: Duration) -> Self {
        self.scheduled_delay = scheduled_delay;
        self
    }

    /// Set how long an idle worker parks before polling again. The default
    /// is 50 milliseconds.
    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    /// Set the time budget of one reporter call. The default is 30 seconds.
    pub fn with_reporter_timeout(mut self, reporter_timeout: Duration) -> Self {
        self.reporter_timeout = reporter_timeout;
        self
    }

    /// Set the retry policy for failed reports.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the grace period for draining on shutdown. The default is 5
    /// seconds.
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Builds a `DispatcherConfig` enforcing the following invariants:
    /// * at least one consumer,
    /// * a batch size of at least one,
    /// * a poll wait of at least one millisecond.
    pub fn build(self) -> DispatcherConfig {
        DispatcherConfig {
            consumers: self.consumers.max(1),
            max_batch_size: self.max_batch_size.max(1),
            scheduled_delay: self.scheduled_delay,
            poll_wait: self.poll_wait.max(Duration::from_millis(1)),
            reporter_timeout: self.reporter_timeout,
            retry: self.retry,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(consumers) = env::var(SW_DISPATCHER_CONSUMERS)
            .ok()
            .and_then(|consumers| usize::from_str(&consumers).ok())
        {
            self.consumers = consumers;
        }

        if let Some(max_batch_size) = env::var(SW_DISPATCHER_MAX_BATCH_SIZE)
            .ok()
            .and_then(|batch_size| usize::from_str(&batch_size).ok())
        {
            self.max_batch_size = max_batch_size;
        }

        if let Some(scheduled_delay) = env::var(SW_DISPATCHER_SCHEDULED_DELAY)
            .ok()
            .and_then(|delay| u64::from_str(&delay).ok())
        {
            self.scheduled_delay = Duration::from_millis(scheduled_delay);
        }

        if let Some(poll_wait) = env::var(SW_DISPATCHER_POLL_WAIT)
            .ok()
            .and_then(|wait| u64::from_str(&wait).ok())
        {
            self.poll_wait = Duration::from_millis(poll_wait);
        }

        if let Some(timeout) = env::var(SW_REPORTER_TIMEOUT)
            .ok()
            .and_then(|timeout| u64::from_str(&timeout).ok())
        {
            self.reporter_timeout = Duration::from_millis(timeout);
        }

        if let Some(max_retries) = env::var(SW_REPORTER_MAX_RETRIES)
            .ok()
            .and_then(|retries| usize::from_str(&retries).ok())
        {
            self.retry.max_retries = max_retries;
        }

        if let Some(timeout) = env::var(SW_SHUTDOWN_TIMEOUT)
            .ok()
            .and_then(|timeout| u64::from_str(&timeout).ok())
        {
            self.shutdown_timeout = Duration::from_millis(timeout);
        }

        self
    }
}

/// Counters of a [`SegmentDispatcher`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Segments accepted by the reporter.
    pub delivered_segments: u64,
    /// Batches accepted by the reporter.
    pub delivered_batches: u64,
    /// Batches dropped after exhausting retries.
    pub failed_batches: u64,
    /// Segments in those batches.
    pub failed_segments: u64,
    /// Delivered batches that were sent a second time after a timeout.
    pub redelivered_batches: u64,
    /// Segments still undelivered when the shutdown grace period ran out.
    pub discarded_on_shutdown: u64,
}

/// Moves sealed segments from a [`SegmentBuffer`] to a [`SegmentReporter`].
#[derive(Debug)]
pub struct SegmentDispatcher {
    shared: Arc<Shared>,
    controls: Vec<Sender<Control>>,
    done: Mutex<Receiver<usize>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    is_shutdown: AtomicBool,
}

impl SegmentDispatcher {
    /// Starts the worker pool.
    pub fn start(
        buffer: Arc<SegmentBuffer>,
        reporter: Arc<dyn SegmentReporter>,
        config: DispatcherConfig,
    ) -> SdkResult<Self> {
        let partitions = buffer.partitions().len();
        let workers = config.consumers.clamp(1, partitions.max(1));
        let shared = Arc::new(Shared {
            buffer,
            reporter,
            config,
            counters: Counters::default(),
            stopping: AtomicBool::new(false),
            shutdown: ShutdownDeadline::default(),
        });

        let (done_sender, done_receiver) = mpsc::channel();
        let mut controls = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (control_sender, control_receiver) = mpsc::channel();
            let worker = Worker {
                partitions: (index..partitions).step_by(workers).collect(),
                shared: shared.clone(),
                control: control_receiver,
                done: done_sender.clone(),
                index,
            };
            let spawned = thread::Builder::new()
                .name(format!("sniffer-dispatcher-{index}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => {
                    controls.push(control_sender);
                    handles.push(handle);
                }
                Err(err) => {
                    shared.stopping.store(true, Ordering::Release);
                    return Err(SdkError::InternalFailure(format!(
                        "failed to spawn dispatcher worker: {err}"
                    )));
                }
            }
        }

        sniffer_debug!(
            name: "SegmentDispatcher.Started",
            workers = workers,
            partitions = partitions
        );

        Ok(SegmentDispatcher {
            shared,
            controls,
            done: Mutex::new(done_receiver),
            handles: Mutex::new(handles),
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.controls.len()
    }

    /// Current counters.
    pub fn stats(&self) -> DispatcherStats {
        let counters = &self.shared.counters;
        DispatcherStats {
            delivered_segments: counters.delivered_segments.load(Ordering::Relaxed),
            delivered_batches: counters.delivered_batches.load(Ordering::Relaxed),
            failed_batches: counters.failed_batches.load(Ordering::Relaxed),
            failed_segments: counters.failed_segments.load(Ordering::Relaxed),
            redelivered_batches: counters.redelivered_batches.load(Ordering::Relaxed),
            discarded_on_shutdown: counters.discarded_on_shutdown.load(Ordering::Relaxed),
        }
    }

    /// Delivers every segment buffered at the time of the call, including
    /// batches the workers are still accumulating.
    ///
    /// Fails with [`SdkError::DeliveryFailed`] when some batches were
    /// dropped after exhausting retries.
    pub fn force_flush(&self) -> SdkResult {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(SdkError::AlreadyShutdown);
        }
        let timeout = self.shared.config.shutdown_timeout;
        let deadline = Instant::now() + timeout;

        let mut replies = Vec::with_capacity(self.controls.len());
        for control in &self.controls {
            let (reply_sender, reply_receiver) = mpsc::sync_channel(1);
            control
                .send(Control::Flush(reply_sender))
                .map_err(|_| SdkError::InternalFailure("dispatcher worker is gone".into()))?;
            replies.push(reply_receiver);
        }
        self.wake_workers();

        let mut failed = 0;
        for reply in replies {
            let remaining = deadline.saturating_duration_since(Instant::now());
            failed += reply
                .recv_timeout(remaining)
                .map_err(|_| SdkError::Timeout(timeout))?;
        }
        if failed > 0 {
            return Err(SdkError::DeliveryFailed(failed));
        }
        Ok(())
    }

    /// Stops the workers after they drained the buffer, waiting at most the
    /// shutdown timeout. Deliveries still running when it expires are
    /// abandoned; their segments and everything left in the buffer are
    /// discarded and counted in [`DispatcherStats::discarded_on_shutdown`].
    ///
    /// The reporter is shut down in every case. Fails with
    /// [`SdkError::Timeout`] when a worker did not stop in time, which only
    /// happens when the reporter blocks outside its returned future.
    ///
    /// The buffer rejects offers from this point on.
    pub fn shutdown(&self) -> SdkResult {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return Err(SdkError::AlreadyShutdown);
        }
        let timeout = self.shared.config.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        self.shared.shutdown.set(deadline);
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.buffer.close();

        // Workers cut their last delivery at the deadline; give them a moment
        // to report back.
        let acknowledged_by = deadline + WORKER_EXIT_GRACE;
        let done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        let mut finished = vec![false; self.controls.len()];
        let mut unfinished = self.controls.len();
        while unfinished > 0 {
            let remaining = acknowledged_by.saturating_duration_since(Instant::now());
            match done.recv_timeout(remaining) {
                Ok(index) => {
                    finished[index] = true;
                    unfinished -= 1;
                }
                Err(_) => break,
            }
        }
        drop(done);

        let mut result = Ok(());
        if unfinished > 0 {
            sniffer_warn!(
                name: "SegmentDispatcher.ShutdownTimedOut",
                unfinished_workers = unfinished,
                timeout_ms = timeout.as_millis() as u64
            );
            result = Err(SdkError::Timeout(timeout));
        }

        // Workers that did not answer are left detached.
        let handles = mem::take(&mut *self.handles.lock()?);
        for (index, handle) in handles.into_iter().enumerate() {
            if finished[index] {
                let _ = handle.join();
            }
        }

        // Whatever the workers left behind, including segments a producer
        // parked before the buffer closed slipped in after they exited.
        let late = self
            .shared
            .discard(0..self.shared.buffer.partitions().len());
        self.shared
            .counters
            .discarded_on_shutdown
            .fetch_add(late, Ordering::Relaxed);

        self.shared.reporter.shutdown();

        let stats = self.stats();
        sniffer_info!(
            name: "SegmentDispatcher.Shutdown",
            delivered_segments = stats.delivered_segments,
            failed_segments = stats.failed_segments,
            discarded_on_shutdown = stats.discarded_on_shutdown,
            dropped_by_buffer = self.shared.buffer.dropped_count()
        );
        result
    }

    fn wake_workers(&self) {
        for partition in self.shared.buffer.partitions() {
            partition.wake_all();
        }
    }
}

impl Drop for SegmentDispatcher {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::Relaxed) {
            let _ = self.shutdown();
        }
    }
}
