//! Bounded delivery of one batch: a reporter call under a timeout, retried
//! with exponential backoff and jitter, and cut off by the shutdown deadline.
use crate::export::{ReportError, ReportResult, SegmentReporter};
use crate::trace::Segment;
use futures_executor::block_on;
use futures_timer::Delay;
use futures_util::future::{self, Either, FutureExt};
use rand::Rng;
use sniffer::sniffer_warn;
use std::future::Future;
use std::mem;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

/// Configuration for retrying failed reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after a definite failure.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound of the delay between retries.
    pub max_delay: Duration,
    /// Maximum random delay added to each backoff.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1600),
            jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep before the next retry, given the current base delay.
    fn backoff(&self, base: Duration) -> Duration {
        (base + generate_jitter(self.jitter)).min(self.max_delay)
    }
}

fn generate_jitter(max_jitter: Duration) -> Duration {
    let max = u64::try_from(max_jitter.as_millis()).unwrap_or(u64::MAX);
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max))
}

/// The instant by which shutdown must be over. Set once; deliveries that
/// are already running when it is set are woken and stop at it.
#[derive(Debug, Default)]
pub(crate) struct ShutdownDeadline {
    at: OnceLock<Instant>,
    waiters: Mutex<Vec<Waker>>,
}

impl ShutdownDeadline {
    pub(crate) fn set(&self, at: Instant) {
        if self.at.set(at).is_err() {
            return;
        }
        let waiters = mem::take(&mut *self.waiters.lock().unwrap_or_else(PoisonError::into_inner));
        for waker in waiters {
            waker.wake();
        }
    }

    pub(crate) fn has_passed(&self) -> bool {
        self.at.get().is_some_and(|at| Instant::now() >= *at)
    }

    /// Resolves once the deadline is set and reached. Pending forever when
    /// it is never set.
    fn reached(&self) -> impl Future<Output = ()> + '_ {
        let published = future::poll_fn(move |cx| {
            if let Some(at) = self.at.get() {
                return Poll::Ready(*at);
            }
            let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
            // `set` publishes before it takes the lock
            if let Some(at) = self.at.get() {
                return Poll::Ready(*at);
            }
            // block_on reuses one waker per thread
            if !waiters.iter().any(|waker| waker.will_wake(cx.waker())) {
                waiters.push(cx.waker().clone());
            }
            Poll::Pending
        });
        async move {
            let at = published.await;
            Delay::new(at.saturating_duration_since(Instant::now())).await;
        }
    }
}

/// How a batch left the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// The reporter accepted the batch. `redelivered` is set when an attempt
    /// timed out before.
    Delivered { redelivered: bool },
    /// Retries ran out.
    Failed(ReportError),
    /// The shutdown deadline passed before the batch could be delivered.
    Abandoned,
}

fn timed_send(
    reporter: &dyn SegmentReporter,
    batch: &[Segment],
    timeout: Duration,
) -> impl Future<Output = ReportResult> + Unpin {
    future::select(reporter.send(batch), Box::pin(Delay::new(timeout))).map(move |raced| {
        match raced {
            Either::Left((result, _)) => result,
            Either::Right(_) => Err(ReportError::Timeout(timeout)),
        }
    })
}

/// Calls the reporter, giving up after `timeout`.
///
/// The returned future is dropped on timeout, so a reporter that does its
/// I/O inside the future stops there.
pub(crate) fn send_with_timeout(
    reporter: &dyn SegmentReporter,
    batch: &[Segment],
    timeout: Duration,
) -> ReportResult {
    block_on(timed_send(reporter, batch, timeout))
}

/// Delivers `batch`, retrying definite failures up to
/// `policy.max_retries` times and redelivering after a timeout at most once.
///
/// Attempts and backoff sleeps race the shutdown deadline, including the
/// ones already running when it is set. The batch is abandoned as soon as
/// the deadline is reached.
pub(crate) fn deliver(
    reporter: &dyn SegmentReporter,
    batch: &[Segment],
    policy: &RetryPolicy,
    reporter_timeout: Duration,
    shutdown: &ShutdownDeadline,
) -> Delivery {
    let mut retries = 0;
    let mut redelivered = false;
    let mut delay = policy.initial_delay;

    loop {
        if shutdown.has_passed() {
            return Delivery::Abandoned;
        }
        let attempt = future::select(
            timed_send(reporter, batch, reporter_timeout),
            Box::pin(shutdown.reached()),
        );
        let result = match block_on(attempt) {
            Either::Left((result, _)) => result,
            Either::Right(_) => return Delivery::Abandoned,
        };
        match result {
            Ok(()) => return Delivery::Delivered { redelivered },
            Err(err) if err.is_ambiguous() && !redelivered => {
                redelivered = true;
                sniffer_warn!(
                    name: "SegmentDispatcher.Redelivering",
                    segments = batch.len(),
                    reason = format!("{err}")
                );
            }
            Err(err) if !err.is_ambiguous() && retries < policy.max_retries => {
                retries += 1;
                sniffer_warn!(
                    name: "SegmentDispatcher.Retrying",
                    attempt = retries,
                    segments = batch.len(),
                    reason = format!("{err}")
                );
                let backoff = future::select(
                    Box::pin(Delay::new(policy.backoff(delay))),
                    Box::pin(shutdown.reached()),
                );
                if let Either::Right(_) = block_on(backoff) {
                    return Delivery::Abandoned;
                }
                delay = (delay * 2).min(policy.max_delay);
            }
            Err(err) => return Delivery::Failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::trace::{InMemoryReporter, InMemoryReporterBuilder};
    use rstest::rstest;
    use std::thread;

    fn quick_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: Duration::from_millis(1),
        }
    }

    fn no_shutdown() -> ShutdownDeadline {
        ShutdownDeadline::default()
    }

    fn shutdown_at(at: Instant) -> ShutdownDeadline {
        let shutdown = ShutdownDeadline::default();
        shutdown.set(at);
        shutdown
    }

    fn unavailable(n: usize) -> Vec<ReportError> {
        vec![ReportError::Unavailable("down".into()); n]
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            assert!(generate_jitter(Duration::from_millis(10)) <= Duration::from_millis(10));
        }
        assert_eq!(generate_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = quick_policy(1);
        assert!(policy.backoff(Duration::from_secs(1)) <= policy.max_delay);
    }

    #[test]
    fn first_attempt_success() {
        let reporter = InMemoryReporter::default();
        let outcome = deliver(&reporter, &[], &quick_policy(2), Duration::from_secs(5), &no_shutdown());
        assert_eq!(outcome, Delivery::Delivered { redelivered: false });
        assert_eq!(reporter.send_count(), 1);
    }

    #[rstest]
    #[case(1, 2, true)]
    #[case(2, 3, true)]
    #[case(3, 3, false)]
    fn definite_failures_are_retried(
        #[case] failures: usize,
        #[case] expected_calls: usize,
        #[case] delivered: bool,
    ) {
        let reporter = InMemoryReporterBuilder::new()
            .with_failures(unavailable(failures))
            .build();
        let outcome = deliver(&reporter, &[], &quick_policy(2), Duration::from_secs(5), &no_shutdown());
        assert_eq!(matches!(outcome, Delivery::Delivered { .. }), delivered);
        assert_eq!(reporter.send_count(), expected_calls);
    }

    #[test]
    fn a_timeout_is_redelivered_once() {
        let reporter = InMemoryReporterBuilder::new()
            .with_delays([Duration::from_secs(5)])
            .build();
        let outcome = deliver(
            &reporter,
            &[],
            &quick_policy(0),
            Duration::from_millis(20),
            &no_shutdown(),
        );
        assert_eq!(outcome, Delivery::Delivered { redelivered: true });
        assert_eq!(reporter.send_count(), 2);
        assert_eq!(reporter.batch_sizes(), vec![0]);
    }

    #[test]
    fn a_second_timeout_fails_the_batch() {
        let reporter = InMemoryReporterBuilder::new()
            .with_delays([Duration::from_secs(5), Duration::from_secs(5)])
            .build();
        let outcome = deliver(
            &reporter,
            &[],
            &quick_policy(5),
            Duration::from_millis(20),
            &no_shutdown(),
        );
        assert_eq!(outcome, Delivery::Failed(ReportError::Timeout(Duration::from_millis(20))));
        assert_eq!(reporter.send_count(), 2);
        assert!(reporter.batch_sizes().is_empty());
    }

    #[test]
    fn a_passed_deadline_abandons() {
        let reporter = InMemoryReporter::default();
        let outcome = deliver(
            &reporter,
            &[],
            &quick_policy(2),
            Duration::from_secs(5),
            &shutdown_at(Instant::now()),
        );
        assert_eq!(outcome, Delivery::Abandoned);
        assert_eq!(reporter.send_count(), 0);
    }

    #[test]
    fn an_attempt_cut_by_the_deadline_abandons() {
        let reporter = InMemoryReporterBuilder::new()
            .with_delays([Duration::from_secs(5)])
            .build();
        let outcome = deliver(
            &reporter,
            &[],
            &quick_policy(2),
            Duration::from_secs(5),
            &shutdown_at(Instant::now() + Duration::from_millis(20)),
        );
        assert_eq!(outcome, Delivery::Abandoned);
        assert_eq!(reporter.send_count(), 1);
    }

    #[test]
    fn a_deadline_set_during_an_attempt_abandons_it() {
        let reporter = InMemoryReporterBuilder::new()
            .with_delays([Duration::from_secs(10)])
            .build();
        let shutdown = no_shutdown();
        let started = Instant::now();
        let outcome = thread::scope(|scope| {
            let delivery = scope.spawn(|| {
                deliver(
                    &reporter,
                    &[],
                    &quick_policy(2),
                    Duration::from_secs(30),
                    &shutdown,
                )
            });
            thread::sleep(Duration::from_millis(50));
            shutdown.set(Instant::now() + Duration::from_millis(20));
            delivery.join().unwrap()
        });
        assert_eq!(outcome, Delivery::Abandoned);
        assert_eq!(reporter.send_count(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn a_deadline_interrupts_the_backoff() {
        let reporter = InMemoryReporterBuilder::new()
            .with_failures(unavailable(1))
            .build();
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            jitter: Duration::ZERO,
        };
        let started = Instant::now();
        let outcome = deliver(
            &reporter,
            &[],
            &policy,
            Duration::from_secs(5),
            &shutdown_at(Instant::now() + Duration::from_millis(50)),
        );
        assert_eq!(outcome, Delivery::Abandoned);
        assert_eq!(reporter.send_count(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn send_with_timeout_reports_the_timeout() {
        let reporter = InMemoryReporterBuilder::new()
            .with_delays([Duration::from_secs(5)])
            .build();
        let started = Instant::now();
        let result = send_with_timeout(&reporter, &[], Duration::from_millis(10));
        assert_eq!(result, Err(ReportError::Timeout(Duration::from_millis(10))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
