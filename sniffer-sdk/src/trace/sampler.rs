use crate::config::ConfigCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SAMPLE_WINDOW: Duration = Duration::from_secs(3);

/// Decides whether a new trace is recorded.
///
/// At most `n` traces started locally are recorded per 3 second window,
/// where `n` is read from a live [`ConfigCell`] at every decision. Zero or a
/// negative `n` records everything. Traces continued from a sampled carrier
/// are always recorded and count against the window.
#[derive(Debug)]
pub(crate) struct SamplingService {
    samples_per_window: Arc<ConfigCell<i32>>,
    window: Duration,
    epoch: Instant,
    // window index in the high half, traces counted in it in the low half,
    // so a window roll and a count can never interleave
    state: AtomicU64,
}

impl SamplingService {
    pub(crate) fn new(samples_per_window: Arc<ConfigCell<i32>>) -> Self {
        SamplingService::with_window(samples_per_window, SAMPLE_WINDOW)
    }

    pub(crate) fn with_window(samples_per_window: Arc<ConfigCell<i32>>, window: Duration) -> Self {
        SamplingService {
            samples_per_window,
            window,
            epoch: Instant::now(),
            state: AtomicU64::new(0),
        }
    }

    /// Whether a trace started locally should be recorded.
    pub(crate) fn try_sample(&self) -> bool {
        let limit = self.samples_per_window.current_value();
        if limit <= 0 {
            return true;
        }
        self.count(Some(limit as u32))
    }

    /// Counts a trace whose sampling was decided upstream.
    pub(crate) fn force_sampled(&self) {
        if self.samples_per_window.current_value() > 0 {
            self.count(None);
        }
    }

    /// Adds one trace to the current window unless it already holds `limit`.
    fn count(&self, limit: Option<u32>) -> bool {
        let now = self.current_window();
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let window = (state >> 32).max(now);
            let counted = if window == state >> 32 {
                state & u64::from(u32::MAX)
            } else {
                0
            };
            if limit.is_some_and(|limit| counted >= u64::from(limit)) {
                return false;
            }
            let next = (window << 32) | (counted + 1).min(u64::from(u32::MAX));
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    fn current_window(&self) -> u64 {
        let window_ms = (self.window.as_millis() as u64).max(1);
        (self.epoch.elapsed().as_millis() as u64 / window_ms) & u64::from(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_rate_samples_everything() {
        let sampler = SamplingService::new(Arc::new(ConfigCell::new(0)));
        assert!((0..10_000).all(|_| sampler.try_sample()));
    }

    #[test]
    fn rate_caps_each_window() {
        let sampler = SamplingService::new(Arc::new(ConfigCell::new(3)));
        let sampled = (0..10).filter(|_| sampler.try_sample()).count();
        assert_eq!(sampled, 3);
    }

    #[test]
    fn forced_samples_use_up_the_window() {
        let sampler = SamplingService::new(Arc::new(ConfigCell::new(2)));
        sampler.force_sampled();
        sampler.force_sampled();
        assert!(!sampler.try_sample());
    }

    #[test]
    fn window_resets() {
        let sampler =
            SamplingService::with_window(Arc::new(ConfigCell::new(1)), Duration::from_millis(20));
        assert!(sampler.try_sample());
        assert!(!sampler.try_sample());
        std::thread::sleep(Duration::from_millis(40));
        assert!(sampler.try_sample());
    }

    #[test]
    fn concurrent_decisions_never_exceed_the_rate() {
        let sampler = Arc::new(SamplingService::new(Arc::new(ConfigCell::new(50))));
        let handles = (0..8)
            .map(|_| {
                let sampler = sampler.clone();
                std::thread::spawn(move || (0..1_000).filter(|_| sampler.try_sample()).count())
            })
            .collect::<Vec<_>>();
        let sampled: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(sampled, 50);
    }

    #[test]
    fn rate_changes_apply_immediately() {
        let rate = Arc::new(ConfigCell::new(1));
        let sampler = SamplingService::new(rate.clone());
        assert!(sampler.try_sample());
        assert!(!sampler.try_sample());
        rate.update(-1);
        assert!(sampler.try_sample());
    }
}
