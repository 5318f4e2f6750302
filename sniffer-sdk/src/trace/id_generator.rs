//! Id Generator
#[cfg(any(test, feature = "testing"))]
pub use increment::IncrementIdGenerator;

use sniffer::{SegmentId, TraceId};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Interface for generating trace and segment ids.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new `TraceId`.
    fn new_trace_id(&self) -> TraceId;

    /// Generate a new `SegmentId`.
    fn new_segment_id(&self) -> SegmentId;
}

/// Default [`IdGenerator`] implementation.
///
/// Ids have the form `{instance}.{thread}.{millis * 10000 + sequence}`: a
/// random per-generator prefix, a per-thread number and a per-thread
/// sequence, so no coordination between threads is needed.
#[derive(Clone, Debug)]
pub struct GlobalIdGenerator {
    instance: Arc<str>,
}

impl Default for GlobalIdGenerator {
    fn default() -> Self {
        GlobalIdGenerator {
            instance: Arc::from(uuid::Uuid::new_v4().simple().to_string()),
        }
    }
}

impl GlobalIdGenerator {
    fn next_id(&self) -> String {
        THREAD_ID_STATE.with(|state| {
            let mut state = state.borrow_mut();
            let sequence = state.next_sequence(now_millis());
            format!("{}.{}.{}", self.instance, state.thread, sequence)
        })
    }
}

impl IdGenerator for GlobalIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        TraceId::from(self.next_id())
    }

    fn new_segment_id(&self) -> SegmentId {
        SegmentId::from(self.next_id())
    }
}

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

struct IdState {
    thread: u64,
    last_millis: u64,
    sequence: u64,
}

impl IdState {
    fn next_sequence(&mut self, now: u64) -> u64 {
        // a clock that moved backwards keeps the last timestamp
        self.last_millis = self.last_millis.max(now);
        self.sequence = (self.sequence + 1) % 10_000;
        self.last_millis * 10_000 + self.sequence
    }
}

thread_local! {
    static THREAD_ID_STATE: RefCell<IdState> = RefCell::new(IdState {
        thread: NEXT_THREAD.fetch_add(1, Ordering::Relaxed),
        last_millis: 0,
        sequence: 0,
    });
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(any(test, feature = "testing"))]
mod increment {
    use super::IdGenerator;
    use sniffer::{SegmentId, TraceId};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// [`IdGenerator`] implementation that increments a counter for each new
    /// id, producing `trace-1`, `segment-2` and so on. Helps write
    /// predictable tests.
    #[derive(Clone, Debug)]
    pub struct IncrementIdGenerator(Arc<AtomicU64>);

    impl IncrementIdGenerator {
        /// Create a new [`IncrementIdGenerator`]
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Default for IncrementIdGenerator {
        fn default() -> Self {
            Self(Arc::new(AtomicU64::new(1)))
        }
    }

    impl IdGenerator for IncrementIdGenerator {
        fn new_trace_id(&self) -> TraceId {
            TraceId::from(format!("trace-{}", self.0.fetch_add(1, Ordering::SeqCst)))
        }

        fn new_segment_id(&self) -> SegmentId {
            SegmentId::from(format!("segment-{}", self.0.fetch_add(1, Ordering::SeqCst)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_across_threads() {
        let generator = GlobalIdGenerator::default();
        let handles = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    (0..1000)
                        .map(|_| generator.new_segment_id())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn id_has_three_parts() {
        let id = GlobalIdGenerator::default().new_trace_id();
        assert_eq!(id.as_str().split('.').count(), 3);
    }

    #[test]
    fn increment_generator_is_predictable() {
        let generator = IncrementIdGenerator::new();
        assert_eq!(generator.new_trace_id().as_str(), "trace-1");
        assert_eq!(generator.new_segment_id().as_str(), "segment-2");
    }
}
