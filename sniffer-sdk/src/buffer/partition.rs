use crate::trace::Segment;
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// One bounded FIFO lane of the [`SegmentBuffer`](super::SegmentBuffer).
///
/// Offers and polls go through a lock-free ring. The mutex and condition
/// variables are only touched by a side that has to wait, and by the other
/// side when it sees a waiter.
pub struct Partition {
    queue: ArrayQueue<Segment>,
    lock: Mutex<()>,
    not_empty: Condvar,
    not_full: Condvar,
    waiting_consumers: AtomicUsize,
    waiting_producers: AtomicUsize,
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("len", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}

impl Partition {
    /// Create a partition holding at most `capacity` segments. A capacity
    /// of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        Partition {
            queue: ArrayQueue::new(capacity.max(1)),
            lock: Mutex::new(()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            waiting_consumers: AtomicUsize::new(0),
            waiting_producers: AtomicUsize::new(0),
        }
    }

    /// Appends `segment` without blocking. Returns `false` when full.
    pub fn offer(&self, segment: Segment) -> bool {
        self.try_offer(segment).is_ok()
    }

    /// Appends `segment` without blocking, handing it back when full.
    pub(crate) fn try_offer(&self, segment: Segment) -> Result<(), Segment> {
        self.queue.push(segment)?;
        self.wake(&self.waiting_consumers, &self.not_empty);
        Ok(())
    }

    /// Appends `segment`, waiting up to `timeout` for space.
    pub(crate) fn offer_timeout(&self, segment: Segment, timeout: Duration) -> Result<(), Segment> {
        let mut segment = match self.try_offer(segment) {
            Ok(()) => return Ok(()),
            Err(segment) => segment,
        };

        let deadline = Instant::now() + timeout;
        let mut guard = self.park();
        self.waiting_producers.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let result = loop {
            match self.queue.push(segment) {
                Ok(()) => break Ok(()),
                Err(rejected) => segment = rejected,
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(segment);
            }
            guard = self
                .not_full
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        self.waiting_producers.fetch_sub(1, Ordering::SeqCst);
        drop(guard);

        if result.is_ok() {
            self.wake(&self.waiting_consumers, &self.not_empty);
        }
        result
    }

    /// Appends `segment`, evicting the oldest queued segment when full.
    /// Returns the evicted segment.
    pub(crate) fn force_offer(&self, segment: Segment) -> Option<Segment> {
        let evicted = self.queue.force_push(segment);
        self.wake(&self.waiting_consumers, &self.not_empty);
        evicted
    }

    /// Takes up to `max` segments in FIFO order, waiting up to `max_wait`
    /// while the partition is empty.
    pub fn poll_batch(&self, max: usize, max_wait: Duration) -> Vec<Segment> {
        let mut batch = Vec::new();
        if max > 0 && self.drain_into(&mut batch, max) == 0 {
            self.wait_for_segment(max_wait);
            self.drain_into(&mut batch, max);
        }
        batch
    }

    /// Moves up to `max - batch.len()` queued segments into `batch` without
    /// waiting. Returns how many were moved.
    pub(crate) fn drain_into(&self, batch: &mut Vec<Segment>, max: usize) -> usize {
        let before = batch.len();
        while batch.len() < max {
            match self.queue.pop() {
                Some(segment) => batch.push(segment),
                None => break,
            }
        }
        let moved = batch.len() - before;
        if moved > 0 {
            self.wake(&self.waiting_producers, &self.not_full);
        }
        moved
    }

    /// Waits up to `max_wait` for the partition to become non-empty.
    pub(crate) fn wait_for_segment(&self, max_wait: Duration) {
        if max_wait.is_zero() || !self.queue.is_empty() {
            return;
        }
        let deadline = Instant::now() + max_wait;
        let mut guard = self.park();
        self.waiting_consumers.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        loop {
            if !self.queue.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = self
                .not_empty
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        self.waiting_consumers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wakes every waiter, used on shutdown.
    pub(crate) fn wake_all(&self) {
        let _guard = self.park();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Number of queued segments.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no segment is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of queued segments.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    fn park(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self, waiters: &AtomicUsize, condvar: &Condvar) {
        // pairs with the fence taken by a waiter after registering
        fence(Ordering::SeqCst);
        if waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.park();
            condvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sniffer::{SegmentId, TraceId};
    use std::sync::Arc;
    use std::thread;

    fn segment(id: &str) -> Segment {
        Segment {
            trace_id: TraceId::from("t"),
            segment_id: SegmentId::from(id),
            service: Arc::from("svc"),
            service_instance: Arc::from("svc-1"),
            spans: Vec::new(),
            refs: Vec::new(),
            size_limited: false,
        }
    }

    fn ids(batch: &[Segment]) -> Vec<&str> {
        batch.iter().map(|s| s.segment_id.as_str()).collect()
    }

    #[test]
    fn offer_fails_when_full() {
        let partition = Partition::new(2);
        assert!(partition.offer(segment("a")));
        assert!(partition.offer(segment("b")));
        assert!(!partition.offer(segment("c")));
        assert_eq!(partition.len(), 2);
    }

    #[test]
    fn poll_batch_is_fifo_and_bounded() {
        let partition = Partition::new(8);
        for id in ["a", "b", "c"] {
            partition.offer(segment(id));
        }
        let batch = partition.poll_batch(2, Duration::ZERO);
        assert_eq!(ids(&batch), vec!["a", "b"]);
        assert_eq!(ids(&partition.poll_batch(10, Duration::ZERO)), vec!["c"]);
        assert!(partition.poll_batch(0, Duration::ZERO).is_empty());
    }

    #[test]
    fn poll_batch_gives_up_after_max_wait() {
        let partition = Partition::new(1);
        let started = Instant::now();
        assert!(partition
            .poll_batch(1, Duration::from_millis(30))
            .is_empty());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn poll_batch_wakes_on_offer() {
        let partition = Arc::new(Partition::new(1));
        let consumer = {
            let partition = partition.clone();
            thread::spawn(move || partition.poll_batch(1, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        assert!(partition.offer(segment("late")));
        let batch = consumer.join().unwrap();
        assert_eq!(ids(&batch), vec!["late"]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn force_offer_evicts_the_oldest() {
        let partition = Partition::new(1);
        assert!(partition.force_offer(segment("a")).is_none());
        let evicted = partition.force_offer(segment("b")).unwrap();
        assert_eq!(evicted.segment_id.as_str(), "a");
        assert_eq!(ids(&partition.poll_batch(1, Duration::ZERO)), vec!["b"]);
    }

    #[test]
    fn offer_timeout_succeeds_once_space_frees() {
        let partition = Arc::new(Partition::new(1));
        partition.offer(segment("a"));
        let consumer = {
            let partition = partition.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                partition.poll_batch(1, Duration::ZERO)
            })
        };
        assert!(partition
            .offer_timeout(segment("b"), Duration::from_secs(10))
            .is_ok());
        assert_eq!(ids(&consumer.join().unwrap()), vec!["a"]);
        assert_eq!(ids(&partition.poll_batch(1, Duration::ZERO)), vec!["b"]);
    }

    #[test]
    fn offer_timeout_hands_back_the_segment() {
        let partition = Partition::new(1);
        partition.offer(segment("a"));
        let rejected = partition
            .offer_timeout(segment("b"), Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(rejected.segment_id.as_str(), "b");
    }
}
