use super::retry::{deliver, Delivery, ShutdownDeadline};
use super::DispatcherConfig;
use crate::buffer::SegmentBuffer;
use crate::export::SegmentReporter;
use crate::trace::Segment;
use sniffer::sniffer_error;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::time::Instant;

/// Requests a worker serves between polls.
#[derive(Debug)]
pub(super) enum Control {
    /// Deliver everything currently owned, then answer with the number of
    /// batches that could not be delivered.
    Flush(SyncSender<u64>),
}

#[derive(Debug, Default)]
pub(super) struct Counters {
    pub(super) delivered_segments: AtomicU64,
    pub(super) delivered_batches: AtomicU64,
    pub(super) failed_batches: AtomicU64,
    pub(super) failed_segments: AtomicU64,
    pub(super) redelivered_batches: AtomicU64,
    pub(super) discarded_on_shutdown: AtomicU64,
}

/// State shared by the dispatcher handle and its workers.
#[derive(Debug)]
pub(super) struct Shared {
    pub(super) buffer: Arc<SegmentBuffer>,
    pub(super) reporter: Arc<dyn SegmentReporter>,
    pub(super) config: DispatcherConfig,
    pub(super) counters: Counters,
    pub(super) stopping: AtomicBool,
    pub(super) shutdown: ShutdownDeadline,
}

impl Shared {
    /// Delivers one batch and records the outcome. Returns `false` unless
    /// the reporter accepted it.
    pub(super) fn deliver(&self, batch: Vec<Segment>) -> bool {
        if batch.is_empty() {
            return true;
        }
        let size = batch.len() as u64;
        match deliver(
            &*self.reporter,
            &batch,
            &self.config.retry,
            self.config.reporter_timeout,
            &self.shutdown,
        ) {
            Delivery::Delivered { redelivered } => {
                self.counters.delivered_batches.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .delivered_segments
                    .fetch_add(size, Ordering::Relaxed);
                if redelivered {
                    self.counters
                        .redelivered_batches
                        .fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            Delivery::Failed(err) => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.counters.failed_segments.fetch_add(size, Ordering::Relaxed);
                sniffer_error!(
                    name: "SegmentDispatcher.BatchDropped",
                    segments = size,
                    reason = format!("{err}")
                );
                false
            }
            Delivery::Abandoned => {
                self.counters
                    .discarded_on_shutdown
                    .fetch_add(size, Ordering::Relaxed);
                false
            }
        }
    }

    /// Empties `partitions` without delivering. Returns how many segments
    /// were removed.
    pub(super) fn discard(&self, partitions: impl IntoIterator<Item = usize>) -> u64 {
        let mut scratch = Vec::new();
        let mut discarded = 0;
        for index in partitions {
            let partition = &self.buffer.partitions()[index];
            while partition.drain_into(&mut scratch, usize::MAX) > 0 {
                discarded += scratch.len() as u64;
                scratch.clear();
            }
        }
        discarded
    }
}

/// One consumer thread and the partitions it owns.
pub(super) struct Worker {
    pub(super) partitions: Vec<usize>,
    pub(super) shared: Arc<Shared>,
    pub(super) control: Receiver<Control>,
    pub(super) done: Sender<usize>,
    pub(super) index: usize,
}

impl Worker {
    pub(super) fn run(self) {
        let max = self.shared.config.max_batch_size;
        let scheduled_delay = self.shared.config.scheduled_delay;
        let poll_wait = self.shared.config.poll_wait;
        let mut batch = Vec::new();
        let mut opened: Option<Instant> = None;
        let mut turn = 0;

        loop {
            if let Ok(Control::Flush(reply)) = self.control.try_recv() {
                let failed = self.flush(&mut batch);
                opened = None;
                let _ = reply.send(failed);
                continue;
            }

            if self.shared.stopping.load(Ordering::Acquire) {
                self.drain_on_shutdown(mem::take(&mut batch));
                break;
            }

            self.fill(&mut batch, max);
            if batch.is_empty() {
                opened = None;
            } else {
                opened.get_or_insert_with(Instant::now);
            }

            if let Some(since) = opened {
                if batch.len() >= max || since.elapsed() >= scheduled_delay {
                    self.shared.deliver(mem::take(&mut batch));
                    opened = None;
                    continue;
                }
            }

            let wait = match opened {
                Some(since) => scheduled_delay.saturating_sub(since.elapsed()).min(poll_wait),
                None => poll_wait,
            };
            // Parks on one owned partition per round. Offers to the others
            // are picked up after at most `wait`.
            let index = self.partitions[turn % self.partitions.len()];
            turn = turn.wrapping_add(1);
            self.shared.buffer.partitions()[index].wait_for_segment(wait);
        }

        let _ = self.done.send(self.index);
    }

    /// Tops `batch` up to `max` from the owned partitions, in order.
    fn fill(&self, batch: &mut Vec<Segment>, max: usize) {
        for &index in &self.partitions {
            if batch.len() >= max {
                break;
            }
            self.shared.buffer.partitions()[index].drain_into(batch, max);
        }
    }

    fn flush(&self, batch: &mut Vec<Segment>) -> u64 {
        let max = self.shared.config.max_batch_size;
        // Only what is queued now is flushed, so busy producers cannot keep
        // the flush going.
        let mut budget = batch.len()
            + self
                .partitions
                .iter()
                .map(|&index| self.shared.buffer.partitions()[index].len())
                .sum::<usize>();
        let mut failed = 0;
        while budget > 0 {
            self.fill(batch, max.min(budget));
            if batch.is_empty() {
                break;
            }
            budget = budget.saturating_sub(batch.len());
            if !self.shared.deliver(mem::take(batch)) {
                failed += 1;
            }
        }
        failed
    }

    fn drain_on_shutdown(&self, mut batch: Vec<Segment>) {
        let max = self.shared.config.max_batch_size;
        loop {
            self.fill(&mut batch, max);
            if batch.is_empty() {
                return;
            }
            self.shared.deliver(mem::take(&mut batch));
            if self.shared.shutdown.has_passed() {
                break;
            }
        }
        let discarded = self.shared.discard(self.partitions.iter().copied());
        self.shared
            .counters
            .discarded_on_shutdown
            .fetch_add(discarded, Ordering::Relaxed);
    }
}
