//! # Segment buffer
//!
//! Sealed segments wait here for the dispatcher. The buffer is split into
//! independent bounded partitions: producers pick one through a
//! [`Partitioner`] and never share a lock across partitions.
//!
//! When a partition is full the [`OverflowPolicy`] in effect decides what is
//! lost. The policy is read from a [`ConfigCell`] at every decision, so it
//! can be switched while the agent runs.
mod partition;
mod partitioner;

pub use partition::Partition;
pub use partitioner::{PartitionStrategy, Partitioner, ProducerHashPartitioner, RoundRobinPartitioner};

use crate::config::{CellWatcher, ConfigCell, DynamicConfigRegistry};
use crate::trace::{ContextKey, Segment, SegmentSink};
use sniffer::sniffer_warn;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of partitions.
pub(crate) const SW_BUFFER_PARTITIONS: &str = "SW_BUFFER_PARTITIONS";
/// Default number of partitions.
pub(crate) const SW_BUFFER_PARTITIONS_DEFAULT: usize = 5;
/// Segments each partition holds.
pub(crate) const SW_BUFFER_PARTITION_CAPACITY: &str = "SW_BUFFER_PARTITION_CAPACITY";
/// Default partition capacity.
pub(crate) const SW_BUFFER_PARTITION_CAPACITY_DEFAULT: usize = 300;
/// `discard`, `block` or `discard_oldest`.
pub(crate) const SW_BUFFER_OVERFLOW_POLICY: &str = "SW_BUFFER_OVERFLOW_POLICY";
/// Milliseconds a producer waits for space under `block`.
pub(crate) const SW_BUFFER_BLOCK_TIMEOUT: &str = "SW_BUFFER_BLOCK_TIMEOUT";
/// Default block timeout.
pub(crate) const SW_BUFFER_BLOCK_TIMEOUT_DEFAULT: u64 = 100;
/// `round_robin` or `producer_hash`.
pub(crate) const SW_BUFFER_PARTITION_STRATEGY: &str = "SW_BUFFER_PARTITION_STRATEGY";

/// Dynamic key of the overflow policy.
pub const OVERFLOW_POLICY_KEY: &str = "buffer.overflow_policy";

/// What happens to a segment offered to a full partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OverflowPolicy {
    /// Drop the new segment.
    #[default]
    Discard,
    /// Wait up to the block timeout for space, then drop the new segment.
    BlockUntilSpace,
    /// Evict the oldest queued segment to make room.
    DiscardOldest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(OverflowPolicy::Discard),
            "block" | "block_until_space" => Ok(OverflowPolicy::BlockUntilSpace),
            "discard_oldest" => Ok(OverflowPolicy::DiscardOldest),
            other => Err(format!("unknown overflow policy `{other}`")),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverflowPolicy::Discard => "discard",
            OverflowPolicy::BlockUntilSpace => "block",
            OverflowPolicy::DiscardOldest => "discard_oldest",
        })
    }
}

/// Buffer settings.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub(crate) partitions: usize,
    pub(crate) partition_capacity: usize,
    pub(crate) overflow_policy: OverflowPolicy,
    pub(crate) block_timeout: Duration,
    pub(crate) strategy: PartitionStrategy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfigBuilder::default().build()
    }
}

impl BufferConfig {
    /// Number of partitions.
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Segments each partition holds.
    pub fn partition_capacity(&self) -> usize {
        self.partition_capacity
    }
}

/// A builder for creating [`BufferConfig`] instances.
#[derive(Debug)]
pub struct BufferConfigBuilder {
    partitions: usize,
    partition_capacity: usize,
    overflow_policy: OverflowPolicy,
    block_timeout: Duration,
    strategy: PartitionStrategy,
}

impl Default for BufferConfigBuilder {
    /// Create a new [`BufferConfigBuilder`] with default values, overridden
    /// by environment variables when set:
    /// * `SW_BUFFER_PARTITIONS`
    /// * `SW_BUFFER_PARTITION_CAPACITY`
    /// * `SW_BUFFER_OVERFLOW_POLICY`
    /// * `SW_BUFFER_BLOCK_TIMEOUT`
    /// * `SW_BUFFER_PARTITION_STRATEGY`
    fn default() -> Self {
        BufferConfigBuilder {
            partitions: SW_BUFFER_PARTITIONS_DEFAULT,
            partition_capacity: SW_BUFFER_PARTITION_CAPACITY_DEFAULT,
            overflow_policy: OverflowPolicy::default(),
            block_timeout: Duration::from_millis(SW_BUFFER_BLOCK_TIMEOUT_DEFAULT),
            strategy: PartitionStrategy::default(),
        }
        .init_from_env_vars()
    }
}

impl BufferConfigBuilder {
    /// Set the number of partitions. The default is 5.
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    /// Set how many segments each partition holds. The default is 300.
    pub fn with_partition_capacity(mut self, capacity: usize) -> Self {
        self.partition_capacity = capacity;
        self
    }

    /// Set the initial overflow policy. The default is
    /// [`OverflowPolicy::Discard`].
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Set how long a producer waits for space under
    /// [`OverflowPolicy::BlockUntilSpace`]. The default is 100 milliseconds.
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Set how producers are mapped to partitions.
    pub fn with_partition_strategy(mut self, strategy: PartitionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Builds a `BufferConfig` enforcing the following invariants:
    /// * at least one partition,
    /// * a partition capacity of at least one.
    pub fn build(self) -> BufferConfig {
        BufferConfig {
            partitions: self.partitions.max(1),
            partition_capacity: self.partition_capacity.max(1),
            overflow_policy: self.overflow_policy,
            block_timeout: self.block_timeout,
            strategy: self.strategy,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(partitions) = env::var(SW_BUFFER_PARTITIONS)
            .ok()
            .and_then(|partitions| usize::from_str(&partitions).ok())
        {
            self.partitions = partitions;
        }

        if let Some(capacity) = env::var(SW_BUFFER_PARTITION_CAPACITY)
            .ok()
            .and_then(|capacity| usize::from_str(&capacity).ok())
        {
            self.partition_capacity = capacity;
        }

        if let Some(policy) = env::var(SW_BUFFER_OVERFLOW_POLICY)
            .ok()
            .and_then(|policy| OverflowPolicy::from_str(&policy).ok())
        {
            self.overflow_policy = policy;
        }

        if let Some(timeout) = env::var(SW_BUFFER_BLOCK_TIMEOUT)
            .ok()
            .and_then(|timeout| u64::from_str(&timeout).ok())
        {
            self.block_timeout = Duration::from_millis(timeout);
        }

        match env::var(SW_BUFFER_PARTITION_STRATEGY).ok().as_deref() {
            Some("round_robin") => self.strategy = PartitionStrategy::RoundRobin,
            Some("producer_hash") => self.strategy = PartitionStrategy::ProducerHash,
            _ => {}
        }

        self
    }
}

/// Partitioned, bounded holding area between the engine and the dispatcher.
#[derive(Debug)]
pub struct SegmentBuffer {
    partitions: Box<[Partition]>,
    partitioner: Box<dyn Partitioner>,
    overflow_policy: Arc<ConfigCell<OverflowPolicy>>,
    block_timeout: Duration,
    accepted: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SegmentBuffer {
    /// Create a buffer using the partitioning strategy of `config`.
    pub fn new(config: BufferConfig) -> Self {
        let partitioner = config.strategy.partitioner();
        SegmentBuffer::with_partitioner(config, partitioner)
    }

    /// Create a buffer with a custom [`Partitioner`].
    pub fn with_partitioner(config: BufferConfig, partitioner: Box<dyn Partitioner>) -> Self {
        SegmentBuffer {
            partitions: (0..config.partitions)
                .map(|_| Partition::new(config.partition_capacity))
                .collect(),
            partitioner,
            overflow_policy: Arc::new(ConfigCell::new(config.overflow_policy)),
            block_timeout: config.block_timeout,
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Queues a segment sealed by `producer`, applying the overflow policy
    /// when its partition is full. Returns whether the segment was queued.
    pub fn offer(&self, producer: ContextKey, segment: Segment) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.record_drop();
            return false;
        }

        let index = self.partitioner.partition(self.partitions.len(), producer) % self.partitions.len();
        let partition = &self.partitions[index];
        let queued = match self.overflow_policy.current_value() {
            OverflowPolicy::Discard => partition.try_offer(segment).is_ok(),
            OverflowPolicy::BlockUntilSpace => {
                partition.offer_timeout(segment, self.block_timeout).is_ok()
            }
            OverflowPolicy::DiscardOldest => {
                if partition.force_offer(segment).is_some() {
                    self.record_drop();
                }
                true
            }
        };

        if queued {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.record_drop();
        }
        queued
    }

    fn record_drop(&self) {
        // The first drop is logged, later ones are only counted.
        if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
            sniffer_warn!(
                name: "SegmentBuffer.SegmentDroppingStarted",
                message = "A segment was dropped because its partition was full or the buffer is closed. Further drops are only counted and reported at shutdown."
            );
        }
    }

    /// The partitions, in index order.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Live overflow policy.
    pub fn overflow_policy(&self) -> &Arc<ConfigCell<OverflowPolicy>> {
        &self.overflow_policy
    }

    /// Registers the overflow policy on `registry`.
    pub fn register_watchers(&self, registry: &DynamicConfigRegistry) {
        registry.register(Arc::new(CellWatcher::new(
            OVERFLOW_POLICY_KEY,
            self.overflow_policy.clone(),
            OverflowPolicy::default(),
        )));
    }

    /// Segments lost to overflow, evictions or a closed buffer.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Segments queued so far.
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Segments currently queued across all partitions.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(Partition::len).sum()
    }

    /// Whether no segment is queued.
    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(Partition::is_empty)
    }

    /// Rejects further offers and wakes every waiting producer and
    /// consumer.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for partition in self.partitions.iter() {
            partition.wake_all();
        }
    }
}

impl SegmentSink for SegmentBuffer {
    fn on_sealed(&self, producer: ContextKey, segment: Segment) {
        self.offer(producer, segment);
    }
}
