use crate::trace::ContextKey;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Chooses the partition a producer's segment goes to.
pub trait Partitioner: Send + Sync + Debug {
    /// Index in `0..partitions` for a segment sealed by `producer`.
    fn partition(&self, partitions: usize, producer: ContextKey) -> usize;
}

/// Spreads segments evenly, regardless of producer.
#[derive(Debug, Default)]
pub struct RoundRobinPartitioner {
    next: AtomicUsize,
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(&self, partitions: usize, _producer: ContextKey) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % partitions.max(1)
    }
}

/// Keeps each producer on one partition, so segments of one context are
/// reported in sealing order.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProducerHashPartitioner;

impl Partitioner for ProducerHashPartitioner {
    fn partition(&self, partitions: usize, producer: ContextKey) -> usize {
        producer.bucket(partitions)
    }
}

/// Built-in partitioning strategies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PartitionStrategy {
    /// [`RoundRobinPartitioner`].
    #[default]
    RoundRobin,
    /// [`ProducerHashPartitioner`].
    ProducerHash,
}

impl PartitionStrategy {
    pub(crate) fn partitioner(self) -> Box<dyn Partitioner> {
        match self {
            PartitionStrategy::RoundRobin => Box::<RoundRobinPartitioner>::default(),
            PartitionStrategy::ProducerHash => Box::new(ProducerHashPartitioner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles() {
        let partitioner = RoundRobinPartitioner::default();
        let picks = (0..6)
            .map(|_| partitioner.partition(3, ContextKey::new(1)))
            .collect::<Vec<_>>();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn producer_hash_is_sticky() {
        let partitioner = ProducerHashPartitioner;
        let key = ContextKey::new(99);
        let first = partitioner.partition(5, key);
        assert!((0..100).all(|_| partitioner.partition(5, key) == first));
    }
}
