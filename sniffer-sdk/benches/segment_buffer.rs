use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use sniffer::{SegmentId, TraceId};
use sniffer_sdk::buffer::{BufferConfigBuilder, OverflowPolicy, SegmentBuffer};
use sniffer_sdk::trace::{ContextKey, Segment};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn segment() -> Segment {
    Segment {
        trace_id: TraceId::from("trace"),
        segment_id: SegmentId::from("segment"),
        service: Arc::from("bench"),
        service_instance: Arc::from("bench-1"),
        spans: Vec::new(),
        refs: Vec::new(),
        size_limited: false,
    }
}

fn buffer(partitions: usize, policy: OverflowPolicy) -> Arc<SegmentBuffer> {
    Arc::new(SegmentBuffer::new(
        BufferConfigBuilder::default()
            .with_partitions(partitions)
            .with_partition_capacity(1024)
            .with_overflow_policy(policy)
            .build(),
    ))
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("SegmentBuffer");
    group.sample_size(50);

    group.bench_function("offer and poll", |b| {
        let buffer = buffer(1, OverflowPolicy::Discard);
        let key = ContextKey::new(1);
        b.iter(|| {
            buffer.offer(key, segment());
            buffer.partitions()[0].poll_batch(1, Duration::ZERO)
        })
    });

    group.bench_function("offer when full, discard oldest", |b| {
        let buffer = buffer(1, OverflowPolicy::DiscardOldest);
        let key = ContextKey::new(1);
        for _ in 0..1024 {
            buffer.offer(key, segment());
        }
        b.iter(|| buffer.offer(key, segment()))
    });

    for producers in [1, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("concurrent producers", producers),
            &producers,
            |b, &producers| {
                b.iter(|| {
                    let buffer = buffer(producers, OverflowPolicy::Discard);
                    let handles = (0..producers)
                        .map(|producer| {
                            let buffer = buffer.clone();
                            thread::spawn(move || {
                                let key = ContextKey::new(producer as u64);
                                for _ in 0..200 {
                                    buffer.offer(key, segment());
                                }
                            })
                        })
                        .collect::<Vec<_>>();
                    for handle in handles {
                        let _ = handle.join();
                    }
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
