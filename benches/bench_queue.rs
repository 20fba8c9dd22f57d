//! Criterion benchmarks for the in-process frame queue.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use avring::{FrameQueue, FrameQueueConfig};

fn bench_frame_queue(c: &mut Criterion) {
    let payload = [0u8; 1024];

    let mut group = c.benchmark_group("frame_queue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("produce_consume_1k", |b| {
        let queue = FrameQueue::new(FrameQueueConfig::new(64, 1024).unwrap()).unwrap();
        let id = queue.register_consumer().unwrap();
        b.iter(|| {
            queue.produce(black_box(&payload), 0).unwrap();
            black_box(queue.consume(id).unwrap());
        })
    });

    group.bench_function("produce_overwrite_1k", |b| {
        // No consumer reads; every produce past the ring size overwrites.
        let queue = FrameQueue::new(FrameQueueConfig::new(64, 1024).unwrap()).unwrap();
        b.iter(|| {
            queue.produce(black_box(&payload), 0).unwrap();
        })
    });

    group.bench_function("fan_out_4_consumers_1k", |b| {
        let queue = FrameQueue::new(FrameQueueConfig::new(64, 1024).unwrap()).unwrap();
        let ids: Vec<i32> = (0..4).map(|_| queue.register_consumer().unwrap()).collect();
        b.iter(|| {
            queue.produce(black_box(&payload), 0).unwrap();
            for &id in &ids {
                black_box(queue.consume(id).unwrap());
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_frame_queue);
criterion_main!(benches);
