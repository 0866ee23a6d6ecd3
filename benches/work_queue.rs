//! Benchmark for the work queue and the exclusion filter

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use volume_replicator::{ClaimKey, ExclusionFilter, WorkQueue};

fn bench_add_get_done(c: &mut Criterion) {
    let mut group = c.benchmark_group("work_queue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("add_get_done", |b| {
        let queue = WorkQueue::new();
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            queue.add(ClaimKey::new("apps", format!("data-{}", counter % 1000)));
            if let Some(key) = tokio_test::block_on(queue.get()) {
                queue.done(black_box(&key));
            }
        });
    });

    group.finish();
}

fn bench_duplicate_adds(c: &mut Criterion) {
    let mut group = c.benchmark_group("work_queue");
    group.throughput(Throughput::Elements(100));

    // Keys already pending are dropped on add
    let queue = WorkQueue::new();
    let keys: Vec<ClaimKey> = (0..100)
        .map(|i| ClaimKey::new("apps", format!("data-{:03}", i)))
        .collect();
    for key in &keys {
        queue.add(key.clone());
    }

    group.bench_function("duplicate_adds", |b| {
        b.iter(|| {
            for key in &keys {
                queue.add(black_box(key.clone()));
            }
        });
    });

    group.finish();
}

fn bench_exclusion_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("exclusion_filter");
    group.throughput(Throughput::Elements(1));

    let filter = ExclusionFilter::new("^(tmp|scratch)-.*$");
    group.bench_function("is_excluded", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let name = if counter % 2 == 0 {
                format!("scratch-{}", counter)
            } else {
                format!("data-{}", counter)
            };
            black_box(filter.is_excluded(&name));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_add_get_done,
    bench_duplicate_adds,
    bench_exclusion_filter,
);
criterion_main!(benches);
