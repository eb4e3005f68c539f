//! Benchmarks for the retry queue scans.
use chrono::{Duration as ChronoDuration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use reindex_core::jobs::{
    CooldownPolicy, QueueFilter, ReindexScope, ReindexTask, RetryMode, RetryQueue, TaskOutcome,
};
use std::time::Duration;

fn populated_queue(size: usize) -> RetryQueue {
    let queue = RetryQueue::new(CooldownPolicy::new(Duration::from_secs(30), Duration::from_secs(1800)), 3);
    let now = Utc::now();
    for i in 0..size {
        let scope = ReindexScope::sources([format!("source-{}", i)]).unwrap();
        let mut task = ReindexTask::new(scope, "bench", now);
        task.start(now).unwrap();
        task.finish(TaskOutcome::failure("EMBEDDING_TIMEOUT"), now).unwrap();
        let mode = if i % 4 == 0 { RetryMode::Manual } else { RetryMode::Auto };
        queue.enqueue(&task, mode, now).unwrap();
    }
    queue
}

fn bench_eligible_auto(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_queue_eligible_auto");
    for size in [100, 1_000, 10_000] {
        let queue = populated_queue(size);
        let later = Utc::now() + ChronoDuration::hours(1);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(queue.eligible_auto(later)));
        });
    }
    group.finish();
}

fn bench_list_with_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_queue_list_search");
    for size in [100, 1_000, 10_000] {
        let queue = populated_queue(size);
        let filter = QueueFilter::new().with_search("source-42");
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(queue.list(&filter)));
        });
    }
    group.finish();
}

fn bench_clear_cooldowns(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_queue_clear_cooldowns");
    let queue = populated_queue(1_000);
    let later = Utc::now() + ChronoDuration::hours(1);
    group.bench_function("1000", |b| {
        b.iter(|| black_box(queue.clear_elapsed_cooldowns(later)));
    });
    group.finish();
}

criterion_group!(benches, bench_eligible_auto, bench_list_with_search, bench_clear_cooldowns);
criterion_main!(benches);
