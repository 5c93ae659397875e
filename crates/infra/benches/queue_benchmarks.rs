use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use lendq_core::QueueName;
use lendq_infra::jobs::{JobOptions, JobStore, Queue};
use lendq_infra::JobSystem;
use serde_json::json;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn fresh_queue(name: &str) -> Queue {
    JobSystem::in_memory().queue(name).unwrap()
}

fn bench_enqueue_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue_latency");
    group.sample_size(500);

    group.bench_function("add_without_dedupe", |b| {
        let queue = fresh_queue("bench");
        b.iter(|| {
            rt.block_on(queue.add("render", json!({ "n": 1 }), JobOptions::new()))
                .unwrap()
        });
    });

    // Every call after the first hits the dedupe path.
    group.bench_function("add_duplicate_key", |b| {
        let queue = fresh_queue("bench");
        b.iter(|| {
            let enqueued = rt
                .block_on(queue.add(
                    "pay-proposal",
                    json!({ "proposalId": "p-1" }),
                    JobOptions::new().with_dedupe_key("payment-p-1"),
                ))
                .unwrap();
            black_box(enqueued.duplicate)
        });
    });

    group.finish();
}

fn bench_claim_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_throughput");

    for batch_size in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), batch_size, |b, &batch_size| {
            let queue = fresh_queue("bench");
            let name = QueueName::new("bench").unwrap();
            b.iter(|| {
                rt.block_on(async {
                    for i in 0..batch_size {
                        queue.add("render", json!({ "n": i }), JobOptions::new()).await.unwrap();
                    }
                    let claimed = queue.store().claim_batch(&name, batch_size).await.unwrap();
                    black_box(claimed.len())
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_enqueue_latency, bench_claim_throughput);
criterion_main!(benches);
