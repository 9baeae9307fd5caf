use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use snowplow_emitter::buffer::{PayloadCodec, PersistentBlockingQueue};
use snowplow_emitter::domain::{Payload, RecordId};
use snowplow_emitter::storage::{MemoryStorage, SpoolConfig, SpoolStorage};
use std::time::Duration;

fn create_test_event(id: usize) -> Payload {
    Payload::new()
        .with("e", "pv")
        .with("eid", format!("00000000-0000-4000-8000-{id:012}"))
        .with("url", format!("https://example.com/page/{id}"))
        .with("tv", "rust-0.1.0")
        .with("dtm", "1700000000000")
}

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_memory");

    for &size in &[100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let queue = PersistentBlockingQueue::new(Box::new(MemoryStorage::new()));
                for i in 0..size {
                    queue
                        .enqueue(vec![std::hint::black_box(create_test_event(i))])
                        .expect("Failed to enqueue event in benchmark");
                }
            });
        });
    }
    group.finish();
}

fn bench_peek_remove_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("peek_remove_cycle");
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime for benchmark");

    for &batch in &[1, 50, 150] {
        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let queue = PersistentBlockingQueue::new(Box::new(MemoryStorage::new()));
                queue
                    .enqueue((0..1_000).map(create_test_event).collect())
                    .expect("Failed to enqueue events in benchmark");

                rt.block_on(async {
                    loop {
                        let events = queue
                            .peek(batch, Duration::ZERO)
                            .await
                            .expect("Failed to peek in benchmark");
                        if events.is_empty() {
                            break;
                        }
                        let ids: Vec<RecordId> = events.iter().map(|(id, _)| *id).collect();
                        queue.remove(&ids).expect("Failed to remove in benchmark");
                    }
                });
            });
        });
    }
    group.finish();
}

fn bench_spool_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_spool");
    group.sample_size(10);

    for compression in [false, true] {
        group.throughput(Throughput::Elements(100));
        group.bench_with_input(
            BenchmarkId::new("compression", compression),
            &compression,
            |b, &compression| {
                b.iter(|| {
                    let temp_dir =
                        tempfile::TempDir::new().expect("Failed to create temp dir for benchmark");
                    let storage = SpoolStorage::open(SpoolConfig {
                        storage_path: temp_dir.path().to_path_buf(),
                        max_disk_usage: 64 * 1024 * 1024,
                        compression,
                    })
                    .expect("Failed to open spool for benchmark");
                    let queue = PersistentBlockingQueue::new(Box::new(storage));
                    queue
                        .enqueue((0..100).map(create_test_event).collect())
                        .expect("Failed to enqueue events in benchmark");
                });
            },
        );
    }
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let codec = PayloadCodec::new();
    let event = create_test_event(42);
    let encoded = codec.encode(&event).expect("Failed to encode event");

    c.bench_function("codec_encode", |b| {
        b.iter(|| codec.encode(std::hint::black_box(&event)));
    });
    c.bench_function("codec_decode", |b| {
        b.iter(|| codec.decode(std::hint::black_box(&encoded)));
    });
}

criterion_group!(
    benches,
    bench_enqueue,
    bench_peek_remove_cycle,
    bench_spool_enqueue,
    bench_codec
);
criterion_main!(benches);
