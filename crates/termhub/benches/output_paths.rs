//! Performance benchmarks for session output handling.
//!
//! These benchmarks measure the hot paths behind every PTY read:
//! - Appending to the retained history
//! - Draining history from a cursor
//! - Fanning chunks out to subscribers

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use termhub::protocol::{encode_line, Payload};
use termhub::session::{OutputBuffer, SessionOutputBroadcaster};

/// Benchmark appending chunks to a full history buffer.
fn bench_buffer_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_buffer_push");

    for size in [64usize, 4096, 65536] {
        let chunk = vec![b'x'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &chunk, |b, chunk| {
            // Small capacity keeps the buffer evicting on every push.
            let mut buffer = OutputBuffer::new(256 * 1024);
            b.iter(|| buffer.push(black_box(chunk)));
        });
    }

    group.finish();
}

/// Benchmark draining from the oldest retained offset.
fn bench_buffer_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_buffer_read");

    let mut buffer = OutputBuffer::new(1024 * 1024);
    for _ in 0..256 {
        buffer.push(&[b'y'; 4096]);
    }
    let start = buffer.oldest_offset();

    for max in [4096usize, 65536, 1024 * 1024] {
        group.throughput(Throughput::Bytes(max as u64));
        group.bench_with_input(BenchmarkId::from_parameter(max), &max, |b, &max| {
            b.iter(|| buffer.read_from(black_box(start), max));
        });
    }

    group.finish();
}

/// Benchmark broadcasting to a growing number of subscribers.
fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let chunk = Bytes::from(vec![b'z'; 4096]);

    for clients in [1usize, 4, 16] {
        group.throughput(Throughput::Bytes((chunk.len() * clients) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, &clients| {
            let broadcaster = SessionOutputBroadcaster::new();
            let mut subs = rt.block_on(async {
                let mut subs = Vec::with_capacity(clients);
                for _ in 0..clients {
                    subs.push(broadcaster.subscribe().await);
                }
                subs
            });

            b.iter(|| {
                rt.block_on(broadcaster.broadcast(black_box(chunk.clone())));
                for sub in subs.iter_mut() {
                    while sub.try_recv().is_some() {}
                }
            });
        });
    }

    group.finish();
}

/// Benchmark encoding a drain response payload as a JSON line.
fn bench_payload_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_encoding");

    for size in [64usize, 4096, 65536] {
        let payload = Payload::new(vec![0x1bu8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| encode_line(black_box(payload)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_buffer_push,
    bench_buffer_read,
    bench_broadcast,
    bench_payload_encoding,
);
criterion_main!(benches);
