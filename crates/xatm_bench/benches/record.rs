//! Record codec benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeSet;
use xatm_journal::{compute_crc32, Gtrid, JournalRecord, TxStatus};

/// A record naming `resources` resources.
fn record(resources: usize) -> JournalRecord {
    let names: BTreeSet<String> = (0..resources).map(|i| format!("resource-{i}")).collect();
    JournalRecord::new(TxStatus::Committing, Gtrid::generate(b"bench-node"), names, 42)
}

/// Benchmark payload encoding.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_encode");

    for resources in [0, 2, 8, 32].iter() {
        let record = record(*resources);
        group.bench_with_input(BenchmarkId::from_parameter(resources), &record, |b, record| {
            let mut buf = Vec::with_capacity(1024);
            b.iter(|| {
                buf.clear();
                black_box(record).encode_payload_into(&mut buf).unwrap();
                black_box(&buf);
            });
        });
    }

    group.finish();
}

/// Benchmark payload decoding.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_decode");

    for resources in [0, 2, 8, 32].iter() {
        let payload = record(*resources).encode_payload().unwrap();
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(resources), &payload, |b, payload| {
            b.iter(|| {
                let decoded = JournalRecord::decode_payload(black_box(payload), true).unwrap();
                black_box(decoded);
            });
        });
    }

    group.finish();
}

/// Benchmark payload checksums.
fn bench_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_crc");

    for size in [64, 256, 1024, 4096].iter() {
        let data: Vec<u8> = (0..*size).map(|i| (i % 256) as u8).collect();
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(compute_crc32(black_box(data))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_crc);

criterion_main!(benches);
