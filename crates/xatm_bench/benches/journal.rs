//! Journal log and force benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use xatm_journal::{DiskJournal, Gtrid, Journal, JournalConfig, TxStatus};
use xatm_storage::InMemoryBackend;

static NEXT: AtomicU64 = AtomicU64::new(0);

fn config() -> JournalConfig {
    JournalConfig::new()
        .initial_size(4 * 1024 * 1024)
        .write_delay(Duration::from_millis(1))
}

fn names() -> BTreeSet<String> {
    ["orders-db".to_string(), "billing-queue".to_string()]
        .into_iter()
        .collect()
}

/// Logs one finished transaction, forcing COMMITTING if asked.
fn commit_records(journal: &dyn Journal, names: &BTreeSet<String>, force: bool) {
    let gtrid = Gtrid::from_bytes(NEXT.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec());
    journal.log(TxStatus::Committing, &gtrid, names).unwrap();
    if force {
        journal.force().unwrap();
    }
    journal.log(TxStatus::Committed, &gtrid, names).unwrap();
}

/// Benchmark unforced logging to memory.
fn bench_log(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_log");
    group.throughput(Throughput::Elements(2));

    let journal = DiskJournal::in_memory(InMemoryBackend::new(), config());
    journal.open().unwrap();
    let names = names();
    group.bench_function("memory", |b| {
        b.iter(|| commit_records(black_box(&journal), &names, false));
    });
    journal.close().unwrap();

    group.finish();
}

/// Benchmark log plus force, as a two-phase commit does.
fn bench_log_force(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_log_force");
    group.sample_size(20);
    let names = names();

    let journal = DiskJournal::in_memory(InMemoryBackend::new(), config());
    journal.open().unwrap();
    group.bench_function("memory", |b| {
        b.iter(|| commit_records(black_box(&journal), &names, true));
    });
    journal.close().unwrap();

    let dir = TempDir::new().unwrap();
    let journal = DiskJournal::new(dir.path().join("bench.journal"), config());
    journal.open().unwrap();
    group.bench_function("file", |b| {
        b.iter(|| commit_records(black_box(&journal), &names, true));
    });
    journal.close().unwrap();

    group.finish();
}

/// Benchmark concurrent forcing threads sharing syncs.
fn bench_concurrent_force(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_concurrent_force");
    group.sample_size(10);
    let names = names();
    let per_thread = 50;

    let dir = TempDir::new().unwrap();
    let journal = DiskJournal::new(dir.path().join("bench.journal"), config());
    journal.open().unwrap();

    for threads in [1, 4, 16].iter() {
        group.throughput(Throughput::Elements((threads * per_thread) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            b.iter(|| {
                thread::scope(|scope| {
                    for _ in 0..threads {
                        scope.spawn(|| {
                            for _ in 0..per_thread {
                                commit_records(&journal, &names, true);
                            }
                        });
                    }
                });
            });
        });
    }

    journal.close().unwrap();
    group.finish();
}

criterion_group!(benches, bench_log, bench_log_force, bench_concurrent_force);

criterion_main!(benches);
