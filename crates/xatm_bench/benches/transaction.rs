//! Transaction commit benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use xatm_core::{
    ResourceRegistration, TmConfig, TransactionManager, Vote, XaFlag, XaResource, XaResult, Xid,
};
use xatm_journal::{DiskJournal, Journal, JournalConfig, NullJournal};

/// A resource that agrees to everything.
struct Noop(String);

impl XaResource for Noop {
    fn unique_name(&self) -> &str {
        &self.0
    }

    fn start(&self, _xid: &Xid, _flag: XaFlag) -> XaResult<()> {
        Ok(())
    }

    fn end(&self, _xid: &Xid, _flag: XaFlag) -> XaResult<()> {
        Ok(())
    }

    fn prepare(&self, _xid: &Xid) -> XaResult<Vote> {
        Ok(Vote::Commit)
    }

    fn commit(&self, _xid: &Xid, _one_phase: bool) -> XaResult<()> {
        Ok(())
    }

    fn rollback(&self, _xid: &Xid) -> XaResult<()> {
        Ok(())
    }
}

fn manager(journal: Arc<dyn Journal>, resources: usize) -> (TransactionManager, Vec<Arc<Noop>>) {
    let config = TmConfig::new()
        .server_id("bench")
        .warn_about_zero_resource_transactions(false);
    let manager = TransactionManager::new(config, journal).unwrap();
    let resources = (0..resources)
        .map(|i| {
            let name = format!("rm-{i}");
            manager
                .registry()
                .register(ResourceRegistration::new(name.clone()))
                .unwrap();
            Arc::new(Noop(name))
        })
        .collect();
    (manager, resources)
}

fn commit_one(manager: &TransactionManager, resources: &[Arc<Noop>]) {
    let transaction = manager.begin().unwrap();
    for resource in resources {
        transaction.enlist_resource(Arc::clone(resource)).unwrap();
    }
    transaction.commit().unwrap();
}

/// Benchmark the state machine alone.
fn bench_commit_null_journal(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_null_journal");

    for resources in [0, 1, 2, 4].iter() {
        let (manager, noops) = manager(Arc::new(NullJournal::new()), *resources);
        group.bench_with_input(BenchmarkId::from_parameter(resources), &noops, |b, noops| {
            b.iter(|| commit_one(&manager, noops));
        });
        manager.shutdown();
    }

    group.finish();
}

/// Benchmark commits journaled to a file.
fn bench_commit_disk_journal(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_disk_journal");
    group.sample_size(20);

    for resources in [1, 2].iter() {
        let dir = TempDir::new().unwrap();
        let config = JournalConfig::new().write_delay(Duration::from_millis(1));
        let journal = Arc::new(DiskJournal::new(dir.path().join("bench.journal"), config));
        let (manager, noops) = manager(journal, *resources);
        group.bench_with_input(BenchmarkId::from_parameter(resources), &noops, |b, noops| {
            b.iter(|| commit_one(&manager, noops));
        });
        manager.shutdown();
    }

    group.finish();
}

criterion_group!(benches, bench_commit_null_journal, bench_commit_disk_journal);

criterion_main!(benches);
