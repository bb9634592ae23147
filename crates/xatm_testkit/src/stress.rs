//! Stress tests for the journal and the transaction manager.
//!
//! These helpers drive many threads through `log`/`force` and through full
//! two-phase commits, counting what succeeded.

use crate::resources::{EventLog, MockXaResource};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use xatm_core::{TransactionManager, XaResource};
use xatm_journal::{Gtrid, Journal, TxStatus};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per run, split across threads.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Resources enlisted in each transaction.
    pub resources: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            resources: 2,
        }
    }
}

fn run_threads<F>(config: &StressConfig, op: F) -> StressTestResult
where
    F: Fn(usize, usize) -> bool + Sync,
{
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let ops_per_thread = config.operations / config.threads.max(1);
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..config.threads.max(1) {
            let (op, successful, failed) = (&op, &successful, &failed);
            scope.spawn(move || {
                for i in 0..ops_per_thread {
                    if op(t, i) {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Each operation logs COMMITTING then COMMITTED for a fresh transaction,
/// forcing after the first record as a committing transaction would.
pub fn stress_concurrent_journaling(journal: &dyn Journal, config: &StressConfig) -> StressTestResult {
    let names: BTreeSet<String> = (0..config.resources).map(|r| format!("rm-{r}")).collect();
    run_threads(config, |t, i| {
        let gtrid = Gtrid::from_bytes(format!("stress-{t}-{i}").into_bytes());
        journal
            .log(TxStatus::Committing, &gtrid, &names)
            .and_then(|()| journal.force())
            .and_then(|()| journal.log(TxStatus::Committed, &gtrid, &names))
            .is_ok()
    })
}

/// Each operation commits a transaction spanning `config.resources` mock
/// resources. Resources must already be registered as `rm-0`, `rm-1`, ...
pub fn stress_concurrent_commits(manager: &TransactionManager, config: &StressConfig) -> StressTestResult {
    let events = EventLog::new();
    let resources: Vec<Arc<MockXaResource>> = (0..config.resources)
        .map(|r| MockXaResource::new(&format!("rm-{r}"), events.clone()).shared())
        .collect();

    run_threads(config, |_, _| {
        let Ok(transaction) = manager.begin() else {
            return false;
        };
        for resource in &resources {
            if transaction.enlist_resource(Arc::clone(resource) as Arc<dyn XaResource>).is_err() {
                return false;
            }
        }
        transaction.commit().is_ok()
    })
}

/// Every other transaction is rolled back instead of committed.
pub fn stress_mixed_outcomes(manager: &TransactionManager, config: &StressConfig) -> StressTestResult {
    let events = EventLog::new();
    let resource = MockXaResource::new("rm-0", events).shared();

    run_threads(config, |_, i| {
        let Ok(transaction) = manager.begin() else {
            return false;
        };
        if transaction.enlist_resource(Arc::clone(&resource) as Arc<dyn XaResource>).is_err() {
            return false;
        }
        if i % 2 == 0 {
            transaction.rollback().is_ok()
        } else {
            transaction.commit().is_ok()
        }
    })
}
