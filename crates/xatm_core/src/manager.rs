//! The transaction manager: creates transactions and owns their services.

use crate::config::TmConfig;
use crate::error::{TmError, TmResult};
use crate::phase::{DefaultPhaseExecutor, PhaseExecutor};
use crate::registry::ResourceRegistry;
use crate::sync::StatusListener;
use crate::timeout::{TaskScheduler, TimeoutScheduler};
use crate::transaction::{Transaction, TransactionServices};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use xatm_journal::{Gtrid, Journal, JournalRecord, NullJournal, TxStatus};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

type InFlight = DashMap<Gtrid, Arc<Transaction>>;

/// Drops a transaction from the in-flight registry once it is terminal.
struct InFlightTracker {
    in_flight: Weak<InFlight>,
}

impl StatusListener for InFlightTracker {
    fn status_changed(&self, gtrid: &Gtrid, _previous: TxStatus, current: TxStatus) {
        if current.is_terminal() {
            if let Some(in_flight) = self.in_flight.upgrade() {
                in_flight.remove(gtrid);
            }
        }
    }
}

/// Builder for [`TransactionManager`].
#[derive(Default)]
pub struct TransactionManagerBuilder {
    config: TmConfig,
    journal: Option<Arc<dyn Journal>>,
    registry: Option<Arc<ResourceRegistry>>,
    executor: Option<Arc<dyn PhaseExecutor>>,
    scheduler: Option<Arc<dyn TimeoutScheduler>>,
}

impl TransactionManagerBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: TmConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the journal. Defaults to a [`NullJournal`].
    #[must_use]
    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Sets the resource registry.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ResourceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replaces the [`DefaultPhaseExecutor`].
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replaces the [`TaskScheduler`].
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn TimeoutScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Opens the journal, collects dangling transactions and starts the
    /// timeout scheduler.
    ///
    /// # Errors
    ///
    /// Returns a journal error if the journal cannot be opened or read, or
    /// an I/O error if the scheduler thread cannot start.
    pub fn build(self) -> TmResult<TransactionManager> {
        let journal = self
            .journal
            .unwrap_or_else(|| Arc::new(NullJournal::new()) as Arc<dyn Journal>);
        journal
            .open()
            .map_err(|err| TmError::journal("cannot open journal", err))?;
        let dangling = journal
            .collect_dangling_records()
            .map_err(|err| TmError::journal("cannot collect dangling transactions", err))?;
        if !dangling.is_empty() {
            warn!(count = dangling.len(), "dangling transactions found in journal");
        }

        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TaskScheduler::start()?) as Arc<dyn TimeoutScheduler>,
        };
        let executor = self.executor.unwrap_or_else(|| {
            Arc::new(DefaultPhaseExecutor::new(self.config.asynchronous_2pc)) as Arc<dyn PhaseExecutor>
        });
        let services = TransactionServices {
            journal,
            registry: self.registry.unwrap_or_default(),
            executor,
            scheduler: Some(scheduler),
            warn_about_zero_resource_transactions: self.config.warn_about_zero_resource_transactions,
        };

        info!(server_id = %self.config.server_id, "transaction manager started");
        Ok(TransactionManager {
            config: self.config,
            services,
            in_flight: Arc::new(DashMap::new()),
            dangling,
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Creates transactions and tracks those in flight.
pub struct TransactionManager {
    config: TmConfig,
    services: TransactionServices,
    in_flight: Arc<InFlight>,
    dangling: HashMap<Gtrid, JournalRecord>,
    shut_down: AtomicBool,
}

impl TransactionManager {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> TransactionManagerBuilder {
        TransactionManagerBuilder::default()
    }

    /// Builds a manager over `journal` with default collaborators.
    ///
    /// # Errors
    ///
    /// See [`TransactionManagerBuilder::build`].
    pub fn new(config: TmConfig, journal: Arc<dyn Journal>) -> TmResult<Self> {
        Self::builder().config(config).journal(journal).build()
    }

    /// Begins a transaction with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an illegal-state error after shutdown, or a journal error if
    /// ACTIVE cannot be logged.
    pub fn begin(&self) -> TmResult<Arc<Transaction>> {
        self.begin_with_timeout(self.config.default_timeout)
    }

    /// Begins a transaction timing out after `timeout`. A zero timeout means
    /// the default.
    ///
    /// # Errors
    ///
    /// Returns an illegal-state error after shutdown, or a journal error if
    /// ACTIVE cannot be logged.
    pub fn begin_with_timeout(&self, timeout: Duration) -> TmResult<Arc<Transaction>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TmError::illegal_state("transaction manager is shutting down"));
        }
        let timeout = if timeout.is_zero() {
            self.config.default_timeout
        } else {
            timeout
        };

        let gtrid = Gtrid::generate(self.config.server_id.as_bytes());
        let transaction = Transaction::new(gtrid.clone(), self.services.clone());
        transaction.add_status_listener(Arc::new(InFlightTracker {
            in_flight: Arc::downgrade(&self.in_flight),
        }));
        self.in_flight.insert(gtrid.clone(), Arc::clone(&transaction));
        if let Err(err) = transaction.begin(timeout) {
            self.in_flight.remove(&gtrid);
            return Err(err);
        }
        Ok(transaction)
    }

    /// Looks up an in-flight transaction.
    #[must_use]
    pub fn get(&self, gtrid: &Gtrid) -> Option<Arc<Transaction>> {
        self.in_flight.get(gtrid).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of transactions not yet terminal.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Transactions the journal held in COMMITTING or ROLLING_BACK at
    /// startup.
    #[must_use]
    pub fn dangling_transactions(&self) -> &HashMap<Gtrid, JournalRecord> {
        &self.dangling
    }

    /// Registry of known resources.
    #[must_use]
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.services.registry
    }

    /// The journal in use.
    #[must_use]
    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.services.journal
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &TmConfig {
        &self.config
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Refuses new transactions, waits up to the graceful shutdown interval
    /// for in-flight ones, then stops the scheduler and closes the journal.
    /// Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let deadline = Instant::now() + self.config.graceful_shutdown_interval;
        while !self.in_flight.is_empty() && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
        if !self.in_flight.is_empty() {
            let gtrids: Vec<String> = self
                .in_flight
                .iter()
                .map(|entry| entry.key().to_string())
                .collect();
            warn!(count = gtrids.len(), ?gtrids, "shutting down with transactions still in flight");
        }

        if let Some(scheduler) = &self.services.scheduler {
            scheduler.shutdown();
        }
        self.services.journal.shutdown();
        info!(server_id = %self.config.server_id, "transaction manager stopped");
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .field("dangling", &self.dangling.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceRegistration;
    use std::collections::BTreeSet;
    use xatm_journal::{DiskJournal, JournalConfig};
    use xatm_storage::InMemoryBackend;

    fn quick_config() -> TmConfig {
        TmConfig::new()
            .server_id("test-tm")
            .graceful_shutdown_interval(Duration::from_millis(50))
    }

    fn journal_config() -> JournalConfig {
        JournalConfig::new()
            .initial_size(16 * 1024)
            .write_delay(Duration::from_millis(5))
    }

    #[test]
    fn in_flight_transactions_are_tracked_until_terminal() {
        let manager = TransactionManager::builder().config(quick_config()).build().unwrap();
        let first = manager.begin().unwrap();
        let second = manager.begin().unwrap();
        assert_ne!(first.gtrid(), second.gtrid());
        assert_eq!(manager.in_flight_count(), 2);
        assert!(manager.get(first.gtrid()).is_some());

        first.commit().unwrap();
        second.rollback().unwrap();
        assert_eq!(manager.in_flight_count(), 0);
    }

    #[test]
    fn gtrids_carry_the_server_id() {
        let manager = TransactionManager::builder().config(quick_config()).build().unwrap();
        let transaction = manager.begin().unwrap();
        assert!(transaction.gtrid().as_bytes().starts_with(b"test-tm"));
        transaction.rollback().unwrap();
    }

    #[test]
    fn timeouts_mark_rollback_only() {
        let manager = TransactionManager::builder().config(quick_config()).build().unwrap();
        let transaction = manager.begin_with_timeout(Duration::from_millis(20)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !transaction.is_timed_out() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(transaction.is_timed_out());
        assert_eq!(transaction.status(), TxStatus::MarkedRollback);
        assert!(transaction.commit().unwrap_err().is_rollback());
    }

    #[test]
    fn shutdown_refuses_new_transactions() {
        let manager = TransactionManager::builder().config(quick_config()).build().unwrap();
        let straggler = manager.begin().unwrap();
        manager.shutdown();
        assert!(manager.is_shut_down());
        assert!(matches!(manager.begin(), Err(TmError::IllegalState { .. })));
        assert_eq!(manager.in_flight_count(), 1);
        drop(straggler);
        manager.shutdown();
    }

    #[test]
    fn dangling_transactions_are_collected_at_startup() {
        let backend = InMemoryBackend::new();
        let gtrid = Gtrid::from_bytes(b"left-behind".to_vec());
        {
            let journal = DiskJournal::in_memory(backend.clone(), journal_config());
            journal.open().unwrap();
            let names: BTreeSet<String> = ["db".to_string(), "mq".to_string()].into();
            journal.log(TxStatus::Committing, &gtrid, &names).unwrap();
            journal.force().unwrap();
            journal.close().unwrap();
        }

        let journal = Arc::new(DiskJournal::in_memory(backend, journal_config()));
        let manager = TransactionManager::new(quick_config(), journal).unwrap();
        let dangling = manager.dangling_transactions();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[&gtrid].status(), TxStatus::Committing);
    }

    #[test]
    fn registry_is_shared_with_transactions() {
        let manager = TransactionManager::builder().config(quick_config()).build().unwrap();
        manager.registry().register(ResourceRegistration::new("db")).unwrap();
        assert_eq!(manager.registry().len(), 1);
    }
}
