//! The transaction state machine.
//!
//! A [`Transaction`] journals every status change before acting on it. The
//! commit path is:
//!
//! ```text
//! ACTIVE -> PREPARING -> PREPARED -> COMMITTING (forced) -> COMMITTED
//!    \                       \            \
//!     MARKED_ROLLBACK ------> ROLLING_BACK -> ROLLEDBACK
//! ```
//!
//! COMMITTING is forced to stable storage before the first resource is told
//! to commit whenever more than one branch takes part.

use crate::branch::{Branch, BranchManager, ResourceCoordinator};
use crate::error::{describe_delist_failures, describe_failures, BranchFailure, TmError, TmResult};
use crate::phase::{names_of, PhaseExecutor};
use crate::registry::ResourceRegistry;
use crate::sync::{StatusListener, Synchronization};
use crate::timeout::{TaskId, TimeoutScheduler};
use crate::xa::{XaFlag, XaResource};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use xatm_journal::{Gtrid, Journal, TxStatus};

/// Collaborators shared by every transaction of a manager.
#[derive(Clone)]
pub struct TransactionServices {
    /// Journal receiving status changes.
    pub journal: Arc<dyn Journal>,
    /// Registrations of known resources.
    pub registry: Arc<ResourceRegistry>,
    /// Runs the prepare, commit and rollback phases.
    pub executor: Arc<dyn PhaseExecutor>,
    /// Fires transaction timeouts. Without one, transactions never time out.
    pub scheduler: Option<Arc<dyn TimeoutScheduler>>,
    /// Warn when a transaction completes without any resource.
    pub warn_about_zero_resource_transactions: bool,
}

#[derive(Debug)]
struct TxState {
    status: TxStatus,
    timed_out: bool,
    deadline: Option<Instant>,
    timeout_task: Option<TaskId>,
}

/// A distributed transaction.
///
/// Handles are shared as `Arc<Transaction>`; the timeout scheduler only
/// holds a weak reference.
pub struct Transaction {
    gtrid: Gtrid,
    services: TransactionServices,
    coordinator: Box<dyn ResourceCoordinator>,
    state: Mutex<TxState>,
    // Serializes status changes with their journal writes.
    transition: Mutex<()>,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
    listeners: RwLock<Vec<Arc<dyn StatusListener>>>,
    this: Weak<Transaction>,
}

impl Transaction {
    /// Creates a transaction in NO_TRANSACTION status using a
    /// [`BranchManager`].
    #[must_use]
    pub fn new(gtrid: Gtrid, services: TransactionServices) -> Arc<Self> {
        Self::with_coordinator(gtrid, services, Box::new(BranchManager::new()))
    }

    /// Creates a transaction with a custom resource coordinator.
    #[must_use]
    pub fn with_coordinator(
        gtrid: Gtrid,
        services: TransactionServices,
        coordinator: Box<dyn ResourceCoordinator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            gtrid,
            services,
            coordinator,
            state: Mutex::new(TxState {
                status: TxStatus::NoTransaction,
                timed_out: false,
                deadline: None,
                timeout_task: None,
            }),
            transition: Mutex::new(()),
            synchronizations: Mutex::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Global transaction id.
    #[must_use]
    pub fn gtrid(&self) -> &Gtrid {
        &self.gtrid
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TxStatus {
        self.state.lock().status
    }

    /// Returns true once the timeout fired.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.state.lock().timed_out
    }

    /// Instant the transaction times out at, once started.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().deadline
    }

    /// Unique names of every enlisted resource.
    #[must_use]
    pub fn enlisted_names(&self) -> BTreeSet<String> {
        self.coordinator.unique_names()
    }

    /// The resource coordinator managing this transaction's branches.
    #[must_use]
    pub fn coordinator(&self) -> &dyn ResourceCoordinator {
        self.coordinator.as_ref()
    }

    /// Starts the transaction: logs ACTIVE and arms the timeout.
    ///
    /// # Errors
    ///
    /// Returns an illegal-state error if already started, or a journal
    /// error if ACTIVE cannot be logged.
    pub fn begin(&self, timeout: Duration) -> TmResult<()> {
        let deadline = Instant::now().checked_add(timeout);
        {
            let mut state = self.state.lock();
            if state.status != TxStatus::NoTransaction {
                return Err(TmError::illegal_state(format!(
                    "transaction {} has already started",
                    self.gtrid
                )));
            }
            state.deadline = deadline;
        }
        self.set_status(TxStatus::Active, &BTreeSet::new())?;

        if let (Some(scheduler), Some(deadline)) = (&self.services.scheduler, deadline) {
            let this = self.this.clone();
            let task = scheduler.schedule(
                deadline,
                Box::new(move || {
                    if let Some(transaction) = this.upgrade() {
                        if let Err(err) = transaction.timeout() {
                            error!(gtrid = %transaction.gtrid, error = %err, "cannot time out transaction");
                        }
                    }
                }),
            );
            self.state.lock().timeout_task = Some(task);
        }
        debug!(gtrid = %self.gtrid, ?timeout, "transaction started");
        Ok(())
    }

    /// Enlists `resource`, starting or joining its branch.
    ///
    /// # Errors
    ///
    /// - illegal state if the transaction is not started or is completing
    /// - rollback if it is marked rollback-only or the resource rolled back
    ///   on start (the transaction becomes rollback-only)
    /// - system error if the resource is not registered or fails to start
    pub fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> TmResult<()> {
        let status = self.status();
        ensure_in_progress(status, "enlist a resource")?;
        if status == TxStatus::MarkedRollback {
            return Err(TmError::rollback(
                format!("transaction {} has been marked as rollback only", self.gtrid),
                Vec::new(),
            ));
        }

        let unique_name = resource.unique_name().to_string();
        let registration = self.services.registry.get(&unique_name).ok_or_else(|| {
            TmError::system(format!("resource [{unique_name}] is not registered"), Vec::new())
        })?;

        let deadline = self.deadline();
        match self.coordinator.enlist(resource, registration, &self.gtrid, deadline) {
            Ok(()) => Ok(()),
            Err(failure) if failure.error.is_rollback() => {
                self.mark_rollback()?;
                let message = format!(
                    "resource [{unique_name}] unilaterally rolled back, transaction {} marked as rollback only",
                    self.gtrid
                );
                Err(TmError::rollback(message, vec![failure]))
            }
            Err(failure) => {
                let failures = vec![failure];
                let message = format!("cannot enlist resource{}", describe_failures(&failures));
                Err(TmError::system(message, failures))
            }
        }
    }

    /// Ends the association of `resource` with the transaction.
    ///
    /// Returns `Ok(false)` when the resource had already rolled back on its
    /// own; the transaction is then rollback-only. TMFAIL also makes it
    /// rollback-only.
    ///
    /// # Errors
    ///
    /// - system error for a flag other than TMSUCCESS, TMSUSPEND or TMFAIL,
    ///   or when a branch could not be ended
    /// - illegal state if the transaction is not started or is completing
    pub fn delist_resource(&self, resource: &dyn XaResource, flag: XaFlag) -> TmResult<bool> {
        if !flag.is_end_flag() {
            return Err(TmError::system(
                format!("can only delist with TMSUCCESS, TMSUSPEND or TMFAIL, not {flag}"),
                Vec::new(),
            ));
        }
        ensure_in_progress(self.status(), "delist a resource")?;

        let unique_name = resource.unique_name();
        if !self.coordinator.is_enlisted(unique_name) {
            return Err(TmError::illegal_state(format!(
                "resource [{unique_name}] is not enlisted in transaction {}",
                self.gtrid
            )));
        }

        let failures = self.coordinator.delist(unique_name, flag);
        if flag == XaFlag::Fail {
            self.mark_rollback()?;
        }
        if failures.is_empty() {
            return Ok(true);
        }
        if failures.iter().all(|failure| failure.error.is_rollback()) {
            warn!(gtrid = %self.gtrid, resource = unique_name, "resource unilaterally rolled back");
            self.mark_rollback()?;
            return Ok(false);
        }
        let message = format!("error delisting resource{}", describe_delist_failures(&failures));
        Err(TmError::system(message, failures))
    }

    /// Suspends every active branch (TMSUSPEND).
    ///
    /// # Errors
    ///
    /// Returns an illegal-state error if not in progress, or a system error
    /// naming every branch that failed to suspend.
    pub fn suspend(&self) -> TmResult<()> {
        ensure_in_progress(self.status(), "suspend")?;
        let failures = self.coordinator.suspend();
        if failures.is_empty() {
            return Ok(());
        }
        let message = format!("cannot suspend transaction{}", describe_failures(&failures));
        Err(TmError::system(message, failures))
    }

    /// Resumes every suspended branch (TMRESUME).
    ///
    /// # Errors
    ///
    /// Returns an illegal-state error if not in progress, or a system error
    /// naming every branch that failed to resume.
    pub fn resume(&self) -> TmResult<()> {
        ensure_in_progress(self.status(), "resume")?;
        let failures = self.coordinator.resume();
        if failures.is_empty() {
            return Ok(());
        }
        let message = format!("cannot resume transaction{}", describe_failures(&failures));
        Err(TmError::system(message, failures))
    }

    /// Registers a completion callback.
    ///
    /// # Errors
    ///
    /// Returns an illegal-state error if not in progress, or a rollback
    /// error if the transaction is rollback-only.
    pub fn register_synchronization(&self, synchronization: Arc<dyn Synchronization>) -> TmResult<()> {
        let status = self.status();
        ensure_in_progress(status, "register a synchronization")?;
        if status == TxStatus::MarkedRollback {
            return Err(TmError::rollback(
                format!("transaction {} has been marked as rollback only", self.gtrid),
                Vec::new(),
            ));
        }
        self.synchronizations.lock().push(synchronization);
        Ok(())
    }

    /// Adds a listener notified after every journaled status change.
    pub fn add_status_listener(&self, listener: Arc<dyn StatusListener>) {
        self.listeners.write().push(listener);
    }

    /// Makes rollback the only possible outcome.
    ///
    /// # Errors
    ///
    /// Returns an illegal-state error if not in progress.
    pub fn set_rollback_only(&self) -> TmResult<()> {
        ensure_in_progress(self.status(), "mark as rollback only")?;
        self.mark_rollback()
    }

    /// Sets the status and journals it.
    ///
    /// COMMITTING is forced to stable storage when more than one branch
    /// is enlisted.
    ///
    /// # Errors
    ///
    /// Returns a fatal journal error if the status cannot be journaled.
    pub fn set_status(&self, status: TxStatus, unique_names: &BTreeSet<String>) -> TmResult<()> {
        self.transition(status, unique_names, |_| true).map(|_| ())
    }

    /// Timeout callback: marks the transaction timed out and rollback-only.
    /// Ignored once completion started.
    ///
    /// # Errors
    ///
    /// Returns a journal error if MARKED_ROLLBACK cannot be logged.
    pub fn timeout(&self) -> TmResult<()> {
        let names = self.coordinator.unique_names();
        let marked = self.transition(TxStatus::MarkedRollback, &names, |state| {
            state.timeout_task = None;
            if matches!(state.status, TxStatus::Active | TxStatus::MarkedRollback) {
                state.timed_out = true;
            }
            state.status == TxStatus::Active
        })?;
        if marked {
            warn!(gtrid = %self.gtrid, "transaction timed out");
        }
        Ok(())
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// - illegal state if not in progress
    /// - rollback if it was rolled back instead (rollback-only, timeout,
    ///   failed synchronization, delistment or prepare failure)
    /// - heuristic errors when resources disagreed with the decision
    /// - a fatal journal error
    pub fn commit(&self) -> TmResult<()> {
        ensure_in_progress(self.status(), "commit")?;
        self.cancel_timeout();
        let result = self.commit_and_report();
        self.after_completion();
        result
    }

    /// Rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns an illegal-state error if not in progress, a heuristic or
    /// system error if resources failed to roll back, or a fatal journal
    /// error.
    pub fn rollback(&self) -> TmResult<()> {
        ensure_in_progress(self.status(), "roll back")?;
        self.cancel_timeout();
        let result = self.rollback_all();
        self.after_completion();
        result
    }

    fn commit_and_report(&self) -> TmResult<()> {
        if let Err(err) = self.before_completion() {
            return self.roll_back_because(
                format!("synchronization failed before completion, transaction rolled back: {err}"),
                Vec::new(),
            );
        }

        if self.is_timed_out() {
            return self.roll_back_because(self.rollback_only_message(), Vec::new());
        }

        let failures = self.coordinator.delist_all(XaFlag::Success);
        if !failures.is_empty() {
            self.mark_rollback()?;
            let message = format!(
                "delistment error caused transaction rollback{}",
                describe_delist_failures(&failures)
            );
            return self.roll_back_because(message, failures);
        }

        if self.status() == TxStatus::MarkedRollback {
            return self.roll_back_because(self.rollback_only_message(), Vec::new());
        }

        self.two_phase_commit()
    }

    /// Rolls every branch back and returns a rollback error carrying
    /// `failures` plus the branches the rollback failed on. Heuristic
    /// outcomes are returned as they are.
    fn roll_back_because(&self, message: String, mut failures: Vec<BranchFailure>) -> TmResult<()> {
        if let Err(err) = self.rollback_all() {
            if err.is_fatal() || err.is_heuristic() {
                return Err(err);
            }
            failures.extend(err.failures().iter().cloned());
        }
        Err(TmError::rollback(message, failures))
    }

    fn rollback_only_message(&self) -> String {
        if self.is_timed_out() {
            format!("transaction {} timed out and has been rolled back", self.gtrid)
        } else {
            format!(
                "transaction {} was marked as rollback only and has been rolled back",
                self.gtrid
            )
        }
    }

    fn two_phase_commit(&self) -> TmResult<()> {
        let branches = self.coordinator.branches(&self.gtrid);
        let names = self.coordinator.unique_names();
        if branches.is_empty() && self.services.warn_about_zero_resource_transactions {
            warn!(gtrid = %self.gtrid, "committing a transaction with no enlisted resource");
        }

        // A timeout may have fired since the rollback-only check.
        let preparing = self.transition(TxStatus::Preparing, &names, |state| {
            state.status == TxStatus::Active && !state.timed_out
        })?;
        if !preparing {
            return self.roll_back_because(self.rollback_only_message(), Vec::new());
        }
        let one_phase = branches.len() == 1;
        let to_commit = if one_phase {
            branches.clone()
        } else {
            match self.services.executor.prepare(&branches) {
                Ok(prepared) => prepared,
                Err(err) => {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    let mut failures = err.failures().to_vec();
                    if let Err(rollback_err) = self.rollback_branches(&branches) {
                        if rollback_err.is_fatal() {
                            return Err(rollback_err);
                        }
                        failures.extend(rollback_err.failures().iter().cloned());
                    }
                    let message = format!(
                        "transaction failed during prepare of {}{}",
                        self.gtrid,
                        describe_failures(&failures)
                    );
                    return Err(TmError::rollback(message, failures));
                }
            }
        };
        self.set_status(TxStatus::Prepared, &names)?;

        if to_commit.is_empty() {
            debug!(gtrid = %self.gtrid, "no resource left to commit");
            self.set_status(TxStatus::Committed, &names)?;
            return Ok(());
        }

        self.set_status(TxStatus::Committing, &names_of(&to_commit))?;
        match self.services.executor.commit(&to_commit, one_phase) {
            Ok(()) => {
                self.set_status(TxStatus::Committed, &names)?;
                info!(gtrid = %self.gtrid, resources = names.len(), "transaction committed");
                Ok(())
            }
            Err(err) if err.is_rollback() || matches!(err, TmError::HeuristicRollback { .. }) => {
                self.set_status(TxStatus::RolledBack, &names)?;
                Err(err)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                let committed = without_failed(&names, &err);
                self.set_status(TxStatus::Committed, &committed)?;
                error!(gtrid = %self.gtrid, error = %err, "heuristic outcome during commit");
                Err(err)
            }
        }
    }

    /// Best-effort delistment, then rollback of every branch.
    fn rollback_all(&self) -> TmResult<()> {
        for failure in self.coordinator.delist_all(XaFlag::Success) {
            warn!(gtrid = %self.gtrid, %failure, "error delisting resource before rollback");
        }
        let branches = self.coordinator.branches(&self.gtrid);
        self.rollback_branches(&branches)
    }

    fn rollback_branches(&self, branches: &[Arc<Branch>]) -> TmResult<()> {
        let names = self.coordinator.unique_names();
        self.set_status(TxStatus::RollingBack, &names)?;

        // Branches that failed to end are already rolled back by their resource.
        let live: Vec<Arc<Branch>> = branches
            .iter()
            .filter(|branch| !branch.is_failed())
            .cloned()
            .collect();
        let result = self.services.executor.rollback(&live);

        let rolled_back = match &result {
            Ok(()) => names,
            Err(err) => without_failed(&names, err),
        };
        self.set_status(TxStatus::RolledBack, &rolled_back)?;
        match &result {
            Ok(()) => info!(gtrid = %self.gtrid, "transaction rolled back"),
            Err(err) => error!(gtrid = %self.gtrid, error = %err, "transaction failed during rollback"),
        }
        result
    }

    fn before_completion(&self) -> TmResult<()> {
        let synchronizations = self.synchronizations.lock().clone();
        for synchronization in synchronizations.iter().rev() {
            if let Err(err) = synchronization.before_completion() {
                warn!(gtrid = %self.gtrid, error = %err, "synchronization failed before completion");
                return Err(TmError::system(err.to_string(), Vec::new()));
            }
        }
        Ok(())
    }

    fn after_completion(&self) {
        let status = self.status();
        let synchronizations = self.synchronizations.lock().clone();
        for synchronization in &synchronizations {
            if let Err(err) = synchronization.after_completion(status) {
                warn!(gtrid = %self.gtrid, %status, error = %err, "synchronization failed after completion");
            }
        }
        self.coordinator.clear();
    }

    fn cancel_timeout(&self) {
        let task = self.state.lock().timeout_task.take();
        if let (Some(task), Some(scheduler)) = (task, &self.services.scheduler) {
            scheduler.cancel(task);
        }
    }

    /// MARKED_ROLLBACK, if currently ACTIVE.
    fn mark_rollback(&self) -> TmResult<()> {
        let names = self.coordinator.unique_names();
        self.transition(TxStatus::MarkedRollback, &names, |state| {
            state.status == TxStatus::Active
        })
        .map(|_| ())
    }

    /// Applies `status` if `allowed` accepts the current state, journals it
    /// and notifies listeners. Returns false when refused.
    fn transition<F>(&self, status: TxStatus, unique_names: &BTreeSet<String>, allowed: F) -> TmResult<bool>
    where
        F: FnOnce(&mut TxState) -> bool,
    {
        let previous = {
            let _ordered = self.transition.lock();
            let previous = {
                let mut state = self.state.lock();
                if !allowed(&mut state) {
                    return Ok(false);
                }
                std::mem::replace(&mut state.status, status)
            };
            self.journal_status(status, unique_names)?;
            previous
        };
        debug!(gtrid = %self.gtrid, %previous, %status, "status changed");
        for listener in self.listeners.read().iter() {
            listener.status_changed(&self.gtrid, previous, status);
        }
        Ok(true)
    }

    fn journal_status(&self, status: TxStatus, unique_names: &BTreeSet<String>) -> TmResult<()> {
        let journal = &self.services.journal;
        journal.log(status, &self.gtrid, unique_names).map_err(|err| {
            error!(gtrid = %self.gtrid, %status, error = %err, "cannot journal status");
            TmError::journal(format!("cannot log {status} status of transaction {}", self.gtrid), err)
        })?;
        if status == TxStatus::Committing && self.coordinator.len() > 1 {
            journal.force().map_err(|err| {
                error!(gtrid = %self.gtrid, error = %err, "cannot force journal");
                TmError::journal(format!("cannot force COMMITTING status of transaction {}", self.gtrid), err)
            })?;
        }
        Ok(())
    }
}

fn ensure_in_progress(status: TxStatus, action: &str) -> TmResult<()> {
    if status == TxStatus::NoTransaction {
        return Err(TmError::illegal_state(format!(
            "cannot {action}, transaction has not started"
        )));
    }
    if status.is_done() {
        return Err(TmError::illegal_state(format!(
            "cannot {action}, transaction is {status}"
        )));
    }
    Ok(())
}

/// `names` minus the resources an error blames.
fn without_failed(names: &BTreeSet<String>, err: &TmError) -> BTreeSet<String> {
    let failed: BTreeSet<&str> = err
        .failures()
        .iter()
        .map(|failure| failure.unique_name.as_str())
        .collect();
    names
        .iter()
        .filter(|name| !failed.contains(name.as_str()))
        .cloned()
        .collect()
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("gtrid", &self.gtrid)
            .field("state", &*self.state.lock())
            .field("resources", &self.coordinator.unique_names())
            .finish_non_exhaustive()
    }
}
