//! Phase executors: run prepare, commit and rollback across branches.

use crate::branch::Branch;
use crate::error::{describe_failures, BranchFailure, TmError, TmResult, XaError};
use crate::xa::{
    Vote, XaResult, XAER_NOTA, XAER_RMERR, XA_HEURCOM, XA_HEURHAZ, XA_HEURMIX, XA_HEURRB,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// What happened to each branch during one phase.
#[derive(Debug, Default)]
struct PhaseReport {
    succeeded: Vec<Arc<Branch>>,
    failures: Vec<BranchFailure>,
}

pub(crate) fn names_of(branches: &[Arc<Branch>]) -> BTreeSet<String> {
    branches
        .iter()
        .map(|branch| branch.unique_name().to_string())
        .collect()
}

/// Runs one phase of two-phase commit over a set of branches.
///
/// Every branch is attempted even after a failure, and the returned error
/// carries every partial failure.
pub trait PhaseExecutor: Send + Sync {
    /// Prepares `branches` and returns those that still need phase two.
    /// Branches voting read-only are left out.
    ///
    /// # Errors
    ///
    /// Returns [`TmError::Rollback`] if any branch failed to prepare.
    fn prepare(&self, branches: &[Arc<Branch>]) -> TmResult<Vec<Arc<Branch>>>;

    /// Commits `branches`, in one phase if `one_phase` is set.
    ///
    /// # Errors
    ///
    /// Returns [`TmError::Rollback`] if a one-phase commit rolled back,
    /// [`TmError::HeuristicRollback`] if nothing committed and
    /// [`TmError::HeuristicMixed`] otherwise.
    fn commit(&self, branches: &[Arc<Branch>], one_phase: bool) -> TmResult<()>;

    /// Rolls `branches` back.
    ///
    /// # Errors
    ///
    /// Returns [`TmError::HeuristicCommit`] if every failing branch committed
    /// instead, [`TmError::HeuristicMixed`] for a mixed outcome and
    /// [`TmError::System`] for any other failure.
    fn rollback(&self, branches: &[Arc<Branch>]) -> TmResult<()>;
}

/// Default [`PhaseExecutor`].
///
/// Branches are ordered by two-phase commit position, then by enlistment
/// order. Prepare and commit walk position groups in ascending order,
/// rollback in descending order. In asynchronous mode the branches of one
/// group run concurrently on scoped threads; groups stay sequential.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPhaseExecutor {
    asynchronous: bool,
}

impl DefaultPhaseExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(asynchronous: bool) -> Self {
        Self { asynchronous }
    }

    /// Returns true if groups run concurrently.
    #[must_use]
    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    fn run<T, F>(&self, branches: &[Arc<Branch>], reverse: bool, op: F) -> Vec<(Arc<Branch>, XaResult<T>)>
    where
        T: Send,
        F: Fn(&Branch) -> XaResult<T> + Sync,
    {
        let mut results = Vec::with_capacity(branches.len());
        for group in position_groups(branches, reverse) {
            if self.asynchronous && group.len() > 1 {
                thread::scope(|scope| {
                    let handles: Vec<_> = group
                        .iter()
                        .map(|branch| {
                            let op = &op;
                            (Arc::clone(branch), scope.spawn(move || op(branch)))
                        })
                        .collect();
                    for (branch, handle) in handles {
                        let result = handle.join().unwrap_or_else(|_| {
                            Err(XaError::new(XAER_RMERR, "resource call panicked"))
                        });
                        results.push((branch, result));
                    }
                });
            } else {
                for branch in group {
                    let result = op(&branch);
                    results.push((branch, result));
                }
            }
        }
        results
    }

    fn collect(results: Vec<(Arc<Branch>, XaResult<()>)>, phase: &str) -> PhaseReport {
        let mut report = PhaseReport::default();
        for (branch, result) in results {
            match result {
                Ok(()) => {
                    debug!(resource = branch.unique_name(), phase, "branch completed");
                    report.succeeded.push(branch);
                }
                Err(err) => {
                    warn!(resource = branch.unique_name(), phase, error = %err, "branch failed");
                    report.failures.push(BranchFailure::new(branch.unique_name(), err));
                }
            }
        }
        report
    }
}

/// Branches grouped by position, ascending (or fully reversed).
fn position_groups(branches: &[Arc<Branch>], reverse: bool) -> Vec<Vec<Arc<Branch>>> {
    let mut sorted = branches.to_vec();
    sorted.sort_by_key(|branch| (branch.position(), branch.enlist_order()));

    let mut groups: Vec<Vec<Arc<Branch>>> = Vec::new();
    for branch in sorted {
        match groups.last_mut() {
            Some(group) if group[0].position() == branch.position() => group.push(branch),
            _ => groups.push(vec![branch]),
        }
    }
    if reverse {
        groups.reverse();
        for group in &mut groups {
            group.reverse();
        }
    }
    groups
}

/// Classifies commit failures.
fn commit_outcome(report: PhaseReport, one_phase: bool) -> TmResult<()> {
    // A branch reporting XA_HEURCOM did commit.
    let (committed, failures): (Vec<_>, Vec<_>) = report
        .failures
        .into_iter()
        .partition(|failure| failure.error.code == XA_HEURCOM);
    if failures.is_empty() {
        return Ok(());
    }
    let nothing_committed = report.succeeded.is_empty() && committed.is_empty();
    let all_rolled_back = failures.iter().all(|failure| failure.error.is_rollback());

    if one_phase && all_rolled_back {
        let message = format!("resource rolled back during one-phase commit{}", describe_failures(&failures));
        return Err(TmError::rollback(message, failures));
    }
    if nothing_committed
        && failures
            .iter()
            .all(|failure| failure.error.is_rollback() || failure.error.code == XA_HEURRB)
    {
        let message = format!("all resources rolled back during commit{}", describe_failures(&failures));
        return Err(TmError::HeuristicRollback { message, failures });
    }
    let message = format!("transaction failed during commit{}", describe_failures(&failures));
    Err(TmError::HeuristicMixed { message, failures })
}

/// Classifies rollback failures.
fn rollback_outcome(report: PhaseReport) -> TmResult<()> {
    // Already rolled back, one way or another.
    let failures: Vec<BranchFailure> = report
        .failures
        .into_iter()
        .filter(|failure| {
            !(failure.error.is_rollback() || matches!(failure.error.code, XA_HEURRB | XAER_NOTA))
        })
        .collect();
    if failures.is_empty() {
        return Ok(());
    }

    let heuristic_commits = failures.iter().filter(|f| f.error.code == XA_HEURCOM).count();
    let mixed = failures
        .iter()
        .any(|failure| matches!(failure.error.code, XA_HEURMIX | XA_HEURHAZ));

    if heuristic_commits == failures.len() && report.succeeded.is_empty() {
        let message = format!("all resources committed during rollback{}", describe_failures(&failures));
        return Err(TmError::HeuristicCommit { message, failures });
    }
    if mixed || heuristic_commits > 0 {
        let message = format!("transaction partly committed during rollback{}", describe_failures(&failures));
        return Err(TmError::HeuristicMixed { message, failures });
    }
    let message = format!("transaction partly failed during rollback{}", describe_failures(&failures));
    Err(TmError::system(message, failures))
}

impl PhaseExecutor for DefaultPhaseExecutor {
    fn prepare(&self, branches: &[Arc<Branch>]) -> TmResult<Vec<Arc<Branch>>> {
        let mut report = PhaseReport::default();
        for (branch, result) in self.run(branches, false, |branch| branch.resource().prepare(branch.xid())) {
            match result {
                Ok(Vote::Commit) => {
                    debug!(resource = branch.unique_name(), "branch prepared");
                    report.succeeded.push(branch);
                }
                Ok(Vote::ReadOnly) => {
                    debug!(resource = branch.unique_name(), "branch voted read-only");
                }
                Err(err) => {
                    warn!(resource = branch.unique_name(), error = %err, "branch failed to prepare");
                    report.failures.push(BranchFailure::new(branch.unique_name(), err));
                }
            }
        }
        if report.failures.is_empty() {
            return Ok(report.succeeded);
        }
        let message = format!("transaction failed during prepare{}", describe_failures(&report.failures));
        Err(TmError::rollback(message, report.failures))
    }

    fn commit(&self, branches: &[Arc<Branch>], one_phase: bool) -> TmResult<()> {
        let results = self.run(branches, false, |branch| {
            branch.resource().commit(branch.xid(), one_phase)
        });
        commit_outcome(Self::collect(results, "commit"), one_phase)
    }

    fn rollback(&self, branches: &[Arc<Branch>]) -> TmResult<()> {
        let results = self.run(branches, true, |branch| branch.resource().rollback(branch.xid()));
        rollback_outcome(Self::collect(results, "rollback"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceRegistration;
    use crate::xa::{XaFlag, XaResource, Xid, XA_RBROLLBACK};
    use parking_lot::Mutex;
    use xatm_journal::Gtrid;

    #[derive(Default)]
    struct Scripted {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        prepare: Option<i32>,
        commit: Option<i32>,
        rollback: Option<i32>,
        read_only: bool,
    }

    fn outcome(code: Option<i32>) -> XaResult<()> {
        match code {
            Some(code) => Err(XaError::new(code, "scripted")),
            None => Ok(()),
        }
    }

    impl XaResource for Scripted {
        fn unique_name(&self) -> &str {
            &self.name
        }
        fn start(&self, _: &Xid, _: XaFlag) -> XaResult<()> {
            Ok(())
        }
        fn end(&self, _: &Xid, _: XaFlag) -> XaResult<()> {
            Ok(())
        }
        fn prepare(&self, _: &Xid) -> XaResult<Vote> {
            self.log.lock().push(format!("prepare {}", self.name));
            outcome(self.prepare)?;
            Ok(if self.read_only { Vote::ReadOnly } else { Vote::Commit })
        }
        fn commit(&self, _: &Xid, _: bool) -> XaResult<()> {
            self.log.lock().push(format!("commit {}", self.name));
            outcome(self.commit)
        }
        fn rollback(&self, _: &Xid) -> XaResult<()> {
            self.log.lock().push(format!("rollback {}", self.name));
            outcome(self.rollback)
        }
    }

    fn branch(resource: Scripted, position: i32, order: usize) -> Arc<Branch> {
        let registration = ResourceRegistration::new(resource.name.clone()).position(position);
        Arc::new(Branch::new(
            Arc::new(resource),
            registration,
            Xid::new_branch(Gtrid::from_bytes(b"g".to_vec())),
            order,
        ))
    }

    fn named(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Scripted {
        Scripted {
            name: name.to_string(),
            log: Arc::clone(log),
            ..Scripted::default()
        }
    }

    #[test]
    fn phases_follow_position_then_enlistment_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let branches = vec![
            branch(named(&log, "late"), 5, 0),
            branch(named(&log, "first"), -1, 1),
            branch(named(&log, "tie-a"), 0, 2),
            branch(named(&log, "tie-b"), 0, 3),
        ];
        let executor = DefaultPhaseExecutor::new(false);

        executor.commit(&branches, false).unwrap();
        executor.rollback(&branches).unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                "commit first",
                "commit tie-a",
                "commit tie-b",
                "commit late",
                "rollback late",
                "rollback tie-b",
                "rollback tie-a",
                "rollback first",
            ]
        );
    }

    #[test]
    fn prepare_skips_read_only_votes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let read_only = Scripted {
            read_only: true,
            ..named(&log, "ro")
        };
        let branches = vec![branch(read_only, 0, 0), branch(named(&log, "rw"), 0, 1)];

        let remaining = DefaultPhaseExecutor::new(false).prepare(&branches).unwrap();
        assert_eq!(names_of(&remaining), BTreeSet::from(["rw".to_string()]));
    }

    #[test]
    fn prepare_attempts_every_branch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bad = Scripted {
            prepare: Some(XA_RBROLLBACK),
            ..named(&log, "bad")
        };
        let branches = vec![branch(bad, 0, 0), branch(named(&log, "good"), 0, 1)];

        let err = DefaultPhaseExecutor::new(false).prepare(&branches).unwrap_err();
        assert!(err.is_rollback());
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].unique_name, "bad");
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn commit_failures_are_classified() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let executor = DefaultPhaseExecutor::new(false);

        let rolled = || Scripted {
            commit: Some(XA_RBROLLBACK),
            ..named(&log, "only")
        };
        let err = executor.commit(&[branch(rolled(), 0, 0)], true).unwrap_err();
        assert!(err.is_rollback());

        let err = executor.commit(&[branch(rolled(), 0, 0)], false).unwrap_err();
        assert!(matches!(err, TmError::HeuristicRollback { .. }));

        let failing = Scripted {
            commit: Some(XAER_RMERR),
            ..named(&log, "broken")
        };
        let err = executor
            .commit(&[branch(named(&log, "ok"), 0, 0), branch(failing, 0, 1)], false)
            .unwrap_err();
        assert!(matches!(err, TmError::HeuristicMixed { .. }));
        assert_eq!(err.failures()[0].unique_name, "broken");

        let heurcom = Scripted {
            commit: Some(XA_HEURCOM),
            ..named(&log, "heurcom")
        };
        executor.commit(&[branch(heurcom, 0, 0)], false).unwrap();
    }

    #[test]
    fn rollback_failures_are_classified() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let executor = DefaultPhaseExecutor::new(false);
        let failing = |name: &str, code: i32| Scripted {
            rollback: Some(code),
            ..named(&log, name)
        };

        executor
            .rollback(&[branch(failing("a", XAER_NOTA), 0, 0), branch(failing("b", XA_HEURRB), 0, 1)])
            .unwrap();

        let err = executor.rollback(&[branch(failing("c", XA_HEURCOM), 0, 0)]).unwrap_err();
        assert!(matches!(err, TmError::HeuristicCommit { .. }));

        let err = executor
            .rollback(&[branch(failing("d", XA_HEURCOM), 0, 0), branch(named(&log, "e"), 0, 1)])
            .unwrap_err();
        assert!(matches!(err, TmError::HeuristicMixed { .. }));

        let err = executor.rollback(&[branch(failing("f", XAER_RMERR), 0, 0)]).unwrap_err();
        assert!(matches!(err, TmError::System { .. }));
        assert!(err.to_string().contains("transaction partly failed during rollback"));
    }

    #[test]
    fn asynchronous_mode_keeps_groups_sequential() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let branches: Vec<_> = (0..4)
            .map(|i: i32| branch(named(&log, &format!("r{i}")), i / 2, i as usize))
            .collect();
        DefaultPhaseExecutor::new(true).commit(&branches, false).unwrap();

        let log = log.lock();
        assert_eq!(log.len(), 4);
        let at = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        assert!(at("commit r0") < at("commit r2"));
        assert!(at("commit r1") < at("commit r3"));
    }
}
