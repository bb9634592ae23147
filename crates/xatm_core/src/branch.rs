//! Transaction branches and the resource coordinator that manages them.

use crate::error::BranchFailure;
use crate::registry::ResourceRegistration;
use crate::xa::{XaFlag, XaResource, Xid};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use xatm_journal::Gtrid;

/// Association state of a branch with its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPhase {
    /// Started or resumed; work may be done.
    Active,
    /// Suspended with TMSUSPEND.
    Suspended,
    /// Ended with TMSUCCESS or TMFAIL.
    Ended,
}

/// One resource's share of a transaction.
pub struct Branch {
    resource: Arc<dyn XaResource>,
    registration: ResourceRegistration,
    xid: Xid,
    enlist_order: usize,
    phase: Mutex<BranchPhase>,
    failed: AtomicBool,
}

impl Branch {
    /// Creates a branch in the active phase.
    #[must_use]
    pub fn new(
        resource: Arc<dyn XaResource>,
        registration: ResourceRegistration,
        xid: Xid,
        enlist_order: usize,
    ) -> Self {
        Self {
            resource,
            registration,
            xid,
            enlist_order,
            phase: Mutex::new(BranchPhase::Active),
            failed: AtomicBool::new(false),
        }
    }

    /// The resource owning the branch.
    #[must_use]
    pub fn resource(&self) -> &dyn XaResource {
        self.resource.as_ref()
    }

    /// Unique name of the resource.
    #[must_use]
    pub fn unique_name(&self) -> &str {
        &self.registration.unique_name
    }

    /// Branch identifier.
    #[must_use]
    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    /// Two-phase commit ordering position of the resource.
    #[must_use]
    pub fn position(&self) -> i32 {
        self.registration.two_pc_ordering_position
    }

    /// Order of enlistment within the transaction.
    #[must_use]
    pub fn enlist_order(&self) -> usize {
        self.enlist_order
    }

    /// Current association state.
    #[must_use]
    pub fn phase(&self) -> BranchPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: BranchPhase) {
        *self.phase.lock() = phase;
    }

    /// Returns true if delisting the branch failed. Failed branches are not
    /// rolled back.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("unique_name", &self.unique_name())
            .field("xid", &self.xid)
            .field("position", &self.position())
            .field("enlist_order", &self.enlist_order)
            .field("phase", &self.phase())
            .field("failed", &self.is_failed())
            .finish()
    }
}

/// Tracks the branches of one transaction and drives `start`/`end` on them.
pub trait ResourceCoordinator: Send + Sync {
    /// Starts, joins or resumes a branch of `gtrid` on `resource`.
    ///
    /// # Errors
    ///
    /// Returns the resource's failure; the branch is then not enlisted.
    fn enlist(
        &self,
        resource: Arc<dyn XaResource>,
        registration: ResourceRegistration,
        gtrid: &Gtrid,
        deadline: Option<Instant>,
    ) -> Result<(), BranchFailure>;

    /// Ends every unended branch of the named resource with `flag`.
    /// Returns the failures; failing branches are marked failed.
    fn delist(&self, unique_name: &str, flag: XaFlag) -> Vec<BranchFailure>;

    /// Ends every unended branch with `flag`.
    fn delist_all(&self, flag: XaFlag) -> Vec<BranchFailure>;

    /// Suspends every active branch.
    fn suspend(&self) -> Vec<BranchFailure>;

    /// Resumes every suspended branch.
    fn resume(&self) -> Vec<BranchFailure>;

    /// Returns true if the named resource has a branch.
    fn is_enlisted(&self, unique_name: &str) -> bool;

    /// Unique names of every enlisted resource.
    fn unique_names(&self) -> BTreeSet<String>;

    /// Branches belonging to `gtrid`, in enlistment order.
    fn branches(&self, gtrid: &Gtrid) -> Vec<Arc<Branch>>;

    /// Number of branches.
    fn len(&self) -> usize;

    /// Returns true if no branch exists.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every branch.
    fn clear(&self);
}

/// Default [`ResourceCoordinator`].
///
/// Re-enlisting a resource whose branch is still active is a no-op, a
/// suspended branch is resumed, and an ended branch is joined with TMJOIN
/// when the registration allows it. Otherwise a new branch is started.
#[derive(Debug, Default)]
pub struct BranchManager {
    branches: Mutex<Vec<Arc<Branch>>>,
}

impl BranchManager {
    /// Creates a manager without branches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn latest_branch(&self, unique_name: &str, gtrid: &Gtrid) -> Option<Arc<Branch>> {
        self.branches
            .lock()
            .iter()
            .rev()
            .find(|branch| branch.unique_name() == unique_name && branch.xid().gtrid() == gtrid)
            .cloned()
    }

    fn end_branches<P>(&self, flag: XaFlag, select: P) -> Vec<BranchFailure>
    where
        P: Fn(&Branch) -> bool,
    {
        let targets: Vec<Arc<Branch>> = self
            .branches
            .lock()
            .iter()
            .filter(|branch| select(branch))
            .cloned()
            .collect();

        let mut failures = Vec::new();
        for branch in targets {
            match branch.resource().end(branch.xid(), flag) {
                Ok(()) => {
                    debug!(resource = branch.unique_name(), xid = %branch.xid(), %flag, "branch ended");
                    branch.set_phase(if flag == XaFlag::Suspend {
                        BranchPhase::Suspended
                    } else {
                        BranchPhase::Ended
                    });
                }
                Err(err) => {
                    warn!(resource = branch.unique_name(), xid = %branch.xid(), %flag, error = %err, "failed to end branch");
                    branch.mark_failed();
                    branch.set_phase(BranchPhase::Ended);
                    failures.push(BranchFailure::new(branch.unique_name(), err));
                }
            }
        }
        failures
    }
}

fn unended_for(flag: XaFlag, branch: &Branch) -> bool {
    match branch.phase() {
        BranchPhase::Active => true,
        BranchPhase::Suspended => flag != XaFlag::Suspend,
        BranchPhase::Ended => false,
    }
}

impl ResourceCoordinator for BranchManager {
    fn enlist(
        &self,
        resource: Arc<dyn XaResource>,
        registration: ResourceRegistration,
        gtrid: &Gtrid,
        deadline: Option<Instant>,
    ) -> Result<(), BranchFailure> {
        let unique_name = registration.unique_name.clone();

        if let Some(branch) = self.latest_branch(&unique_name, gtrid) {
            let flag = match branch.phase() {
                BranchPhase::Active => {
                    debug!(resource = %unique_name, "resource already enlisted");
                    return Ok(());
                }
                BranchPhase::Suspended => Some(XaFlag::Resume),
                BranchPhase::Ended if registration.use_tm_join && !branch.is_failed() => {
                    Some(XaFlag::Join)
                }
                BranchPhase::Ended => None,
            };
            if let Some(flag) = flag {
                resource
                    .start(branch.xid(), flag)
                    .map_err(|err| BranchFailure::new(&unique_name, err))?;
                branch.set_phase(BranchPhase::Active);
                debug!(resource = %unique_name, xid = %branch.xid(), %flag, "branch restarted");
                return Ok(());
            }
        }

        let xid = Xid::new_branch(gtrid.clone());
        if let Some(deadline) = deadline {
            let seconds = deadline
                .saturating_duration_since(Instant::now())
                .as_secs()
                .max(1);
            let seconds = u32::try_from(seconds).unwrap_or(u32::MAX);
            if let Err(err) = resource.set_transaction_timeout(seconds) {
                warn!(resource = %unique_name, error = %err, "cannot set branch timeout");
            }
        }
        resource
            .start(&xid, XaFlag::NoFlags)
            .map_err(|err| BranchFailure::new(&unique_name, err))?;

        let mut branches = self.branches.lock();
        let order = branches.len();
        debug!(resource = %unique_name, %xid, order, "branch started");
        branches.push(Arc::new(Branch::new(resource, registration, xid, order)));
        Ok(())
    }

    fn delist(&self, unique_name: &str, flag: XaFlag) -> Vec<BranchFailure> {
        self.end_branches(flag, |branch| {
            branch.unique_name() == unique_name && unended_for(flag, branch)
        })
    }

    fn delist_all(&self, flag: XaFlag) -> Vec<BranchFailure> {
        self.end_branches(flag, |branch| unended_for(flag, branch))
    }

    fn suspend(&self) -> Vec<BranchFailure> {
        self.end_branches(XaFlag::Suspend, |branch| branch.phase() == BranchPhase::Active)
    }

    fn resume(&self) -> Vec<BranchFailure> {
        let suspended: Vec<Arc<Branch>> = self
            .branches
            .lock()
            .iter()
            .filter(|branch| branch.phase() == BranchPhase::Suspended)
            .cloned()
            .collect();

        let mut failures = Vec::new();
        for branch in suspended {
            match branch.resource().start(branch.xid(), XaFlag::Resume) {
                Ok(()) => branch.set_phase(BranchPhase::Active),
                Err(err) => failures.push(BranchFailure::new(branch.unique_name(), err)),
            }
        }
        failures
    }

    fn is_enlisted(&self, unique_name: &str) -> bool {
        self.branches
            .lock()
            .iter()
            .any(|branch| branch.unique_name() == unique_name)
    }

    fn unique_names(&self) -> BTreeSet<String> {
        self.branches
            .lock()
            .iter()
            .map(|branch| branch.unique_name().to_string())
            .collect()
    }

    fn branches(&self, gtrid: &Gtrid) -> Vec<Arc<Branch>> {
        self.branches
            .lock()
            .iter()
            .filter(|branch| branch.xid().gtrid() == gtrid)
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.branches.lock().len()
    }

    fn clear(&self) {
        self.branches.lock().clear();
    }
}
