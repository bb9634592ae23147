//! Cross-crate integration test helpers.
//!
//! [`IntegrationHarness`] wires a transaction manager to a real
//! [`DiskJournal`](xatm_journal::DiskJournal) through a
//! [`RecordingJournal`], so journal records and resource calls land in one
//! ordered [`EventLog`].

use crate::crash::CrashImage;
use crate::fixtures::{fast_tm_config, TestJournal};
use crate::journal::RecordingJournal;
use crate::resources::{EventLog, MockXaResource};
use std::sync::Arc;
use xatm_core::{ResourceRegistration, TmConfig, TransactionManager};

/// A transaction manager over a recorded in-memory disk journal.
pub struct IntegrationHarness {
    /// The manager.
    pub manager: TransactionManager,
    /// The disk journal underneath the recorder.
    pub journal: TestJournal,
    /// The journal the manager writes through.
    pub recorder: Arc<RecordingJournal>,
    /// Resource calls, `"log <STATUS>"` and `"force"`, in order.
    pub events: EventLog,
}

impl IntegrationHarness {
    /// Creates a harness with test defaults.
    pub fn new() -> Self {
        Self::with_config(fast_tm_config())
    }

    /// Creates a harness with `config`.
    pub fn with_config(config: TmConfig) -> Self {
        let journal = TestJournal::memory();
        let events = EventLog::new();
        let recorder = Arc::new(RecordingJournal::new(journal.journal.clone(), events.clone()));
        let manager =
            TransactionManager::new(config, recorder.clone()).expect("Failed to start transaction manager");
        Self {
            manager,
            journal,
            recorder,
            events,
        }
    }

    /// Registers a resource and returns its mock.
    pub fn resource(&self, unique_name: &str) -> MockXaResource {
        self.resource_with(ResourceRegistration::new(unique_name))
    }

    /// Registers `registration` and returns a matching mock.
    pub fn resource_with(&self, registration: ResourceRegistration) -> MockXaResource {
        let resource = MockXaResource::new(&registration.unique_name, self.events.clone());
        self.manager
            .registry()
            .register(registration)
            .expect("Failed to register resource");
        resource
    }

    /// The journal bytes as a crash at this instant would leave them.
    pub fn crash(&self) -> CrashImage {
        CrashImage::capture(&self.journal)
    }

    /// Asserts that `first` happened before `then`, by event prefix.
    pub fn assert_before(&self, first: &str, then: &str) {
        let events = self.events.events();
        let a = self.events.position(first);
        let b = self.events.position(then);
        match (a, b) {
            (Some(a), Some(b)) => assert!(a < b, "expected {first:?} before {then:?} in {events:?}"),
            _ => panic!("expected both {first:?} and {then:?} in {events:?}"),
        }
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts a manager over a crash image, as a restarted process would.
pub fn restart_from(image: &CrashImage, config: TmConfig) -> TransactionManager {
    TransactionManager::new(config, Arc::new(image.journal())).expect("Failed to restart transaction manager")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::XaCall;
    use std::collections::BTreeSet;
    use std::thread;
    use std::time::{Duration, Instant};
    use xatm_core::{TmError, XaFlag, XAER_RMERR, XaResource};
    use xatm_journal::{Journal, TxStatus};

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|name| (*name).to_string()).collect()
    }

    #[test]
    fn committing_is_durable_before_any_commit() {
        let harness = IntegrationHarness::new();
        let a = harness.resource("a").shared();
        let b = harness.resource("b").shared();

        let transaction = harness.manager.begin().unwrap();
        transaction.enlist_resource(a).unwrap();
        transaction.enlist_resource(b).unwrap();
        transaction.commit().unwrap();

        harness.assert_before("log COMMITTING", "force");
        harness.assert_before("force", "commit");
        harness.assert_before("prepare b", "log COMMITTING");
        assert_eq!(
            harness.recorder.statuses_of(transaction.gtrid()),
            vec![
                TxStatus::Active,
                TxStatus::Preparing,
                TxStatus::Prepared,
                TxStatus::Committing,
                TxStatus::Committed,
            ]
        );

        // The forced COMMITTING record is on storage already.
        let stored = harness.journal.stored_records();
        assert!(stored
            .iter()
            .any(|record| record.gtrid() == transaction.gtrid() && record.status() == TxStatus::Committing));
    }

    #[test]
    fn delistment_failure_journals_a_rollback() {
        let harness = IntegrationHarness::new();
        let a = harness.resource("a").failing(XaCall::Rollback, XAER_RMERR).shared();
        let b = harness.resource("b").failing(XaCall::End, XAER_RMERR).shared();

        let transaction = harness.manager.begin().unwrap();
        transaction.enlist_resource(a).unwrap();
        transaction.enlist_resource(b).unwrap();
        let err = transaction.commit().unwrap_err();

        assert!(err.is_rollback());
        assert!(err
            .to_string()
            .starts_with("delistment error caused transaction rollback\n  resource(s) [b] could not be delisted"));
        let failed: BTreeSet<&str> = err
            .failures()
            .iter()
            .map(|failure| failure.unique_name.as_str())
            .collect();
        assert_eq!(failed, ["a", "b"].into_iter().collect());
        assert_eq!(
            harness.recorder.statuses_of(transaction.gtrid()),
            vec![
                TxStatus::Active,
                TxStatus::MarkedRollback,
                TxStatus::RollingBack,
                TxStatus::RolledBack,
            ]
        );
        assert_eq!(harness.events.matching("rollback"), vec!["rollback a"]);
        assert!(harness.events.matching("prepare").is_empty());
        assert_eq!(harness.manager.in_flight_count(), 0);
    }

    #[test]
    fn crash_after_committing_leaves_dangling_transaction() {
        let harness = IntegrationHarness::new();
        let a = harness.resource("a").commit_delay(Duration::from_millis(300)).shared();
        let b = harness.resource("b").commit_delay(Duration::from_millis(300)).shared();

        let transaction = harness.manager.begin().unwrap();
        transaction.enlist_resource(a).unwrap();
        transaction.enlist_resource(b).unwrap();
        let gtrid = transaction.gtrid().clone();

        let committer = thread::spawn(move || transaction.commit());
        let deadline = Instant::now() + Duration::from_secs(5);
        while harness.events.position("force").is_none() {
            assert!(Instant::now() < deadline, "COMMITTING was never forced");
            thread::sleep(Duration::from_millis(5));
        }
        let image = harness.crash();
        committer.join().unwrap().unwrap();

        let restarted = restart_from(&image, fast_tm_config());
        let dangling = restarted.dangling_transactions();
        assert_eq!(dangling.len(), 1);
        let record = &dangling[&gtrid];
        assert_eq!(record.status(), TxStatus::Committing);
        assert_eq!(record.unique_names(), &names(&["a", "b"]));
        restarted.shutdown();

        // The live journal saw the transaction through.
        assert!(harness.recorder.collect_dangling_records().unwrap().is_empty());
    }

    #[test]
    fn asynchronous_commit_overlaps_resources() {
        let delay = Duration::from_millis(200);
        let harness = IntegrationHarness::with_config(fast_tm_config().asynchronous_2pc(true));
        let resources: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|name| harness.resource(name).commit_delay(delay).shared())
            .collect();

        let transaction = harness.manager.begin().unwrap();
        for resource in &resources {
            transaction.enlist_resource(Arc::clone(resource) as Arc<dyn XaResource>).unwrap();
        }
        let start = Instant::now();
        transaction.commit().unwrap();

        assert!(start.elapsed() < delay * 3);
        assert_eq!(harness.events.matching("commit").len(), 3);
        assert_eq!(transaction.status(), TxStatus::Committed);
    }

    #[test]
    fn rejoining_an_ended_branch() {
        let harness = IntegrationHarness::new();
        let joined = harness
            .resource_with(ResourceRegistration::new("joined").use_tm_join(true))
            .shared();

        let transaction = harness.manager.begin().unwrap();
        transaction.enlist_resource(joined.clone()).unwrap();
        assert!(transaction.delist_resource(&*joined, XaFlag::Success).unwrap());
        transaction.enlist_resource(joined).unwrap();
        transaction.commit().unwrap();

        assert_eq!(harness.events.matching("join"), vec!["join joined"]);
        // Still one branch, so one-phase.
        assert_eq!(harness.events.matching("commit"), vec!["commit-1pc joined"]);
    }

    #[test]
    fn reenlisting_without_join_starts_a_new_branch() {
        let harness = IntegrationHarness::new();
        let db = harness.resource("db").shared();

        let transaction = harness.manager.begin().unwrap();
        transaction.enlist_resource(db.clone()).unwrap();
        transaction.delist_resource(&*db, XaFlag::Success).unwrap();
        transaction.enlist_resource(db).unwrap();
        transaction.commit().unwrap();

        assert_eq!(harness.events.matching("start"), vec!["start db", "start db"]);
        assert_eq!(harness.events.matching("prepare").len(), 2);
        assert_eq!(harness.events.matching("commit db").len(), 2);
    }

    #[test]
    fn suspend_and_resume() {
        let harness = IntegrationHarness::new();
        let db = harness.resource("db").shared();

        let transaction = harness.manager.begin().unwrap();
        transaction.enlist_resource(db).unwrap();
        transaction.suspend().unwrap();
        transaction.resume().unwrap();
        transaction.commit().unwrap();

        harness.assert_before("suspend db", "resume db");
        harness.assert_before("resume db", "end db");
        assert_eq!(transaction.status(), TxStatus::Committed);
    }

    #[test]
    fn journal_failure_is_fatal() {
        let harness = IntegrationHarness::new();
        let a = harness.resource("a").shared();
        let b = harness.resource("b").shared();

        let transaction = harness.manager.begin().unwrap();
        transaction.enlist_resource(a).unwrap();
        transaction.enlist_resource(b).unwrap();
        harness.recorder.fail_log(true);
        let err = transaction.commit().unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(err, TmError::Journal { .. }));
        assert!(harness.events.matching("commit").is_empty());
    }
}
