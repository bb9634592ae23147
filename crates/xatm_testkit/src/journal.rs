//! A journal decorator that records calls and injects failures.

use crate::resources::EventLog;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use xatm_journal::{Gtrid, Journal, JournalError, JournalRecord, JournalResult, NullJournal, TxStatus};

/// One recorded `log` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedStatus {
    /// Status logged.
    pub status: TxStatus,
    /// Transaction it was logged for.
    pub gtrid: Gtrid,
    /// Resources named in the record.
    pub unique_names: BTreeSet<String>,
}

/// Wraps another journal, remembering every status logged and appending
/// `"log <STATUS>"` and `"force"` to an [`EventLog`].
pub struct RecordingJournal {
    inner: Arc<dyn Journal>,
    events: EventLog,
    logged: Mutex<Vec<LoggedStatus>>,
    fail_log: AtomicBool,
    fail_force: AtomicBool,
}

impl RecordingJournal {
    /// Records calls made to `inner`.
    pub fn new(inner: Arc<dyn Journal>, events: EventLog) -> Self {
        Self {
            inner,
            events,
            logged: Mutex::new(Vec::new()),
            fail_log: AtomicBool::new(false),
            fail_force: AtomicBool::new(false),
        }
    }

    /// Records calls without any durable storage behind them.
    pub fn null(events: EventLog) -> Self {
        Self::new(Arc::new(NullJournal::new()), events)
    }

    /// Every status logged so far.
    pub fn logged(&self) -> Vec<LoggedStatus> {
        self.logged.lock().clone()
    }

    /// Statuses logged for `gtrid`, in order.
    pub fn statuses_of(&self, gtrid: &Gtrid) -> Vec<TxStatus> {
        self.logged
            .lock()
            .iter()
            .filter(|entry| &entry.gtrid == gtrid)
            .map(|entry| entry.status)
            .collect()
    }

    /// Makes subsequent `log` calls fail with an I/O error.
    pub fn fail_log(&self, fail: bool) {
        self.fail_log.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `force` calls fail.
    pub fn fail_force(&self, fail: bool) {
        self.fail_force.store(fail, Ordering::SeqCst);
    }
}

impl Journal for RecordingJournal {
    fn open(&self) -> JournalResult<()> {
        self.inner.open()
    }

    fn close(&self) -> JournalResult<()> {
        self.inner.close()
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn log(&self, status: TxStatus, gtrid: &Gtrid, unique_names: &BTreeSet<String>) -> JournalResult<()> {
        if self.fail_log.load(Ordering::SeqCst) {
            return Err(JournalError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected log failure",
            )));
        }
        self.inner.log(status, gtrid, unique_names)?;
        self.events.push(format!("log {status}"));
        self.logged.lock().push(LoggedStatus {
            status,
            gtrid: gtrid.clone(),
            unique_names: unique_names.clone(),
        });
        Ok(())
    }

    fn force(&self) -> JournalResult<()> {
        if self.fail_force.load(Ordering::SeqCst) {
            return Err(JournalError::ForceFailed { sequence: 0 });
        }
        self.inner.force()?;
        self.events.push("force");
        Ok(())
    }

    fn collect_dangling_records(&self) -> JournalResult<HashMap<Gtrid, JournalRecord>> {
        self.inner.collect_dangling_records()
    }

    fn unfinished_records(&self) -> JournalResult<Vec<JournalRecord>> {
        self.inner.unfinished_records()
    }

    fn unsafe_read_records_into(&self, out: &mut Vec<JournalRecord>, include_invalid: bool) -> JournalResult<()> {
        self.inner.unsafe_read_records_into(out, include_invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_forwards() {
        let events = EventLog::new();
        let journal = RecordingJournal::null(events.clone());
        let gtrid = Gtrid::from_bytes(b"rec".to_vec());

        journal.log(TxStatus::Active, &gtrid, &BTreeSet::new()).unwrap();
        journal.force().unwrap();

        assert_eq!(journal.statuses_of(&gtrid), vec![TxStatus::Active]);
        assert_eq!(events.events(), vec!["log ACTIVE", "force"]);
    }

    #[test]
    fn injected_failures() {
        let journal = RecordingJournal::null(EventLog::new());
        let gtrid = Gtrid::from_bytes(b"rec".to_vec());

        journal.fail_log(true);
        assert!(journal.log(TxStatus::Active, &gtrid, &BTreeSet::new()).is_err());
        journal.fail_force(true);
        assert!(matches!(journal.force(), Err(JournalError::ForceFailed { .. })));
        assert!(journal.logged().is_empty());
    }
}
