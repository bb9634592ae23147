//! The `Journal` trait and its disk implementation.

use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::file::JournalFile;
use crate::force::ForceOutcome;
use crate::queue::PendingRecord;
use crate::record::{now_millis, JournalRecord, RECORD_OVERHEAD};
use crate::scan::ScanOptions;
use crate::tracked::TrackedTransactions;
use crate::types::{Gtrid, TxStatus};
use crate::writer::{self, WriterShared};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use xatm_storage::{FileBackend, InMemoryBackend, StorageBackend};

/// Name of the journal writer thread.
pub const WRITER_THREAD_NAME: &str = "xatm-journal-writer";

/// Durable log of transaction status changes.
///
/// `log` only enqueues; `force` blocks until everything the calling thread
/// logged is on stable storage. Implementations are shared between threads.
pub trait Journal: Send + Sync {
    /// Opens the journal and rebuilds its view of unfinished transactions.
    /// Opening an open journal does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be opened or is corrupted.
    fn open(&self) -> JournalResult<()>;

    /// Writes and forces everything pending, then closes the journal.
    /// Closing a closed journal does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the final force fails.
    fn close(&self) -> JournalResult<()>;

    /// Closes the journal, logging instead of returning errors.
    fn shutdown(&self);

    /// Records a status change of `gtrid` affecting `unique_names`.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is closed or the record is too large.
    fn log(
        &self,
        status: TxStatus,
        gtrid: &Gtrid,
        unique_names: &BTreeSet<String>,
    ) -> JournalResult<()>;

    /// Blocks until every record logged by the calling thread is durable.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::ForceFailed`] if the records could not be
    /// written or synced, and [`JournalError::Interrupted`] if the journal
    /// closed first.
    fn force(&self) -> JournalResult<()>;

    /// Transactions left in COMMITTING or ROLLING_BACK.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is closed.
    fn collect_dangling_records(&self) -> JournalResult<HashMap<Gtrid, JournalRecord>>;

    /// Latest record of every unfinished transaction, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is closed.
    fn unfinished_records(&self) -> JournalResult<Vec<JournalRecord>>;

    /// Copies every unfinished transaction into `other` and forces it.
    ///
    /// # Errors
    ///
    /// Returns the first error from reading this journal or writing `other`.
    fn migrate_to(&self, other: &dyn Journal) -> JournalResult<()> {
        let records = self.unfinished_records()?;
        for record in &records {
            other.log(record.status(), record.gtrid(), record.unique_names())?;
        }
        other.force()?;
        info!(records = records.len(), "migrated unfinished transactions");
        Ok(())
    }

    /// Appends every record on storage to `out`, bypassing the writer.
    ///
    /// Records still queued are not seen. Meant for tooling and tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is closed or the storage fails.
    fn unsafe_read_records_into(
        &self,
        out: &mut Vec<JournalRecord>,
        include_invalid: bool,
    ) -> JournalResult<()>;
}

type BackendOpener = dyn Fn() -> JournalResult<Box<dyn StorageBackend>> + Send + Sync;

struct OpenState {
    shared: Arc<WriterShared>,
    writer: Option<JoinHandle<()>>,
}

/// Point-in-time statistics of an open [`DiskJournal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalStats {
    /// Write cursor.
    pub position: u64,
    /// File size.
    pub size: u64,
    /// Unfinished transactions.
    pub tracked: usize,
    /// Records waiting for the writer.
    pub queued: usize,
    /// Highest durable sequence.
    pub forced_sequence: u64,
}

/// A journal persisted through a [`StorageBackend`] by a dedicated writer
/// thread.
///
/// # Example
///
/// ```rust
/// use std::collections::BTreeSet;
/// use xatm_journal::{DiskJournal, Gtrid, Journal, JournalConfig, TxStatus};
/// use xatm_storage::InMemoryBackend;
///
/// let journal = DiskJournal::in_memory(InMemoryBackend::new(), JournalConfig::default());
/// journal.open().unwrap();
///
/// let gtrid = Gtrid::generate(b"node-1");
/// let names = BTreeSet::from(["db".to_string(), "queue".to_string()]);
/// journal.log(TxStatus::Committing, &gtrid, &names).unwrap();
/// journal.force().unwrap();
///
/// assert!(journal.collect_dangling_records().unwrap().contains_key(&gtrid));
/// journal.close().unwrap();
/// ```
pub struct DiskJournal {
    opener: Box<BackendOpener>,
    config: JournalConfig,
    state: RwLock<Option<OpenState>>,
}

impl std::fmt::Debug for DiskJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskJournal")
            .field("config", &self.config)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl DiskJournal {
    /// Creates a journal stored in the file at `path`.
    ///
    /// Nothing is touched until [`open`](Journal::open).
    #[must_use]
    pub fn new(path: impl AsRef<Path>, config: JournalConfig) -> Self {
        let path: PathBuf = path.as_ref().to_path_buf();
        Self::with_opener(config, move || {
            let backend = FileBackend::open_with_create_dirs(&path)?;
            Ok(Box::new(backend) as Box<dyn StorageBackend>)
        })
    }

    /// Creates a journal over shared in-memory storage. Reopening sees the
    /// same bytes.
    #[must_use]
    pub fn in_memory(backend: InMemoryBackend, config: JournalConfig) -> Self {
        Self::with_opener(config, move || {
            Ok(Box::new(backend.clone()) as Box<dyn StorageBackend>)
        })
    }

    /// Creates a journal whose storage is produced by `opener` at each open.
    #[must_use]
    pub fn with_opener<F>(config: JournalConfig, opener: F) -> Self
    where
        F: Fn() -> JournalResult<Box<dyn StorageBackend>> + Send + Sync + 'static,
    {
        Self {
            opener: Box::new(opener),
            config,
            state: RwLock::new(None),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Returns true between a successful open and close.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.read().is_some()
    }

    /// Statistics, or `None` when closed.
    #[must_use]
    pub fn stats(&self) -> Option<JournalStats> {
        let state = self.state.read();
        let shared = &state.as_ref()?.shared;
        let file = shared.file.lock();
        Some(JournalStats {
            position: file.position(),
            size: file.size(),
            tracked: shared.tracked.len(),
            queued: shared.queue.len(),
            forced_sequence: shared.sync.forced(),
        })
    }

    /// Rolls the journal over now, re-appending unfinished transactions.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is closed or the rollover fails.
    pub fn rollover(&self) -> JournalResult<()> {
        let shared = self.shared()?;
        let mut file = shared.file.lock();
        writer::roll_over(&shared, &mut file, 0)
    }

    fn shared(&self) -> JournalResult<Arc<WriterShared>> {
        self.state
            .read()
            .as_ref()
            .map(|state| Arc::clone(&state.shared))
            .ok_or(JournalError::NotOpen)
    }

    fn is_mandatory(status: TxStatus) -> bool {
        matches!(
            status,
            TxStatus::Committing | TxStatus::Committed | TxStatus::Unknown
        )
    }

    fn stop_writer(&self, shared: &WriterShared, handle: JoinHandle<()>) {
        shared.shutdown.store(true, Ordering::Release);
        shared.queue.wake();
        if self.wait_for_exit(&handle) {
            join_writer(handle);
            return;
        }

        warn!(
            queued = shared.queue.len(),
            "journal writer still busy after shutdown grace period, interrupting it"
        );
        shared.interrupted.store(true, Ordering::Release);
        shared.queue.wake();
        if self.wait_for_exit(&handle) {
            join_writer(handle);
        } else {
            error!("journal writer thread did not stop, leaving it behind");
        }
    }

    fn wait_for_exit(&self, handle: &JoinHandle<()>) -> bool {
        for _ in 0..self.config.shutdown_wait_cycles {
            if handle.is_finished() {
                return true;
            }
            thread::sleep(self.config.shutdown_wait_interval);
        }
        handle.is_finished()
    }
}

fn join_writer(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("journal writer thread panicked");
    }
}

impl Journal for DiskJournal {
    fn open(&self) -> JournalResult<()> {
        let mut state = self.state.write();
        if state.is_some() {
            debug!("journal already open");
            return Ok(());
        }
        self.config.validate()?;

        let file = JournalFile::open((self.opener)()?, self.config.initial_size)?;
        let tracked = TrackedTransactions::new();
        let options = ScanOptions {
            include_invalid: false,
            skip_corrupted: self.config.skip_corrupted_logs,
        };
        let mut last_sequence = 0;
        let mut records = 0usize;
        for record in file.read_all(options) {
            let record = record?;
            last_sequence = last_sequence.max(record.sequence());
            tracked.track(&record);
            records += 1;
        }

        let purged = tracked.purge_expired(now_millis(), self.config.max_transaction_lifetime);
        let dangling = tracked.dangling().len();
        info!(
            records,
            tracked = tracked.len(),
            dangling,
            purged,
            last_sequence,
            "journal recovered"
        );

        let shared = Arc::new(WriterShared::new(
            file,
            tracked,
            last_sequence,
            self.config.clone(),
        ));
        let writer = thread::Builder::new()
            .name(WRITER_THREAD_NAME.to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || writer::run(shared)
            })?;

        *state = Some(OpenState {
            shared,
            writer: Some(writer),
        });
        Ok(())
    }

    fn close(&self) -> JournalResult<()> {
        let Some(mut open) = self.state.write().take() else {
            return Ok(());
        };
        if let Some(handle) = open.writer.take() {
            self.stop_writer(&open.shared, handle);
        }
        open.shared.sync.interrupt();
        let result = open.shared.file.lock().close();
        info!("journal closed");
        result
    }

    fn shutdown(&self) {
        if let Err(err) = self.close() {
            error!(error = %err, "error closing journal");
        }
    }

    fn log(
        &self,
        status: TxStatus,
        gtrid: &Gtrid,
        unique_names: &BTreeSet<String>,
    ) -> JournalResult<()> {
        let shared = self.shared()?;
        if self.config.filter_log_status && !Self::is_mandatory(status) {
            debug!(%gtrid, %status, "status filtered out of the journal");
            return Ok(());
        }

        let max = self.config.max_record_size;
        shared.queue.enqueue(|sequence| {
            let record = JournalRecord::new(status, gtrid.clone(), unique_names.clone(), sequence);
            let size = record.encoded_len() + RECORD_OVERHEAD;
            if size > max {
                return Err(JournalError::RecordTooLarge { size, max });
            }
            let pending = PendingRecord::encode(&shared.pool, &record)?;
            shared.tracked.track(&record);
            Ok((pending.payload, pending.crc))
        })?;

        if self.config.conservative_journaling {
            self.force()?;
        }
        Ok(())
    }

    fn force(&self) -> JournalResult<()> {
        let shared = self.shared()?;
        let Some(sequence) = shared.queue.take_thread_latest() else {
            return Ok(());
        };

        shared.pending_forces.fetch_add(1, Ordering::AcqRel);
        shared.queue.wake();
        let outcome = shared.sync.wait_for(sequence);
        shared.pending_forces.fetch_sub(1, Ordering::AcqRel);

        match outcome {
            ForceOutcome::Forced => Ok(()),
            ForceOutcome::Failed => Err(JournalError::ForceFailed { sequence }),
            ForceOutcome::Interrupted => Err(JournalError::Interrupted),
        }
    }

    fn collect_dangling_records(&self) -> JournalResult<HashMap<Gtrid, JournalRecord>> {
        Ok(self.shared()?.tracked.dangling())
    }

    fn unfinished_records(&self) -> JournalResult<Vec<JournalRecord>> {
        Ok(self.shared()?.tracked.unfinished())
    }

    fn unsafe_read_records_into(
        &self,
        out: &mut Vec<JournalRecord>,
        include_invalid: bool,
    ) -> JournalResult<()> {
        let shared = self.shared()?;
        let file = shared.file.lock();
        let options = ScanOptions {
            include_invalid,
            skip_corrupted: true,
        };
        for record in file.read_all(options) {
            out.push(record?);
        }
        Ok(())
    }
}

impl Drop for DiskJournal {
    fn drop(&mut self) {
        if self.is_open() {
            self.shutdown();
        }
    }
}
