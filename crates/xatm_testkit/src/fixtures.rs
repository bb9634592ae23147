//! Test fixtures: journals and transaction managers with automatic cleanup.

use crate::resources::{EventLog, MockXaResource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use xatm_core::{ResourceRegistration, TmConfig, TransactionManager};
use xatm_journal::{DiskJournal, Journal, JournalConfig, JournalRecord};
use xatm_storage::InMemoryBackend;

/// Journal settings for tests: small file, short write delay.
#[must_use]
pub fn fast_journal_config() -> JournalConfig {
    JournalConfig::new()
        .initial_size(16 * 1024)
        .max_record_size(4 * 1024)
        .write_delay(Duration::from_millis(5))
}

/// Manager settings for tests: short graceful shutdown, no zero-resource
/// warnings.
#[must_use]
pub fn fast_tm_config() -> TmConfig {
    TmConfig::new()
        .server_id("xatm-test")
        .graceful_shutdown_interval(Duration::from_millis(100))
        .warn_about_zero_resource_transactions(false)
}

/// A [`DiskJournal`] over temporary storage.
pub struct TestJournal {
    /// The journal, not yet opened.
    pub journal: Arc<DiskJournal>,
    memory: Option<InMemoryBackend>,
    temp_dir: Option<TempDir>,
}

impl TestJournal {
    /// A journal over shared in-memory bytes.
    pub fn memory() -> Self {
        Self::memory_with(fast_journal_config())
    }

    /// A journal over shared in-memory bytes with `config`.
    pub fn memory_with(config: JournalConfig) -> Self {
        let backend = InMemoryBackend::new();
        Self {
            journal: Arc::new(DiskJournal::in_memory(backend.clone(), config)),
            memory: Some(backend),
            temp_dir: None,
        }
    }

    /// A journal in a file inside a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("xatm.journal");
        Self {
            journal: Arc::new(DiskJournal::new(&path, fast_journal_config())),
            memory: None,
            temp_dir: Some(temp_dir),
        }
    }

    /// Journal file path, if file-based.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir
            .as_ref()
            .map(|dir| dir.path().join("xatm.journal"))
    }

    /// The in-memory storage, if memory-based.
    pub fn backend(&self) -> Option<&InMemoryBackend> {
        self.memory.as_ref()
    }

    /// A second journal over the same storage, as a restarted process
    /// would open it.
    pub fn reopen(&self) -> Arc<DiskJournal> {
        let config = self.journal.config().clone();
        match (&self.memory, self.path()) {
            (Some(backend), _) => Arc::new(DiskJournal::in_memory(backend.clone(), config)),
            (None, Some(path)) => Arc::new(DiskJournal::new(path, config)),
            (None, None) => unreachable!("test journal has neither memory nor file storage"),
        }
    }

    /// Every valid record currently on storage.
    pub fn stored_records(&self) -> Vec<JournalRecord> {
        let mut records = Vec::new();
        self.journal
            .unsafe_read_records_into(&mut records, false)
            .expect("Failed to read journal");
        records
    }
}

impl std::ops::Deref for TestJournal {
    type Target = DiskJournal;

    fn deref(&self) -> &Self::Target {
        &self.journal
    }
}

/// Runs `f` with an open in-memory journal, closing it afterwards.
pub fn with_temp_journal<F, R>(f: F) -> R
where
    F: FnOnce(&TestJournal) -> R,
{
    let journal = TestJournal::memory();
    journal.open().expect("Failed to open journal");
    let result = f(&journal);
    journal.close().expect("Failed to close journal");
    result
}

/// A transaction manager over a [`TestJournal`] with a shared [`EventLog`].
pub struct TestManager {
    /// The manager.
    pub manager: TransactionManager,
    /// Its journal.
    pub journal: TestJournal,
    /// Event log shared by every mock created through [`Self::resource`].
    pub events: EventLog,
}

impl TestManager {
    /// A manager over an in-memory journal.
    pub fn new() -> Self {
        Self::with_config(fast_tm_config())
    }

    /// A manager over an in-memory journal with `config`.
    pub fn with_config(config: TmConfig) -> Self {
        let journal = TestJournal::memory();
        let manager = TransactionManager::new(config, journal.journal.clone())
            .expect("Failed to start transaction manager");
        Self {
            manager,
            journal,
            events: EventLog::new(),
        }
    }

    /// Registers and returns a mock resource sharing the event log.
    pub fn resource(&self, unique_name: &str) -> MockXaResource {
        self.resource_with(ResourceRegistration::new(unique_name))
    }

    /// Registers `registration` and returns a matching mock resource.
    pub fn resource_with(&self, registration: ResourceRegistration) -> MockXaResource {
        let resource = MockXaResource::new(&registration.unique_name, self.events.clone());
        self.manager
            .registry()
            .register(registration)
            .expect("Failed to register resource");
        resource
    }
}

impl Default for TestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestManager {
    type Target = TransactionManager;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}
