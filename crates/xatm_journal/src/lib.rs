//! # xatm Journal
//!
//! Write-ahead journal of transaction status changes.
//!
//! Every status change of a distributed transaction is appended as a framed,
//! CRC-protected record. A single writer thread batches records, writes them
//! and syncs the file; callers that need durability block in
//! [`Journal::force`] until their records are on stable storage.
//!
//! ## Architecture
//!
//! ```text
//! log() ──► AppendQueue ──► writer thread ──► JournalFile ──► StorageBackend
//!   │        (sequence)         │                 (header, generations)
//!   │                           └──► ForceSynchronizer ◄── force()
//!   └──► TrackedTransactions (unfinished, dangling, carry-forward)
//! ```
//!
//! ## Generations
//!
//! The file is circular in spirit. When a batch no longer fits, the journal
//! rolls over: the current generation becomes the previous one, writing
//! restarts after the header, and every unfinished transaction is re-appended
//! so its latest status survives the next rollover too.
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeSet;
//! use xatm_journal::{DiskJournal, Gtrid, Journal, JournalConfig, TxStatus};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let journal = DiskJournal::new(dir.path().join("xatm.journal"), JournalConfig::default());
//! journal.open().unwrap();
//!
//! let gtrid = Gtrid::generate(b"node-1");
//! journal.log(TxStatus::Active, &gtrid, &BTreeSet::new()).unwrap();
//! journal.force().unwrap();
//! journal.close().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod file;
mod force;
mod journal;
mod null;
mod pool;
mod queue;
mod record;
mod scan;
mod tracked;
mod types;
mod writer;

pub use config::JournalConfig;
pub use error::{JournalError, JournalResult};
pub use file::{read_records, JournalFile, JournalHeader, FILLER_BYTE, HEADER_SIZE};
pub use force::{FailedRange, ForceOutcome, ForceSynchronizer};
pub use journal::{DiskJournal, Journal, JournalStats, WRITER_THREAD_NAME};
pub use null::NullJournal;
pub use pool::BufferPool;
pub use queue::{AppendQueue, PendingRecord};
pub use record::{
    compute_crc32, now_millis, JournalRecord, RECORD_HEADER_SIZE, RECORD_OVERHEAD, RECORD_TRAILER_SIZE,
};
pub use scan::{GenerationScanner, PartialReason, RecordIterator, ScanOptions, ScanOutcome};
pub use tracked::TrackedTransactions;
pub use types::{Gtrid, TxStatus, MAX_GTRID_SIZE};
