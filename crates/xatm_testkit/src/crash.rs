//! Crash images of a journal.
//!
//! A [`CrashImage`] is a copy of a journal's bytes taken as if the process
//! died at that moment. Records logged but not forced may be missing, and
//! the image can be damaged further before being reopened:
//!
//! 1. **Torn record** - the tail of the last record never reached the disk
//! 2. **Bit rot** - a payload byte flipped, the CRC no longer matches
//! 3. **Truncation** - the file is shorter than the journal believed
//!
//! ## Usage
//!
//! ```rust
//! use xatm_journal::Journal;
//! use xatm_testkit::{CrashImage, TestJournal};
//!
//! let journal = TestJournal::memory();
//! journal.open().unwrap();
//! let image = CrashImage::capture(&journal);
//! image.tear_last_record();
//! let recovered = image.open();
//! assert!(recovered.is_open());
//! ```

use crate::fixtures::TestJournal;
use xatm_journal::{
    DiskJournal, GenerationScanner, Journal, JournalConfig, JournalHeader, ScanOutcome,
    HEADER_SIZE, RECORD_HEADER_SIZE, RECORD_TRAILER_SIZE,
};
use xatm_storage::{InMemoryBackend, StorageBackend};

/// Location of a complete record frame in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLocation {
    /// Offset of the record header.
    pub offset: u64,
    /// Payload length.
    pub length: u32,
}

impl FrameLocation {
    /// Offset of the first payload byte.
    pub fn payload_offset(&self) -> u64 {
        self.offset + RECORD_HEADER_SIZE as u64
    }
}

/// Raw journal bytes that can be damaged and reopened.
#[derive(Debug, Clone)]
pub struct CrashImage {
    backend: InMemoryBackend,
    config: JournalConfig,
}

impl CrashImage {
    /// Copies the bytes of a memory-backed test journal as they are now.
    pub fn capture(journal: &TestJournal) -> Self {
        let backend = journal
            .backend()
            .expect("Crash images need a memory-backed journal");
        Self::from_bytes(backend.data(), journal.config().clone())
    }

    /// Wraps raw bytes.
    pub fn from_bytes(data: Vec<u8>, config: JournalConfig) -> Self {
        Self {
            backend: InMemoryBackend::with_data(data),
            config,
        }
    }

    /// The image's storage.
    pub fn backend(&self) -> &InMemoryBackend {
        &self.backend
    }

    /// Opens a journal over the image. Panics if the journal refuses it.
    pub fn open(&self) -> DiskJournal {
        let journal = self.journal();
        journal.open().expect("Failed to open crash image");
        journal
    }

    /// A journal over the image, not yet opened.
    pub fn journal(&self) -> DiskJournal {
        DiskJournal::in_memory(self.backend.clone(), self.config.clone())
    }

    /// Complete frames of the current generation, in file order.
    pub fn frames(&self) -> Vec<FrameLocation> {
        let header = JournalHeader::read_from(&self.backend).expect("Image has no journal header");
        let size = self.backend.size().expect("Failed to size image");
        GenerationScanner::new(&self.backend, header.current, HEADER_SIZE, size)
            .filter_map(|outcome| match outcome.expect("Failed to scan image") {
                ScanOutcome::Record { offset, length, .. } => Some(FrameLocation { offset, length }),
                ScanOutcome::Partial { .. } => None,
            })
            .collect()
    }

    /// Zeroes the second half of the last record, as if the write was torn.
    pub fn tear_last_record(&self) -> Option<FrameLocation> {
        let frame = *self.frames().last()?;
        let total = RECORD_HEADER_SIZE + frame.length as usize + RECORD_TRAILER_SIZE;
        let from = frame.offset as usize + total / 2;
        self.backend.corrupt(|data| {
            let end = (frame.offset as usize + total).min(data.len());
            data[from..end].fill(0);
        });
        Some(frame)
    }

    /// Flips one payload byte of the `index`-th record.
    pub fn flip_payload_byte(&self, index: usize) -> Option<FrameLocation> {
        let frame = *self.frames().get(index)?;
        let at = frame.payload_offset() as usize + frame.length as usize / 2;
        self.backend.corrupt(|data| data[at] ^= 0x40);
        Some(frame)
    }

    /// Cuts the image to `len` bytes.
    pub fn truncate(&self, len: usize) {
        self.backend.corrupt(|data| data.truncate(len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::fast_journal_config;
    use std::collections::BTreeSet;
    use xatm_journal::{Gtrid, JournalError, TxStatus};

    fn gtrid(name: &str) -> Gtrid {
        Gtrid::from_bytes(name.as_bytes().to_vec())
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|name| (*name).to_string()).collect()
    }

    /// T1 is in doubt, T2 finished.
    fn journal_with_two_transactions() -> TestJournal {
        let journal = TestJournal::memory();
        journal.open().unwrap();
        journal.log(TxStatus::Committing, &gtrid("t1"), &names(&["a", "b"])).unwrap();
        journal.log(TxStatus::Committing, &gtrid("t2"), &names(&["a", "b"])).unwrap();
        journal.log(TxStatus::Committed, &gtrid("t2"), &names(&["a", "b"])).unwrap();
        journal.force().unwrap();
        journal
    }

    #[test]
    fn forced_records_survive_a_crash() {
        let journal = journal_with_two_transactions();
        let image = CrashImage::capture(&journal);
        assert_eq!(image.frames().len(), 3);

        let recovered = image.open();
        let dangling = recovered.collect_dangling_records().unwrap();
        assert_eq!(dangling.len(), 1);
        assert!(dangling.contains_key(&gtrid("t1")));
    }

    #[test]
    fn torn_tail_record_is_ignored() {
        let journal = journal_with_two_transactions();
        let image = CrashImage::capture(&journal);
        image.tear_last_record().unwrap();
        assert_eq!(image.frames().len(), 2);

        // Without the COMMITTED record both transactions look in doubt.
        let recovered = image.open();
        assert_eq!(recovered.collect_dangling_records().unwrap().len(), 2);

        // Writing resumes where the torn record began.
        recovered.log(TxStatus::Committed, &gtrid("t1"), &names(&["a", "b"])).unwrap();
        recovered.force().unwrap();
        recovered.close().unwrap();
        assert_eq!(image.frames().len(), 3);
    }

    #[test]
    fn flipped_payload_is_skipped_or_refused() {
        let journal = journal_with_two_transactions();
        let image = CrashImage::capture(&journal);
        image.flip_payload_byte(2).unwrap();

        let recovered = image.open();
        assert_eq!(recovered.collect_dangling_records().unwrap().len(), 2);
        let mut all = Vec::new();
        recovered.unsafe_read_records_into(&mut all, true).unwrap();
        assert_eq!(all.iter().filter(|record| !record.is_valid()).count(), 1);
        recovered.close().unwrap();

        let strict = CrashImage::from_bytes(
            image.backend().data(),
            fast_journal_config().skip_corrupted_logs(false),
        );
        let result = strict.journal().open();
        assert!(matches!(result, Err(JournalError::Corruption { .. })));
    }

    #[test]
    fn truncated_image_reopens() {
        let journal = journal_with_two_transactions();
        let image = CrashImage::capture(&journal);
        let last = *image.frames().last().unwrap();
        image.truncate(last.offset as usize + 10);

        let recovered = image.open();
        assert_eq!(recovered.collect_dangling_records().unwrap().len(), 2);
        recovered.close().unwrap();
    }
}
