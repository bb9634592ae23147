//! The journal file: header, write cursor, growth and rollover.
//!
//! ## Layout
//!
//! ```text
//! | header (64) | record | record | ... | free space filled with 0x00 |
//! ```
//!
//! The header names two generations. Records of the current generation are
//! appended at the cursor; records of the previous generation survive from
//! the last rollover until they are overwritten. Anything carrying another
//! delimiter is garbage.

use crate::error::{JournalError, JournalResult};
use crate::queue::PendingRecord;
use crate::record::{frame_into, JournalRecord, DELIMITER_SIZE};
use crate::scan::{GenerationScanner, RecordIterator, ScanOptions};
use tracing::{debug, info};
use uuid::Uuid;
use xatm_storage::StorageBackend;

/// Size of the file header.
pub const HEADER_SIZE: u64 = 64;

/// Marker opening the file header.
pub const HEADER_PREFIX: [u8; 16] = *b"XATM-JOURNAL-V1\n";

/// Marker closing the file header.
pub const HEADER_SUFFIX: [u8; 16] = *b"\n-END-OF-HEADER\n";

/// Byte written over free space at rollover.
pub const FILLER_BYTE: u8 = 0x00;

const FILL_CHUNK: usize = 64 * 1024;

/// The two generation delimiters stored in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    /// Generation before the last rollover.
    pub previous: Uuid,
    /// Generation new records are written with.
    pub current: Uuid,
}

impl JournalHeader {
    /// A header with two random delimiters.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            previous: Uuid::new_v4(),
            current: Uuid::new_v4(),
        }
    }

    /// The header after a rollover.
    #[must_use]
    pub fn rolled(&self) -> Self {
        Self {
            previous: self.current,
            current: Uuid::new_v4(),
        }
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE as usize);
        bytes.extend_from_slice(&HEADER_PREFIX);
        bytes.extend_from_slice(self.previous.as_bytes());
        bytes.extend_from_slice(self.current.as_bytes());
        bytes.extend_from_slice(&HEADER_SUFFIX);
        bytes
    }

    /// Decodes a header.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the markers are missing.
    pub fn decode(bytes: &[u8]) -> JournalResult<Self> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(JournalError::corruption(format!(
                "journal header needs {HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[..16] != HEADER_PREFIX || bytes[48..64] != HEADER_SUFFIX {
            return Err(JournalError::corruption("not a journal file: bad header markers"));
        }
        let previous = Uuid::from_slice(&bytes[16..16 + DELIMITER_SIZE])
            .map_err(|err| JournalError::corruption(format!("bad previous delimiter: {err}")))?;
        let current = Uuid::from_slice(&bytes[32..32 + DELIMITER_SIZE])
            .map_err(|err| JournalError::corruption(format!("bad current delimiter: {err}")))?;
        Ok(Self { previous, current })
    }

    /// Reads the header of an existing journal.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the storage is too small or the header
    /// is malformed, or a storage error if it cannot be read.
    pub fn read_from(backend: &dyn StorageBackend) -> JournalResult<Self> {
        let size = backend.size()?;
        if size < HEADER_SIZE {
            return Err(JournalError::corruption(format!(
                "journal of {size} bytes is too small to hold a header"
            )));
        }
        Self::decode(&backend.read_at(0, HEADER_SIZE as usize)?)
    }
}

/// Reads every record of both generations of a journal without modifying
/// it.
///
/// # Errors
///
/// Returns an error if the header is bad, the storage fails, or a corrupted
/// record is found and `options` does not skip it.
pub fn read_records(
    backend: &dyn StorageBackend,
    options: ScanOptions,
) -> JournalResult<Vec<JournalRecord>> {
    let header = JournalHeader::read_from(backend)?;
    let size = backend.size()?;
    generations(backend, header, size, options).collect()
}

fn generations(
    backend: &dyn StorageBackend,
    header: JournalHeader,
    size: u64,
    options: ScanOptions,
) -> impl Iterator<Item = JournalResult<JournalRecord>> + '_ {
    RecordIterator::new(backend, header.previous, HEADER_SIZE, size, options).chain(
        RecordIterator::new(backend, header.current, HEADER_SIZE, size, options),
    )
}

/// An open journal file.
pub struct JournalFile {
    backend: Box<dyn StorageBackend>,
    header: JournalHeader,
    position: u64,
    size: u64,
    dirty: bool,
}

impl std::fmt::Debug for JournalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalFile")
            .field("header", &self.header)
            .field("position", &self.position)
            .field("size", &self.size)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl JournalFile {
    /// Opens a journal on `backend`.
    ///
    /// Empty storage is preallocated to `initial_size` and given a fresh
    /// header. Otherwise the header is read and the current generation is
    /// scanned to find where the next record goes.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage fails or holds something that is not
    /// a journal.
    pub fn open(mut backend: Box<dyn StorageBackend>, initial_size: u64) -> JournalResult<Self> {
        let size = backend.size()?;
        if size == 0 {
            let header = JournalHeader::fresh();
            backend.grow(initial_size)?;
            backend.write_at(0, &header.encode())?;
            backend.sync()?;
            info!(size = initial_size, generation = %header.current, "created journal");
            return Ok(Self {
                backend,
                header,
                position: HEADER_SIZE,
                size: initial_size,
                dirty: false,
            });
        }

        let header = JournalHeader::read_from(backend.as_ref())?;
        let position = {
            let mut scanner =
                GenerationScanner::new(backend.as_ref(), header.current, HEADER_SIZE, size);
            for outcome in scanner.by_ref() {
                outcome?;
            }
            scanner.resume_offset()
        };
        info!(size, position, generation = %header.current, "opened journal");

        Ok(Self {
            backend,
            header,
            position,
            size,
            dirty: false,
        })
    }

    /// Frames `records` into one buffer and writes it at the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InsufficientCapacity`] if the records do not
    /// fit, or a storage error if the write fails. The cursor only moves on
    /// success.
    pub fn write(&mut self, records: &[PendingRecord]) -> JournalResult<()> {
        let required: u64 = records.iter().map(|r| r.framed_len() as u64).sum();
        let remaining = self.remaining_capacity();
        if required > remaining {
            return Err(JournalError::InsufficientCapacity {
                required,
                remaining,
            });
        }
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(required as usize);
        for record in records {
            frame_into(&mut buf, &self.header.current, &record.payload, record.crc);
        }
        self.backend.write_at(self.position, &buf)?;
        self.position += required;
        self.dirty = true;
        Ok(())
    }

    /// Starts a new generation.
    ///
    /// Free space after the cursor is overwritten with the filler byte, the
    /// current generation becomes the previous one and the cursor goes back
    /// to just after the header. The caller is expected to re-append the
    /// unfinished transactions.
    ///
    /// # Errors
    ///
    /// Returns a storage error if filling, writing the header or syncing
    /// fails.
    pub fn rollover(&mut self) -> JournalResult<()> {
        let mut offset = self.position;
        while offset < self.size {
            let len = (self.size - offset).min(FILL_CHUNK as u64) as usize;
            self.backend.write_at(offset, &vec![FILLER_BYTE; len])?;
            offset += len as u64;
        }

        let header = self.header.rolled();
        self.backend.write_at(0, &header.encode())?;
        self.backend.sync()?;

        info!(
            previous = %header.previous,
            current = %header.current,
            used = self.position,
            "journal rolled over"
        );
        self.header = header;
        self.position = HEADER_SIZE;
        self.dirty = false;
        Ok(())
    }

    /// Grows the file to `new_size`. Smaller sizes are ignored.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be extended.
    pub fn grow(&mut self, new_size: u64) -> JournalResult<()> {
        if new_size <= self.size {
            return Ok(());
        }
        self.backend.grow(new_size)?;
        debug!(from = self.size, to = new_size, "journal grown");
        self.size = new_size;
        Ok(())
    }

    /// Syncs the file if anything was written since the last force.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the sync fails; the file stays dirty.
    pub fn force(&mut self) -> JournalResult<()> {
        if self.dirty {
            self.backend.sync()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Forces outstanding writes before the file is dropped.
    ///
    /// # Errors
    ///
    /// See [`force`](Self::force).
    pub fn close(&mut self) -> JournalResult<()> {
        self.force()
    }

    /// Lazily reads the previous generation, then the current one.
    pub fn read_all(
        &self,
        options: ScanOptions,
    ) -> impl Iterator<Item = JournalResult<JournalRecord>> + '_ {
        generations(self.backend.as_ref(), self.header, self.size, options)
    }

    /// Bytes between the cursor and the end of the file.
    #[must_use]
    pub fn remaining_capacity(&self) -> u64 {
        self.size - self.position
    }

    /// Write cursor.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Logical file size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current header.
    #[must_use]
    pub fn header(&self) -> JournalHeader {
        self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::types::{Gtrid, TxStatus};
    use std::collections::BTreeSet;
    use xatm_storage::{FileBackend, InMemoryBackend};

    fn pending(status: TxStatus, gtrid: &str, sequence: u64) -> PendingRecord {
        let pool = BufferPool::new(1, 386);
        let record = JournalRecord::new(
            status,
            Gtrid::from_bytes(gtrid.as_bytes().to_vec()),
            BTreeSet::from(["db".to_string()]),
            sequence,
        );
        PendingRecord::encode(&pool, &record).unwrap()
    }

    fn open(backend: &InMemoryBackend, size: u64) -> JournalFile {
        JournalFile::open(Box::new(backend.clone()), size).unwrap()
    }

    fn statuses(file: &JournalFile) -> Vec<(TxStatus, u64)> {
        file.read_all(ScanOptions::default())
            .map(|r| r.map(|r| (r.status(), r.sequence())))
            .collect::<JournalResult<_>>()
            .unwrap()
    }

    #[test]
    fn header_round_trip() {
        let header = JournalHeader::fresh();
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE as usize);
        assert_eq!(JournalHeader::decode(&bytes).unwrap(), header);

        let mut bad = bytes;
        bad[0] = b'Y';
        assert!(matches!(JournalHeader::decode(&bad), Err(JournalError::Corruption { .. })));
    }

    #[test]
    fn create_preallocates_and_writes_header() {
        let backend = InMemoryBackend::new();
        let file = open(&backend, 4096);
        assert_eq!(file.size(), 4096);
        assert_eq!(file.position(), HEADER_SIZE);
        assert_eq!(backend.data().len(), 4096);
        assert_eq!(&backend.data()[..16], &HEADER_PREFIX);
    }

    #[test]
    fn reopen_resumes_after_last_record() {
        let backend = InMemoryBackend::new();
        let mut file = open(&backend, 4096);
        let records = [pending(TxStatus::Active, "t1", 1), pending(TxStatus::Active, "t2", 2)];
        file.write(&records).unwrap();
        file.force().unwrap();
        let position = file.position();
        drop(file);

        let file = open(&backend, 4096);
        assert_eq!(file.position(), position);
        assert_eq!(statuses(&file), vec![(TxStatus::Active, 1), (TxStatus::Active, 2)]);
    }

    #[test]
    fn write_fails_without_capacity() {
        let backend = InMemoryBackend::new();
        let mut file = open(&backend, HEADER_SIZE + 100);
        let record = pending(TxStatus::Committing, "t1", 1);
        let required = record.framed_len() as u64;
        assert!(required > 100);

        let err = file.write(&[record]).unwrap_err();
        assert!(matches!(
            err,
            JournalError::InsufficientCapacity { required: r, remaining: 100 } if r == required
        ));
        assert_eq!(file.position(), HEADER_SIZE);
    }

    #[test]
    fn rollover_keeps_previous_generation_readable() {
        let backend = InMemoryBackend::new();
        let mut file = open(&backend, 4096);
        file.write(&[pending(TxStatus::Active, "t1", 1)]).unwrap();
        let before = file.header();

        file.rollover().unwrap();
        assert_eq!(file.position(), HEADER_SIZE);
        assert_eq!(file.header().previous, before.current);
        assert_ne!(file.header().current, before.current);
        assert_eq!(statuses(&file), vec![(TxStatus::Active, 1)]);

        // A second rollover without re-appending forgets the record.
        file.rollover().unwrap();
        assert!(statuses(&file).is_empty());
    }

    #[test]
    fn rollover_fills_free_space() {
        let backend = InMemoryBackend::new();
        let mut file = open(&backend, 4096);
        backend.corrupt(|data| data[4000] = 0xAB);
        file.write(&[pending(TxStatus::Active, "t1", 1)]).unwrap();
        file.rollover().unwrap();
        assert_eq!(backend.data()[4000], FILLER_BYTE);
    }

    #[test]
    fn grow_extends_capacity() {
        let backend = InMemoryBackend::new();
        let mut file = open(&backend, 1024);
        file.grow(2048).unwrap();
        assert_eq!(file.size(), 2048);
        assert_eq!(file.remaining_capacity(), 2048 - HEADER_SIZE);
        file.grow(512).unwrap();
        assert_eq!(file.size(), 2048);
    }

    #[test]
    fn force_only_syncs_when_dirty() {
        let backend = InMemoryBackend::new();
        let mut file = open(&backend, 4096);
        let syncs = backend.sync_count();
        file.force().unwrap();
        assert_eq!(backend.sync_count(), syncs);

        file.write(&[pending(TxStatus::Active, "t1", 1)]).unwrap();
        file.force().unwrap();
        assert_eq!(backend.sync_count(), syncs + 1);
    }

    #[test]
    fn rejects_foreign_file() {
        let backend = InMemoryBackend::with_data(vec![7u8; 128]);
        let result = JournalFile::open(Box::new(backend), 4096);
        assert!(matches!(result, Err(JournalError::Corruption { .. })));
    }

    #[test]
    fn file_backed_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xatm.journal");
        {
            let backend = FileBackend::open(&path).unwrap();
            let mut file = JournalFile::open(Box::new(backend), 8192).unwrap();
            file.write(&[pending(TxStatus::Prepared, "t1", 4)]).unwrap();
            file.close().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        let file = JournalFile::open(Box::new(backend), 8192).unwrap();
        assert_eq!(file.size(), 8192);
        assert_eq!(
            file.position(),
            HEADER_SIZE + pending(TxStatus::Prepared, "t1", 4).framed_len() as u64
        );
        assert_eq!(statuses(&file), vec![(TxStatus::Prepared, 4)]);
    }
}
