//! Generation scanning over a journal file.
//!
//! Records of one generation are located by searching for the record prefix
//! followed by that generation's delimiter, then confirmed by finding the
//! trailer and the same delimiter right after the payload. Records of other
//! generations are invisible to the scan.

use crate::error::{JournalError, JournalResult};
use crate::record::{
    compute_crc32, JournalRecord, DELIMITER_SIZE, RECORD_HEADER_SIZE, RECORD_OVERHEAD,
    RECORD_PREFIX, RECORD_SUFFIX, RECORD_TRAILER,
};
use std::fmt;
use tracing::{error, warn};
use uuid::Uuid;
use xatm_storage::StorageBackend;

/// Bytes read per search window.
const SCAN_WINDOW: usize = 64 * 1024;

const NEEDLE_SIZE: usize = RECORD_PREFIX.len() + DELIMITER_SIZE;

/// Why a record header could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialReason {
    /// The header or payload runs past the end of the scanned region.
    Truncated,
    /// The header suffix marker is missing.
    BadHeader,
    /// No matching trailer after the payload.
    MissingTrailer,
}

impl fmt::Display for PartialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => f.write_str("record runs past the end of the journal"),
            Self::BadHeader => f.write_str("record header is malformed"),
            Self::MissingTrailer => f.write_str("record trailer is missing"),
        }
    }
}

/// One step of a generation scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A complete record frame. The CRC has not been checked yet.
    Record {
        /// Offset of the record header.
        offset: u64,
        /// Payload length.
        length: u32,
        /// Stored CRC32 of the payload.
        crc: u32,
    },
    /// A record header without a complete frame behind it.
    Partial {
        /// Offset of the record header.
        offset: u64,
        /// What was wrong.
        reason: PartialReason,
    },
}

/// Scans a region of the journal for frames of one generation.
///
/// Reads are windowed, so scanning a large journal does not load it whole.
pub struct GenerationScanner<'a> {
    backend: &'a dyn StorageBackend,
    needle: [u8; NEEDLE_SIZE],
    trailer: [u8; NEEDLE_SIZE],
    position: u64,
    end: u64,
    resume_offset: u64,
    failed: bool,
}

impl<'a> GenerationScanner<'a> {
    /// Creates a scanner over `[start, end)` looking for `delimiter` frames.
    #[must_use]
    pub fn new(backend: &'a dyn StorageBackend, delimiter: Uuid, start: u64, end: u64) -> Self {
        let mut needle = [0u8; NEEDLE_SIZE];
        needle[..RECORD_PREFIX.len()].copy_from_slice(&RECORD_PREFIX);
        needle[RECORD_PREFIX.len()..].copy_from_slice(delimiter.as_bytes());

        let mut trailer = [0u8; NEEDLE_SIZE];
        trailer[..RECORD_TRAILER.len()].copy_from_slice(&RECORD_TRAILER);
        trailer[RECORD_TRAILER.len()..].copy_from_slice(delimiter.as_bytes());

        Self {
            backend,
            needle,
            trailer,
            position: start,
            end,
            resume_offset: start,
            failed: false,
        }
    }

    /// Offset just past the last complete record seen so far.
    ///
    /// After a full scan of the current generation this is where the next
    /// write goes.
    #[must_use]
    pub fn resume_offset(&self) -> u64 {
        self.resume_offset
    }

    fn find_needle(&mut self) -> JournalResult<Option<u64>> {
        while self.position + NEEDLE_SIZE as u64 <= self.end {
            let len = (self.end - self.position).min(SCAN_WINDOW as u64) as usize;
            let window = self.backend.read_at(self.position, len)?;
            if let Some(index) = window
                .windows(NEEDLE_SIZE)
                .position(|candidate| candidate == self.needle)
            {
                return Ok(Some(self.position + index as u64));
            }
            if self.position + len as u64 >= self.end {
                self.position = self.end;
                break;
            }
            // Overlap windows so a needle straddling the boundary is found.
            self.position += (len - (NEEDLE_SIZE - 1)) as u64;
        }
        Ok(None)
    }

    fn partial(&mut self, offset: u64, reason: PartialReason) -> ScanOutcome {
        self.position = offset + 1;
        ScanOutcome::Partial { offset, reason }
    }

    fn scan_one(&mut self) -> JournalResult<Option<ScanOutcome>> {
        let Some(offset) = self.find_needle()? else {
            return Ok(None);
        };

        let available = self.end - offset;
        if available < RECORD_OVERHEAD as u64 {
            return Ok(Some(self.partial(offset, PartialReason::Truncated)));
        }

        let header = self.backend.read_at(offset, RECORD_HEADER_SIZE)?;
        let length = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
        let crc = u32::from_le_bytes([header[24], header[25], header[26], header[27]]);
        if header[28..30] != RECORD_SUFFIX {
            return Ok(Some(self.partial(offset, PartialReason::BadHeader)));
        }

        let frame_len = RECORD_OVERHEAD as u64 + u64::from(length);
        if frame_len > available {
            return Ok(Some(self.partial(offset, PartialReason::Truncated)));
        }

        let trailer_offset = offset + RECORD_HEADER_SIZE as u64 + u64::from(length);
        let trailer = self.backend.read_at(trailer_offset, NEEDLE_SIZE)?;
        if trailer != self.trailer {
            return Ok(Some(self.partial(offset, PartialReason::MissingTrailer)));
        }

        self.position = offset + frame_len;
        self.resume_offset = self.position;
        Ok(Some(ScanOutcome::Record {
            offset,
            length,
            crc,
        }))
    }
}

impl Iterator for GenerationScanner<'_> {
    type Item = JournalResult<ScanOutcome>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.scan_one() {
            Ok(outcome) => outcome.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// How a [`RecordIterator`] treats records failing their CRC check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// Yield invalid records with `is_valid() == false`.
    pub include_invalid: bool,
    /// Skip invalid records (after logging them) instead of failing.
    pub skip_corrupted: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include_invalid: false,
            skip_corrupted: true,
        }
    }
}

/// Lazily decodes the records of one generation.
pub struct RecordIterator<'a> {
    scanner: GenerationScanner<'a>,
    backend: &'a dyn StorageBackend,
    options: ScanOptions,
}

impl<'a> RecordIterator<'a> {
    /// Creates an iterator over the `delimiter` generation in `[start, end)`.
    #[must_use]
    pub fn new(
        backend: &'a dyn StorageBackend,
        delimiter: Uuid,
        start: u64,
        end: u64,
        options: ScanOptions,
    ) -> Self {
        Self {
            scanner: GenerationScanner::new(backend, delimiter, start, end),
            backend,
            options,
        }
    }

    fn read_record(&self, offset: u64, length: u32, crc: u32) -> JournalResult<Option<JournalRecord>> {
        let payload = self
            .backend
            .read_at(offset + RECORD_HEADER_SIZE as u64, length as usize)?;

        let valid = compute_crc32(&payload) == crc;
        if !valid {
            error!(offset, stored_crc = crc, "journal record failed its CRC check");
            if self.options.include_invalid {
                return match JournalRecord::decode_payload(&payload, false) {
                    Ok(record) => Ok(Some(record)),
                    Err(err) => {
                        error!(offset, error = %err, "invalid journal record cannot be decoded");
                        Ok(None)
                    }
                };
            }
            if self.options.skip_corrupted {
                return Ok(None);
            }
            return Err(JournalError::corruption(format!(
                "record at offset {offset} failed its CRC check"
            )));
        }

        match JournalRecord::decode_payload(&payload, true) {
            Ok(record) => Ok(Some(record)),
            Err(err) if self.options.skip_corrupted => {
                error!(offset, error = %err, "skipping undecodable journal record");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

impl Iterator for RecordIterator<'_> {
    type Item = JournalResult<JournalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.scanner.next()? {
                Err(err) => return Some(Err(err)),
                Ok(ScanOutcome::Partial { offset, reason }) => {
                    warn!(offset, %reason, "skipping partial journal record");
                }
                Ok(ScanOutcome::Record {
                    offset,
                    length,
                    crc,
                }) => match self.read_record(offset, length, crc) {
                    Ok(Some(record)) => return Some(Ok(record)),
                    Ok(None) => {}
                    Err(err) => return Some(Err(err)),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::frame_into;
    use crate::types::{Gtrid, TxStatus};
    use std::collections::BTreeSet;
    use xatm_storage::InMemoryBackend;

    const START: u64 = 64;

    fn framed(delimiter: &Uuid, sequence: u64) -> Vec<u8> {
        let record = JournalRecord::new(
            TxStatus::Active,
            Gtrid::from_bytes(format!("tx-{sequence}").into_bytes()),
            BTreeSet::new(),
            sequence,
        );
        let payload = record.encode_payload().unwrap();
        let mut out = Vec::new();
        frame_into(&mut out, delimiter, &payload, compute_crc32(&payload));
        out
    }

    fn image(chunks: &[Vec<u8>], size: usize) -> InMemoryBackend {
        let mut data = vec![0u8; START as usize];
        for chunk in chunks {
            data.extend_from_slice(chunk);
        }
        data.resize(size, 0);
        InMemoryBackend::with_data(data)
    }

    #[test]
    fn finds_records_of_one_generation_only() {
        let current = Uuid::new_v4();
        let other = Uuid::new_v4();
        let backend = image(
            &[framed(&current, 1), framed(&other, 2), framed(&current, 3)],
            4096,
        );

        let records: Vec<_> = RecordIterator::new(&backend, current, START, 4096, ScanOptions::default())
            .collect::<JournalResult<_>>()
            .unwrap();
        let sequences: Vec<u64> = records.iter().map(JournalRecord::sequence).collect();
        assert_eq!(sequences, vec![1, 3]);
    }

    #[test]
    fn resume_offset_follows_last_complete_record() {
        let current = Uuid::new_v4();
        let first = framed(&current, 1);
        let second = framed(&current, 2);
        let expected = START + (first.len() + second.len()) as u64;
        let backend = image(&[first, second], 4096);

        let mut scanner = GenerationScanner::new(&backend, current, START, 4096);
        assert_eq!(scanner.by_ref().count(), 2);
        assert_eq!(scanner.resume_offset(), expected);
    }

    #[test]
    fn torn_record_is_reported_partial() {
        let current = Uuid::new_v4();
        let complete = framed(&current, 1);
        let mut torn = framed(&current, 2);
        let tail = torn.len() - 10;
        torn[tail..].fill(0);
        let resume = START + complete.len() as u64;
        let backend = image(&[complete, torn], 4096);

        let mut scanner = GenerationScanner::new(&backend, current, START, 4096);
        let outcomes: Vec<_> = scanner.by_ref().map(Result::unwrap).collect();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], ScanOutcome::Record { .. }));
        assert_eq!(
            outcomes[1],
            ScanOutcome::Partial {
                offset: resume,
                reason: PartialReason::MissingTrailer
            }
        );
        assert_eq!(scanner.resume_offset(), resume);
    }

    #[test]
    fn record_cut_by_end_of_region_is_truncated() {
        let current = Uuid::new_v4();
        let record = framed(&current, 1);
        let end = START + record.len() as u64 - 1;
        let backend = image(&[record], end as usize);

        let outcomes: Vec<_> = GenerationScanner::new(&backend, current, START, end)
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            outcomes,
            vec![ScanOutcome::Partial {
                offset: START,
                reason: PartialReason::Truncated
            }]
        );
    }

    #[test]
    fn record_straddling_scan_window_is_found() {
        let current = Uuid::new_v4();
        let padding = vec![0u8; SCAN_WINDOW - 10];
        let size = START as usize + SCAN_WINDOW * 2;
        let backend = image(&[padding, framed(&current, 9)], size);

        let records: Vec<_> =
            RecordIterator::new(&backend, current, START, size as u64, ScanOptions::default())
                .collect::<JournalResult<_>>()
                .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence(), 9);
    }

    #[test]
    fn crc_mismatch_handling() {
        let current = Uuid::new_v4();
        let mut bad = framed(&current, 1);
        // Flip a bit in the sequence field of the payload.
        let sequence_offset = RECORD_HEADER_SIZE + 1 + "ACTIVE".len() + 1 + 4 + 8;
        bad[sequence_offset] ^= 0x01;
        let backend = image(&[bad, framed(&current, 2)], 4096);

        let skip = ScanOptions::default();
        let records: Vec<_> = RecordIterator::new(&backend, current, START, 4096, skip)
            .collect::<JournalResult<_>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence(), 2);

        let include = ScanOptions {
            include_invalid: true,
            skip_corrupted: true,
        };
        let records: Vec<_> = RecordIterator::new(&backend, current, START, 4096, include)
            .collect::<JournalResult<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records[0].is_valid());
        assert!(records[1].is_valid());

        let strict = ScanOptions {
            include_invalid: false,
            skip_corrupted: false,
        };
        let result: JournalResult<Vec<_>> =
            RecordIterator::new(&backend, current, START, 4096, strict).collect();
        assert!(matches!(result, Err(JournalError::Corruption { .. })));
    }
}
