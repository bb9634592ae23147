//! Verify command implementation.

use super::open_journal;
use std::path::Path;
use xatm_journal::{
    GenerationScanner, JournalHeader, JournalResult, RecordIterator, ScanOptions, ScanOutcome,
    HEADER_SIZE,
};
use xatm_storage::StorageBackend;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Complete frames found in both generations.
    pub records_checked: usize,
    /// Frames whose checksum matched.
    pub valid_records: usize,
    /// Frames whose checksum did not match.
    pub corrupt_records: usize,
    /// Record headers without a complete frame, e.g. a torn last write.
    pub partial_records: usize,
    /// Descriptions of every problem found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Partial frames are expected after a crash; only corruption fails.
    pub fn is_ok(&self) -> bool {
        self.corrupt_records == 0
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying journal at {:?}", path);
    println!();

    let backend = open_journal(path)?;
    let result = verify_journal(&backend)?;

    println!("Records checked: {}", result.records_checked);
    println!("Valid: {}", result.valid_records);
    println!("Corrupt: {}", result.corrupt_records);
    println!("Partial: {}", result.partial_records);
    for error in &result.errors {
        println!("  - {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Journal verification passed");
        Ok(())
    } else {
        println!("✗ Journal verification failed");
        Err("Verification failed".into())
    }
}

/// Scans both generations, checking framing and checksums.
pub fn verify_journal(backend: &dyn StorageBackend) -> JournalResult<VerifyResult> {
    let header = JournalHeader::read_from(backend)?;
    let size = backend.size()?;
    let mut result = VerifyResult::default();

    for (name, delimiter) in [("previous", header.previous), ("current", header.current)] {
        for outcome in GenerationScanner::new(backend, delimiter, HEADER_SIZE, size) {
            if let ScanOutcome::Partial { offset, reason } = outcome? {
                result.partial_records += 1;
                result
                    .errors
                    .push(format!("{name} generation: partial record at offset {offset}: {reason}"));
            }
        }

        let options = ScanOptions {
            include_invalid: true,
            skip_corrupted: true,
        };
        for record in RecordIterator::new(backend, delimiter, HEADER_SIZE, size, options) {
            let record = record?;
            result.records_checked += 1;
            if record.is_valid() {
                result.valid_records += 1;
            } else {
                result.corrupt_records += 1;
                result.errors.push(format!(
                    "{name} generation: checksum mismatch in record {} of {}",
                    record.sequence(),
                    record.gtrid()
                ));
            }
        }
    }

    Ok(result)
}
