//! Dump command implementation.

use super::open_journal;
use serde::Serialize;
use std::path::Path;
use xatm_journal::{read_records, JournalRecord, JournalResult, ScanOptions};
use xatm_storage::StorageBackend;

/// Journal record representation for output.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Sequence number assigned when the record was logged.
    pub sequence: u64,
    /// Transaction status.
    pub status: String,
    /// GTRID, hex-encoded.
    pub gtrid: String,
    /// Resources the status applies to.
    pub unique_names: Vec<String>,
    /// Creation time in ms since the epoch.
    pub time: i64,
    /// Re-appended by a rollover.
    pub rolled_over: bool,
    /// Checksum matched.
    pub valid: bool,
}

impl From<&JournalRecord> for RecordInfo {
    fn from(record: &JournalRecord) -> Self {
        Self {
            sequence: record.sequence(),
            status: record.status().to_string(),
            gtrid: record.gtrid().to_string(),
            unique_names: record.unique_names().iter().cloned().collect(),
            time: record.time(),
            rolled_over: record.is_rolled_over(),
            valid: record.is_valid(),
        }
    }
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    include_invalid: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_journal(path)?;
    let records = collect_records(&backend, limit, include_invalid)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records);
        }
    }

    Ok(())
}

/// Reads both generations, previous first.
pub fn collect_records(
    backend: &dyn StorageBackend,
    limit: Option<usize>,
    include_invalid: bool,
) -> JournalResult<Vec<RecordInfo>> {
    let options = ScanOptions {
        include_invalid,
        skip_corrupted: true,
    };
    let records = read_records(backend, options)?;
    Ok(records
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(RecordInfo::from)
        .collect())
}

fn print_text_output(records: &[RecordInfo]) {
    println!("Journal Records ({} total)", records.len());
    println!("================");
    println!();

    for record in records {
        print!("[{:08}] {:14} {}", record.sequence, record.status, record.gtrid);
        if !record.unique_names.is_empty() {
            print!(" resources={}", record.unique_names.join(","));
        }
        if record.rolled_over {
            print!(" (rolled over)");
        }
        if !record.valid {
            print!(" INVALID");
        }
        println!();
    }
}
