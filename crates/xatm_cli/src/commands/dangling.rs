//! Dangling command implementation.

use super::dump::RecordInfo;
use super::open_journal;
use std::path::Path;
use xatm_journal::{read_records, JournalResult, ScanOptions, TrackedTransactions};
use xatm_storage::StorageBackend;

/// Runs the dangling command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_journal(path)?;
    let dangling = collect_dangling(&backend)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&dangling)?);
        }
        _ => {
            println!("Dangling Transactions ({} total)", dangling.len());
            println!("=====================");
            for record in &dangling {
                println!(
                    "{} {} resources={}",
                    record.gtrid,
                    record.status,
                    record.unique_names.join(",")
                );
            }
        }
    }

    Ok(())
}

/// Replays the journal the way opening it does and returns the transactions
/// left in COMMITTING or ROLLING_BACK, oldest first.
pub fn collect_dangling(backend: &dyn StorageBackend) -> JournalResult<Vec<RecordInfo>> {
    let tracked = TrackedTransactions::new();
    for record in read_records(backend, ScanOptions::default())? {
        tracked.track(&record);
    }
    let mut dangling: Vec<_> = tracked.dangling().into_values().collect();
    dangling.sort_by_key(|record| record.sequence());
    Ok(dangling.iter().map(RecordInfo::from).collect())
}
