//! Index of transactions that have not reached a terminal status.

use crate::record::JournalRecord;
use crate::types::Gtrid;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

/// Latest journal record of every unfinished transaction.
///
/// Fed by every logged record and by the recovery scan at open. The writer
/// thread re-appends its content after each rollover.
#[derive(Debug, Default)]
pub struct TrackedTransactions {
    entries: DashMap<Gtrid, JournalRecord>,
}

impl TrackedTransactions {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one record to the index.
    ///
    /// A non-terminal status replaces the tracked record. A terminal status
    /// removes its unique names from the tracked record and drops the entry
    /// once no names remain. Inconsistent transitions are logged, not
    /// rejected.
    pub fn track(&self, record: &JournalRecord) {
        let status = record.status();
        if !status.is_tracked() && !status.is_terminal() {
            return;
        }

        match self.entries.entry(record.gtrid().clone()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get().status();
                if !status.may_follow(previous) {
                    warn!(
                        gtrid = %record.gtrid(),
                        %previous,
                        %status,
                        "unexpected transaction status transition in journal"
                    );
                }

                if status.is_tracked() {
                    entry.insert(record.clone());
                    return;
                }

                let remaining: BTreeSet<String> = entry
                    .get()
                    .unique_names()
                    .difference(record.unique_names())
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    entry.remove();
                } else {
                    debug!(
                        gtrid = %record.gtrid(),
                        remaining = remaining.len(),
                        "transaction still has unfinished resources"
                    );
                    let mut reduced = entry.get().clone();
                    reduced.set_unique_names(remaining);
                    entry.insert(reduced);
                }
            }
            Entry::Vacant(entry) => {
                if status.is_tracked() {
                    entry.insert(record.clone());
                } else {
                    debug!(
                        gtrid = %record.gtrid(),
                        %status,
                        "terminal status for a transaction that is not tracked"
                    );
                }
            }
        }
    }

    /// Drops entries older than `max_lifetime` relative to `now` (ms since
    /// the epoch). Returns the number purged.
    pub fn purge_expired(&self, now: i64, max_lifetime: Duration) -> usize {
        let lifetime = i64::try_from(max_lifetime.as_millis()).unwrap_or(i64::MAX);
        let mut purged = 0;
        self.entries.retain(|gtrid, record| {
            let expired = now.saturating_sub(record.time()) > lifetime;
            if expired {
                warn!(
                    %gtrid,
                    status = %record.status(),
                    age_ms = now.saturating_sub(record.time()),
                    "purging transaction that exceeded its maximum lifetime"
                );
                purged += 1;
            }
            !expired
        });
        purged
    }

    /// Tracked records ordered by sequence number.
    #[must_use]
    pub fn unfinished(&self) -> Vec<JournalRecord> {
        let mut records: Vec<JournalRecord> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(JournalRecord::sequence);
        records
    }

    /// Tracked transactions stuck in COMMITTING or ROLLING_BACK.
    #[must_use]
    pub fn dangling(&self) -> HashMap<Gtrid, JournalRecord> {
        self.entries
            .iter()
            .filter(|entry| entry.value().status().is_in_doubt())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Tracked record for `gtrid`.
    #[must_use]
    pub fn get(&self, gtrid: &Gtrid) -> Option<JournalRecord> {
        self.entries.get(gtrid).map(|entry| entry.value().clone())
    }

    /// Number of tracked transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets every tracked transaction.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
