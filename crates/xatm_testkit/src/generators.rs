//! Property-based test generators using proptest.
//!
//! Provides strategies for journal inputs that respect the record limits.

use proptest::prelude::*;
use std::collections::BTreeSet;
use xatm_journal::{Gtrid, JournalRecord, TxStatus, MAX_GTRID_SIZE};

/// Strategy for any transaction status.
pub fn status_strategy() -> impl Strategy<Value = TxStatus> {
    prop::sample::select(TxStatus::ALL.to_vec())
}

/// Strategy for GTRIDs of 1 to [`MAX_GTRID_SIZE`] bytes.
pub fn gtrid_strategy() -> impl Strategy<Value = Gtrid> {
    prop::collection::vec(any::<u8>(), 1..=MAX_GTRID_SIZE).prop_map(Gtrid::from_bytes)
}

/// Strategy for resource unique names.
pub fn unique_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("Invalid regex")
}

/// Strategy for sets of up to `max` unique names.
pub fn unique_names_strategy(max: usize) -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set(unique_name_strategy(), 0..=max)
}

/// Strategy for standalone journal records.
pub fn record_strategy() -> impl Strategy<Value = JournalRecord> {
    (
        status_strategy(),
        gtrid_strategy(),
        unique_names_strategy(8),
        any::<u64>(),
    )
        .prop_map(|(status, gtrid, names, sequence)| {
            JournalRecord::new(status, gtrid, names, sequence)
        })
}

/// Strategy for a sequence of status changes, as `(transaction index,
/// status, names)` over `transactions` transactions.
pub fn status_changes_strategy(
    transactions: usize,
    len: usize,
) -> impl Strategy<Value = Vec<(usize, TxStatus, BTreeSet<String>)>> {
    prop::collection::vec(
        (0..transactions, status_strategy(), unique_names_strategy(4)),
        1..=len,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::with_temp_journal;
    use std::collections::HashMap;
    use xatm_journal::Journal;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn record_payloads_decode(record in record_strategy()) {
            let payload = record.encode_payload().unwrap();
            let decoded = JournalRecord::decode_payload(&payload, true).unwrap();
            prop_assert_eq!(decoded.status(), record.status());
            prop_assert_eq!(decoded.gtrid(), record.gtrid());
            prop_assert_eq!(decoded.unique_names(), record.unique_names());
        }

        #[test]
        fn last_logged_status_wins(changes in status_changes_strategy(4, 24)) {
            let gtrids: Vec<Gtrid> = (0..4)
                .map(|i| Gtrid::from_bytes(format!("prop-{i}").into_bytes()))
                .collect();

            let stored = with_temp_journal(|journal| {
                for (index, status, names) in &changes {
                    journal.log(*status, &gtrids[*index], names).unwrap();
                }
                journal.force().unwrap();
                journal.stored_records()
            });

            prop_assert_eq!(stored.len(), changes.len());
            let mut stored_last: HashMap<&Gtrid, TxStatus> = HashMap::new();
            for record in &stored {
                stored_last.insert(record.gtrid(), record.status());
            }
            let mut logged_last: HashMap<&Gtrid, TxStatus> = HashMap::new();
            for (index, status, _) in &changes {
                logged_last.insert(&gtrids[*index], *status);
            }
            prop_assert_eq!(stored_last, logged_last);
            prop_assert!(stored.windows(2).all(|pair| pair[0].sequence() < pair[1].sequence()));
        }
    }
}
