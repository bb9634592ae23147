//! A journal that records nothing.

use crate::error::JournalResult;
use crate::journal::Journal;
use crate::record::JournalRecord;
use crate::types::{Gtrid, TxStatus};
use std::collections::{BTreeSet, HashMap};

/// Journal without durability. Every operation succeeds and nothing is ever
/// dangling, so crash recovery is impossible with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

impl NullJournal {
    /// Creates a null journal.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Journal for NullJournal {
    fn open(&self) -> JournalResult<()> {
        Ok(())
    }

    fn close(&self) -> JournalResult<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn log(&self, _: TxStatus, _: &Gtrid, _: &BTreeSet<String>) -> JournalResult<()> {
        Ok(())
    }

    fn force(&self) -> JournalResult<()> {
        Ok(())
    }

    fn collect_dangling_records(&self) -> JournalResult<HashMap<Gtrid, JournalRecord>> {
        Ok(HashMap::new())
    }

    fn unfinished_records(&self) -> JournalResult<Vec<JournalRecord>> {
        Ok(Vec::new())
    }

    fn unsafe_read_records_into(&self, _: &mut Vec<JournalRecord>, _: bool) -> JournalResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn everything_is_a_no_op() {
        let journal = NullJournal::new();
        journal.open().unwrap();
        journal
            .log(TxStatus::Committing, &Gtrid::generate(b"n"), &BTreeSet::new())
            .unwrap();
        journal.force().unwrap();
        assert!(journal.collect_dangling_records().unwrap().is_empty());

        let mut records = Vec::new();
        journal.unsafe_read_records_into(&mut records, true).unwrap();
        assert!(records.is_empty());
        journal.close().unwrap();
    }
}
