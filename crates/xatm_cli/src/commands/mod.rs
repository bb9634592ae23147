//! CLI command implementations.

pub mod dangling;
pub mod dump;
pub mod verify;

use std::path::Path;
use tracing::debug;
use xatm_storage::FileBackend;

/// Opens an existing journal file. `FileBackend::open` would create it.
pub fn open_journal(path: &Path) -> Result<FileBackend, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("Journal file not found: {}", path.display()).into());
    }
    debug!(path = %path.display(), "opening journal");
    Ok(FileBackend::open(path)?)
}

/// A closed in-memory journal holding `entries`, each naming resource `db`.
#[cfg(test)]
pub(crate) fn journal_bytes(entries: &[(xatm_journal::TxStatus, &str)]) -> xatm_storage::InMemoryBackend {
    use std::collections::BTreeSet;
    use std::time::Duration;
    use xatm_journal::{DiskJournal, Gtrid, Journal, JournalConfig};

    let backend = xatm_storage::InMemoryBackend::new();
    let config = JournalConfig::new()
        .initial_size(16 * 1024)
        .write_delay(Duration::from_millis(5));
    let journal = DiskJournal::in_memory(backend.clone(), config);
    journal.open().unwrap();
    let names: BTreeSet<String> = ["db".to_string()].into_iter().collect();
    for (status, gtrid) in entries {
        journal
            .log(*status, &Gtrid::from_bytes(gtrid.as_bytes().to_vec()), &names)
            .unwrap();
    }
    journal.force().unwrap();
    journal.close().unwrap();
    backend
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_journal_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.journal");
        assert!(open_journal(&path).is_err());
        assert!(!path.exists());
    }
}
