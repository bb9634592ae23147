//! In-memory storage backend for testing.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An in-memory storage backend.
///
/// This backend stores all data in memory and is suitable for:
/// - Unit tests
/// - Crash-recovery tests that hand-craft or corrupt journal images
/// - Running a journal without persistence
///
/// Clones share the same bytes, so a test can keep a handle while a journal
/// owns another, then reopen a fresh journal over the same image to simulate a
/// restart.
///
/// # Example
///
/// ```rust
/// use xatm_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let observer = backend.clone();
/// backend.write_at(0, b"test data").unwrap();
/// assert_eq!(observer.size().unwrap(), 9);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    syncs: Arc<AtomicU64>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing data.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            syncs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Applies `f` to the raw bytes, e.g. to flip a bit or tear a record.
    pub fn corrupt<F>(&self, f: F)
    where
        F: FnOnce(&mut Vec<u8>),
    {
        f(&mut self.data.write());
    }

    /// Returns how many times `sync` has been called.
    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let offset_usize = offset as usize;
        let end = offset_usize.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[offset_usize..end].to_vec())
    }

    fn write_at(&mut self, offset: u64, new_data: &[u8]) -> StorageResult<()> {
        if new_data.is_empty() {
            return Ok(());
        }
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + new_data.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(new_data);
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        // In-memory backend has no pending writes
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn grow(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let current_size = data.len() as u64;

        if new_size < current_size {
            return Err(StorageError::Shrink {
                size: current_size,
                requested: new_size,
            });
        }

        data.resize(new_size as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_new_is_empty() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(backend.data().is_empty());
    }

    #[test]
    fn memory_write_extends() {
        let mut backend = InMemoryBackend::new();
        backend.write_at(0, b"hello").unwrap();
        backend.write_at(5, b" world").unwrap();
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn memory_write_past_end_zero_fills_gap() {
        let mut backend = InMemoryBackend::new();
        backend.write_at(4, b"ab").unwrap();
        assert_eq!(backend.data(), vec![0, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn memory_read_at_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.write_at(0, b"hello").unwrap();

        let result = backend.read_at(10, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));

        let result = backend.read_at(3, 10);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn memory_with_data() {
        let backend = InMemoryBackend::with_data(b"preloaded".to_vec());
        assert_eq!(backend.size().unwrap(), 9);
        assert_eq!(backend.read_at(0, 9).unwrap(), b"preloaded");
    }

    #[test]
    fn memory_clones_share_bytes() {
        let mut backend = InMemoryBackend::new();
        let observer = backend.clone();
        backend.grow(8).unwrap();
        backend.write_at(2, b"zz").unwrap();
        assert_eq!(observer.read_at(2, 2).unwrap(), b"zz");
    }

    #[test]
    fn memory_corrupt_flips_bytes() {
        let backend = InMemoryBackend::with_data(vec![0u8; 4]);
        backend.corrupt(|bytes| bytes[1] ^= 0xFF);
        assert_eq!(backend.data(), vec![0, 0xFF, 0, 0]);
    }

    #[test]
    fn memory_sync_is_counted() {
        let mut backend = InMemoryBackend::new();
        assert!(backend.flush().is_ok());
        backend.sync().unwrap();
        backend.sync().unwrap();
        assert_eq!(backend.sync_count(), 2);
    }

    #[test]
    fn memory_grow_and_refuse_shrink() {
        let mut backend = InMemoryBackend::new();
        backend.grow(100).unwrap();
        assert_eq!(backend.size().unwrap(), 100);

        let result = backend.grow(10);
        assert!(matches!(result, Err(StorageError::Shrink { .. })));
    }
}
