//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level storage backend for the transaction journal.
///
/// Storage backends are **opaque byte stores** addressed by offset. The
/// journal owns the file layout: it preallocates the backend with
/// [`grow`](Self::grow), writes framed records at explicit offsets and reads
/// them back during recovery scans.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `write_at` may extend the storage when writing past its end
/// - `grow` never shrinks; newly exposed bytes read as zero
/// - `sync` makes every completed write durable
/// - Backends must be `Send + Sync` for hand-off to the writer thread
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`, overwriting whatever was there.
    ///
    /// Writing past the current end extends the storage.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Pushes buffered writes to the operating system.
    ///
    /// This does not guarantee durability; use [`sync`](Self::sync) for that.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// After this returns successfully every completed write survives
    /// process termination and power loss.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Extends the storage to `new_size` bytes, zero-filling the new region.
    ///
    /// Growing to the current size is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `new_size` is smaller than the current size
    /// - The resize fails
    fn grow(&mut self, new_size: u64) -> StorageResult<()>;
}
