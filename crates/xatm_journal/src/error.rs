//! Error types for journal operations.

use std::io;
use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur while logging to, forcing or reading the journal.
///
/// Every variant is fatal from the transaction coordinator's point of view:
/// once a status cannot be durably recorded, in-memory transaction state can
/// no longer be trusted.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] xatm_storage::StorageError),

    /// I/O error (e.g. the writer thread could not be spawned).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The journal has not been opened, or has been closed.
    #[error("journal is not open")]
    NotOpen,

    /// The journal file is corrupted or not a journal file.
    #[error("journal corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// A serialized record exceeds the configured maximum record size.
    #[error("journal record of {size} bytes exceeds the maximum of {max} bytes")]
    RecordTooLarge {
        /// Serialized size of the record, framing included.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A write does not fit in the remaining file capacity.
    #[error("journal write of {required} bytes exceeds remaining capacity of {remaining} bytes")]
    InsufficientCapacity {
        /// Bytes the write needs.
        required: u64,
        /// Bytes left between the write cursor and end of file.
        remaining: u64,
    },

    /// The batch holding this sequence number could not be written or synced.
    #[error("failed to force journal record with sequence {sequence}")]
    ForceFailed {
        /// Sequence number whose force failed.
        sequence: u64,
    },

    /// A thread waiting for a force was released because the journal closed.
    #[error("interrupted while waiting for the journal to be forced")]
    Interrupted,

    /// Invalid argument or configuration.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },
}

impl JournalError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true if the error came from the storage layer or the OS.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }
}
