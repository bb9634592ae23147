//! Transaction status and global transaction identifiers.

use std::fmt;

/// Status of a distributed transaction.
///
/// The numeric codes follow the classic JTA numbering and are persisted in
/// every journal record, so they must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TxStatus {
    /// Transaction is active; resources may be enlisted.
    Active = 0,
    /// Transaction can only be rolled back.
    MarkedRollback = 1,
    /// All resources voted to commit.
    Prepared = 2,
    /// Every resource committed.
    Committed = 3,
    /// Every resource rolled back.
    RolledBack = 4,
    /// Outcome cannot be determined.
    Unknown = 5,
    /// No transaction has been started.
    NoTransaction = 6,
    /// Resources are being asked to prepare.
    Preparing = 7,
    /// Commit decision taken; resources are being committed.
    Committing = 8,
    /// Rollback decision taken; resources are being rolled back.
    RollingBack = 9,
}

impl TxStatus {
    /// All statuses, ordered by code.
    pub const ALL: [TxStatus; 10] = [
        Self::Active,
        Self::MarkedRollback,
        Self::Prepared,
        Self::Committed,
        Self::RolledBack,
        Self::Unknown,
        Self::NoTransaction,
        Self::Preparing,
        Self::Committing,
        Self::RollingBack,
    ];

    /// Converts a persisted status code back to a status.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Returns the persisted status code.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Returns the upper-case symbolic name written next to the code.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::MarkedRollback => "MARKED_ROLLBACK",
            Self::Prepared => "PREPARED",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLEDBACK",
            Self::Unknown => "UNKNOWN",
            Self::NoTransaction => "NO_TRANSACTION",
            Self::Preparing => "PREPARING",
            Self::Committing => "COMMITTING",
            Self::RollingBack => "ROLLING_BACK",
        }
    }

    /// Returns true for COMMITTED and ROLLEDBACK.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Returns true once a completion phase has started.
    ///
    /// No resource may be enlisted and no synchronization registered in
    /// these states.
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(
            self,
            Self::Preparing
                | Self::Prepared
                | Self::Committing
                | Self::Committed
                | Self::RollingBack
                | Self::RolledBack
                | Self::Unknown
        )
    }

    /// Returns true if a journal record with this status keeps the
    /// transaction in the tracked-transactions index.
    #[must_use]
    pub const fn is_tracked(self) -> bool {
        !self.is_terminal() && !matches!(self, Self::NoTransaction)
    }

    /// Returns true if a transaction last seen in this status needs recovery
    /// when found in the journal at startup.
    #[must_use]
    pub const fn is_in_doubt(self) -> bool {
        matches!(self, Self::Committing | Self::RollingBack)
    }

    /// Returns true if `self` may causally follow `previous`.
    ///
    /// Re-logging the same status is always allowed (rollover carry-forward
    /// does exactly that). UNKNOWN may follow anything. COMMITTED follows
    /// PREPARED when every resource voted read-only, and ROLLEDBACK follows
    /// COMMITTING when a one-phase commit rolled back.
    #[must_use]
    pub fn may_follow(self, previous: TxStatus) -> bool {
        if self == previous || self == Self::Unknown {
            return true;
        }
        match self {
            Self::Active => previous == Self::NoTransaction,
            Self::MarkedRollback => previous == Self::Active,
            Self::Preparing => previous == Self::Active,
            Self::Prepared => previous == Self::Preparing,
            Self::Committing => matches!(previous, Self::Preparing | Self::Prepared),
            Self::Committed => matches!(previous, Self::Prepared | Self::Committing),
            Self::RollingBack => matches!(
                previous,
                Self::Active
                    | Self::MarkedRollback
                    | Self::Preparing
                    | Self::Prepared
                    | Self::Committing
            ),
            Self::RolledBack => matches!(previous, Self::RollingBack | Self::Committing),
            Self::NoTransaction | Self::Unknown => false,
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Maximum size of a global transaction identifier, as in the XA standard.
pub const MAX_GTRID_SIZE: usize = 64;

/// Global transaction identifier.
///
/// A GTRID is opaque and immutable. Generated GTRIDs are the server id
/// followed by 16 random bytes, which keeps them unique across restarts and
/// across transaction managers sharing resources.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gtrid(Vec<u8>);

impl Gtrid {
    /// Wraps raw GTRID bytes.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Generates a fresh GTRID for the given server id.
    ///
    /// The server id is truncated so the result never exceeds
    /// [`MAX_GTRID_SIZE`].
    #[must_use]
    pub fn generate(server_id: &[u8]) -> Self {
        let random = uuid::Uuid::new_v4();
        let prefix_len = server_id.len().min(MAX_GTRID_SIZE - 16);
        let mut bytes = Vec::with_capacity(prefix_len + 16);
        bytes.extend_from_slice(&server_id[..prefix_len]);
        bytes.extend_from_slice(random.as_bytes());
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the GTRID has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Gtrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}
