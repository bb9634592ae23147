//! XA resource interface, identifiers and return codes.

use crate::error::XaError;
use std::fmt;
use xatm_journal::Gtrid;

/// Result of an XA resource call.
pub type XaResult<T> = Result<T, XaError>;

/// Format id stamped on every XID this transaction manager creates.
pub const FORMAT_ID: i32 = 0x5841_544D;

/// Maximum size of a branch qualifier.
pub const MAX_BQUAL_SIZE: usize = 64;

/// Normal execution.
pub const XA_OK: i32 = 0;
/// The branch was read-only and has been committed.
pub const XA_RDONLY: i32 = 3;
/// The branch may retry.
pub const XA_RETRY: i32 = 4;
/// The branch was partly committed and partly rolled back.
pub const XA_HEURMIX: i32 = 5;
/// The branch was heuristically rolled back.
pub const XA_HEURRB: i32 = 6;
/// The branch was heuristically committed.
pub const XA_HEURCOM: i32 = 7;
/// The branch may have been heuristically completed.
pub const XA_HEURHAZ: i32 = 8;
/// Resumption must occur where the suspension occurred.
pub const XA_NOMIGRATE: i32 = 9;
/// Rollback for an unspecified reason.
pub const XA_RBROLLBACK: i32 = 100;
/// Rollback caused by a communication failure.
pub const XA_RBCOMMFAIL: i32 = 101;
/// A deadlock was detected.
pub const XA_RBDEADLOCK: i32 = 102;
/// A condition violating resource integrity was detected.
pub const XA_RBINTEGRITY: i32 = 103;
/// Rollback for a reason not on this list.
pub const XA_RBOTHER: i32 = 104;
/// A protocol error occurred in the resource manager.
pub const XA_RBPROTO: i32 = 105;
/// The branch took too long.
pub const XA_RBTIMEOUT: i32 = 106;
/// The branch may retry after rolling back.
pub const XA_RBTRANSIENT: i32 = 107;
/// Asynchronous operation already outstanding.
pub const XAER_ASYNC: i32 = -2;
/// A resource manager error occurred.
pub const XAER_RMERR: i32 = -3;
/// The XID is not valid.
pub const XAER_NOTA: i32 = -4;
/// Invalid arguments were given.
pub const XAER_INVAL: i32 = -5;
/// Routine invoked in an improper context.
pub const XAER_PROTO: i32 = -6;
/// Resource manager unavailable.
pub const XAER_RMFAIL: i32 = -7;
/// The XID already exists.
pub const XAER_DUPID: i32 = -8;
/// Resource manager doing work outside a global transaction.
pub const XAER_OUTSIDE: i32 = -9;

/// Symbolic name of an XA return code.
#[must_use]
pub fn code_name(code: i32) -> &'static str {
    match code {
        XA_OK => "XA_OK",
        XA_RDONLY => "XA_RDONLY",
        XA_RETRY => "XA_RETRY",
        XA_HEURMIX => "XA_HEURMIX",
        XA_HEURRB => "XA_HEURRB",
        XA_HEURCOM => "XA_HEURCOM",
        XA_HEURHAZ => "XA_HEURHAZ",
        XA_NOMIGRATE => "XA_NOMIGRATE",
        XA_RBROLLBACK => "XA_RBROLLBACK",
        XA_RBCOMMFAIL => "XA_RBCOMMFAIL",
        XA_RBDEADLOCK => "XA_RBDEADLOCK",
        XA_RBINTEGRITY => "XA_RBINTEGRITY",
        XA_RBOTHER => "XA_RBOTHER",
        XA_RBPROTO => "XA_RBPROTO",
        XA_RBTIMEOUT => "XA_RBTIMEOUT",
        XA_RBTRANSIENT => "XA_RBTRANSIENT",
        XAER_ASYNC => "XAER_ASYNC",
        XAER_RMERR => "XAER_RMERR",
        XAER_NOTA => "XAER_NOTA",
        XAER_INVAL => "XAER_INVAL",
        XAER_PROTO => "XAER_PROTO",
        XAER_RMFAIL => "XAER_RMFAIL",
        XAER_DUPID => "XAER_DUPID",
        XAER_OUTSIDE => "XAER_OUTSIDE",
        _ => "UNKNOWN_XA_CODE",
    }
}

/// Flags passed to `start` and `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaFlag {
    /// TMNOFLAGS: start a new branch.
    NoFlags,
    /// TMJOIN: join an ended branch of the same resource manager.
    Join,
    /// TMRESUME: resume a suspended branch.
    Resume,
    /// TMSUCCESS: work done successfully.
    Success,
    /// TMSUSPEND: suspend the association.
    Suspend,
    /// TMFAIL: work failed; the branch may only roll back.
    Fail,
}

impl XaFlag {
    /// Wire value of the flag.
    #[must_use]
    pub const fn bits(self) -> i32 {
        match self {
            Self::NoFlags => 0,
            Self::Join => 0x0020_0000,
            Self::Resume => 0x0800_0000,
            Self::Success => 0x0400_0000,
            Self::Suspend => 0x0200_0000,
            Self::Fail => 0x2000_0000,
        }
    }

    /// Returns true for the flags accepted when delisting.
    #[must_use]
    pub const fn is_end_flag(self) -> bool {
        matches!(self, Self::Success | Self::Suspend | Self::Fail)
    }
}

impl fmt::Display for XaFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoFlags => "TMNOFLAGS",
            Self::Join => "TMJOIN",
            Self::Resume => "TMRESUME",
            Self::Success => "TMSUCCESS",
            Self::Suspend => "TMSUSPEND",
            Self::Fail => "TMFAIL",
        };
        f.write_str(name)
    }
}

/// A resource manager's answer to `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// XA_OK: ready to commit.
    Commit,
    /// XA_RDONLY: nothing to commit; the branch is already finished.
    ReadOnly,
}

/// Transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    format_id: i32,
    gtrid: Gtrid,
    bqual: Vec<u8>,
}

impl Xid {
    /// Creates an XID with this transaction manager's format id.
    #[must_use]
    pub fn new(gtrid: Gtrid, bqual: Vec<u8>) -> Self {
        Self {
            format_id: FORMAT_ID,
            gtrid,
            bqual,
        }
    }

    /// Creates an XID with a fresh random branch qualifier.
    #[must_use]
    pub fn new_branch(gtrid: Gtrid) -> Self {
        Self::new(gtrid, uuid::Uuid::new_v4().as_bytes().to_vec())
    }

    /// Format id.
    #[must_use]
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Global transaction id.
    #[must_use]
    pub fn gtrid(&self) -> &Gtrid {
        &self.gtrid
    }

    /// Branch qualifier.
    #[must_use]
    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:X}:{}:", self.format_id, self.gtrid)?;
        for byte in &self.bqual {
            write!(f, "{byte:02X}")?;
        }
        f.write_str("]")
    }
}

/// A resource manager taking part in distributed transactions.
///
/// Every method maps to the XA call of the same name. Errors carry the XA
/// return code so the transaction can tell a unilateral rollback from a
/// resource failure or a heuristic outcome.
pub trait XaResource: Send + Sync {
    /// Name identifying the resource across restarts. Must be registered in
    /// the [`ResourceRegistry`](crate::ResourceRegistry) before enlistment.
    fn unique_name(&self) -> &str;

    /// Associates the branch `xid` with the resource.
    fn start(&self, xid: &Xid, flag: XaFlag) -> XaResult<()>;

    /// Dissociates the branch `xid`.
    fn end(&self, xid: &Xid, flag: XaFlag) -> XaResult<()>;

    /// Asks the resource to prepare the branch.
    fn prepare(&self, xid: &Xid) -> XaResult<Vote>;

    /// Commits the branch, in one phase if `one_phase` is set.
    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()>;

    /// Rolls the branch back.
    fn rollback(&self, xid: &Xid) -> XaResult<()>;

    /// Discards a heuristically completed branch.
    fn forget(&self, _xid: &Xid) -> XaResult<()> {
        Ok(())
    }

    /// Sets the branch timeout. Returns false if unsupported.
    fn set_transaction_timeout(&self, _seconds: u32) -> XaResult<bool> {
        Ok(false)
    }
}
