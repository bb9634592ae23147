//! Error types for the transaction manager.

use crate::xa::{code_name, XA_HEURCOM, XA_HEURHAZ, XA_HEURMIX, XA_HEURRB};
use std::fmt;
use std::io;
use thiserror::Error;
use xatm_journal::JournalError;

/// Result type for transaction manager operations.
pub type TmResult<T> = Result<T, TmError>;

/// An error returned by an XA resource, carrying its XA return code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct XaError {
    /// XA return code (`XA_RB*`, `XA_HEUR*` or `XAER_*`).
    pub code: i32,
    /// Resource-provided description.
    pub message: String,
}

impl XaError {
    /// Creates an XA error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Symbolic name of the code.
    #[must_use]
    pub fn code_name(&self) -> &'static str {
        code_name(self.code)
    }

    /// Returns true for the `XA_RB*` codes: the resource rolled the branch
    /// back on its own.
    #[must_use]
    pub fn is_rollback(&self) -> bool {
        (100..=107).contains(&self.code)
    }

    /// Returns true for the `XA_HEUR*` codes.
    #[must_use]
    pub fn is_heuristic(&self) -> bool {
        matches!(self.code, XA_HEURMIX | XA_HEURRB | XA_HEURCOM | XA_HEURHAZ)
    }
}

impl fmt::Display for XaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", code_name(self.code), self.message)
    }
}

/// An XA error attributed to the resource that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchFailure {
    /// Unique name of the failing resource.
    pub unique_name: String,
    /// What the resource reported.
    pub error: XaError,
}

impl BranchFailure {
    /// Creates a branch failure.
    pub fn new(unique_name: impl Into<String>, error: XaError) -> Self {
        Self {
            unique_name: unique_name.into(),
            error,
        }
    }
}

impl fmt::Display for BranchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource [{}] reported {}", self.unique_name, self.error)
    }
}

/// Errors raised by transactions and the transaction manager.
///
/// Variants carrying `failures` aggregate every resource that failed during
/// the same operation.
#[derive(Debug, Error)]
pub enum TmError {
    /// The operation is not allowed in the transaction's current status.
    #[error("illegal state: {message}")]
    IllegalState {
        /// What was attempted and why it is refused.
        message: String,
    },

    /// The transaction was rolled back instead of committed.
    #[error("{message}")]
    Rollback {
        /// Description, including the failing resources.
        message: String,
        /// Per-resource failures that led to the rollback.
        failures: Vec<BranchFailure>,
    },

    /// Some resources committed and some rolled back.
    #[error("{message}")]
    HeuristicMixed {
        /// Description, including the failing resources.
        message: String,
        /// Per-resource failures.
        failures: Vec<BranchFailure>,
    },

    /// Every resource rolled back although commit was decided.
    #[error("{message}")]
    HeuristicRollback {
        /// Description, including the failing resources.
        message: String,
        /// Per-resource failures.
        failures: Vec<BranchFailure>,
    },

    /// Resources committed although rollback was decided.
    #[error("{message}")]
    HeuristicCommit {
        /// Description, including the failing resources.
        message: String,
        /// Per-resource failures.
        failures: Vec<BranchFailure>,
    },

    /// A resource or the transaction manager failed unexpectedly.
    #[error("system error: {message}")]
    System {
        /// Description, including the failing resources.
        message: String,
        /// Per-resource failures, if any.
        failures: Vec<BranchFailure>,
    },

    /// A status change could not be journaled. Fatal: in-memory state can
    /// no longer be trusted.
    #[error("{message}: {source}")]
    Journal {
        /// What was being journaled.
        message: String,
        /// Underlying journal error.
        #[source]
        source: JournalError,
    },

    /// I/O error (e.g. a background thread could not be spawned).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TmError {
    /// Creates an illegal-state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Creates a rollback error.
    pub fn rollback(message: impl Into<String>, failures: Vec<BranchFailure>) -> Self {
        Self::Rollback {
            message: message.into(),
            failures,
        }
    }

    /// Creates a system error.
    pub fn system(message: impl Into<String>, failures: Vec<BranchFailure>) -> Self {
        Self::System {
            message: message.into(),
            failures,
        }
    }

    /// Creates a journal error.
    pub fn journal(message: impl Into<String>, source: JournalError) -> Self {
        Self::Journal {
            message: message.into(),
            source,
        }
    }

    /// Per-resource failures carried by the error.
    #[must_use]
    pub fn failures(&self) -> &[BranchFailure] {
        match self {
            Self::Rollback { failures, .. }
            | Self::HeuristicMixed { failures, .. }
            | Self::HeuristicRollback { failures, .. }
            | Self::HeuristicCommit { failures, .. }
            | Self::System { failures, .. } => failures,
            Self::IllegalState { .. } | Self::Journal { .. } | Self::Io(_) => &[],
        }
    }

    /// Returns true for rollback errors.
    #[must_use]
    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::Rollback { .. })
    }

    /// Returns true for heuristic outcomes.
    #[must_use]
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self,
            Self::HeuristicMixed { .. } | Self::HeuristicRollback { .. } | Self::HeuristicCommit { .. }
        )
    }

    /// Returns true for errors after which the transaction manager cannot
    /// guarantee atomicity.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Journal { .. })
    }
}

/// One line per failure, each indented under a headline.
pub(crate) fn describe_failures(failures: &[BranchFailure]) -> String {
    failures.iter().map(|failure| format!("\n  {failure}")).collect()
}

/// Delistment failures split into unilateral rollbacks and plain failures.
pub(crate) fn describe_delist_failures(failures: &[BranchFailure]) -> String {
    let (rolled_back, failed): (Vec<&BranchFailure>, Vec<&BranchFailure>) =
        failures.iter().partition(|failure| failure.error.is_rollback());

    let mut description = String::new();
    if !rolled_back.is_empty() {
        description.push_str(&format!(
            "\n  resource(s) [{}] unilaterally rolled back",
            join_names(&rolled_back)
        ));
    }
    if !failed.is_empty() {
        description.push_str(&format!(
            "\n  resource(s) [{}] could not be delisted",
            join_names(&failed)
        ));
    }
    description
}

fn join_names(failures: &[&BranchFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.unique_name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
