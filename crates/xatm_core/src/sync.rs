//! Completion callbacks and status listeners.

use std::error::Error;
use xatm_journal::{Gtrid, TxStatus};

/// Error type returned by synchronization callbacks.
pub type CallbackError = Box<dyn Error + Send + Sync>;

/// Callbacks around transaction completion.
///
/// `before_completion` runs before the prepare phase, in reverse
/// registration order; a failure rolls the transaction back.
/// `after_completion` runs once the outcome is known, in registration order;
/// its failures are only logged.
pub trait Synchronization: Send + Sync {
    /// Called before the transaction starts completing.
    ///
    /// # Errors
    ///
    /// Any error makes the transaction roll back.
    fn before_completion(&self) -> Result<(), CallbackError>;

    /// Called with the final status of the transaction.
    ///
    /// # Errors
    ///
    /// Errors are logged and otherwise ignored.
    fn after_completion(&self, status: TxStatus) -> Result<(), CallbackError>;
}

/// Observes every journaled status change of a transaction.
pub trait StatusListener: Send + Sync {
    /// Called after `current` was journaled for `gtrid`.
    fn status_changed(&self, gtrid: &Gtrid, previous: TxStatus, current: TxStatus);
}
