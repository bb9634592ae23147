//! # xatm Core
//!
//! Two-phase-commit transaction manager for XA resources.
//!
//! This crate provides:
//! - XA identifiers, flags, return codes and the [`XaResource`] trait
//! - a resource registry and per-transaction branch management
//! - the [`Transaction`] state machine, journaling every status change
//! - phase execution ordered by resource position, optionally concurrent
//! - transaction timeouts and the [`TransactionManager`] front end
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use xatm_core::{
//!     ResourceRegistration, TmConfig, TransactionManager, Vote, XaFlag, XaResource, XaResult, Xid,
//! };
//! use xatm_journal::NullJournal;
//!
//! struct Noop;
//!
//! impl XaResource for Noop {
//!     fn unique_name(&self) -> &str { "noop" }
//!     fn start(&self, _: &Xid, _: XaFlag) -> XaResult<()> { Ok(()) }
//!     fn end(&self, _: &Xid, _: XaFlag) -> XaResult<()> { Ok(()) }
//!     fn prepare(&self, _: &Xid) -> XaResult<Vote> { Ok(Vote::Commit) }
//!     fn commit(&self, _: &Xid, _: bool) -> XaResult<()> { Ok(()) }
//!     fn rollback(&self, _: &Xid) -> XaResult<()> { Ok(()) }
//! }
//!
//! let manager = TransactionManager::new(TmConfig::default(), Arc::new(NullJournal::new())).unwrap();
//! manager.registry().register(ResourceRegistration::new("noop")).unwrap();
//!
//! let transaction = manager.begin().unwrap();
//! transaction.enlist_resource(Arc::new(Noop)).unwrap();
//! transaction.commit().unwrap();
//! manager.shutdown();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod branch;
mod config;
mod error;
mod manager;
mod phase;
mod registry;
mod sync;
mod timeout;
mod transaction;
mod xa;

pub use branch::{Branch, BranchManager, BranchPhase, ResourceCoordinator};
pub use config::TmConfig;
pub use error::{BranchFailure, TmError, TmResult, XaError};
pub use manager::{TransactionManager, TransactionManagerBuilder};
pub use phase::{DefaultPhaseExecutor, PhaseExecutor};
pub use registry::{ResourceRegistration, ResourceRegistry};
pub use sync::{CallbackError, StatusListener, Synchronization};
pub use timeout::{TaskId, TaskScheduler, TimeoutScheduler, TimeoutTask, SCHEDULER_THREAD_NAME};
pub use transaction::{Transaction, TransactionServices};
pub use xa::*;
