//! # xatm Testkit
//!
//! Test utilities for xatm.
//!
//! This crate provides:
//! - Journal and transaction manager fixtures
//! - Scriptable XA resources sharing an ordered event log
//! - A journal decorator that records calls and injects failures
//! - Crash images for recovery testing
//! - Property-based test generators using proptest
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust
//! use xatm_testkit::prelude::*;
//!
//! let tm = TestManager::new();
//! let db = tm.resource("db").shared();
//! let transaction = tm.begin().unwrap();
//! transaction.enlist_resource(db).unwrap();
//! transaction.commit().unwrap();
//! assert_eq!(tm.events.matching("commit"), vec!["commit-1pc db"]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod journal;
pub mod resources;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::journal::*;
    pub use crate::resources::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use journal::*;
pub use resources::*;
pub use stress::*;
