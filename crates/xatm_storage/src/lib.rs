//! # xatm Storage
//!
//! Storage backends for the xatm transaction journal.
//!
//! Backends are **opaque, fixed-layout byte stores**: the journal preallocates
//! its file, writes framed records at explicit offsets and grows the file when
//! it runs short of room. Backends know nothing about records, generations or
//! checksums.
//!
//! ## Design Principles
//!
//! - Positional reads and writes, no implicit cursor
//! - Files only ever grow; shrinking is refused
//! - `sync` is the single durability point
//! - Must be `Send + Sync` so the journal can hand them to its writer thread
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and crash-image crafting
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use xatm_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.grow(64).unwrap();
//! backend.write_at(8, b"hello world").unwrap();
//! let data = backend.read_at(8, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
