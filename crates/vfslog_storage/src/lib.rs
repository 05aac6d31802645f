//! # vfslog storage
//!
//! Byte-store backends for vfslog.
//!
//! Everything vfslog persists (the name table, content blobs, the attribute
//! journal and the operation log chunks) sits on top of a [`StorageBackend`].
//! Backends are **opaque, append-only byte stores**: they know nothing about
//! records, log entries or payload references.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - scratch stores and tests
//! - [`FileBackend`] - one OS file, optionally opened read-only
//!
//! ## Example
//!
//! ```rust
//! use vfslog_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"names").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"names");
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
