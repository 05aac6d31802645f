//! # vfslog core
//!
//! Persistent file-metadata store with an append-only operation log.
//!
//! This crate provides:
//! - [`RecordStore`]: file records (flags, parent, children, name, content,
//!   attributes) with a root set, validated mutators and tombstones
//! - [`OperationLog`]: the append-only history of every accepted mutation,
//!   read through [`LogQuery`] windows
//! - [`CompactionController`]: folds a log prefix into a snapshot
//! - [`recover_from_point`]: rebuilds a store in a fresh directory from the
//!   log, classifying every file as `Ok`, `Partial` or `Botched`
//! - [`DiffOracle`]: structural comparison of two stores
//!
//! ## Example
//!
//! ```rust,no_run
//! use vfslog_core::{
//!     build_diff, recover_from_point, Config, NoReadLock, RecordFlag, RecordFlags, RecordStore,
//! };
//! use std::path::Path;
//!
//! # fn main() -> vfslog_core::CoreResult<()> {
//! let store = RecordStore::connect(Path::new("caches/records"), Config::default())?.store;
//! let root = store.add_root("file:///", RecordFlags::from(RecordFlag::IsDirectory))?;
//! let file = store.create_child(root, "notes.txt", RecordFlags::empty())?;
//! store.write_content(file, b"hello")?;
//!
//! if let Some(log) = store.log() {
//!     let query = log.query();
//!     let recovery = recover_from_point(
//!         query.end(),
//!         &query,
//!         store.path(),
//!         Path::new("caches/recovered"),
//!         &NoReadLock,
//!         &Config::default(),
//!     )?;
//!     assert!(build_diff(&store, &recovery.store, 100)?.is_empty());
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod attributes;
mod codec;
mod compaction;
mod config;
mod content;
mod diff;
mod dir;
mod error;
mod flags;
mod manifest;
mod names;
mod oplog;
mod record;
mod recovery;
mod replay;
mod snapshot;
mod store;
mod types;

pub use compaction::{safe_boundary, CompactionContext, CompactionController, CompactionStats};
pub use config::{Config, LogMode, DEFAULT_STORE_VERSION};
pub use diff::{build_diff, AttributeMismatch, DiffElement, DiffOracle, DiffResult};
pub use dir::{is_missing_or_empty, oplog_dir, read_manifest, wipe_contents, StoreDir};
pub use error::{CoreError, CoreResult};
pub use flags::{RecordFlag, RecordFlags};
pub use manifest::{Manifest, MANIFEST_FORMAT, MANIFEST_MAGIC};
pub use names::NameTable;
pub use oplog::{
    CompactionPoint, LogEntry, LogIter, LogOptions, LogQuery, LogStats, LoggedOperation, OpKind,
    Operation, OperationLog, PayloadRef, ReclaimStats, ResolvedOperation, SnapshotRef,
    ENTRY_HEADER_SIZE, ENTRY_MAGIC, ENTRY_TRAILER_SIZE, ENTRY_VERSION,
};
pub use record::{FileRecord, RecordTable};
pub use recovery::{
    recover_from_point, NoReadLock, ReadAction, Recovery, RecoveryResult, RecoveryState,
};
pub use snapshot::{RecordSnapshot, SnapshotRecord};
pub use store::{ConnectResult, RecordStore};
pub use types::{AttributeId, AttributeRecordId, ContentId, FileId, LogPosition, NameId};
