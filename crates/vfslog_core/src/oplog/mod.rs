//! Operation log.
//!
//! Every mutation of a logged [`crate::RecordStore`] is appended here before
//! it is applied. The log is split into numbered entry chunks and payload
//! chunks, plus the compaction points written by
//! [`crate::CompactionController`]. Readers go through a [`LogQuery`].

mod chunks;
mod entry;
mod log;
mod points;
mod query;

pub use entry::{
    LogEntry, LoggedOperation, OpKind, Operation, PayloadRef, ENTRY_HEADER_SIZE, ENTRY_MAGIC,
    ENTRY_TRAILER_SIZE, ENTRY_VERSION,
};
pub use log::{LogOptions, LogStats, OperationLog, ReclaimStats};
pub use points::{CompactionPoint, SnapshotRef};
pub use query::{LogIter, LogQuery, ResolvedOperation};
