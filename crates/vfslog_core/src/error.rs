//! Error types for vfslog core.

use crate::types::LogPosition;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in vfslog core operations.
///
/// Recoverable degradations (partially recovered files, diff elements) are
/// never reported through this type; they are data in
/// [`crate::RecoveryResult`] and [`crate::DiffResult`].
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] vfslog_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The on-disk store version differs from the requested one.
    #[error("store version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version requested by the caller.
        expected: u32,
        /// Version recorded in the manifest.
        found: u32,
    },

    /// Load-time structural validation of a store failed.
    #[error("corrupt store: {message}")]
    CorruptStore {
        /// Description of the violated invariant.
        message: String,
    },

    /// A recovery target directory already holds files.
    #[error("recovery target is not empty: {}", path.display())]
    TargetNotEmpty {
        /// The offending directory.
        path: PathBuf,
    },

    /// The operation log itself is broken.
    #[error("operation log corrupt: {message}")]
    LogCorrupt {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A compaction snapshot could not be loaded.
    #[error("snapshot at position {position} unavailable: {message}")]
    SnapshotUnavailable {
        /// Compaction position of the snapshot.
        position: LogPosition,
        /// What went wrong.
        message: String,
    },

    /// Two stores being compared are individually inconsistent.
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// Description of the violation.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// A file could not be decoded.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Another process holds the store lock.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// The store has been disconnected.
    #[error("store is disconnected")]
    StoreClosed,

    /// A mutation was attempted on a read-only store or log.
    #[error("read-only: {message}")]
    ReadOnly {
        /// What was attempted.
        message: String,
    },

    /// Snapshot serialization failed.
    #[error("snapshot codec error: {message}")]
    Snapshot {
        /// Codec error text.
        message: String,
    },
}

impl CoreError {
    /// Creates a corrupt store error.
    pub fn corrupt_store(message: impl Into<String>) -> Self {
        Self::CorruptStore {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corrupt(message: impl Into<String>) -> Self {
        Self::LogCorrupt {
            message: message.into(),
        }
    }

    /// Creates a snapshot unavailable error.
    pub fn snapshot_unavailable(position: LogPosition, message: impl Into<String>) -> Self {
        Self::SnapshotUnavailable {
            position,
            message: message.into(),
        }
    }

    /// Creates an invariant violation error.
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a read-only error.
    pub fn read_only(message: impl Into<String>) -> Self {
        Self::ReadOnly {
            message: message.into(),
        }
    }

    /// Creates a snapshot codec error.
    pub fn snapshot(message: impl ToString) -> Self {
        Self::Snapshot {
            message: message.to_string(),
        }
    }

    /// Returns true for errors raised by mutation validation.
    ///
    /// Replay treats these as per-file degradations; everything else aborts.
    #[must_use]
    pub fn is_rejected_operation(&self) -> bool {
        matches!(self, Self::InvalidOperation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_problem() {
        let err = CoreError::VersionMismatch {
            expected: 3,
            found: 2,
        };
        assert_eq!(err.to_string(), "store version mismatch: expected 3, found 2");

        let err = CoreError::TargetNotEmpty {
            path: PathBuf::from("/tmp/target"),
        };
        assert!(err.to_string().contains("/tmp/target"));
    }

    #[test]
    fn only_validation_failures_are_rejections() {
        assert!(CoreError::invalid_operation("no such record").is_rejected_operation());
        assert!(!CoreError::log_corrupt("bad crc").is_rejected_operation());
        assert!(!CoreError::StoreClosed.is_rejected_operation());
    }
}
