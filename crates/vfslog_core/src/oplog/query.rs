//! Read-side view of the operation log.

use super::entry::{LogEntry, LoggedOperation, Operation, PayloadRef};
use super::log::{OperationLog, SnapshotLoadError};
use super::points::{CompactionPoint, SnapshotRef};
use crate::error::{CoreError, CoreResult};
use crate::types::LogPosition;
use std::sync::Arc;
use tracing::warn;

/// An entry with its payload bytes fetched, or the reason they could not be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedOperation {
    /// The operation, payload included, ready to apply.
    Ready(Operation),
    /// The payload was reclaimed or failed its checksum.
    PayloadUnavailable(LoggedOperation),
}

/// A registered read window `[begin, end)` over the log.
///
/// While a query is alive, compaction keeps every entry, payload and snapshot
/// it may read. Dropping the query unregisters it.
pub struct LogQuery {
    log: Arc<OperationLog>,
    id: u64,
    begin: LogPosition,
    end: LogPosition,
}

impl std::fmt::Debug for LogQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogQuery")
            .field("id", &self.id)
            .field("begin", &self.begin)
            .field("end", &self.end)
            .finish()
    }
}

impl LogQuery {
    pub(crate) fn new(log: Arc<OperationLog>, id: u64, begin: LogPosition, end: LogPosition) -> Self {
        Self {
            log,
            id,
            begin,
            end,
        }
    }

    /// Latest compaction position when the query was acquired, or 1.
    #[must_use]
    pub fn begin(&self) -> LogPosition {
        self.begin
    }

    /// Next position to be written when the query was acquired.
    #[must_use]
    pub fn end(&self) -> LogPosition {
        self.end
    }

    /// Registry id of this query.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The log this query reads.
    #[must_use]
    pub fn log(&self) -> &Arc<OperationLog> {
        &self.log
    }

    /// Iterates the entries in `[from, to)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` unless `begin <= from <= to <= end`.
    pub fn iterate(&self, from: LogPosition, to: LogPosition) -> CoreResult<LogIter<'_>> {
        if from < self.begin || from > to || to > self.end {
            return Err(CoreError::invalid_operation(format!(
                "range [{from}, {to}) is outside query window [{}, {})",
                self.begin, self.end
            )));
        }
        Ok(LogIter {
            query: self,
            next: from,
            to,
            last: None,
        })
    }

    /// Iterates the whole window.
    pub fn entries(&self) -> LogIter<'_> {
        LogIter {
            query: self,
            next: self.begin,
            to: self.end,
            last: None,
        }
    }

    /// Reads a payload. `None` when it is unavailable.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures.
    pub fn read_payload(&self, payload: &PayloadRef) -> CoreResult<Option<Vec<u8>>> {
        self.log.read_payload(payload)
    }

    /// Fetches the payload of `entry`, if it has one.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures.
    pub fn resolve(&self, entry: &LogEntry) -> CoreResult<ResolvedOperation> {
        let mut missing = false;
        let operation = entry.operation.clone().try_map_payload(|payload| {
            match self.read_payload(&payload)? {
                Some(bytes) => Ok::<_, CoreError>(bytes),
                None => {
                    missing = true;
                    Ok(Vec::new())
                }
            }
        })?;
        if missing {
            warn!(position = %entry.position, file = %entry.operation.file_id(), "payload unavailable");
            return Ok(ResolvedOperation::PayloadUnavailable(entry.operation.clone()));
        }
        Ok(ResolvedOperation::Ready(operation))
    }

    /// Returns the newest compaction point at or before `begin`, loaded and
    /// verified.
    ///
    /// `None` when the log was never compacted. When the snapshot file is
    /// missing, `on_missing` decides; when it fails verification,
    /// `on_corruption` decides. A handler returning `Ok(())` makes this
    /// return `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Whatever the handlers return.
    pub fn get_base_snapshot<M, C>(
        &self,
        on_missing: M,
        on_corruption: C,
    ) -> CoreResult<Option<CompactionPoint>>
    where
        M: FnOnce(&SnapshotRef) -> CoreResult<()>,
        C: FnOnce(&SnapshotRef, &CoreError) -> CoreResult<()>,
    {
        self.base_snapshot_at(self.begin, on_missing, on_corruption)
    }

    /// Like [`LogQuery::get_base_snapshot`] but for the newest point at or
    /// before `at`, which must lie in the query window.
    ///
    /// # Errors
    ///
    /// Whatever the handlers return.
    pub fn base_snapshot_at<M, C>(
        &self,
        at: LogPosition,
        on_missing: M,
        on_corruption: C,
    ) -> CoreResult<Option<CompactionPoint>>
    where
        M: FnOnce(&SnapshotRef) -> CoreResult<()>,
        C: FnOnce(&SnapshotRef, &CoreError) -> CoreResult<()>,
    {
        let Some(reference) = self
            .log
            .compaction_points()
            .into_iter()
            .rev()
            .find(|p| p.position <= at)
        else {
            return Ok(None);
        };
        match self.log.load_snapshot(&reference) {
            Ok(snapshot) => Ok(Some(CompactionPoint {
                reference,
                snapshot,
            })),
            Err(SnapshotLoadError::Missing) => on_missing(&reference).map(|()| None),
            Err(SnapshotLoadError::Corrupt(e)) => on_corruption(&reference, &e).map(|()| None),
        }
    }
}

impl Drop for LogQuery {
    fn drop(&mut self) {
        self.log.release_query(self.id);
    }
}

/// Lazy iterator over a range of a [`LogQuery`].
///
/// Each item is read from disk when requested. Creating a new iterator over
/// the same range restarts from the beginning.
pub struct LogIter<'q> {
    query: &'q LogQuery,
    next: LogPosition,
    to: LogPosition,
    last: Option<LogPosition>,
}

impl Iterator for LogIter<'_> {
    type Item = CoreResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.to {
            return None;
        }
        let position = self.next;
        self.next = position.next();
        let entry = match self.query.log.read_entry(position) {
            Ok(entry) => entry,
            Err(e) => {
                self.next = self.to;
                return Some(Err(e));
            }
        };
        if let Some(last) = self.last {
            if entry.position <= last {
                self.next = self.to;
                return Some(Err(CoreError::log_corrupt(format!(
                    "entry {} follows {last}",
                    entry.position
                ))));
            }
        }
        self.last = Some(entry.position);
        Some(Ok(entry))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.next.distance_to(self.to)).unwrap_or(usize::MAX);
        (0, Some(remaining))
    }
}
