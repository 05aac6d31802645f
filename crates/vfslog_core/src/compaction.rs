//! Log compaction.
//!
//! Compaction folds a prefix of the log into a snapshot so that replay can
//! start from the snapshot instead of position 1. The fold happens in a
//! scratch in-memory store; the live store is never involved.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::names::NameTable;
use crate::oplog::{LogQuery, OperationLog, ReclaimStats, SnapshotRef};
use crate::replay::Replayer;
use crate::store::RecordStore;
use crate::types::LogPosition;
use parking_lot::MutexGuard;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Exclusive right to compact a log.
///
/// Holds the log's compaction lock and a query pinning the window the
/// compaction reads. At most one context exists per log at a time.
pub struct CompactionContext<'c> {
    _guard: MutexGuard<'c, ()>,
    query: LogQuery,
}

impl CompactionContext<'_> {
    /// The window this context reads.
    #[must_use]
    pub fn query(&self) -> &LogQuery {
        &self.query
    }
}

/// What a compaction did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionStats {
    /// The new compaction position. Equal to the old one when nothing was
    /// compacted.
    pub boundary: LogPosition,
    /// Entries folded into the snapshot.
    pub entries_folded: u64,
    /// The snapshot written, if any.
    pub snapshot: Option<SnapshotRef>,
    /// Files the fold could not reproduce exactly.
    pub degraded_files: usize,
    /// Space reclaimed afterwards.
    pub reclaimed: ReclaimStats,
}

/// Computes how far compaction may go.
///
/// `min(target, end, open query begins)`, never below `begin`.
#[must_use]
pub fn safe_boundary(
    target: LogPosition,
    begin: LogPosition,
    end: LogPosition,
    open_query_begins: &[LogPosition],
) -> LogPosition {
    open_query_begins
        .iter()
        .copied()
        .fold(target.min(end), LogPosition::min)
        .max(begin)
}

/// Compacts an [`OperationLog`].
#[derive(Debug)]
pub struct CompactionController {
    log: Arc<OperationLog>,
    reclaim: bool,
}

impl CompactionController {
    /// Creates a controller that reclaims space after compacting.
    #[must_use]
    pub fn new(log: Arc<OperationLog>) -> Self {
        Self { log, reclaim: true }
    }

    /// Creates a controller following `config.reclaim_on_compaction`.
    #[must_use]
    pub fn with_config(log: Arc<OperationLog>, config: &Config) -> Self {
        Self {
            log,
            reclaim: config.reclaim_on_compaction,
        }
    }

    /// The compacted log.
    #[must_use]
    pub fn log(&self) -> &Arc<OperationLog> {
        &self.log
    }

    /// Takes the compaction lock, blocking while another compaction runs.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` for a read-only log.
    pub fn acquire_compaction_context(&self) -> CoreResult<CompactionContext<'_>> {
        if self.log.is_read_only() {
            return Err(CoreError::read_only("cannot compact a read-only log"));
        }
        let guard = self.log.compaction_guard();
        let query = self.log.query();
        Ok(CompactionContext {
            _guard: guard,
            query,
        })
    }

    /// Compacts up to `target` and returns the boundary actually used.
    ///
    /// # Errors
    ///
    /// See [`CompactionController::compact`].
    pub fn force_compaction_up_to(
        &self,
        ctx: &CompactionContext<'_>,
        target: LogPosition,
    ) -> CoreResult<LogPosition> {
        self.compact(ctx, target).map(|stats| stats.boundary)
    }

    /// Compacts up to `target`.
    ///
    /// The boundary is lowered to the oldest begin of any other open query
    /// and to the end of the context's window. When it does not move past
    /// the current compaction position nothing is written.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotUnavailable` if the current base snapshot cannot be
    /// loaded, `LogCorrupt` if an entry in the folded range is unreadable,
    /// or an I/O error writing the new snapshot. Reclamation failures are
    /// logged and ignored.
    pub fn compact(
        &self,
        ctx: &CompactionContext<'_>,
        target: LogPosition,
    ) -> CoreResult<CompactionStats> {
        let query = &ctx.query;
        // An earlier compaction under the same context may have moved begin.
        let begin = self.log.begin().max(query.begin());
        let open = self.log.open_query_begins(Some(query.id()));
        let boundary = safe_boundary(target, begin, query.end(), &open);
        if boundary == begin {
            debug!(%target, %begin, "nothing to compact");
            return Ok(CompactionStats {
                boundary,
                entries_folded: 0,
                snapshot: None,
                degraded_files: 0,
                reclaimed: ReclaimStats::default(),
            });
        }

        let base = query.base_snapshot_at(
            begin,
            |reference| {
                Err(CoreError::snapshot_unavailable(
                    reference.position,
                    format!("{} is missing", reference.file_name),
                ))
            },
            |reference, e| {
                Err(CoreError::snapshot_unavailable(
                    reference.position,
                    e.to_string(),
                ))
            },
        )?;

        let scratch = RecordStore::in_memory(Arc::new(NameTable::in_memory()));
        let mut replayer = Replayer::new(&scratch);
        if let Some(point) = &base {
            replayer.load_snapshot(&point.snapshot)?;
        }
        for entry in query.iterate(begin, boundary)? {
            replayer.replay_entry(query, &entry?)?;
        }
        let outcome = replayer.finish();
        if outcome.degraded_files() > 0 {
            warn!(
                degraded = outcome.degraded_files(),
                %boundary,
                "compaction folded entries that did not replay cleanly"
            );
        }

        let snapshot = scratch.export_snapshot(boundary)?;
        let reference = self.log.record_compaction(&snapshot)?;

        let reclaimed = if self.reclaim {
            match self.log.reclaim(boundary, Some(query.id())) {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(error = %e, %boundary, "reclamation after compaction failed");
                    ReclaimStats::default()
                }
            }
        } else {
            ReclaimStats::default()
        };

        info!(
            from = %begin,
            to = %boundary,
            requested = %target,
            records = reference.record_count,
            "compacted operation log"
        );
        Ok(CompactionStats {
            boundary,
            entries_folded: begin.distance_to(boundary),
            snapshot: Some(reference),
            degraded_files: outcome.degraded_files(),
            reclaimed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::Operation;
    use crate::types::FileId;
    use tempfile::tempdir;

    fn p(n: u64) -> LogPosition {
        LogPosition(n)
    }

    #[test]
    fn boundary_rules() {
        assert_eq!(safe_boundary(p(10), p(1), p(20), &[]), p(10));
        assert_eq!(safe_boundary(p(30), p(1), p(20), &[]), p(20));
        assert_eq!(safe_boundary(p(10), p(1), p(20), &[p(4), p(7)]), p(4));
        assert_eq!(safe_boundary(p(10), p(5), p(20), &[p(2)]), p(5));
        assert_eq!(safe_boundary(p(3), p(5), p(20), &[]), p(5));
    }

    fn log_with_roots(count: u32) -> (tempfile::TempDir, Arc<OperationLog>) {
        let temp = tempdir().unwrap();
        let log = OperationLog::open(temp.path(), false).unwrap();
        for id in 1..=count {
            log.append(&Operation::AllocateRecord { id: FileId(id) }).unwrap();
            log.append(&Operation::CreateRoot { id: FileId(id) }).unwrap();
        }
        (temp, log)
    }

    #[test]
    fn compaction_moves_begin() {
        let (_temp, log) = log_with_roots(3);
        let controller = CompactionController::new(Arc::clone(&log));
        let ctx = controller.acquire_compaction_context().unwrap();
        let stats = controller.compact(&ctx, p(5)).unwrap();
        drop(ctx);

        assert_eq!(stats.boundary, p(5));
        assert_eq!(stats.entries_folded, 4);
        assert_eq!(log.begin(), p(5));
        let point = log.compaction_points().pop().unwrap();
        assert_eq!(point.position, p(5));
        assert_eq!(point.record_count, 2);
    }

    #[test]
    fn open_query_holds_boundary_back() {
        let (_temp, log) = log_with_roots(2);
        let controller = CompactionController::new(Arc::clone(&log));
        {
            let ctx = controller.acquire_compaction_context().unwrap();
            controller.force_compaction_up_to(&ctx, p(3)).unwrap();
        }
        let reader = log.query();
        log.append(&Operation::AllocateRecord { id: FileId(3) }).unwrap();

        let ctx = controller.acquire_compaction_context().unwrap();
        let reached = controller.force_compaction_up_to(&ctx, p(6)).unwrap();
        assert_eq!(reached, reader.begin());
        assert_eq!(reached, p(3));
    }

    #[test]
    fn repeated_compaction_builds_on_the_previous_snapshot() {
        let (_temp, log) = log_with_roots(4);
        let controller = CompactionController::new(Arc::clone(&log));
        for target in [p(3), p(7), p(9)] {
            let ctx = controller.acquire_compaction_context().unwrap();
            controller.compact(&ctx, target).unwrap();
        }
        let point = log.compaction_points().pop().unwrap();
        assert_eq!(point.position, p(9));
        assert_eq!(point.record_count, 4);
    }

    #[test]
    fn second_compaction_under_one_context_starts_at_the_new_begin() {
        let (_temp, log) = log_with_roots(3);
        let controller = CompactionController::new(Arc::clone(&log));
        let ctx = controller.acquire_compaction_context().unwrap();
        assert_eq!(controller.force_compaction_up_to(&ctx, p(5)).unwrap(), p(5));

        let stats = controller.compact(&ctx, p(3)).unwrap();
        assert_eq!(stats.boundary, p(5));
        assert!(stats.snapshot.is_none());

        let stats = controller.compact(&ctx, p(7)).unwrap();
        assert_eq!(stats.entries_folded, 2);
        assert_eq!(stats.snapshot.unwrap().record_count, 3);
    }

    #[test]
    fn missing_base_snapshot_is_fatal() {
        let (temp, log) = log_with_roots(3);
        let controller = CompactionController::new(Arc::clone(&log));
        {
            let ctx = controller.acquire_compaction_context().unwrap();
            controller.compact(&ctx, p(3)).unwrap();
        }
        let point = log.compaction_points().pop().unwrap();
        std::fs::remove_file(temp.path().join("snapshots").join(&point.file_name)).unwrap();

        let ctx = controller.acquire_compaction_context().unwrap();
        let err = controller.compact(&ctx, p(7)).unwrap_err();
        assert!(matches!(err, CoreError::SnapshotUnavailable { .. }));
    }
}
