//! Point-in-time recovery.
//!
//! Rebuilds a store in a fresh directory from a source log: the newest usable
//! compaction snapshot is loaded first, then log entries are replayed up to
//! the requested position. Entries the rebuilt store rejects are not fatal;
//! each affected file is classified instead.

use crate::config::{Config, LogMode};
use crate::dir::{is_missing_or_empty, read_manifest, wipe_contents};
use crate::error::{CoreError, CoreResult};
use crate::oplog::LogQuery;
use crate::replay::Replayer;
use crate::store::{ConnectResult, RecordStore};
use crate::types::{FileId, LogPosition};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Wraps units of recovery work.
///
/// A host can take its own read lock here, or use the calls as cooperative
/// checkpoints. Recovery calls `run` once for snapshot loading and once per
/// batch of entries.
pub trait ReadAction {
    /// Runs `f` under the action.
    fn run<T>(&self, f: impl FnOnce() -> T) -> T;
}

/// A [`ReadAction`] that just runs the closure.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReadLock;

impl ReadAction for NoReadLock {
    fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        f()
    }
}

/// How well a file was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryState {
    /// Every operation for the file was applied.
    Ok,
    /// Content, attributes or scalar fields may be stale.
    Partial,
    /// The file's place in the tree could not be reproduced.
    Botched,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Partial => "PARTIAL",
            Self::Botched => "BOTCHED",
        })
    }
}

/// Summary of a recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryResult {
    /// Number of files in each state.
    pub file_state_counts: BTreeMap<RecoveryState, u64>,
    /// Attribute writes that could not be carried out.
    pub botched_attributes_count: u64,
    /// Position recovery stopped at (exclusive).
    pub recovered_up_to: LogPosition,
    /// Log entries replayed after the snapshot.
    pub entries_applied: u64,
    /// Compaction point the run started from, if any.
    pub started_from: Option<LogPosition>,
}

impl RecoveryResult {
    /// Files in `state`.
    #[must_use]
    pub fn count(&self, state: RecoveryState) -> u64 {
        self.file_state_counts.get(&state).copied().unwrap_or(0)
    }

    /// True if every file recovered `Ok` and no attribute was lost.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.count(RecoveryState::Partial) == 0
            && self.count(RecoveryState::Botched) == 0
            && self.botched_attributes_count == 0
    }
}

impl fmt::Display for RecoveryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recovered up to {}: {} OK, {} PARTIAL, {} BOTCHED, {} botched attributes ({} entries",
            self.recovered_up_to,
            self.count(RecoveryState::Ok),
            self.count(RecoveryState::Partial),
            self.count(RecoveryState::Botched),
            self.botched_attributes_count,
            self.entries_applied
        )?;
        match self.started_from {
            Some(position) => write!(f, " after snapshot {position})"),
            None => f.write_str(" from an empty store)"),
        }
    }
}

/// A recovered store and how the recovery went.
#[derive(Debug)]
pub struct Recovery {
    /// The rebuilt store, connected read-write with its own log.
    pub store: RecordStore,
    /// Per-file classification.
    pub result: RecoveryResult,
}

/// Rebuilds the state at `end_point` into `target_dir`.
///
/// The target gets the store version found in `source_dir`'s manifest, or
/// `config.version` when there is none. It is written with its own log, so
/// it can itself be recovered or compacted later.
///
/// A missing or damaged base snapshot is not fatal: recovery then starts from
/// an empty store at the query's `begin`, and files created before that
/// point come out `Botched`.
///
/// # Errors
///
/// - `TargetNotEmpty` if `target_dir` exists and has entries
/// - `InvalidOperation` if `end_point` lies outside the query window
/// - `LogCorrupt` for unreadable or out-of-order entries
///
/// The target directory is removed again on any error.
pub fn recover_from_point(
    end_point: LogPosition,
    query: &LogQuery,
    source_dir: Option<&Path>,
    target_dir: &Path,
    read_action: &impl ReadAction,
    config: &Config,
) -> CoreResult<Recovery> {
    if !is_missing_or_empty(target_dir)? {
        return Err(CoreError::TargetNotEmpty {
            path: target_dir.to_path_buf(),
        });
    }
    if end_point < query.begin() || end_point > query.end() {
        return Err(CoreError::invalid_operation(format!(
            "recovery point {end_point} is outside the log window [{}, {}]",
            query.begin(),
            query.end()
        )));
    }

    let version = match source_dir {
        Some(dir) => read_manifest(dir)?.map(|m| m.store_version),
        None => None,
    }
    .unwrap_or_else(|| config.effective_version());
    let target_config = config
        .clone()
        .version(Some(version))
        .create_if_missing(true)
        .read_only(false)
        .log_mode(LogMode::Enabled);

    let target_existed = target_dir.exists();
    match recover_into(end_point, query, target_dir, read_action, target_config) {
        Ok(recovery) => Ok(recovery),
        Err(e) => {
            warn!(target = %target_dir.display(), error = %e, "recovery failed, removing target");
            let cleanup = if target_existed {
                wipe_contents(target_dir)
            } else {
                fs::remove_dir_all(target_dir).map_err(CoreError::from)
            };
            if let Err(cleanup) = cleanup {
                warn!(target = %target_dir.display(), error = %cleanup, "failed to remove recovery target");
            }
            Err(e)
        }
    }
}

fn recover_into(
    end_point: LogPosition,
    query: &LogQuery,
    target_dir: &Path,
    read_action: &impl ReadAction,
    config: Config,
) -> CoreResult<Recovery> {
    let batch_size = config.recovery_batch_size.max(1);
    let ConnectResult { store, .. } = RecordStore::connect(target_dir, config)?;

    let base = query.base_snapshot_at(
        end_point,
        |reference| {
            warn!(snapshot = %reference, "base snapshot missing, recovering from an empty store");
            Ok(())
        },
        |reference, e| {
            warn!(snapshot = %reference, error = %e, "base snapshot unusable, recovering from an empty store");
            Ok(())
        },
    )?;
    let started_from = base.as_ref().map(|point| point.position());
    let start = started_from.unwrap_or(query.begin());

    let mut replayer = Replayer::new(&store);
    if let Some(point) = &base {
        read_action.run(|| replayer.load_snapshot(&point.snapshot))?;
    }

    let mut entries = query.iterate(start, end_point)?;
    loop {
        let exhausted = read_action.run(|| -> CoreResult<bool> {
            for _ in 0..batch_size {
                match entries.next() {
                    Some(entry) => replayer.replay_entry(query, &entry?)?,
                    None => return Ok(true),
                }
            }
            Ok(false)
        })?;
        if exhausted {
            break;
        }
    }
    let outcome = replayer.finish();

    let mut states = outcome.states;
    for id in store.unresolved_blobs()? {
        let state = states.entry(id).or_insert(RecoveryState::Partial);
        *state = (*state).max(RecoveryState::Partial);
    }
    let max_id = store.max_allocated_id()?;
    let mut file_state_counts = BTreeMap::new();
    for raw in 1..=max_id.0 {
        let state = states.remove(&FileId(raw)).unwrap_or(RecoveryState::Ok);
        *file_state_counts.entry(state).or_insert(0) += 1;
    }
    // Ids whose allocation itself failed.
    for state in states.into_values() {
        *file_state_counts.entry(state).or_insert(0) += 1;
    }

    store.flush()?;
    let result = RecoveryResult {
        file_state_counts,
        botched_attributes_count: outcome.botched_attributes,
        recovered_up_to: end_point,
        entries_applied: outcome.entries,
        started_from,
    };
    info!(target = %target_dir.display(), %result, "recovery finished");
    Ok(Recovery { store, result })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{RecordFlag, RecordFlags};
    use tempfile::tempdir;

    fn source(path: &Path) -> RecordStore {
        let store = RecordStore::connect(path, Config::default()).unwrap().store;
        let root = store
            .add_root("/", RecordFlags::from(RecordFlag::IsDirectory))
            .unwrap();
        let file = store.create_child(root, "f", RecordFlags::empty()).unwrap();
        store.write_content(file, b"data").unwrap();
        store
    }

    #[test]
    fn recovers_a_clean_log() {
        let temp = tempdir().unwrap();
        let store = source(&temp.path().join("src"));
        let log = store.log().unwrap();
        let query = log.query();

        let target = temp.path().join("dst");
        let recovery = recover_from_point(
            query.end(),
            &query,
            store.path(),
            &target,
            &NoReadLock,
            &Config::default(),
        )
        .unwrap();

        assert!(recovery.result.is_clean());
        assert_eq!(recovery.result.count(RecoveryState::Ok), 2);
        assert_eq!(recovery.store.list_roots().unwrap(), store.list_roots().unwrap());
        assert_eq!(
            recovery.store.read_content(FileId(2)).unwrap().as_deref(),
            Some(&b"data"[..])
        );
    }

    #[test]
    fn earlier_point_stops_replay() {
        let temp = tempdir().unwrap();
        let store = source(&temp.path().join("src"));
        let query = store.log().unwrap().query();

        let recovery = recover_from_point(
            LogPosition(5),
            &query,
            None,
            &temp.path().join("dst"),
            &NoReadLock,
            &Config::default(),
        )
        .unwrap();
        assert_eq!(recovery.result.entries_applied, 4);
        assert_eq!(recovery.store.max_allocated_id().unwrap(), FileId(1));
    }

    #[test]
    fn target_must_be_empty() {
        let temp = tempdir().unwrap();
        let store = source(&temp.path().join("src"));
        let query = store.log().unwrap().query();
        let target = temp.path().join("dst");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("keep.txt"), b"x").unwrap();

        let err = recover_from_point(
            query.end(),
            &query,
            None,
            &target,
            &NoReadLock,
            &Config::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::TargetNotEmpty { .. }));
        assert!(target.join("keep.txt").exists());
    }

    #[test]
    fn point_outside_window_is_rejected_and_target_left_alone() {
        let temp = tempdir().unwrap();
        let store = source(&temp.path().join("src"));
        let query = store.log().unwrap().query();
        let target = temp.path().join("dst");

        let err = recover_from_point(
            LogPosition(query.end().0 + 1),
            &query,
            None,
            &target,
            &NoReadLock,
            &Config::default(),
        )
        .unwrap_err();
        assert!(err.is_rejected_operation());
        assert!(!target.exists());
    }

    #[test]
    fn read_action_wraps_batches() {
        struct Counting(std::cell::Cell<usize>);
        impl ReadAction for Counting {
            fn run<T>(&self, f: impl FnOnce() -> T) -> T {
                self.0.set(self.0.get() + 1);
                f()
            }
        }

        let temp = tempdir().unwrap();
        let store = source(&temp.path().join("src"));
        let query = store.log().unwrap().query();
        let action = Counting(std::cell::Cell::new(0));
        recover_from_point(
            query.end(),
            &query,
            None,
            &temp.path().join("dst"),
            &action,
            &Config::default().recovery_batch_size(4),
        )
        .unwrap();
        // Nine entries in batches of four.
        assert_eq!(action.0.get(), 3);
    }
}
