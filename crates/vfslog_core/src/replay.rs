//! Replaying log entries into a store.
//!
//! Shared by compaction and recovery. Operations the target store rejects do
//! not stop the replay; they degrade the affected file instead.

use crate::error::{CoreError, CoreResult};
use crate::flags::RecordFlag;
use crate::oplog::{LogEntry, LogQuery, LoggedOperation, OpKind, Operation, ResolvedOperation};
use crate::recovery::RecoveryState;
use crate::snapshot::RecordSnapshot;
use crate::store::{snapshot_operations, RecordStore};
use crate::types::{FileId, LogPosition};
use std::collections::BTreeMap;
use tracing::warn;

/// What a replay did.
#[derive(Debug, Default)]
pub(crate) struct ReplayOutcome {
    /// Log entries read and handed to the store.
    pub(crate) entries: u64,
    /// Files that ended up worse than `Ok`.
    pub(crate) states: BTreeMap<FileId, RecoveryState>,
    /// Attribute writes that could not be carried out.
    pub(crate) botched_attributes: u64,
    /// Last replayed position.
    pub(crate) last: Option<LogPosition>,
}

impl ReplayOutcome {
    pub(crate) fn degraded_files(&self) -> usize {
        self.states.len()
    }
}

pub(crate) struct Replayer<'s> {
    store: &'s RecordStore,
    outcome: ReplayOutcome,
}

impl<'s> Replayer<'s> {
    pub(crate) fn new(store: &'s RecordStore) -> Self {
        Self {
            store,
            outcome: ReplayOutcome::default(),
        }
    }

    /// Materializes a snapshot through the store's mutators.
    pub(crate) fn load_snapshot(&mut self, snapshot: &RecordSnapshot) -> CoreResult<()> {
        for operation in snapshot_operations(snapshot) {
            self.apply(&operation)?;
        }
        Ok(())
    }

    /// Applies one log entry, fetching its payload through `query`.
    ///
    /// # Errors
    ///
    /// `LogCorrupt` if positions do not increase; I/O and other non-validation
    /// errors from the store.
    pub(crate) fn replay_entry(&mut self, query: &LogQuery, entry: &LogEntry) -> CoreResult<()> {
        if let Some(last) = self.outcome.last {
            if entry.position <= last {
                return Err(CoreError::log_corrupt(format!(
                    "entry {} replayed after {last}",
                    entry.position
                )));
            }
        }
        match query.resolve(entry)? {
            ResolvedOperation::Ready(operation) => self.apply(&operation)?,
            ResolvedOperation::PayloadUnavailable(operation) => {
                self.payload_unavailable(&operation)?;
            }
        }
        self.outcome.entries += 1;
        self.outcome.last = Some(entry.position);
        Ok(())
    }

    fn apply(&mut self, operation: &Operation) -> CoreResult<()> {
        match self.store.apply(operation) {
            Ok(_) => Ok(()),
            Err(e) if e.is_rejected_operation() => {
                let kind = operation.kind();
                let id = operation.file_id();
                let state = if kind.is_structural() {
                    RecoveryState::Botched
                } else {
                    RecoveryState::Partial
                };
                if kind == OpKind::SetAttribute {
                    self.outcome.botched_attributes += 1;
                }
                warn!(file = %id, %kind, %state, error = %e, "replayed operation rejected");
                self.mark(id, state);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn payload_unavailable(&mut self, operation: &LoggedOperation) -> CoreResult<()> {
        let id = operation.file_id();
        self.mark(id, RecoveryState::Partial);
        match operation {
            Operation::SetContent { .. } => {
                let flags = self.store.get_flags(id)?.filter(|f| !f.is_free());
                if let Some(flags) = flags {
                    self.apply(&Operation::SetFlags {
                        id,
                        flags: flags.with(RecordFlag::MustReloadContent),
                    })?;
                }
            }
            Operation::SetAttribute { .. } => self.outcome.botched_attributes += 1,
            _ => {}
        }
        Ok(())
    }

    fn mark(&mut self, id: FileId, state: RecoveryState) {
        let current = self.outcome.states.entry(id).or_insert(state);
        *current = (*current).max(state);
    }

    pub(crate) fn finish(self) -> ReplayOutcome {
        self.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::NameTable;
    use crate::oplog::OperationLog;
    use crate::types::AttributeId;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn scratch() -> RecordStore {
        RecordStore::in_memory(Arc::new(NameTable::in_memory()))
    }

    #[test]
    fn rejected_operations_degrade_files() {
        let temp = tempdir().unwrap();
        let log = OperationLog::open(temp.path(), false).unwrap();
        for op in [
            Operation::AllocateRecord { id: FileId(1) },
            Operation::CreateRoot { id: FileId(1) },
            Operation::SetParent {
                id: FileId(1),
                parent: FileId(8),
            },
            Operation::SetLength {
                id: FileId(5),
                length: 3,
            },
            Operation::SetAttribute {
                id: FileId(1),
                attribute_id: AttributeId(2),
                value: None,
            },
        ] {
            log.append(&op).unwrap();
        }

        let store = scratch();
        let query = log.query();
        let mut replayer = Replayer::new(&store);
        for entry in query.entries() {
            replayer.replay_entry(&query, &entry.unwrap()).unwrap();
        }
        let outcome = replayer.finish();

        assert_eq!(outcome.entries, 5);
        assert_eq!(outcome.states.get(&FileId(1)), Some(&RecoveryState::Botched));
        assert_eq!(outcome.states.get(&FileId(5)), Some(&RecoveryState::Partial));
        assert_eq!(outcome.botched_attributes, 1);
        assert_eq!(store.list_roots().unwrap(), vec![FileId(1)]);
    }

    #[test]
    fn worst_state_wins() {
        let store = scratch();
        let mut replayer = Replayer::new(&store);
        replayer.mark(FileId(3), RecoveryState::Botched);
        replayer.mark(FileId(3), RecoveryState::Partial);
        assert_eq!(replayer.finish().states[&FileId(3)], RecoveryState::Botched);
    }
}
