//! Attribute store.
//!
//! Values are keyed by `(AttributeRecordId, AttributeId)`. Each attribute
//! record remembers the file that owns it so bulk enumeration can report
//! `(record, file, attribute, bytes)` without consulting the record table.
//!
//! The store is persisted as a journal of changes in `attributes.dat`,
//! replayed into memory on open.

use crate::codec::{encode_frame, scan_frames, ByteReader, ByteWriter};
use crate::error::{CoreError, CoreResult};
use crate::types::{AttributeId, AttributeRecordId, FileId};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;
use vfslog_storage::{FileBackend, InMemoryBackend, StorageBackend};

const TAG_CREATE: u8 = 1;
const TAG_PUT: u8 = 2;
const TAG_REMOVE: u8 = 3;
const TAG_DELETE_RECORD: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
enum JournalOp {
    Create {
        record: AttributeRecordId,
        file: FileId,
    },
    Put {
        record: AttributeRecordId,
        attribute: AttributeId,
        value: Vec<u8>,
    },
    Remove {
        record: AttributeRecordId,
        attribute: AttributeId,
    },
    DeleteRecord {
        record: AttributeRecordId,
    },
}

impl JournalOp {
    fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        match self {
            Self::Create { record, file } => {
                w.u8(TAG_CREATE).u32(record.0).u32(file.0);
            }
            Self::Put {
                record,
                attribute,
                value,
            } => {
                w.u8(TAG_PUT).u32(record.0).u32(attribute.0).bytes(value);
            }
            Self::Remove { record, attribute } => {
                w.u8(TAG_REMOVE).u32(record.0).u32(attribute.0);
            }
            Self::DeleteRecord { record } => {
                w.u8(TAG_DELETE_RECORD).u32(record.0);
            }
        }
        w.into_inner()
    }

    fn decode(body: &[u8]) -> CoreResult<Self> {
        let mut r = ByteReader::new(body, "attributes.dat", CoreError::corrupt_store);
        let op = match r.u8()? {
            TAG_CREATE => Self::Create {
                record: AttributeRecordId(r.u32()?),
                file: FileId(r.u32()?),
            },
            TAG_PUT => Self::Put {
                record: AttributeRecordId(r.u32()?),
                attribute: AttributeId(r.u32()?),
                value: r.bytes()?.to_vec(),
            },
            TAG_REMOVE => Self::Remove {
                record: AttributeRecordId(r.u32()?),
                attribute: AttributeId(r.u32()?),
            },
            TAG_DELETE_RECORD => Self::DeleteRecord {
                record: AttributeRecordId(r.u32()?),
            },
            tag => return Err(r.fail(format!("unknown journal tag {tag}"))),
        };
        r.finish()?;
        Ok(op)
    }
}

#[derive(Debug, Clone, Default)]
struct AttributeRecord {
    file: FileId,
    values: BTreeMap<AttributeId, Vec<u8>>,
}

/// In-memory view of the attribute journal.
pub(crate) struct AttributeStore {
    backend: Box<dyn StorageBackend>,
    records: BTreeMap<AttributeRecordId, AttributeRecord>,
    next_record: u32,
}

impl AttributeStore {
    pub(crate) fn in_memory() -> Self {
        Self {
            backend: Box::new(InMemoryBackend::new()),
            records: BTreeMap::new(),
            next_record: 1,
        }
    }

    pub(crate) fn open(path: &Path, read_only: bool) -> CoreResult<Self> {
        let mut backend = if read_only {
            FileBackend::open_read_only(path)?
        } else {
            FileBackend::open(path)?
        };
        let data = backend.read_all()?;
        let scan = scan_frames(&data, "attributes.dat")?;
        if scan.valid_len < data.len() as u64 {
            warn!(path = %path.display(), "dropping torn tail of attribute journal");
            if !read_only {
                backend.truncate(scan.valid_len)?;
            }
        }

        let mut store = Self {
            backend: Box::new(backend),
            records: BTreeMap::new(),
            next_record: 1,
        };
        for index in 0..scan.frames.len() {
            let op = JournalOp::decode(scan.body(&data, index))?;
            store.replay(op).map_err(|message| {
                CoreError::corrupt_store(format!(
                    "attributes.dat: entry {}: {message}",
                    index + 1
                ))
            })?;
        }
        Ok(store)
    }

    fn replay(&mut self, op: JournalOp) -> Result<(), String> {
        match op {
            JournalOp::Create { record, file } => {
                if record.is_none() || self.records.contains_key(&record) {
                    return Err(format!("{record} created twice"));
                }
                self.next_record = self.next_record.max(record.0 + 1);
                self.records.insert(
                    record,
                    AttributeRecord {
                        file,
                        values: BTreeMap::new(),
                    },
                );
            }
            JournalOp::Put {
                record,
                attribute,
                value,
            } => {
                let entry = self
                    .records
                    .get_mut(&record)
                    .ok_or_else(|| format!("write to unknown {record}"))?;
                entry.values.insert(attribute, value);
            }
            JournalOp::Remove { record, attribute } => {
                let entry = self
                    .records
                    .get_mut(&record)
                    .ok_or_else(|| format!("removal from unknown {record}"))?;
                entry.values.remove(&attribute);
            }
            JournalOp::DeleteRecord { record } => {
                self.records
                    .remove(&record)
                    .ok_or_else(|| format!("deletion of unknown {record}"))?;
            }
        }
        Ok(())
    }

    fn journal(&mut self, op: JournalOp) -> CoreResult<()> {
        self.backend.append(&encode_frame(&op.encode()))?;
        self.replay(op).map_err(CoreError::invalid_operation)
    }

    /// Drops every record and truncates the journal.
    pub(crate) fn clear(&mut self) -> CoreResult<()> {
        self.backend.truncate(0)?;
        self.records.clear();
        self.next_record = 1;
        Ok(())
    }

    pub(crate) fn create_record(&mut self, file: FileId) -> CoreResult<AttributeRecordId> {
        let record = AttributeRecordId(self.next_record);
        self.journal(JournalOp::Create { record, file })?;
        Ok(record)
    }

    pub(crate) fn put(
        &mut self,
        record: AttributeRecordId,
        attribute: AttributeId,
        value: &[u8],
    ) -> CoreResult<()> {
        if !self.records.contains_key(&record) {
            return Err(CoreError::invalid_operation(format!("unknown {record}")));
        }
        self.journal(JournalOp::Put {
            record,
            attribute,
            value: value.to_vec(),
        })
    }

    pub(crate) fn remove(
        &mut self,
        record: AttributeRecordId,
        attribute: AttributeId,
    ) -> CoreResult<()> {
        if !self.has(record, attribute) {
            return Err(CoreError::invalid_operation(format!(
                "{record} has no {attribute}"
            )));
        }
        self.journal(JournalOp::Remove { record, attribute })
    }

    pub(crate) fn delete_record(&mut self, record: AttributeRecordId) -> CoreResult<()> {
        if !self.records.contains_key(&record) {
            return Ok(());
        }
        self.journal(JournalOp::DeleteRecord { record })
    }

    pub(crate) fn owner(&self, record: AttributeRecordId) -> Option<FileId> {
        self.records.get(&record).map(|entry| entry.file)
    }

    pub(crate) fn has(&self, record: AttributeRecordId, attribute: AttributeId) -> bool {
        self.records
            .get(&record)
            .is_some_and(|entry| entry.values.contains_key(&attribute))
    }

    pub(crate) fn read(&self, record: AttributeRecordId, attribute: AttributeId) -> Option<&[u8]> {
        self.records
            .get(&record)
            .and_then(|entry| entry.values.get(&attribute))
            .map(Vec::as_slice)
    }

    /// Values of one record in attribute order.
    pub(crate) fn values(
        &self,
        record: AttributeRecordId,
    ) -> impl Iterator<Item = (AttributeId, &[u8])> {
        self.records
            .get(&record)
            .into_iter()
            .flat_map(|entry| entry.values.iter().map(|(id, v)| (*id, v.as_slice())))
    }

    /// Visits every stored value as `(record, file, attribute, bytes)`.
    pub(crate) fn for_each(
        &self,
        mut visit: impl FnMut(AttributeRecordId, FileId, AttributeId, &[u8]),
    ) {
        for (record, entry) in &self.records {
            for (attribute, value) in &entry.values {
                visit(*record, entry.file, *attribute, value);
            }
        }
    }

    pub(crate) fn sync(&mut self) -> CoreResult<()> {
        self.backend.sync().map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_carry_owner() {
        let mut store = AttributeStore::in_memory();
        let rec = store.create_record(FileId(4)).unwrap();
        store.put(rec, AttributeId(1), b"v1").unwrap();
        store.put(rec, AttributeId(1), b"v2").unwrap();
        store.put(rec, AttributeId(2), b"other").unwrap();

        assert_eq!(store.owner(rec), Some(FileId(4)));
        assert_eq!(store.read(rec, AttributeId(1)), Some(&b"v2"[..]));

        let mut seen = Vec::new();
        store.for_each(|r, file, attr, bytes| seen.push((r, file, attr, bytes.to_vec())));
        assert_eq!(
            seen,
            vec![
                (rec, FileId(4), AttributeId(1), b"v2".to_vec()),
                (rec, FileId(4), AttributeId(2), b"other".to_vec()),
            ]
        );
    }

    #[test]
    fn removal_of_absent_value_rejected() {
        let mut store = AttributeStore::in_memory();
        let rec = store.create_record(FileId(1)).unwrap();
        assert!(store.remove(rec, AttributeId(3)).is_err());
        assert!(store.put(AttributeRecordId(99), AttributeId(1), b"x").is_err());
    }

    #[test]
    fn journal_replays_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("attributes.dat");
        let (kept, deleted) = {
            let mut store = AttributeStore::open(&path, false).unwrap();
            let kept = store.create_record(FileId(1)).unwrap();
            let deleted = store.create_record(FileId(2)).unwrap();
            store.put(kept, AttributeId(7), b"seven").unwrap();
            store.put(kept, AttributeId(8), b"eight").unwrap();
            store.remove(kept, AttributeId(8)).unwrap();
            store.put(deleted, AttributeId(7), b"gone").unwrap();
            store.delete_record(deleted).unwrap();
            store.sync().unwrap();
            (kept, deleted)
        };

        let mut store = AttributeStore::open(&path, false).unwrap();
        assert!(store.has(kept, AttributeId(7)));
        assert!(!store.has(kept, AttributeId(8)));
        assert_eq!(store.owner(deleted), None);
        let fresh = store.create_record(FileId(3)).unwrap();
        assert!(fresh.0 > deleted.0);
    }
}
