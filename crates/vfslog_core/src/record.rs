//! File records and the record table.
//!
//! The table is kept in memory and persisted to `records.dat` as one
//! checksummed image, rewritten atomically on flush:
//!
//! ```text
//! "VREC" | format: u16 | root_count: u32 | roots: u32* | record_count: u32 |
//! records* | crc32: u32
//! ```
//!
//! Record ids are dense: record `n` sits at index `n - 1`.

use crate::codec::{checksum, len_u32, ByteReader, ByteWriter};
use crate::error::{CoreError, CoreResult};
use crate::flags::RecordFlags;
use crate::types::{AttributeRecordId, ContentId, FileId, NameId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const RECORDS_MAGIC: [u8; 4] = *b"VREC";
const RECORDS_FORMAT: u16 = 1;

/// Metadata for one file, directory or symlink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Primary key.
    pub id: FileId,
    /// Parent record, `NONE` for roots.
    pub parent_id: FileId,
    /// Interned name.
    pub name_id: NameId,
    /// Status flags.
    pub flags: RecordFlags,
    /// Modification timestamp.
    pub timestamp: i64,
    /// File length.
    pub length: i64,
    /// Stored content, `NONE` when nothing is stored.
    pub content_id: ContentId,
    /// Children. Only meaningful with `ChildrenCached`.
    pub children: Vec<FileId>,
    /// Attribute record, `NONE` when the file has no attributes.
    pub attribute_record_id: AttributeRecordId,
}

impl FileRecord {
    /// A freshly allocated record with every field empty.
    #[must_use]
    pub fn new(id: FileId) -> Self {
        Self {
            id,
            parent_id: FileId::NONE,
            name_id: NameId::NONE,
            flags: RecordFlags::empty(),
            timestamp: 0,
            length: 0,
            content_id: ContentId::NONE,
            children: Vec::new(),
            attribute_record_id: AttributeRecordId::NONE,
        }
    }

    /// A tombstone: only the id and `{FreeRecord}` survive.
    #[must_use]
    pub fn tombstone(id: FileId) -> Self {
        Self {
            flags: RecordFlags::tombstone(),
            ..Self::new(id)
        }
    }

    /// Returns true unless the record is a tombstone.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.flags.is_free()
    }

    fn encode(&self, w: &mut ByteWriter) {
        w.u32(self.id.0)
            .u32(self.parent_id.0)
            .u32(self.name_id.0)
            .u16(self.flags.bits())
            .i64(self.timestamp)
            .i64(self.length)
            .u32(self.content_id.0)
            .u32(self.attribute_record_id.0)
            .u32(len_u32(self.children.len()));
        for child in &self.children {
            w.u32(child.0);
        }
    }

    fn decode(r: &mut ByteReader<'_>) -> CoreResult<Self> {
        let id = FileId(r.u32()?);
        let parent_id = FileId(r.u32()?);
        let name_id = NameId(r.u32()?);
        let flags = RecordFlags::from_bits(r.u16()?)
            .map_err(|e| CoreError::corrupt_store(format!("records.dat: {id}: {e}")))?;
        let timestamp = r.i64()?;
        let length = r.i64()?;
        let content_id = ContentId(r.u32()?);
        let attribute_record_id = AttributeRecordId(r.u32()?);
        let child_count = r.u32()?;
        let children = (0..child_count)
            .map(|_| r.u32().map(FileId))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self {
            id,
            parent_id,
            name_id,
            flags,
            timestamp,
            length,
            content_id,
            children,
            attribute_record_id,
        })
    }
}

/// All records of a store plus its root set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordTable {
    records: Vec<FileRecord>,
    roots: BTreeSet<FileId>,
}

impl RecordTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The id the next allocation must use.
    #[must_use]
    pub fn next_id(&self) -> FileId {
        FileId(len_u32(self.records.len()) + 1)
    }

    /// Highest allocated id, `NONE` for an empty table.
    #[must_use]
    pub fn max_id(&self) -> FileId {
        FileId(len_u32(self.records.len()))
    }

    /// Appends a fresh record. `id` must equal [`Self::next_id`].
    pub(crate) fn push(&mut self, record: FileRecord) {
        debug_assert_eq!(record.id, self.next_id());
        self.records.push(record);
    }

    /// Returns the record, tombstone or not.
    #[must_use]
    pub fn get(&self, id: FileId) -> Option<&FileRecord> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.records.get(index)
    }

    /// Returns the record only if it is live.
    #[must_use]
    pub fn live(&self, id: FileId) -> Option<&FileRecord> {
        self.get(id).filter(|record| record.is_live())
    }

    pub(crate) fn get_mut(&mut self, id: FileId) -> Option<&mut FileRecord> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.records.get_mut(index)
    }

    /// Returns true if `id` is allocated and not tombstoned.
    #[must_use]
    pub fn is_live(&self, id: FileId) -> bool {
        self.live(id).is_some()
    }

    /// Iterates all records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.iter()
    }

    /// Number of allocated records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing was ever allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The root set.
    #[must_use]
    pub fn roots(&self) -> &BTreeSet<FileId> {
        &self.roots
    }

    pub(crate) fn roots_mut(&mut self) -> &mut BTreeSet<FileId> {
        &mut self.roots
    }

    /// Encodes the table into the `records.dat` image.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.raw(&RECORDS_MAGIC)
            .u16(RECORDS_FORMAT)
            .u32(len_u32(self.roots.len()));
        for root in &self.roots {
            w.u32(root.0);
        }
        w.u32(len_u32(self.records.len()));
        for record in &self.records {
            record.encode(&mut w);
        }
        let mut bytes = w.into_inner();
        let crc = checksum(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Decodes a `records.dat` image.
    ///
    /// # Errors
    ///
    /// Returns `CorruptStore` on a bad magic, checksum or layout.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < RECORDS_MAGIC.len() + 2 + 4 || data[..4] != RECORDS_MAGIC {
            return Err(CoreError::corrupt_store("records.dat: bad magic"));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let mut stored = [0u8; 4];
        stored.copy_from_slice(trailer);
        let stored = u32::from_le_bytes(stored);
        let actual = checksum(body);
        if stored != actual {
            return Err(CoreError::corrupt_store(format!(
                "records.dat: checksum mismatch: expected {stored:08x}, got {actual:08x}"
            )));
        }

        let mut r = ByteReader::new(&body[4..], "records.dat", CoreError::corrupt_store);
        let format = r.u16()?;
        if format != RECORDS_FORMAT {
            return Err(r.fail(format!("unsupported format {format}")));
        }
        let root_count = r.u32()?;
        let roots = (0..root_count)
            .map(|_| r.u32().map(FileId))
            .collect::<CoreResult<BTreeSet<_>>>()?;
        let record_count = r.u32()?;
        let mut records = Vec::with_capacity(record_count.min(1 << 20) as usize);
        for expected in 1..=record_count {
            let record = FileRecord::decode(&mut r)?;
            if record.id != FileId(expected) {
                return Err(r.fail(format!(
                    "record {} stored at slot {expected}",
                    record.id
                )));
            }
            records.push(record);
        }
        r.finish()?;
        Ok(Self { records, roots })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::RecordFlag;

    fn sample() -> RecordTable {
        let mut table = RecordTable::new();
        let mut root = FileRecord::new(FileId(1));
        root.flags = RecordFlags::from(RecordFlag::IsDirectory).with(RecordFlag::ChildrenCached);
        root.children = vec![FileId(2)];
        table.push(root);
        let mut child = FileRecord::new(FileId(2));
        child.parent_id = FileId(1);
        child.length = 5;
        child.timestamp = -17;
        table.push(child);
        table.push(FileRecord::tombstone(FileId(3)));
        table.roots_mut().insert(FileId(1));
        table
    }

    #[test]
    fn ids_are_dense() {
        let table = sample();
        assert_eq!(table.max_id(), FileId(3));
        assert_eq!(table.next_id(), FileId(4));
        assert!(table.get(FileId(0)).is_none());
        assert!(table.get(FileId(4)).is_none());
        assert!(table.get(FileId(3)).is_some());
        assert!(table.live(FileId(3)).is_none());
    }

    #[test]
    fn image_decodes_to_same_table() {
        let table = sample();
        assert_eq!(RecordTable::decode(&table.encode()).unwrap(), table);
    }

    #[test]
    fn damaged_image_is_corrupt() {
        let mut image = sample().encode();
        let mid = image.len() / 2;
        image[mid] ^= 0x40;
        assert!(matches!(
            RecordTable::decode(&image),
            Err(CoreError::CorruptStore { .. })
        ));
        assert!(RecordTable::decode(b"VRE").is_err());
    }

    #[test]
    fn tombstone_keeps_only_id() {
        let record = FileRecord::tombstone(FileId(9));
        assert!(!record.is_live());
        assert_eq!(record.flags, RecordFlags::tombstone());
        assert_eq!(record.parent_id, FileId::NONE);
    }
}
