//! Record store snapshots.
//!
//! A snapshot captures the full logical state of a store: every record
//! (tombstones included, so id allocation is reproduced), the root set, and
//! the bytes of content and attributes. Names are stored as strings so a
//! snapshot can be loaded into a store with a different name table.
//!
//! Snapshots are serialized with CBOR and identified by their SHA-256 digest.

use crate::error::{CoreError, CoreResult};
use crate::flags::RecordFlags;
use crate::types::{AttributeId, FileId, LogPosition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One record inside a [`RecordSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Record id.
    pub id: FileId,
    /// Parent id, `NONE` for roots and tombstones.
    pub parent_id: FileId,
    /// Name, if the record has one.
    pub name: Option<String>,
    /// Flags; `{FreeRecord}` for tombstones.
    pub flags: RecordFlags,
    /// Timestamp.
    pub timestamp: i64,
    /// Length.
    pub length: i64,
    /// Children list.
    pub children: Vec<FileId>,
    /// Content bytes, if any are stored.
    pub content: Option<Vec<u8>>,
    /// Attribute values in attribute order.
    pub attributes: Vec<(AttributeId, Vec<u8>)>,
}

impl SnapshotRecord {
    /// Returns true unless the record is a tombstone.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.flags.is_free()
    }
}

/// The cumulative effect of every log entry before `position`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// First position not folded into this snapshot.
    pub position: LogPosition,
    /// Root set in ascending order.
    pub roots: Vec<FileId>,
    /// All records in id order.
    pub records: Vec<SnapshotRecord>,
}

impl RecordSnapshot {
    /// Serializes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns a `Snapshot` error if serialization fails.
    pub fn to_cbor(&self) -> CoreResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes).map_err(CoreError::snapshot)?;
        Ok(bytes)
    }

    /// Deserializes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns a `Snapshot` error if the bytes are not a valid snapshot.
    pub fn from_cbor(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::de::from_reader(bytes).map_err(CoreError::snapshot)
    }

    /// Number of live records.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_live()).count()
    }
}

/// SHA-256 of a serialized snapshot.
#[must_use]
pub fn snapshot_digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Lower-case hex rendering of a digest.
#[must_use]
pub fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::RecordFlag;

    fn sample() -> RecordSnapshot {
        RecordSnapshot {
            position: LogPosition(12),
            roots: vec![FileId(1)],
            records: vec![
                SnapshotRecord {
                    id: FileId(1),
                    parent_id: FileId::NONE,
                    name: Some("/".into()),
                    flags: RecordFlags::from(RecordFlag::IsDirectory),
                    timestamp: 100,
                    length: 0,
                    children: vec![FileId(2)],
                    content: None,
                    attributes: vec![(AttributeId(3), b"meta".to_vec())],
                },
                SnapshotRecord {
                    id: FileId(2),
                    parent_id: FileId::NONE,
                    name: None,
                    flags: RecordFlags::tombstone(),
                    timestamp: 0,
                    length: 0,
                    children: Vec::new(),
                    content: None,
                    attributes: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn cbor_preserves_snapshot() {
        let snapshot = sample();
        let bytes = snapshot.to_cbor().unwrap();
        assert_eq!(RecordSnapshot::from_cbor(&bytes).unwrap(), snapshot);
        assert_eq!(snapshot.live_count(), 1);
    }

    #[test]
    fn garbage_is_a_snapshot_error() {
        assert!(matches!(
            RecordSnapshot::from_cbor(b"\xff\x00garbage"),
            Err(CoreError::Snapshot { .. })
        ));
    }

    #[test]
    fn digest_is_stable() {
        let bytes = sample().to_cbor().unwrap();
        assert_eq!(snapshot_digest(&bytes), snapshot_digest(&bytes));
        assert_eq!(hex(&[0x0a, 0xff]), "0aff");
    }
}
