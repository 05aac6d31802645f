//! Compaction points and the `COMPACTION` metadata file.
//!
//! ```text
//! "VCMP" | format: u16 | count: u32 | (position: u64 | file: str | digest: [u8; 32] | records: u32)* | crc32: u32
//! ```

use crate::codec::{checksum, len_u32, ByteReader, ByteWriter};
use crate::error::{CoreError, CoreResult};
use crate::snapshot::{hex, RecordSnapshot};
use crate::types::LogPosition;
use serde::Serialize;
use std::fmt;

const POINTS_MAGIC: [u8; 4] = *b"VCMP";
const POINTS_FORMAT: u16 = 1;

/// Reference to a compaction snapshot on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRef {
    /// Compaction position; the snapshot folds every entry before it.
    pub position: LogPosition,
    /// File name inside `oplog/snapshots/`.
    pub file_name: String,
    /// SHA-256 of the file.
    #[serde(serialize_with = "serialize_digest")]
    pub digest: [u8; 32],
    /// Records in the snapshot, tombstones included.
    pub record_count: u32,
}

fn serialize_digest<S: serde::Serializer>(digest: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex(digest))
}

impl SnapshotRef {
    /// File name used for the snapshot at `position`.
    #[must_use]
    pub fn file_name_for(position: LogPosition) -> String {
        format!("snap-{:020}.cbor", position.0)
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({} records, sha256 {})",
            self.position,
            self.file_name,
            self.record_count,
            &hex(&self.digest)[..16]
        )
    }
}

/// A compaction point with its snapshot loaded and verified.
#[derive(Debug, Clone)]
pub struct CompactionPoint {
    /// Where the snapshot lives.
    pub reference: SnapshotRef,
    /// The snapshot.
    pub snapshot: RecordSnapshot,
}

impl CompactionPoint {
    /// The compaction position.
    #[must_use]
    pub fn position(&self) -> LogPosition {
        self.reference.position
    }
}

pub(crate) fn encode_points(points: &[SnapshotRef]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.raw(&POINTS_MAGIC)
        .u16(POINTS_FORMAT)
        .u32(len_u32(points.len()));
    for point in points {
        w.u64(point.position.0)
            .str(&point.file_name)
            .raw(&point.digest)
            .u32(point.record_count);
    }
    let mut bytes = w.into_inner();
    let crc = checksum(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes
}

pub(crate) fn decode_points(data: &[u8]) -> CoreResult<Vec<SnapshotRef>> {
    if data.len() < 10 || data[..4] != POINTS_MAGIC {
        return Err(CoreError::log_corrupt("COMPACTION: bad magic"));
    }
    let (body, trailer) = data.split_at(data.len() - 4);
    let mut stored = [0u8; 4];
    stored.copy_from_slice(trailer);
    if u32::from_le_bytes(stored) != checksum(body) {
        return Err(CoreError::log_corrupt("COMPACTION: checksum mismatch"));
    }

    let mut r = ByteReader::new(&body[4..], "COMPACTION", CoreError::log_corrupt);
    let format = r.u16()?;
    if format != POINTS_FORMAT {
        return Err(r.fail(format!("unsupported format {format}")));
    }
    let count = r.u32()?;
    let mut points: Vec<SnapshotRef> = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let position = LogPosition(r.u64()?);
        let file_name = r.string()?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(r.take(32)?);
        let record_count = r.u32()?;
        if let Some(last) = points.last() {
            if last.position >= position {
                return Err(r.fail(format!(
                    "compaction point {position} does not follow {}",
                    last.position
                )));
            }
        }
        points.push(SnapshotRef {
            position,
            file_name,
            digest,
            record_count,
        });
    }
    r.finish()?;
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(position: u64) -> SnapshotRef {
        SnapshotRef {
            position: LogPosition(position),
            file_name: SnapshotRef::file_name_for(LogPosition(position)),
            digest: [position as u8; 32],
            record_count: 3,
        }
    }

    #[test]
    fn points_file_decodes() {
        let points = vec![point(5), point(40)];
        assert_eq!(decode_points(&encode_points(&points)).unwrap(), points);
        assert_eq!(decode_points(&encode_points(&[])).unwrap(), Vec::new());
    }

    #[test]
    fn out_of_order_points_are_corrupt() {
        let bytes = encode_points(&[point(40), point(5)]);
        assert!(matches!(
            decode_points(&bytes),
            Err(CoreError::LogCorrupt { .. })
        ));
    }

    #[test]
    fn snapshot_file_names_sort_by_position() {
        assert_eq!(
            SnapshotRef::file_name_for(LogPosition(42)),
            "snap-00000000000000000042.cbor"
        );
        assert!(
            SnapshotRef::file_name_for(LogPosition(9)) < SnapshotRef::file_name_for(LogPosition(10))
        );
    }
}
