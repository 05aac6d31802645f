//! Operation log entries and their on-disk envelope.
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | position (8) | len (4) | body (len) | crc32 (4) |
//! ```
//!
//! The checksum covers everything before it. Content and attribute bytes are
//! not part of the body: they live in payload chunks and the body carries a
//! [`PayloadRef`].

use crate::codec::{checksum, len_u32, ByteReader, ByteWriter};
use crate::error::{CoreError, CoreResult};
use crate::flags::RecordFlags;
use crate::types::{AttributeId, FileId, LogPosition};
use serde::Serialize;
use std::fmt;

/// Magic bytes identifying a log entry.
pub const ENTRY_MAGIC: [u8; 4] = *b"VOPL";

/// Current entry format version.
pub const ENTRY_VERSION: u16 = 1;

/// Bytes before the body.
pub const ENTRY_HEADER_SIZE: usize = 4 + 2 + 1 + 8 + 4;

/// Bytes after the body.
pub const ENTRY_TRAILER_SIZE: usize = 4;

/// Kind of a logged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum OpKind {
    /// A record id was handed out.
    AllocateRecord = 1,
    /// A record joined the root set.
    CreateRoot = 2,
    /// A record left the root set.
    RemoveRoot = 3,
    /// Flags replaced.
    SetFlags = 4,
    /// Parent changed.
    SetParent = 5,
    /// Children list replaced.
    SetChildren = 6,
    /// Content replaced or cleared.
    SetContent = 7,
    /// Attribute value written or deleted.
    SetAttribute = 8,
    /// Name changed.
    SetName = 9,
    /// Timestamp changed.
    SetTimestamp = 10,
    /// Length changed.
    SetLength = 11,
    /// Record tombstoned.
    Tombstone = 12,
}

impl OpKind {
    /// Converts a byte to a kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::AllocateRecord,
            2 => Self::CreateRoot,
            3 => Self::RemoveRoot,
            4 => Self::SetFlags,
            5 => Self::SetParent,
            6 => Self::SetChildren,
            7 => Self::SetContent,
            8 => Self::SetAttribute,
            9 => Self::SetName,
            10 => Self::SetTimestamp,
            11 => Self::SetLength,
            12 => Self::Tombstone,
            _ => return None,
        })
    }

    /// Converts the kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Kinds whose failure leaves a file's place in the tree undefined.
    #[must_use]
    pub const fn is_structural(self) -> bool {
        matches!(
            self,
            Self::AllocateRecord
                | Self::CreateRoot
                | Self::RemoveRoot
                | Self::SetParent
                | Self::SetChildren
                | Self::SetName
                | Self::Tombstone
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where a payload lives inside the log's payload chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PayloadRef {
    /// Payload chunk number.
    pub chunk: u32,
    /// Offset inside the chunk.
    pub offset: u64,
    /// Payload length.
    pub len: u32,
    /// CRC32 of the payload bytes.
    pub crc: u32,
}

impl fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payload[{}+{}:{}]", self.chunk, self.offset, self.len)
    }
}

/// A mutation of a record store.
///
/// `P` is the payload representation: `Vec<u8>` when handed to
/// [`crate::RecordStore::apply`], [`PayloadRef`] once logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum Operation<P = Vec<u8>> {
    /// Allocate record `id`, which must be the store's next id.
    AllocateRecord {
        /// New record.
        id: FileId,
    },
    /// Add `id` to the root set.
    CreateRoot {
        /// Record.
        id: FileId,
    },
    /// Remove `id` from the root set.
    RemoveRoot {
        /// Record.
        id: FileId,
    },
    /// Replace the flags of `id`.
    SetFlags {
        /// Record.
        id: FileId,
        /// New flags; never contains `FreeRecord`.
        flags: RecordFlags,
    },
    /// Reparent `id`.
    SetParent {
        /// Record.
        id: FileId,
        /// New parent, `NONE` to detach.
        parent: FileId,
    },
    /// Replace the children list of `id`.
    SetChildren {
        /// Record.
        id: FileId,
        /// New children.
        children: Vec<FileId>,
    },
    /// Rename `id`.
    SetName {
        /// Record.
        id: FileId,
        /// New name, interned by the applying store.
        name: String,
    },
    /// Set the timestamp of `id`.
    SetTimestamp {
        /// Record.
        id: FileId,
        /// New timestamp.
        timestamp: i64,
    },
    /// Set the length of `id`.
    SetLength {
        /// Record.
        id: FileId,
        /// New length.
        length: i64,
    },
    /// Store new content for `id`, or clear it.
    SetContent {
        /// Record.
        id: FileId,
        /// New content, `None` to clear.
        content: Option<P>,
    },
    /// Write or delete one attribute of `id`.
    SetAttribute {
        /// Record.
        id: FileId,
        /// Attribute kind.
        attribute_id: AttributeId,
        /// New value, `None` to delete.
        value: Option<P>,
    },
    /// Tombstone `id`.
    Tombstone {
        /// Record.
        id: FileId,
    },
}

/// An operation as stored in the log.
pub type LoggedOperation = Operation<PayloadRef>;

impl<P> Operation<P> {
    /// Returns the operation kind.
    #[must_use]
    pub fn kind(&self) -> OpKind {
        match self {
            Self::AllocateRecord { .. } => OpKind::AllocateRecord,
            Self::CreateRoot { .. } => OpKind::CreateRoot,
            Self::RemoveRoot { .. } => OpKind::RemoveRoot,
            Self::SetFlags { .. } => OpKind::SetFlags,
            Self::SetParent { .. } => OpKind::SetParent,
            Self::SetChildren { .. } => OpKind::SetChildren,
            Self::SetName { .. } => OpKind::SetName,
            Self::SetTimestamp { .. } => OpKind::SetTimestamp,
            Self::SetLength { .. } => OpKind::SetLength,
            Self::SetContent { .. } => OpKind::SetContent,
            Self::SetAttribute { .. } => OpKind::SetAttribute,
            Self::Tombstone { .. } => OpKind::Tombstone,
        }
    }

    /// Returns the record the operation targets.
    #[must_use]
    pub fn file_id(&self) -> FileId {
        match self {
            Self::AllocateRecord { id }
            | Self::CreateRoot { id }
            | Self::RemoveRoot { id }
            | Self::SetFlags { id, .. }
            | Self::SetParent { id, .. }
            | Self::SetChildren { id, .. }
            | Self::SetName { id, .. }
            | Self::SetTimestamp { id, .. }
            | Self::SetLength { id, .. }
            | Self::SetContent { id, .. }
            | Self::SetAttribute { id, .. }
            | Self::Tombstone { id } => *id,
        }
    }

    /// Returns the payload, if the operation carries one.
    #[must_use]
    pub fn payload(&self) -> Option<&P> {
        match self {
            Self::SetContent { content, .. } => content.as_ref(),
            Self::SetAttribute { value, .. } => value.as_ref(),
            _ => None,
        }
    }

    /// Borrows the payload, copying the other fields.
    #[must_use]
    pub fn as_ref(&self) -> Operation<&P> {
        match self {
            Self::AllocateRecord { id } => Operation::AllocateRecord { id: *id },
            Self::CreateRoot { id } => Operation::CreateRoot { id: *id },
            Self::RemoveRoot { id } => Operation::RemoveRoot { id: *id },
            Self::SetFlags { id, flags } => Operation::SetFlags {
                id: *id,
                flags: *flags,
            },
            Self::SetParent { id, parent } => Operation::SetParent {
                id: *id,
                parent: *parent,
            },
            Self::SetChildren { id, children } => Operation::SetChildren {
                id: *id,
                children: children.clone(),
            },
            Self::SetName { id, name } => Operation::SetName {
                id: *id,
                name: name.clone(),
            },
            Self::SetTimestamp { id, timestamp } => Operation::SetTimestamp {
                id: *id,
                timestamp: *timestamp,
            },
            Self::SetLength { id, length } => Operation::SetLength {
                id: *id,
                length: *length,
            },
            Self::SetContent { id, content } => Operation::SetContent {
                id: *id,
                content: content.as_ref(),
            },
            Self::SetAttribute {
                id,
                attribute_id,
                value,
            } => Operation::SetAttribute {
                id: *id,
                attribute_id: *attribute_id,
                value: value.as_ref(),
            },
            Self::Tombstone { id } => Operation::Tombstone { id: *id },
        }
    }

    /// Converts the payload representation, leaving everything else as is.
    pub fn try_map_payload<Q, E>(
        self,
        f: impl FnOnce(P) -> Result<Q, E>,
    ) -> Result<Operation<Q>, E> {
        Ok(match self {
            Self::AllocateRecord { id } => Operation::AllocateRecord { id },
            Self::CreateRoot { id } => Operation::CreateRoot { id },
            Self::RemoveRoot { id } => Operation::RemoveRoot { id },
            Self::SetFlags { id, flags } => Operation::SetFlags { id, flags },
            Self::SetParent { id, parent } => Operation::SetParent { id, parent },
            Self::SetChildren { id, children } => Operation::SetChildren { id, children },
            Self::SetName { id, name } => Operation::SetName { id, name },
            Self::SetTimestamp { id, timestamp } => Operation::SetTimestamp { id, timestamp },
            Self::SetLength { id, length } => Operation::SetLength { id, length },
            Self::SetContent { id, content } => Operation::SetContent {
                id,
                content: content.map(f).transpose()?,
            },
            Self::SetAttribute {
                id,
                attribute_id,
                value,
            } => Operation::SetAttribute {
                id,
                attribute_id,
                value: value.map(f).transpose()?,
            },
            Self::Tombstone { id } => Operation::Tombstone { id },
        })
    }
}

impl LoggedOperation {
    fn encode_body(&self, w: &mut ByteWriter) {
        w.u32(self.file_id().0);
        match self {
            Self::AllocateRecord { .. }
            | Self::CreateRoot { .. }
            | Self::RemoveRoot { .. }
            | Self::Tombstone { .. } => {}
            Self::SetFlags { flags, .. } => {
                w.u16(flags.bits());
            }
            Self::SetParent { parent, .. } => {
                w.u32(parent.0);
            }
            Self::SetChildren { children, .. } => {
                w.u32(len_u32(children.len()));
                for child in children {
                    w.u32(child.0);
                }
            }
            Self::SetName { name, .. } => {
                w.str(name);
            }
            Self::SetTimestamp { timestamp, .. } => {
                w.i64(*timestamp);
            }
            Self::SetLength { length, .. } => {
                w.i64(*length);
            }
            Self::SetContent { content, .. } => encode_payload_ref(w, content.as_ref()),
            Self::SetAttribute {
                attribute_id,
                value,
                ..
            } => {
                w.u32(attribute_id.0);
                encode_payload_ref(w, value.as_ref());
            }
        }
    }

    fn decode_body(kind: OpKind, body: &[u8]) -> CoreResult<Self> {
        let mut r = ByteReader::new(body, "log entry", CoreError::log_corrupt);
        let id = FileId(r.u32()?);
        let op = match kind {
            OpKind::AllocateRecord => Self::AllocateRecord { id },
            OpKind::CreateRoot => Self::CreateRoot { id },
            OpKind::RemoveRoot => Self::RemoveRoot { id },
            OpKind::Tombstone => Self::Tombstone { id },
            OpKind::SetFlags => Self::SetFlags {
                id,
                flags: RecordFlags::from_bits(r.u16()?)
                    .map_err(|e| CoreError::log_corrupt(e.to_string()))?,
            },
            OpKind::SetParent => Self::SetParent {
                id,
                parent: FileId(r.u32()?),
            },
            OpKind::SetChildren => {
                let count = r.u32()?;
                let children = (0..count)
                    .map(|_| r.u32().map(FileId))
                    .collect::<CoreResult<Vec<_>>>()?;
                Self::SetChildren { id, children }
            }
            OpKind::SetName => Self::SetName {
                id,
                name: r.string()?,
            },
            OpKind::SetTimestamp => Self::SetTimestamp {
                id,
                timestamp: r.i64()?,
            },
            OpKind::SetLength => Self::SetLength {
                id,
                length: r.i64()?,
            },
            OpKind::SetContent => Self::SetContent {
                id,
                content: decode_payload_ref(&mut r)?,
            },
            OpKind::SetAttribute => Self::SetAttribute {
                id,
                attribute_id: AttributeId(r.u32()?),
                value: decode_payload_ref(&mut r)?,
            },
        };
        r.finish()?;
        Ok(op)
    }
}

fn encode_payload_ref(w: &mut ByteWriter, payload: Option<&PayloadRef>) {
    match payload {
        None => {
            w.u8(0);
        }
        Some(p) => {
            w.u8(1).u32(p.chunk).u64(p.offset).u32(p.len).u32(p.crc);
        }
    }
}

fn decode_payload_ref(r: &mut ByteReader<'_>) -> CoreResult<Option<PayloadRef>> {
    match r.u8()? {
        0 => Ok(None),
        1 => Ok(Some(PayloadRef {
            chunk: r.u32()?,
            offset: r.u64()?,
            len: r.u32()?,
            crc: r.u32()?,
        })),
        flag => Err(r.fail(format!("bad payload marker {flag}"))),
    }
}

/// A logged operation with its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Position assigned by the log writer.
    pub position: LogPosition,
    /// The logged operation.
    pub operation: LoggedOperation,
}

impl LogEntry {
    /// Encodes the entry with its envelope.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = ByteWriter::new();
        self.operation.encode_body(&mut body);
        let body = body.into_inner();

        let mut w = ByteWriter::new();
        w.raw(&ENTRY_MAGIC)
            .u16(ENTRY_VERSION)
            .u8(self.operation.kind().as_byte())
            .u64(self.position.0)
            .u32(len_u32(body.len()))
            .raw(&body);
        let mut bytes = w.into_inner();
        let crc = checksum(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }
}

/// Outcome of decoding the bytes at an entry boundary.
#[derive(Debug)]
pub(crate) enum Decoded {
    /// A complete entry and the number of bytes it occupied.
    Entry(LogEntry, usize),
    /// The bytes end before the entry does: a torn tail.
    Torn,
}

/// Decodes one entry from the start of `data`.
///
/// Running out of bytes is reported as [`Decoded::Torn`]; a bad magic,
/// version, kind or checksum is `LogCorrupt`.
pub(crate) fn decode_entry(data: &[u8]) -> CoreResult<Decoded> {
    if data.len() < ENTRY_HEADER_SIZE {
        return Ok(Decoded::Torn);
    }
    let mut r = ByteReader::new(&data[..ENTRY_HEADER_SIZE], "entry header", CoreError::log_corrupt);
    if r.take(4)? != ENTRY_MAGIC {
        return Err(CoreError::log_corrupt("invalid entry magic"));
    }
    let version = r.u16()?;
    if version != ENTRY_VERSION {
        return Err(CoreError::log_corrupt(format!(
            "unsupported entry version {version}"
        )));
    }
    let kind_byte = r.u8()?;
    let kind = OpKind::from_byte(kind_byte)
        .ok_or_else(|| CoreError::log_corrupt(format!("unknown entry kind {kind_byte}")))?;
    let position = LogPosition(r.u64()?);
    let len = r.u32()? as usize;

    let total = ENTRY_HEADER_SIZE + len + ENTRY_TRAILER_SIZE;
    if data.len() < total {
        return Ok(Decoded::Torn);
    }
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&data[total - ENTRY_TRAILER_SIZE..total]);
    let stored = u32::from_le_bytes(stored);
    let actual = checksum(&data[..total - ENTRY_TRAILER_SIZE]);
    if stored != actual {
        return Err(CoreError::log_corrupt(format!(
            "checksum mismatch in entry {position}: expected {stored:08x}, got {actual:08x}"
        )));
    }

    let body = &data[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + len];
    let operation = LoggedOperation::decode_body(kind, body)?;
    Ok(Decoded::Entry(LogEntry { position, operation }, total))
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = &self.operation;
        write!(f, "{} {} {}", self.position, op.kind(), op.file_id())?;
        match op {
            Operation::AllocateRecord { .. }
            | Operation::CreateRoot { .. }
            | Operation::RemoveRoot { .. }
            | Operation::Tombstone { .. } => Ok(()),
            Operation::SetFlags { flags, .. } => write!(f, " {flags}"),
            Operation::SetParent { parent, .. } => write!(f, " parent={parent}"),
            Operation::SetChildren { children, .. } => {
                let ids: Vec<String> = children.iter().map(|c| c.0.to_string()).collect();
                write!(f, " children=[{}]", ids.join(","))
            }
            Operation::SetName { name, .. } => write!(f, " name={name:?}"),
            Operation::SetTimestamp { timestamp, .. } => write!(f, " timestamp={timestamp}"),
            Operation::SetLength { length, .. } => write!(f, " length={length}"),
            Operation::SetContent { content, .. } => match content {
                Some(p) => write!(f, " {p}"),
                None => f.write_str(" cleared"),
            },
            Operation::SetAttribute {
                attribute_id,
                value,
                ..
            } => match value {
                Some(p) => write!(f, " {attribute_id} {p}"),
                None => write!(f, " {attribute_id} deleted"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::RecordFlag;

    fn entry(position: u64, operation: LoggedOperation) -> LogEntry {
        LogEntry {
            position: LogPosition(position),
            operation,
        }
    }

    fn decoded(bytes: &[u8]) -> (LogEntry, usize) {
        match decode_entry(bytes).unwrap() {
            Decoded::Entry(entry, used) => (entry, used),
            Decoded::Torn => panic!("unexpected torn entry"),
        }
    }

    #[test]
    fn every_kind_survives_the_envelope() {
        let payload = PayloadRef {
            chunk: 2,
            offset: 40,
            len: 5,
            crc: 0xdead_beef,
        };
        let ops = vec![
            Operation::AllocateRecord { id: FileId(1) },
            Operation::SetFlags {
                id: FileId(1),
                flags: RecordFlags::from(RecordFlag::IsDirectory),
            },
            Operation::SetChildren {
                id: FileId(1),
                children: vec![FileId(2), FileId(3)],
            },
            Operation::SetName {
                id: FileId(2),
                name: "Cargo.toml".into(),
            },
            Operation::SetTimestamp {
                id: FileId(2),
                timestamp: -1,
            },
            Operation::SetContent {
                id: FileId(2),
                content: Some(payload),
            },
            Operation::SetAttribute {
                id: FileId(2),
                attribute_id: AttributeId(4),
                value: None,
            },
            Operation::Tombstone { id: FileId(3) },
        ];
        for (i, op) in ops.into_iter().enumerate() {
            let original = entry(i as u64 + 1, op);
            let bytes = original.encode();
            let (decoded, used) = decoded(&bytes);
            assert_eq!(used, bytes.len());
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn short_input_is_torn() {
        let bytes = entry(1, Operation::CreateRoot { id: FileId(1) }).encode();
        for cut in [0, 3, ENTRY_HEADER_SIZE, bytes.len() - 1] {
            assert!(matches!(decode_entry(&bytes[..cut]).unwrap(), Decoded::Torn));
        }
    }

    #[test]
    fn damage_is_corruption() {
        let mut bytes = entry(9, Operation::RemoveRoot { id: FileId(1) }).encode();
        let last = bytes.len() - 5;
        bytes[last] ^= 0x10;
        assert!(matches!(decode_entry(&bytes), Err(CoreError::LogCorrupt { .. })));

        let mut bytes = entry(9, Operation::RemoveRoot { id: FileId(1) }).encode();
        bytes[0] = b'X';
        assert!(matches!(decode_entry(&bytes), Err(CoreError::LogCorrupt { .. })));
    }

    #[test]
    fn structural_kinds() {
        assert!(OpKind::SetParent.is_structural());
        assert!(OpKind::Tombstone.is_structural());
        assert!(!OpKind::SetFlags.is_structural());
        assert!(!OpKind::SetAttribute.is_structural());
        assert_eq!(OpKind::from_byte(OpKind::SetLength.as_byte()), Some(OpKind::SetLength));
        assert_eq!(OpKind::from_byte(0), None);
    }

    #[test]
    fn display_for_dumps() {
        let e = entry(
            3,
            Operation::SetParent {
                id: FileId(2),
                parent: FileId(1),
            },
        );
        assert_eq!(e.to_string(), "@3 SetParent file:2 parent=file:1");
    }
}
