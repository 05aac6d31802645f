//! Little-endian field codec and checksummed frames.
//!
//! Every vfslog file except snapshots is built from these primitives. A frame
//! is `len: u32 | body | crc32(body): u32`; append-only files are sequences of
//! frames, and a frame cut short by a crash marks the end of valid data.

use crate::error::{CoreError, CoreResult};

/// Size of the frame header (length prefix).
pub(crate) const FRAME_HEADER: usize = 4;
/// Size of the frame trailer (checksum).
pub(crate) const FRAME_TRAILER: usize = 4;

/// Computes the CRC32 (IEEE) of `data`.
#[must_use]
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Appends little-endian fields to a buffer.
#[derive(Debug, Default)]
pub(crate) struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub(crate) fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn i64(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Writes a `u32` length followed by the bytes.
    pub(crate) fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.u32(len_u32(bytes.len())).raw(bytes)
    }

    pub(crate) fn str(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Largest name, content or attribute value the store accepts. Leaves room
/// for the framing around a blob inside a `u32` length.
pub(crate) const MAX_BLOB_LEN: usize = u32::MAX as usize - 64;

/// Length of a caller-supplied blob as stored in frames and payload refs.
///
/// # Errors
///
/// `InvalidOperation` if `len` exceeds [`MAX_BLOB_LEN`].
pub(crate) fn blob_len(len: usize) -> CoreResult<u32> {
    if len > MAX_BLOB_LEN {
        return Err(CoreError::invalid_operation(format!(
            "blob of {len} bytes exceeds the {MAX_BLOB_LEN} byte limit"
        )));
    }
    u32::try_from(len).map_err(|_| CoreError::invalid_operation(format!("blob of {len} bytes")))
}

/// Converts a count bounded by `u32` ids (records, children, roots,
/// points, encoded entry headers) to `u32`.
pub(crate) fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Reads little-endian fields, reporting short input through `err`.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
    err: fn(String) -> CoreError,
}

impl<'a> ByteReader<'a> {
    /// `what` names the structure for error messages.
    pub(crate) fn new(data: &'a [u8], what: &'static str, err: fn(String) -> CoreError) -> Self {
        Self {
            data,
            pos: 0,
            what,
            err,
        }
    }

    pub(crate) fn fail(&self, message: impl AsRef<str>) -> CoreError {
        (self.err)(format!("{}: {}", self.what, message.as_ref()))
    }

    pub(crate) fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.data.len());
        let Some(end) = end else {
            return Err(self.fail(format!(
                "truncated at byte {} (wanted {len} more, have {})",
                self.pos,
                self.data.len() - self.pos
            )));
        };
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> CoreResult<u16> {
        self.array().map(u16::from_le_bytes)
    }

    pub(crate) fn u32(&mut self) -> CoreResult<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub(crate) fn u64(&mut self) -> CoreResult<u64> {
        self.array().map(u64::from_le_bytes)
    }

    pub(crate) fn i64(&mut self) -> CoreResult<i64> {
        self.array().map(i64::from_le_bytes)
    }

    pub(crate) fn bytes(&mut self) -> CoreResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub(crate) fn string(&mut self) -> CoreResult<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.fail("name is not valid UTF-8"))
    }

    /// Fails if unread bytes remain.
    pub(crate) fn finish(&self) -> CoreResult<()> {
        if self.pos != self.data.len() {
            return Err(self.fail(format!(
                "{} trailing bytes",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}

/// Wraps `body` in a checksummed frame.
pub(crate) fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER + body.len() + FRAME_TRAILER);
    out.extend_from_slice(&len_u32(body.len()).to_le_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(&checksum(body).to_le_bytes());
    out
}

/// Location of one frame body inside a scanned file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameSpan {
    /// Offset of the body (just past the length prefix).
    pub(crate) offset: u64,
    /// Body length.
    pub(crate) len: u32,
}

/// Result of scanning a frame file.
#[derive(Debug, Default)]
pub(crate) struct FrameScan {
    pub(crate) frames: Vec<FrameSpan>,
    /// Bytes covered by complete frames. Anything past this is a torn tail.
    pub(crate) valid_len: u64,
}

impl FrameScan {
    pub(crate) fn body<'a>(&self, data: &'a [u8], index: usize) -> &'a [u8] {
        let span = self.frames[index];
        let start = span.offset as usize;
        &data[start..start + span.len as usize]
    }
}

/// Scans a sequence of frames.
///
/// A frame that runs past the end of `data` is a torn tail and ends the scan.
/// A complete frame whose checksum does not match is corruption.
pub(crate) fn scan_frames(data: &[u8], what: &str) -> CoreResult<FrameScan> {
    let mut scan = FrameScan::default();
    let mut pos = 0usize;
    while data.len() - pos >= FRAME_HEADER {
        let mut len = [0u8; 4];
        len.copy_from_slice(&data[pos..pos + FRAME_HEADER]);
        let len = u32::from_le_bytes(len);
        let body_start = pos + FRAME_HEADER;
        let Some(end) = body_start
            .checked_add(len as usize)
            .and_then(|body_end| body_end.checked_add(FRAME_TRAILER))
            .filter(|end| *end <= data.len())
        else {
            break;
        };
        let body = &data[body_start..body_start + len as usize];
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&data[end - FRAME_TRAILER..end]);
        let stored = u32::from_le_bytes(stored);
        let actual = checksum(body);
        if stored != actual {
            return Err(CoreError::corrupt_store(format!(
                "{what}: checksum mismatch in frame at byte {pos}: expected {stored:08x}, got {actual:08x}"
            )));
        }
        scan.frames.push(FrameSpan {
            offset: body_start as u64,
            len,
        });
        pos = end;
    }
    scan.valid_len = pos as u64;
    Ok(scan)
}
