//! Store manifest.
//!
//! ```text
//! "VMFN" | format: u16 | store_version: u32 | clean: u8 | created_at: u64 | crc32: u32
//! ```
//!
//! `clean` is cleared while a read-write connection is open and set again by
//! a successful disconnect, so a manifest found unclean means the previous
//! session ended without flushing.

use crate::codec::{checksum, ByteReader, ByteWriter};
use crate::error::{CoreError, CoreResult};
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic bytes for the manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"VMFN";

/// Current manifest format.
pub const MANIFEST_FORMAT: u16 = 1;

/// Store-level metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Caller-defined store version; a mismatch makes `connect` fail.
    pub store_version: u32,
    /// Whether the last read-write session disconnected cleanly.
    pub clean_shutdown: bool,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
}

impl Manifest {
    /// Creates a manifest for a new store.
    #[must_use]
    pub fn new(store_version: u32) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            store_version,
            clean_shutdown: false,
            created_at,
        }
    }

    /// Encodes the manifest to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.raw(&MANIFEST_MAGIC)
            .u16(MANIFEST_FORMAT)
            .u32(self.store_version)
            .u8(u8::from(self.clean_shutdown))
            .u64(self.created_at);
        let mut bytes = w.into_inner();
        let crc = checksum(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Decodes a manifest from bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` on a bad magic, unknown format or short input,
    /// and `ChecksumMismatch` if the trailer does not match.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 4 || data[..4] != MANIFEST_MAGIC {
            return Err(CoreError::invalid_format("invalid manifest magic"));
        }
        if data.len() < 8 {
            return Err(CoreError::invalid_format("manifest too short"));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let mut expected = [0u8; 4];
        expected.copy_from_slice(trailer);
        let expected = u32::from_le_bytes(expected);
        let actual = checksum(body);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        let mut r = ByteReader::new(&body[4..], "manifest", CoreError::invalid_format);
        let format = r.u16()?;
        if format > MANIFEST_FORMAT {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest format: {format}"
            )));
        }
        let store_version = r.u32()?;
        let clean_shutdown = r.u8()? != 0;
        let created_at = r.u64()?;
        r.finish()?;
        Ok(Self {
            store_version,
            clean_shutdown,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let mut manifest = Manifest::new(12);
        manifest.clean_shutdown = true;
        let decoded = Manifest::decode(&manifest.encode()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn new_manifest_is_unclean() {
        assert!(!Manifest::new(1).clean_shutdown);
    }

    #[test]
    fn invalid_magic() {
        assert!(matches!(
            Manifest::decode(b"XXXX0000000000"),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn damaged_manifest() {
        let mut bytes = Manifest::new(3).encode();
        bytes[7] ^= 0xff;
        assert!(matches!(
            Manifest::decode(&bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }
}
