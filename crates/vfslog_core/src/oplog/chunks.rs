//! Numbered chunk files.
//!
//! Entries and payloads are both stored as sequences of chunk files
//! (`ops-000001.log`, `payload-000001.dat`, ...). Only the highest-numbered
//! chunk is appended to; it is rotated once it reaches the configured size.

use crate::error::{CoreError, CoreResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use vfslog_storage::{FileBackend, StorageBackend, StorageError};

/// Entry chunk naming.
pub(crate) const ENTRY_CHUNKS: ChunkNaming = ChunkNaming {
    prefix: "ops",
    extension: "log",
};

/// Payload chunk naming.
pub(crate) const PAYLOAD_CHUNKS: ChunkNaming = ChunkNaming {
    prefix: "payload",
    extension: "dat",
};

#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkNaming {
    prefix: &'static str,
    extension: &'static str,
}

impl ChunkNaming {
    pub(crate) fn file_name(self, number: u32) -> String {
        format!("{}-{number:06}.{}", self.prefix, self.extension)
    }

    fn parse(self, file_name: &str) -> Option<u32> {
        let rest = file_name.strip_prefix(self.prefix)?.strip_prefix('-')?;
        let digits = rest.strip_suffix(self.extension)?.strip_suffix('.')?;
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

#[derive(Debug)]
pub(crate) struct ChunkSet {
    dir: PathBuf,
    naming: ChunkNaming,
    chunks: BTreeMap<u32, FileBackend>,
    read_only: bool,
}

impl ChunkSet {
    pub(crate) fn open(dir: &Path, naming: ChunkNaming, read_only: bool) -> CoreResult<Self> {
        let mut chunks = BTreeMap::new();
        if dir.exists() {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let Some(number) = entry.file_name().to_str().and_then(|n| naming.parse(n)) else {
                    continue;
                };
                let path = entry.path();
                let backend = if read_only {
                    FileBackend::open_read_only(&path)?
                } else {
                    FileBackend::open(&path)?
                };
                chunks.insert(number, backend);
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            naming,
            chunks,
            read_only,
        })
    }

    pub(crate) fn numbers(&self) -> Vec<u32> {
        self.chunks.keys().copied().collect()
    }

    pub(crate) fn active_number(&self) -> Option<u32> {
        self.chunks.keys().next_back().copied()
    }

    pub(crate) fn get(&self, number: u32) -> Option<&FileBackend> {
        self.chunks.get(&number)
    }

    pub(crate) fn get_mut(&mut self, number: u32) -> Option<&mut FileBackend> {
        self.chunks.get_mut(&number)
    }

    /// Returns the chunk to append to, creating or rotating as needed.
    pub(crate) fn active_mut(&mut self, max_size: u64) -> CoreResult<(u32, &mut FileBackend)> {
        if self.read_only {
            return Err(CoreError::read_only("operation log opened read-only"));
        }
        let rotate = match self.chunks.iter().next_back() {
            None => Some(1),
            Some((&number, backend)) if backend.size()? >= max_size => Some(number + 1),
            Some(_) => None,
        };
        if let Some(number) = rotate {
            let path = self.dir.join(self.naming.file_name(number));
            let backend = FileBackend::open_with_create_dirs(&path)?;
            crate::dir::sync_directory(&self.dir)?;
            debug!(chunk = %path.display(), "started new chunk");
            self.chunks.insert(number, backend);
        }
        match self.chunks.iter_mut().next_back() {
            Some((&number, backend)) => Ok((number, backend)),
            None => Err(CoreError::invalid_operation("no active chunk")),
        }
    }

    /// Reads bytes from a chunk; `None` if the chunk or range no longer exists.
    pub(crate) fn read(&self, number: u32, offset: u64, len: usize) -> CoreResult<Option<Vec<u8>>> {
        let Some(backend) = self.chunks.get(&number) else {
            return Ok(None);
        };
        match backend.read_at(offset, len) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StorageError::ReadPastEnd { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a chunk file.
    pub(crate) fn remove(&mut self, number: u32) -> CoreResult<()> {
        if self.read_only {
            return Err(CoreError::read_only("operation log opened read-only"));
        }
        if self.chunks.remove(&number).is_some() {
            fs::remove_file(self.dir.join(self.naming.file_name(number)))?;
        }
        Ok(())
    }

    pub(crate) fn sync_active(&mut self) -> CoreResult<()> {
        if self.read_only {
            return Ok(());
        }
        if let Some(backend) = self.chunks.values_mut().next_back() {
            backend.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn names_parse_back() {
        assert_eq!(ENTRY_CHUNKS.file_name(12), "ops-000012.log");
        assert_eq!(ENTRY_CHUNKS.parse("ops-000012.log"), Some(12));
        assert_eq!(ENTRY_CHUNKS.parse("ops-12.log"), None);
        assert_eq!(ENTRY_CHUNKS.parse("payload-000001.dat"), None);
        assert_eq!(PAYLOAD_CHUNKS.parse("payload-000001.dat"), Some(1));
        assert_eq!(PAYLOAD_CHUNKS.parse("payload-000001.dat.tmp"), None);
    }

    #[test]
    fn rotates_at_size() {
        let temp = tempdir().unwrap();
        let mut set = ChunkSet::open(temp.path(), PAYLOAD_CHUNKS, false).unwrap();

        let (first, backend) = set.active_mut(8).unwrap();
        backend.append(b"0123456789").unwrap();
        assert_eq!(first, 1);
        let (second, backend) = set.active_mut(8).unwrap();
        backend.append(b"x").unwrap();
        assert_eq!(second, 2);
        assert_eq!(set.numbers(), vec![1, 2]);

        let reopened = ChunkSet::open(temp.path(), PAYLOAD_CHUNKS, true).unwrap();
        assert_eq!(reopened.read(1, 2, 3).unwrap().as_deref(), Some(&b"234"[..]));
        assert_eq!(reopened.read(2, 0, 5).unwrap(), None);
        assert_eq!(reopened.read(7, 0, 1).unwrap(), None);
    }

    #[test]
    fn removed_chunk_reads_as_missing() {
        let temp = tempdir().unwrap();
        let mut set = ChunkSet::open(temp.path(), ENTRY_CHUNKS, false).unwrap();
        set.active_mut(1).unwrap().1.append(b"a").unwrap();
        set.active_mut(1).unwrap().1.append(b"b").unwrap();

        set.remove(1).unwrap();
        assert!(!temp.path().join("ops-000001.log").exists());
        assert_eq!(set.read(1, 0, 1).unwrap(), None);
        assert_eq!(set.active_number(), Some(2));
    }

    #[test]
    fn read_only_set_refuses_appends() {
        let temp = tempdir().unwrap();
        let mut set = ChunkSet::open(temp.path(), ENTRY_CHUNKS, true).unwrap();
        assert!(matches!(set.active_mut(10), Err(CoreError::ReadOnly { .. })));
    }
}
