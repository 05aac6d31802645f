//! File-backed byte store.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A byte store kept in a single OS file.
///
/// Opened read-write, the file is created when missing. Opened read-only
/// (used by `vfslog inspect` and when diffing two stores), every mutating
/// call fails with [`StorageError::ReadOnly`] and the file is never touched.
///
/// `flush()` hands buffered data to the OS, `sync()` calls `sync_all`.
///
/// ```no_run
/// use vfslog_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut chunk = FileBackend::open(Path::new("ops-000001.log")).unwrap();
/// chunk.append(b"entry").unwrap();
/// chunk.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
    read_only: bool,
}

impl FileBackend {
    /// Opens the file at `path` for reading and appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(path, file, false)
    }

    /// Opens an existing file without write access.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be read.
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Self::from_file(path, file, true)
    }

    /// Like [`FileBackend::open`], creating missing parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    fn from_file(path: &Path, file: File, read_only: bool) -> StorageResult<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
            read_only,
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether this backend rejects writes.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly(self.path.display().to_string()));
        }
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        // Seeking mutates the cursor, so readers take the write side.
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.check_writable()?;
        if data.is_empty() {
            return Ok(*self.size.read());
        }

        let mut file = self.file.write();
        let mut size = self.size.write();
        let offset = *size;
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        *size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.write().flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.write().sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.check_writable()?;
        let file = self.file.write();
        let mut size = self.size.write();
        if new_size > *size {
            return Err(StorageError::TruncatePastEnd {
                requested: new_size,
                size: *size,
            });
        }
        file.set_len(new_size)?;
        file.sync_all()?;
        *size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_report_offsets() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("names.dat")).unwrap();

        assert_eq!(backend.append(b"alpha").unwrap(), 0);
        assert_eq!(backend.append(b"beta").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 9);
        assert_eq!(backend.read_at(5, 4).unwrap(), b"beta");
        assert_eq!(backend.read_all().unwrap(), b"alphabeta");
    }

    #[test]
    fn reads_past_end_are_rejected() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("c.dat")).unwrap();
        backend.append(b"abc").unwrap();

        assert!(matches!(
            backend.read_at(2, 5),
            Err(StorageError::ReadPastEnd { size: 3, .. })
        ));
    }

    #[test]
    fn contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ops-000001.log");
        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"durable entry").unwrap();
            backend.sync().unwrap();
        }
        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 13);
        assert_eq!(backend.read_at(0, 13).unwrap(), b"durable entry");
    }

    #[test]
    fn truncate_drops_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ops.log");
        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"whole").unwrap();
        backend.append(b"tor").unwrap();

        backend.truncate(5).unwrap();
        assert_eq!(backend.size().unwrap(), 5);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 5);
        assert!(matches!(
            backend.truncate(9),
            Err(StorageError::TruncatePastEnd { requested: 9, size: 5 })
        ));
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.dat");
        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"rec").unwrap();
            backend.sync().unwrap();
        }

        let mut backend = FileBackend::open_read_only(&path).unwrap();
        assert!(backend.is_read_only());
        assert_eq!(backend.read_all().unwrap(), b"rec");
        assert!(matches!(backend.append(b"x"), Err(StorageError::ReadOnly(_))));
        assert!(matches!(backend.truncate(0), Err(StorageError::ReadOnly(_))));
        backend.sync().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3);
    }

    #[test]
    fn read_only_requires_existing_file() {
        let dir = tempdir().unwrap();
        assert!(FileBackend::open_read_only(&dir.path().join("missing.dat")).is_err());
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oplog").join("payload-000001.dat");
        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }
}
