//! Store directory management.
//!
//! ```text
//! <store>/
//! ├─ MANIFEST          # store version, clean-shutdown flag
//! ├─ LOCK              # advisory lock: exclusive for writers, shared for readers
//! ├─ records.dat       # record table image
//! ├─ names.dat         # name table
//! ├─ contents.dat      # content blobs
//! ├─ attributes.dat    # attribute journal
//! └─ oplog/            # operation log
//! ```

use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const RECORDS_FILE: &str = "records.dat";
const NAMES_FILE: &str = "names.dat";
const CONTENTS_FILE: &str = "contents.dat";
const ATTRIBUTES_FILE: &str = "attributes.dat";
const OPLOG_DIR: &str = "oplog";

/// A locked store directory.
///
/// The lock is held until [`StoreDir::release`] is called or the value is
/// dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    lock: Mutex<Option<File>>,
    read_only: bool,
}

impl StoreDir {
    /// Opens (or creates) a store directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the directory is missing and `create_if_missing` is false
    /// - the path is not a directory
    /// - another connection holds a conflicting lock (`StoreLocked`)
    pub fn open(path: &Path, create_if_missing: bool, read_only: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing && !read_only {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_operation(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_path = path.join(LOCK_FILE);
        let lock_file = if read_only {
            match File::open(&lock_path) {
                Ok(file) => {
                    file.try_lock_shared().map_err(|_| CoreError::StoreLocked)?;
                    Some(file)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            }
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)?;
            file.try_lock_exclusive()
                .map_err(|_| CoreError::StoreLocked)?;
            Some(file)
        };

        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(lock_file),
            read_only,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether the directory was opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Path of `records.dat`.
    #[must_use]
    pub fn records_path(&self) -> PathBuf {
        self.path.join(RECORDS_FILE)
    }

    /// Path of `names.dat`.
    #[must_use]
    pub fn names_path(&self) -> PathBuf {
        self.path.join(NAMES_FILE)
    }

    /// Path of `contents.dat`.
    #[must_use]
    pub fn contents_path(&self) -> PathBuf {
        self.path.join(CONTENTS_FILE)
    }

    /// Path of `attributes.dat`.
    #[must_use]
    pub fn attributes_path(&self) -> PathBuf {
        self.path.join(ATTRIBUTES_FILE)
    }

    /// Path of the operation log directory.
    #[must_use]
    pub fn oplog_dir(&self) -> PathBuf {
        oplog_dir(&self.path)
    }

    /// Writes the manifest atomically.
    pub fn save_manifest(&self, manifest: &Manifest) -> CoreResult<()> {
        atomic_write(&self.path, MANIFEST_FILE, &manifest.encode())
    }

    /// Reads `records.dat`, or `None` if it was never written.
    pub fn load_records_image(&self) -> CoreResult<Option<Vec<u8>>> {
        read_optional(&self.records_path())
    }

    /// Replaces `records.dat` atomically.
    pub fn save_records_image(&self, image: &[u8]) -> CoreResult<()> {
        atomic_write(&self.path, RECORDS_FILE, image)
    }

    /// Releases the directory lock. Idempotent.
    pub fn release(&self) {
        if let Some(file) = self.lock.lock().take() {
            // Closing the handle drops the lock as well.
            let _ = FileExt::unlock(&file);
            debug!(path = %self.path.display(), "released store lock");
        }
    }
}

impl Drop for StoreDir {
    fn drop(&mut self) {
        self.release();
    }
}

/// Path of the operation log directory inside a store directory.
#[must_use]
pub fn oplog_dir(store: &Path) -> PathBuf {
    store.join(OPLOG_DIR)
}

/// Reads the manifest of the store at `path` without locking it.
///
/// Returns `None` if there is no manifest (missing or empty directory).
pub fn read_manifest(path: &Path) -> CoreResult<Option<Manifest>> {
    match read_optional(&path.join(MANIFEST_FILE))? {
        Some(bytes) if !bytes.is_empty() => Manifest::decode(&bytes).map(Some),
        _ => Ok(None),
    }
}

/// Returns true if `path` does not exist or is an empty directory.
pub fn is_missing_or_empty(path: &Path) -> CoreResult<bool> {
    if !path.exists() {
        return Ok(true);
    }
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Removes everything inside `path`, keeping the directory itself.
pub fn wipe_contents(path: &Path) -> CoreResult<()> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    sync_directory(path)
}

fn read_optional(path: &Path) -> CoreResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replaces `dir/name` with `bytes` using write-temp, fsync, rename, fsync-dir.
pub(crate) fn atomic_write(dir: &Path, name: &str, bytes: &[u8]) -> CoreResult<()> {
    let target = dir.join(name);
    let temp = dir.join(format!("{name}.tmp"));

    let mut file = File::create(&temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, &target)?;
    sync_directory(dir)
}

/// Fsyncs a directory so created, renamed and deleted entries are durable.
#[cfg(unix)]
pub(crate) fn sync_directory(path: &Path) -> CoreResult<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_directory(_path: &Path) -> CoreResult<()> {
    // NTFS journals metadata; directories cannot be fsynced there.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        let dir = StoreDir::open(&path, true, false).unwrap();
        assert!(path.is_dir());
        assert!(path.join(LOCK_FILE).exists());
        assert_eq!(dir.oplog_dir(), path.join("oplog"));
    }

    #[test]
    fn missing_directory_without_create() {
        let temp = tempdir().unwrap();
        let result = StoreDir::open(&temp.path().join("absent"), false, false);
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn second_writer_is_locked_out() {
        let temp = tempdir().unwrap();
        let first = StoreDir::open(temp.path(), true, false).unwrap();
        assert!(matches!(
            StoreDir::open(temp.path(), true, false),
            Err(CoreError::StoreLocked)
        ));
        first.release();
        StoreDir::open(temp.path(), true, false).unwrap();
    }

    #[test]
    fn manifest_written_atomically() {
        let temp = tempdir().unwrap();
        assert!(read_manifest(temp.path()).unwrap().is_none());

        let dir = StoreDir::open(temp.path(), true, false).unwrap();
        dir.save_manifest(&Manifest::new(4)).unwrap();
        assert_eq!(read_manifest(temp.path()).unwrap().unwrap().store_version, 4);
        assert!(!temp.path().join("MANIFEST.tmp").exists());
    }

    #[test]
    fn wipe_keeps_directory() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("oplog")).unwrap();
        fs::write(temp.path().join("records.dat"), b"x").unwrap();
        assert!(!is_missing_or_empty(temp.path()).unwrap());

        wipe_contents(temp.path()).unwrap();
        assert!(temp.path().is_dir());
        assert!(is_missing_or_empty(temp.path()).unwrap());
        assert!(is_missing_or_empty(&temp.path().join("nope")).unwrap());
    }
}
