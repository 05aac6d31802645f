//! Test fixtures and store helpers.
//!
//! Provides temporary logged stores, recovery into sibling directories and
//! the diff assertion used throughout the integration tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use vfslog_core::{
    build_diff, recover_from_point, Config, CoreResult, FileId, LogPosition, NameTable,
    NoReadLock, OperationLog, RecordStore, Recovery,
};

/// Element limit used by [`assert_no_diff`].
pub const DIFF_LIMIT: usize = 64;

/// A logged store in a temporary directory.
///
/// Recovery targets created through [`TestStore::recover`] live in the same
/// temporary directory and are removed with it.
pub struct TestStore {
    /// The store instance.
    pub store: RecordStore,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: TempDir,
}

impl TestStore {
    /// Creates a new store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a new store with `config`.
    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = RecordStore::connect(&temp_dir.path().join("store"), config)
            .expect("Failed to connect store")
            .store;
        Self { store, temp_dir }
    }

    /// Directory of the store.
    pub fn path(&self) -> PathBuf {
        self.temp_dir.path().join("store")
    }

    /// A path next to the store, for recovery targets and copies.
    pub fn sibling(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// The store's operation log.
    pub fn log(&self) -> Arc<OperationLog> {
        Arc::clone(self.store.log().expect("Test stores keep a log"))
    }

    /// Copies the store directory to the sibling `name` while the store is
    /// still connected, leaving the files as a crashed process would.
    pub fn crash_copy(&self, name: &str) -> PathBuf {
        let target = self.sibling(name);
        copy_dir(&self.path(), &target).expect("Failed to copy store directory");
        target
    }

    /// Recovers the whole log into the sibling directory `name`.
    pub fn recover(&self, name: &str) -> Recovery {
        let end = self.log().end();
        self.recover_to(name, end).expect("Recovery failed")
    }

    /// Recovers up to `end_point` into the sibling directory `name`.
    pub fn recover_to(&self, name: &str, end_point: LogPosition) -> CoreResult<Recovery> {
        recover_store(&self.store, &self.sibling(name), end_point)
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestStore {
    type Target = RecordStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Recovers `store`'s log up to `end_point` into `target`.
pub fn recover_store(
    store: &RecordStore,
    target: &Path,
    end_point: LogPosition,
) -> CoreResult<Recovery> {
    let log = store.log().expect("Store has no log");
    let query = log.query();
    recover_from_point(
        end_point,
        &query,
        store.path(),
        target,
        &NoReadLock,
        &Config::default(),
    )
}

/// Creates an in-memory store without a log.
pub fn memory_store() -> RecordStore {
    RecordStore::in_memory(Arc::new(NameTable::in_memory()))
}

/// Runs a test with a temporary logged store.
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&TestStore) -> R,
{
    let store = TestStore::new();
    f(&store)
}

/// Panics with the differences if `target` is not structurally equal to
/// `base`.
pub fn assert_no_diff(base: &RecordStore, target: &RecordStore) {
    let result = build_diff(base, target, DIFF_LIMIT).expect("Diff failed");
    assert!(result.is_empty(), "stores differ: {result}");
}

/// Every allocated id that is not tombstoned, ascending.
pub fn live_ids(store: &RecordStore) -> Vec<FileId> {
    let max = store.max_allocated_id().expect("Failed to read store").0;
    (1..=max)
        .map(FileId)
        .filter(|id| !store.is_deleted(*id).expect("Failed to read store"))
        .collect()
}

/// Test scenario helpers.
pub mod scenarios {
    use vfslog_core::{AttributeId, FileId, RecordFlag, RecordFlags, RecordStore};

    /// Root `R` (id 1) with child `C` (id 2) whose content is `hello`; `C` is
    /// then deleted. Returns `(R, C)`.
    pub fn delete_scenario(store: &RecordStore) -> (FileId, FileId) {
        let root = store
            .add_root("R", RecordFlags::from(RecordFlag::IsDirectory))
            .expect("Failed to add root");
        let child = store
            .create_child(root, "C", RecordFlags::empty())
            .expect("Failed to create child");
        store
            .write_content(child, b"hello")
            .expect("Failed to write content");
        store.delete_file(child).expect("Failed to delete child");
        (root, child)
    }

    /// A root with `breadth` children per directory, `depth` levels deep.
    ///
    /// Leaves get content, a timestamp, a length and one attribute.
    /// Returns the root.
    pub fn populated_tree(store: &RecordStore, breadth: usize, depth: usize) -> FileId {
        let root = store
            .add_root("/", RecordFlags::from(RecordFlag::IsDirectory))
            .expect("Failed to add root");
        let mut level = vec![root];
        for d in 0..depth {
            let mut next = Vec::new();
            for parent in &level {
                for b in 0..breadth {
                    let leaf = d + 1 == depth;
                    let flags = if leaf {
                        RecordFlags::empty()
                    } else {
                        RecordFlags::from(RecordFlag::IsDirectory)
                    };
                    let id = store
                        .create_child(*parent, &format!("n{d}_{b}"), flags)
                        .expect("Failed to create child");
                    if leaf {
                        let body = format!("content of {id}");
                        store
                            .write_content(id, body.as_bytes())
                            .expect("Failed to write content");
                        store
                            .set_length(id, body.len() as i64)
                            .expect("Failed to set length");
                        store
                            .set_timestamp(id, 1_700_000_000 + i64::from(id.0))
                            .expect("Failed to set timestamp");
                        store
                            .write_attribute(id, AttributeId(1), &id.0.to_le_bytes())
                            .expect("Failed to write attribute");
                    }
                    next.push(id);
                }
            }
            level = next;
        }
        root
    }
}
