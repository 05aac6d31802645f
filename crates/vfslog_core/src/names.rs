//! Name interning.
//!
//! A [`NameTable`] maps file names to stable [`NameId`]s. It is an owned
//! component: each store is handed an `Arc<NameTable>` when it connects, and
//! two stores may share one table. Persistent tables live in an append-only
//! `names.dat` where the id of a name is the ordinal of its frame.

use crate::codec::{encode_frame, scan_frames};
use crate::error::{CoreError, CoreResult};
use crate::types::NameId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};
use vfslog_storage::{FileBackend, InMemoryBackend, StorageBackend};

#[derive(Debug, Default)]
struct Names {
    by_id: Vec<String>,
    by_name: HashMap<String, NameId>,
}

impl Names {
    fn insert(&mut self, name: String) -> NameId {
        let id = NameId(crate::codec::len_u32(self.by_id.len()) + 1);
        self.by_name.insert(name.clone(), id);
        self.by_id.push(name);
        id
    }
}

/// Bidirectional string/id interner.
pub struct NameTable {
    names: RwLock<Names>,
    backend: Mutex<Box<dyn StorageBackend>>,
    read_only: bool,
}

impl std::fmt::Debug for NameTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameTable")
            .field("len", &self.len())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl NameTable {
    /// Creates a table that is never persisted.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            names: RwLock::new(Names::default()),
            backend: Mutex::new(Box::new(InMemoryBackend::new())),
            read_only: false,
        }
    }

    /// Opens (or creates) the table stored at `path`.
    ///
    /// A torn trailing entry is dropped; on a writable table it is also cut
    /// from the file.
    ///
    /// # Errors
    ///
    /// Returns `CorruptStore` if an entry fails its checksum, is not UTF-8 or
    /// repeats an earlier name.
    pub fn open(path: &Path, read_only: bool) -> CoreResult<Self> {
        let mut backend = if read_only {
            FileBackend::open_read_only(path)?
        } else {
            FileBackend::open(path)?
        };
        let data = backend.read_all()?;
        let scan = scan_frames(&data, "names.dat")?;

        let mut names = Names::default();
        for index in 0..scan.frames.len() {
            let name = String::from_utf8(scan.body(&data, index).to_vec()).map_err(|_| {
                CoreError::corrupt_store(format!("names.dat: entry {} is not UTF-8", index + 1))
            })?;
            if names.by_name.contains_key(&name) {
                return Err(CoreError::corrupt_store(format!(
                    "names.dat: duplicate name {name:?} at entry {}",
                    index + 1
                )));
            }
            names.insert(name);
        }

        if scan.valid_len < data.len() as u64 {
            warn!(
                path = %path.display(),
                dropped = data.len() as u64 - scan.valid_len,
                "dropping torn tail of name table"
            );
            if !read_only {
                backend.truncate(scan.valid_len)?;
            }
        }
        debug!(path = %path.display(), names = names.by_id.len(), "opened name table");

        Ok(Self {
            names: RwLock::new(names),
            backend: Mutex::new(Box::new(backend)),
            read_only,
        })
    }

    /// Returns the id for `name`, interning it if needed.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` when a new name reaches a read-only table, or an
    /// I/O error if the entry cannot be appended.
    pub fn intern(&self, name: &str) -> CoreResult<NameId> {
        if let Some(id) = self.id_of(name) {
            return Ok(id);
        }
        let mut names = self.names.write();
        if let Some(&id) = names.by_name.get(name) {
            return Ok(id);
        }
        if self.read_only {
            return Err(CoreError::read_only(format!("cannot intern {name:?}")));
        }
        self.backend.lock().append(&encode_frame(name.as_bytes()))?;
        Ok(names.insert(name.to_string()))
    }

    /// Returns the name behind `id`.
    #[must_use]
    pub fn name_of(&self, id: NameId) -> Option<String> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.names.read().by_id.get(index).cloned()
    }

    /// Returns the id of an already interned name.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<NameId> {
        self.names.read().by_name.get(name).copied()
    }

    /// Number of interned names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.read().by_id.len()
    }

    /// Returns true if nothing has been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes every interned name durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.backend.lock().sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn same_string_same_id() {
        let table = NameTable::in_memory();
        let a = table.intern("src").unwrap();
        let b = table.intern("main.rs").unwrap();
        assert_eq!(a, NameId(1));
        assert_eq!(b, NameId(2));
        assert_eq!(table.intern("src").unwrap(), a);
        assert_eq!(table.name_of(b).as_deref(), Some("main.rs"));
        assert_eq!(table.id_of("missing"), None);
        assert_eq!(table.name_of(NameId::NONE), None);
    }

    #[test]
    fn ids_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names.dat");
        {
            let table = NameTable::open(&path, false).unwrap();
            table.intern("a").unwrap();
            table.intern("b").unwrap();
            table.sync().unwrap();
        }
        let table = NameTable::open(&path, false).unwrap();
        assert_eq!(table.id_of("b"), Some(NameId(2)));
        assert_eq!(table.intern("c").unwrap(), NameId(3));
    }

    #[test]
    fn torn_entry_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names.dat");
        {
            let table = NameTable::open(&path, false).unwrap();
            table.intern("kept").unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&encode_frame(b"torn")[..5]);
        std::fs::write(&path, &bytes).unwrap();

        let table = NameTable::open(&path, false).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.intern("next").unwrap(), NameId(2));
    }

    #[test]
    fn read_only_table_rejects_new_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names.dat");
        NameTable::open(&path, false).unwrap().intern("x").unwrap();

        let table = NameTable::open(&path, true).unwrap();
        assert_eq!(table.intern("x").unwrap(), NameId(1));
        assert!(matches!(table.intern("y"), Err(CoreError::ReadOnly { .. })));
    }
}
