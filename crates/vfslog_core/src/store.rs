//! The record store.

use crate::attributes::AttributeStore;
use crate::codec::blob_len;
use crate::config::{Config, LogMode};
use crate::content::ContentStore;
use crate::dir::{is_missing_or_empty, read_manifest, wipe_contents, StoreDir};
use crate::error::{CoreError, CoreResult};
use crate::flags::{RecordFlag, RecordFlags};
use crate::manifest::Manifest;
use crate::names::NameTable;
use crate::oplog::{Operation, OperationLog, ResolvedOperation};
use crate::record::{FileRecord, RecordTable};
use crate::snapshot::{RecordSnapshot, SnapshotRecord};
use crate::types::{AttributeId, AttributeRecordId, ContentId, FileId, LogPosition, NameId};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct StoreState {
    table: RecordTable,
    contents: ContentStore,
    attributes: AttributeStore,
}

impl StoreState {
    fn empty() -> Self {
        Self {
            table: RecordTable::new(),
            contents: ContentStore::in_memory(),
            attributes: AttributeStore::in_memory(),
        }
    }

    fn live(&self, id: FileId) -> CoreResult<&FileRecord> {
        self.table
            .live(id)
            .ok_or_else(|| CoreError::invalid_operation(format!("{id} is not a live record")))
    }
}

/// Outcome of [`RecordStore::connect`].
#[derive(Debug)]
pub struct ConnectResult {
    /// The connected store.
    pub store: RecordStore,
    /// True if the directory held no store before this call.
    pub created_anew: bool,
}

/// A persistent table of file records.
///
/// Every mutation goes through [`RecordStore::apply`]: the operation is
/// validated against the current state, appended to the operation log (when
/// the store has one), and then applied. An operation that fails validation
/// is rejected with `InvalidOperation` and never reaches the log.
///
/// # Opening a store
///
/// ```rust,ignore
/// use vfslog_core::{Config, RecordStore};
/// use std::path::Path;
///
/// let ConnectResult { store, created_anew } =
///     RecordStore::connect(Path::new("caches/records"), Config::default())?;
/// let root = store.add_root("file:///", RecordFlags::from(RecordFlag::IsDirectory))?;
/// store.disconnect()?;
/// ```
///
/// # In-memory stores
///
/// `RecordStore::in_memory(names)` keeps everything in memory and has no
/// log. Compaction uses such stores as scratch space.
pub struct RecordStore {
    /// Configuration.
    config: Config,
    /// Locked store directory. None for in-memory stores.
    dir: Option<StoreDir>,
    /// Manifest as read or created at connect.
    manifest: Option<Manifest>,
    /// Name table, possibly shared with other stores.
    names: Arc<NameTable>,
    /// Records, roots and blob stores.
    state: RwLock<StoreState>,
    /// Serializes validate, log append and apply.
    writer: Mutex<()>,
    /// Operation log. None when logging is disabled.
    log: Option<Arc<OperationLog>>,
    /// Whether the store is connected.
    is_open: RwLock<bool>,
    /// Set when an operation reached the log but could not be applied.
    diverged: RwLock<bool>,
    /// Whether the previous session ended without disconnecting.
    needs_recovery: bool,
}

impl RecordStore {
    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Connects to the store in `path`, creating it if allowed.
    ///
    /// The store uses its own persisted name table (`names.dat`).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the manifest version differs from `config.version` (`VersionMismatch`);
    ///   nothing on disk is touched in that case
    /// - the loaded records fail structural validation (`CorruptStore`)
    /// - another connection holds the store (`StoreLocked`)
    /// - the operation log is damaged (`LogCorrupt`)
    pub fn connect(path: &Path, config: Config) -> CoreResult<ConnectResult> {
        Self::connect_inner(path, config, None)
    }

    /// Connects using a caller-owned name table instead of `names.dat`.
    ///
    /// Record name ids refer to `names`, so the same table must be passed on
    /// every reconnect.
    ///
    /// # Errors
    ///
    /// See [`RecordStore::connect`].
    pub fn connect_with_names(
        path: &Path,
        config: Config,
        names: Arc<NameTable>,
    ) -> CoreResult<ConnectResult> {
        Self::connect_inner(path, config, Some(names))
    }

    /// Like [`RecordStore::connect`], but a version mismatch wipes the
    /// directory and creates a fresh store.
    ///
    /// # Errors
    ///
    /// See [`RecordStore::connect`].
    pub fn connect_or_recreate(path: &Path, config: Config) -> CoreResult<ConnectResult> {
        match Self::connect(path, config.clone()) {
            Err(CoreError::VersionMismatch { expected, found }) => {
                warn!(
                    path = %path.display(),
                    expected,
                    found,
                    "store version mismatch, recreating"
                );
                wipe_contents(path)?;
                let mut result = Self::connect(path, config)?;
                result.created_anew = true;
                Ok(result)
            }
            other => other,
        }
    }

    fn connect_inner(
        path: &Path,
        config: Config,
        names: Option<Arc<NameTable>>,
    ) -> CoreResult<ConnectResult> {
        let manifest = read_manifest(path)?;
        if let (Some(expected), Some(manifest)) = (config.version, &manifest) {
            if manifest.store_version != expected {
                return Err(CoreError::VersionMismatch {
                    expected,
                    found: manifest.store_version,
                });
            }
        }
        if manifest.is_none() && config.read_only {
            return Err(CoreError::invalid_operation(format!(
                "no store at {}",
                path.display()
            )));
        }

        let dir_existed = path.exists();
        let was_empty = is_missing_or_empty(path)?;
        match Self::open_dir(path, config, names, manifest) {
            Ok(result) => Ok(result),
            Err(e) => {
                if was_empty {
                    let cleanup = if dir_existed {
                        wipe_contents(path)
                    } else {
                        fs::remove_dir_all(path).map_err(CoreError::from)
                    };
                    if let Err(cleanup) = cleanup {
                        warn!(path = %path.display(), error = %cleanup, "failed to remove half-created store");
                    }
                }
                Err(e)
            }
        }
    }

    fn open_dir(
        path: &Path,
        config: Config,
        names: Option<Arc<NameTable>>,
        manifest: Option<Manifest>,
    ) -> CoreResult<ConnectResult> {
        let dir = StoreDir::open(path, config.create_if_missing, config.read_only)?;
        let read_only = config.read_only;
        let created_anew = manifest.is_none();
        let needs_recovery = manifest.as_ref().is_some_and(|m| !m.clean_shutdown);

        let names = match names {
            Some(names) => names,
            None if read_only && !dir.names_path().exists() => Arc::new(NameTable::in_memory()),
            None => Arc::new(NameTable::open(&dir.names_path(), read_only)?),
        };
        let log = match config.log_mode {
            LogMode::Enabled => Some(OperationLog::open_with_config(&dir.oplog_dir(), &config)?),
            LogMode::Disabled => None,
        };

        // records.dat is only rewritten on flush, so after a crash it can lag
        // behind the log and the blob files. The log is authoritative then.
        let replay_log = match &log {
            Some(log) if needs_recovery => Some(Arc::clone(log)),
            None if needs_recovery && read_only && dir.oplog_dir().exists() => {
                Some(OperationLog::open(&dir.oplog_dir(), true)?)
            }
            _ => None,
        };
        let rebuilt = replay_log.is_some();

        let state = match &replay_log {
            Some(replay_log) => {
                warn!(
                    path = %path.display(),
                    "previous session did not disconnect, rebuilding records from the operation log"
                );
                let (contents, attributes) = if read_only {
                    (ContentStore::in_memory(), AttributeStore::in_memory())
                } else {
                    (
                        ContentStore::open(&dir.contents_path(), false)?,
                        AttributeStore::open(&dir.attributes_path(), false)?,
                    )
                };
                rebuild_from_log(replay_log, &names, contents, attributes)?
            }
            None => {
                let contents = if read_only && !dir.contents_path().exists() {
                    ContentStore::in_memory()
                } else {
                    ContentStore::open(&dir.contents_path(), read_only)?
                };
                let attributes = if read_only && !dir.attributes_path().exists() {
                    AttributeStore::in_memory()
                } else {
                    AttributeStore::open(&dir.attributes_path(), read_only)?
                };
                let table = match dir.load_records_image()? {
                    Some(image) => RecordTable::decode(&image)?,
                    None => RecordTable::new(),
                };
                StoreState {
                    table,
                    contents,
                    attributes,
                }
            }
        };
        drop(replay_log);
        validate_loaded(&state)?;

        let mut manifest = manifest.unwrap_or_else(|| Manifest::new(config.effective_version()));
        if !read_only {
            manifest.clean_shutdown = false;
            dir.save_manifest(&manifest)?;
        }

        info!(
            path = %path.display(),
            records = state.table.len(),
            version = manifest.store_version,
            created_anew,
            needs_recovery,
            rebuilt,
            read_only,
            "connected record store"
        );

        let store = Self {
            config,
            dir: Some(dir),
            manifest: Some(manifest),
            names,
            state: RwLock::new(state),
            writer: Mutex::new(()),
            log,
            is_open: RwLock::new(true),
            diverged: RwLock::new(false),
            needs_recovery,
        };
        if rebuilt && !read_only {
            if let Err(e) = store.flush_inner() {
                *store.diverged.write() = true;
                return Err(e);
            }
        }
        Ok(ConnectResult {
            store,
            created_anew,
        })
    }

    /// Creates an empty store that lives only in memory and has no log.
    #[must_use]
    pub fn in_memory(names: Arc<NameTable>) -> Self {
        Self {
            config: Config::default().log_mode(LogMode::Disabled),
            dir: None,
            manifest: None,
            names,
            state: RwLock::new(StoreState::empty()),
            writer: Mutex::new(()),
            log: None,
            is_open: RwLock::new(true),
            diverged: RwLock::new(false),
            needs_recovery: false,
        }
    }

    /// Flushes everything and releases the directory.
    ///
    /// Idempotent. Every later call on the store fails with `StoreClosed`.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails; the store stays connected then.
    pub fn disconnect(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }
        if let Some(dir) = &self.dir {
            if !self.config.read_only {
                self.flush_inner()?;
                if *self.diverged.read() {
                    warn!(
                        path = %dir.path().display(),
                        "store diverged from its log, leaving it marked for rebuild"
                    );
                } else if let Some(manifest) = &self.manifest {
                    let mut manifest = manifest.clone();
                    manifest.clean_shutdown = true;
                    dir.save_manifest(&manifest)?;
                }
            }
            dir.release();
            info!(path = %dir.path().display(), "disconnected record store");
        }
        *is_open = false;
        Ok(())
    }

    /// Makes the record table, blob stores, names and log durable.
    ///
    /// # Errors
    ///
    /// Returns an error if any write or sync fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.ensure_open()?;
        if self.config.read_only {
            return Ok(());
        }
        self.flush_inner()
    }

    fn flush_inner(&self) -> CoreResult<()> {
        let _writer = self.writer.lock();
        if let Some(log) = &self.log {
            log.sync()?;
        }
        self.names.sync()?;
        let mut state = self.state.write();
        state.contents.sync()?;
        state.attributes.sync()?;
        if let Some(dir) = &self.dir {
            dir.save_records_image(&state.table.encode())?;
        }
        debug!(records = state.table.len(), "flushed record store");
        Ok(())
    }

    /// Checks if the store is connected.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::StoreClosed)
        }
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        self.ensure_open()?;
        if self.config.read_only {
            return Err(CoreError::read_only("store connected read-only"));
        }
        if *self.diverged.read() {
            return Err(CoreError::invariant_violation(
                "store no longer matches its operation log; reconnect to rebuild it",
            ));
        }
        Ok(())
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Store directory. None for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(StoreDir::path)
    }

    /// Version recorded in the manifest.
    #[must_use]
    pub fn store_version(&self) -> u32 {
        self.manifest
            .as_ref()
            .map_or(self.config.effective_version(), |m| m.store_version)
    }

    /// True when the previous session did not disconnect cleanly.
    ///
    /// A logged store in that state was rebuilt from its operation log while
    /// connecting, so its records match the log again.
    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        self.needs_recovery
    }

    /// The operation log, if the store keeps one.
    #[must_use]
    pub fn log(&self) -> Option<&Arc<OperationLog>> {
        self.log.as_ref()
    }

    /// The name table.
    #[must_use]
    pub fn names(&self) -> &Arc<NameTable> {
        &self.names
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> CoreResult<T> {
        self.ensure_open()?;
        Ok(f(&self.state.read()))
    }

    /// Flags of an allocated record; `{FreeRecord}` for tombstones.
    pub fn get_flags(&self, id: FileId) -> CoreResult<Option<RecordFlags>> {
        self.read(|s| s.table.get(id).map(|r| r.flags))
    }

    /// Parent of a live record, None for roots.
    pub fn get_parent(&self, id: FileId) -> CoreResult<Option<FileId>> {
        self.read(|s| s.table.live(id).and_then(|r| r.parent_id.non_zero()))
    }

    /// Name id of a live record.
    pub fn get_name_id(&self, id: FileId) -> CoreResult<Option<NameId>> {
        self.read(|s| s.table.live(id).and_then(|r| r.name_id.non_zero()))
    }

    /// Name of a live record.
    pub fn get_name(&self, id: FileId) -> CoreResult<Option<String>> {
        Ok(self
            .get_name_id(id)?
            .and_then(|name_id| self.names.name_of(name_id)))
    }

    /// Timestamp of a live record.
    pub fn get_timestamp(&self, id: FileId) -> CoreResult<Option<i64>> {
        self.read(|s| s.table.live(id).map(|r| r.timestamp))
    }

    /// Length of a live record.
    pub fn get_length(&self, id: FileId) -> CoreResult<Option<i64>> {
        self.read(|s| s.table.live(id).map(|r| r.length))
    }

    /// Children list of a live record; empty otherwise.
    ///
    /// The store maintains every list it holds, so the result is
    /// authoritative. [`RecordFlag::ChildrenCached`] marks records whose list
    /// has been set at least once; without it an empty list may just mean
    /// the children were never loaded.
    pub fn list_ids(&self, id: FileId) -> CoreResult<Vec<FileId>> {
        self.read(|s| s.table.live(id).map(|r| r.children.clone()).unwrap_or_default())
    }

    /// Content id of a live record.
    pub fn get_content_id(&self, id: FileId) -> CoreResult<Option<ContentId>> {
        self.read(|s| s.table.live(id).and_then(|r| r.content_id.non_zero()))
    }

    /// Content bytes of a live record.
    pub fn read_content(&self, id: FileId) -> CoreResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        let state = self.state.read();
        match state.table.live(id).and_then(|r| r.content_id.non_zero()) {
            Some(content_id) => state.contents.read(content_id),
            None => Ok(None),
        }
    }

    /// Attribute record of a live record.
    pub fn get_attribute_record_id(&self, id: FileId) -> CoreResult<Option<AttributeRecordId>> {
        self.read(|s| s.table.live(id).and_then(|r| r.attribute_record_id.non_zero()))
    }

    /// Returns whether a live record has a value for `attribute`.
    pub fn has_attribute(&self, id: FileId, attribute: AttributeId) -> CoreResult<bool> {
        self.read(|s| {
            s.table
                .live(id)
                .is_some_and(|r| s.attributes.has(r.attribute_record_id, attribute))
        })
    }

    /// Value of one attribute of a live record.
    pub fn read_attribute_value(
        &self,
        id: FileId,
        attribute: AttributeId,
    ) -> CoreResult<Option<Vec<u8>>> {
        self.read(|s| {
            s.table
                .live(id)
                .and_then(|r| s.attributes.read(r.attribute_record_id, attribute))
                .map(<[u8]>::to_vec)
        })
    }

    /// Visits every stored attribute as `(record, file, attribute, bytes)`.
    pub fn for_each_attribute(
        &self,
        visit: impl FnMut(AttributeRecordId, FileId, AttributeId, &[u8]),
    ) -> CoreResult<()> {
        self.read(|s| s.attributes.for_each(visit))
    }

    /// Root set in ascending order.
    pub fn list_roots(&self) -> CoreResult<Vec<FileId>> {
        self.read(|s| s.table.roots().iter().copied().collect())
    }

    /// True if `id` was allocated and then tombstoned.
    pub fn is_deleted(&self, id: FileId) -> CoreResult<bool> {
        self.read(|s| s.table.get(id).is_some_and(|r| !r.is_live()))
    }

    /// Copy of a record, tombstones included.
    pub fn record(&self, id: FileId) -> CoreResult<Option<FileRecord>> {
        self.read(|s| s.table.get(id).cloned())
    }

    /// Highest allocated id, `NONE` for an empty store.
    pub fn max_allocated_id(&self) -> CoreResult<FileId> {
        self.read(|s| s.table.max_id())
    }

    /// Number of live records.
    pub fn live_count(&self) -> CoreResult<usize> {
        self.read(|s| s.table.iter().filter(|r| r.is_live()).count())
    }

    /// Live records whose content or attribute reference does not resolve.
    pub(crate) fn unresolved_blobs(&self) -> CoreResult<Vec<FileId>> {
        self.read(|s| {
            s.table
                .iter()
                .filter(|r| r.is_live())
                .filter(|r| {
                    let content_missing =
                        !r.content_id.is_none() && !s.contents.contains(r.content_id);
                    let attributes_missing = r
                        .attribute_record_id
                        .non_zero()
                        .is_some_and(|rec| s.attributes.owner(rec) != Some(r.id));
                    content_missing || attributes_missing
                })
                .map(|r| r.id)
                .collect()
        })
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Validates, logs and applies one operation.
    ///
    /// Returns the log position, or None if the store keeps no log.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the operation does not fit the current
    /// state (nothing is logged then), `ReadOnly` on a read-only store, or an
    /// I/O error.
    pub fn apply(&self, operation: &Operation) -> CoreResult<Option<LogPosition>> {
        let writer = self.writer.lock();
        self.apply_locked(&writer, operation)
    }

    fn apply_locked(
        &self,
        _writer: &MutexGuard<'_, ()>,
        operation: &Operation,
    ) -> CoreResult<Option<LogPosition>> {
        self.ensure_writable()?;
        validate(&self.state.read(), operation)?;
        let name_id = match operation {
            Operation::SetName { name, .. } => self.names.intern(name)?,
            _ => NameId::NONE,
        };

        let position = match &self.log {
            Some(log) => Some(log.append(operation)?),
            None => None,
        };

        let mut state = self.state.write();
        if let Err(e) = mutate(&mut state, operation, name_id) {
            if position.is_some() {
                *self.diverged.write() = true;
                warn!(kind = %operation.kind(), file = %operation.file_id(), error = %e, "logged operation could not be applied");
            }
            return Err(e);
        }
        debug!(
            kind = %operation.kind(),
            file = %operation.file_id(),
            position = ?position.map(|p| p.0),
            "applied"
        );
        Ok(position)
    }

    /// Allocates the next record id.
    pub fn allocate_record(&self) -> CoreResult<FileId> {
        let writer = self.writer.lock();
        self.allocate_locked(&writer)
    }

    fn allocate_locked(&self, writer: &MutexGuard<'_, ()>) -> CoreResult<FileId> {
        let id = self.state.read().table.next_id();
        self.apply_locked(writer, &Operation::AllocateRecord { id })?;
        Ok(id)
    }

    /// Adds a live, parentless record to the root set.
    pub fn create_root(&self, id: FileId) -> CoreResult<()> {
        self.apply(&Operation::CreateRoot { id }).map(drop)
    }

    /// Removes a record from the root set.
    pub fn remove_root(&self, id: FileId) -> CoreResult<()> {
        self.apply(&Operation::RemoveRoot { id }).map(drop)
    }

    /// Replaces the flags of a live record.
    pub fn set_flags(&self, id: FileId, flags: RecordFlags) -> CoreResult<()> {
        self.apply(&Operation::SetFlags { id, flags }).map(drop)
    }

    /// Reparents a live record. `FileId::NONE` detaches it.
    pub fn set_parent(&self, id: FileId, parent: FileId) -> CoreResult<()> {
        self.apply(&Operation::SetParent { id, parent }).map(drop)
    }

    /// Replaces the children list of a live record.
    pub fn set_children(&self, id: FileId, children: Vec<FileId>) -> CoreResult<()> {
        self.apply(&Operation::SetChildren { id, children }).map(drop)
    }

    /// Renames a live record.
    pub fn set_name(&self, id: FileId, name: &str) -> CoreResult<()> {
        self.apply(&Operation::SetName {
            id,
            name: name.to_string(),
        })
        .map(drop)
    }

    /// Sets the timestamp of a live record.
    pub fn set_timestamp(&self, id: FileId, timestamp: i64) -> CoreResult<()> {
        self.apply(&Operation::SetTimestamp { id, timestamp }).map(drop)
    }

    /// Sets the length of a live record.
    pub fn set_length(&self, id: FileId, length: i64) -> CoreResult<()> {
        self.apply(&Operation::SetLength { id, length }).map(drop)
    }

    /// Stores new content for a live record.
    pub fn write_content(&self, id: FileId, content: &[u8]) -> CoreResult<()> {
        self.apply(&Operation::SetContent {
            id,
            content: Some(content.to_vec()),
        })
        .map(drop)
    }

    /// Drops the content reference of a live record.
    pub fn clear_content(&self, id: FileId) -> CoreResult<()> {
        self.apply(&Operation::SetContent { id, content: None })
            .map(drop)
    }

    /// Writes one attribute of a live record.
    pub fn write_attribute(&self, id: FileId, attribute: AttributeId, value: &[u8]) -> CoreResult<()> {
        self.apply(&Operation::SetAttribute {
            id,
            attribute_id: attribute,
            value: Some(value.to_vec()),
        })
        .map(drop)
    }

    /// Deletes one attribute. Returns false, logging nothing, if it was not set.
    pub fn delete_attribute(&self, id: FileId, attribute: AttributeId) -> CoreResult<bool> {
        let writer = self.writer.lock();
        if !self.has_attribute(id, attribute)? {
            return Ok(false);
        }
        self.apply_locked(
            &writer,
            &Operation::SetAttribute {
                id,
                attribute_id: attribute,
                value: None,
            },
        )?;
        Ok(true)
    }

    /// Tombstones a record that nothing references any more.
    pub fn tombstone(&self, id: FileId) -> CoreResult<()> {
        self.apply(&Operation::Tombstone { id }).map(drop)
    }

    /// Interns a name without changing the store.
    pub fn intern_name(&self, name: &str) -> CoreResult<NameId> {
        self.ensure_open()?;
        self.names.intern(name)
    }

    /// Allocates a named record and adds it to the root set.
    pub fn add_root(&self, name: &str, flags: RecordFlags) -> CoreResult<FileId> {
        let writer = self.writer.lock();
        let id = self.allocate_locked(&writer)?;
        self.describe_locked(&writer, id, name, flags)?;
        self.apply_locked(&writer, &Operation::CreateRoot { id })?;
        Ok(id)
    }

    /// Allocates a named record under `parent` and appends it to the
    /// parent's children list.
    pub fn create_child(&self, parent: FileId, name: &str, flags: RecordFlags) -> CoreResult<FileId> {
        let writer = self.writer.lock();
        let mut children = {
            let state = self.state.read();
            state.live(parent)?.children.clone()
        };
        let id = self.allocate_locked(&writer)?;
        self.describe_locked(&writer, id, name, flags)?;
        self.apply_locked(&writer, &Operation::SetParent { id, parent })?;
        children.push(id);
        self.apply_locked(
            &writer,
            &Operation::SetChildren {
                id: parent,
                children,
            },
        )?;
        Ok(id)
    }

    fn describe_locked(
        &self,
        writer: &MutexGuard<'_, ()>,
        id: FileId,
        name: &str,
        flags: RecordFlags,
    ) -> CoreResult<()> {
        self.apply_locked(
            writer,
            &Operation::SetName {
                id,
                name: name.to_string(),
            },
        )?;
        if !flags.is_empty() {
            self.apply_locked(writer, &Operation::SetFlags { id, flags })?;
        }
        Ok(())
    }

    /// Detaches a record from its parent (or the root set) and tombstones it
    /// together with every record below it.
    pub fn delete_file(&self, id: FileId) -> CoreResult<()> {
        let writer = self.writer.lock();
        let (is_root, parent_children, subtree) = {
            let state = self.state.read();
            let record = state.live(id)?;
            let parent_children = record
                .parent_id
                .non_zero()
                .and_then(|parent| state.table.live(parent))
                .filter(|parent| parent.children.contains(&id))
                .map(|parent| {
                    (
                        parent.id,
                        parent.children.iter().copied().filter(|c| *c != id).collect::<Vec<_>>(),
                    )
                });
            (
                state.table.roots().contains(&id),
                parent_children,
                subtree_post_order(&state.table, id),
            )
        };

        if is_root {
            self.apply_locked(&writer, &Operation::RemoveRoot { id })?;
        }
        if let Some((parent, children)) = parent_children {
            self.apply_locked(&writer, &Operation::SetChildren { id: parent, children })?;
        }
        for &member in &subtree {
            let has_children = self
                .state
                .read()
                .table
                .get(member)
                .is_some_and(|r| !r.children.is_empty());
            if has_children {
                self.apply_locked(
                    &writer,
                    &Operation::SetChildren {
                        id: member,
                        children: Vec::new(),
                    },
                )?;
            }
        }
        for &member in &subtree {
            self.apply_locked(&writer, &Operation::Tombstone { id: member })?;
        }
        debug!(file = %id, tombstoned = subtree.len(), "deleted file");
        Ok(())
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Captures the full logical state of the store.
    ///
    /// `position` is recorded in the snapshot as the first log position it
    /// does not cover.
    pub fn export_snapshot(&self, position: LogPosition) -> CoreResult<RecordSnapshot> {
        self.ensure_open()?;
        let state = self.state.read();
        let mut records = Vec::with_capacity(state.table.len());
        for record in state.table.iter() {
            let content = match record.content_id.non_zero() {
                Some(content_id) => state.contents.read(content_id)?,
                None => None,
            };
            records.push(SnapshotRecord {
                id: record.id,
                parent_id: record.parent_id,
                name: record
                    .name_id
                    .non_zero()
                    .and_then(|name_id| self.names.name_of(name_id)),
                flags: record.flags,
                timestamp: record.timestamp,
                length: record.length,
                children: record.children.clone(),
                content,
                attributes: state
                    .attributes
                    .values(record.attribute_record_id)
                    .map(|(attribute, value)| (attribute, value.to_vec()))
                    .collect(),
            });
        }
        Ok(RecordSnapshot {
            position,
            roots: state.table.roots().iter().copied().collect(),
            records,
        })
    }

    /// Rebuilds a snapshot in this store through its own mutators.
    ///
    /// The store must be empty. Records are allocated in id order so ids are
    /// reproduced exactly; tombstoned ids are tombstoned last.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the store is not empty or the snapshot
    /// is inconsistent.
    pub fn load_snapshot(&self, snapshot: &RecordSnapshot) -> CoreResult<()> {
        self.ensure_empty()?;
        for operation in snapshot_operations(snapshot) {
            self.apply(&operation)?;
        }
        Ok(())
    }

    fn ensure_empty(&self) -> CoreResult<()> {
        self.ensure_open()?;
        if self.state.read().table.is_empty() {
            Ok(())
        } else {
            Err(CoreError::invalid_operation("store is not empty"))
        }
    }
}

/// The operations that rebuild `snapshot` in an empty store.
pub(crate) fn snapshot_operations(snapshot: &RecordSnapshot) -> Vec<Operation> {
    let mut ops = Vec::new();
    for record in &snapshot.records {
        ops.push(Operation::AllocateRecord { id: record.id });
    }
    let live = || snapshot.records.iter().filter(|r| r.is_live());
    for record in live() {
        let id = record.id;
        if let Some(name) = &record.name {
            ops.push(Operation::SetName {
                id,
                name: name.clone(),
            });
        }
        if record.timestamp != 0 {
            ops.push(Operation::SetTimestamp {
                id,
                timestamp: record.timestamp,
            });
        }
        if record.length != 0 {
            ops.push(Operation::SetLength {
                id,
                length: record.length,
            });
        }
        if !record.parent_id.is_none() {
            ops.push(Operation::SetParent {
                id,
                parent: record.parent_id,
            });
        }
        if let Some(content) = &record.content {
            ops.push(Operation::SetContent {
                id,
                content: Some(content.clone()),
            });
        }
        for (attribute_id, value) in &record.attributes {
            ops.push(Operation::SetAttribute {
                id,
                attribute_id: *attribute_id,
                value: Some(value.clone()),
            });
        }
    }
    for record in live().filter(|r| !r.children.is_empty()) {
        ops.push(Operation::SetChildren {
            id: record.id,
            children: record.children.clone(),
        });
    }
    // After children, which mark their parent ChildrenCached.
    for record in live().filter(|r| !r.flags.is_empty() || !r.children.is_empty()) {
        ops.push(Operation::SetFlags {
            id: record.id,
            flags: record.flags,
        });
    }
    for root in &snapshot.roots {
        ops.push(Operation::CreateRoot { id: *root });
    }
    for record in snapshot.records.iter().filter(|r| !r.is_live()) {
        ops.push(Operation::Tombstone { id: record.id });
    }
    ops
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("path", &self.path())
            .field("is_open", &self.is_open())
            .field("read_only", &self.config.read_only)
            .field("logged", &self.log.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!(error = %e, "failed to disconnect record store on drop");
        }
    }
}

// ============================================================================
// Validation and application
// ============================================================================

/// Records of the subtree rooted at `id`, deepest first, found by parent
/// links.
fn subtree_post_order(table: &RecordTable, id: FileId) -> Vec<FileId> {
    let mut by_parent: BTreeMap<FileId, Vec<FileId>> = BTreeMap::new();
    for record in table.iter().filter(|r| r.is_live() && !r.parent_id.is_none()) {
        by_parent.entry(record.parent_id).or_default().push(record.id);
    }
    let mut order = Vec::new();
    let mut stack = vec![(id, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        stack.push((node, true));
        if let Some(children) = by_parent.get(&node) {
            stack.extend(children.iter().map(|c| (*c, false)));
        }
    }
    order
}

fn validate(state: &StoreState, operation: &Operation) -> CoreResult<()> {
    let table = &state.table;
    match operation {
        Operation::AllocateRecord { id } => {
            let next = table.next_id();
            if *id != next {
                return Err(CoreError::invalid_operation(format!(
                    "allocation of {id}, next id is {next}"
                )));
            }
        }
        Operation::CreateRoot { id } => {
            let record = state.live(*id)?;
            if !record.parent_id.is_none() {
                return Err(CoreError::invalid_operation(format!(
                    "{id} has parent {} and cannot be a root",
                    record.parent_id
                )));
            }
            if table.roots().contains(id) {
                return Err(CoreError::invalid_operation(format!("{id} is already a root")));
            }
        }
        Operation::RemoveRoot { id } => {
            if !table.roots().contains(id) {
                return Err(CoreError::invalid_operation(format!("{id} is not a root")));
            }
        }
        Operation::SetFlags { id, flags } => {
            state.live(*id)?;
            if flags.contains(RecordFlag::FreeRecord) {
                return Err(CoreError::invalid_operation(
                    "FreeRecord is set only by tombstoning",
                ));
            }
        }
        Operation::SetParent { id, parent } => validate_parent(state, *id, *parent)?,
        Operation::SetChildren { id, children } => {
            state.live(*id)?;
            let mut seen = BTreeSet::new();
            for child in children {
                if !seen.insert(*child) {
                    return Err(CoreError::invalid_operation(format!(
                        "{child} listed twice under {id}"
                    )));
                }
                let record = state.live(*child)?;
                if record.parent_id != *id {
                    return Err(CoreError::invalid_operation(format!(
                        "{child} has parent {}, not {id}",
                        record.parent_id
                    )));
                }
            }
        }
        Operation::SetName { id, name } => {
            state.live(*id)?;
            blob_len(name.len())?;
        }
        Operation::SetContent { id, content } => {
            state.live(*id)?;
            if let Some(bytes) = content {
                blob_len(bytes.len())?;
            }
        }
        Operation::SetTimestamp { id, .. } | Operation::SetLength { id, .. } => {
            state.live(*id)?;
        }
        Operation::SetAttribute {
            id,
            attribute_id,
            value,
        } => {
            let record = state.live(*id)?;
            if let Some(bytes) = value {
                blob_len(bytes.len())?;
            }
            if value.is_none() && !state.attributes.has(record.attribute_record_id, *attribute_id) {
                return Err(CoreError::invalid_operation(format!(
                    "{id} has no {attribute_id} to delete"
                )));
            }
        }
        Operation::Tombstone { id } => {
            let record = state.live(*id)?;
            if table.roots().contains(id) {
                return Err(CoreError::invalid_operation(format!(
                    "{id} is a root; remove it from the root set first"
                )));
            }
            if let Some(child) = table.iter().find(|r| r.is_live() && r.parent_id == *id) {
                return Err(CoreError::invalid_operation(format!(
                    "{id} still has live child {}",
                    child.id
                )));
            }
            if let Some(parent) = record.parent_id.non_zero().and_then(|p| table.get(p)) {
                if parent.children.contains(id) {
                    return Err(CoreError::invalid_operation(format!(
                        "{id} is still listed as a child of {}",
                        parent.id
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_parent(state: &StoreState, id: FileId, parent: FileId) -> CoreResult<()> {
    let table = &state.table;
    let record = state.live(id)?;
    if record.parent_id == parent {
        return Ok(());
    }
    if parent == id {
        return Err(CoreError::invalid_operation(format!("{id} cannot be its own parent")));
    }
    if !parent.is_none() {
        state.live(parent)?;
        if table.roots().contains(&id) {
            return Err(CoreError::invalid_operation(format!(
                "root {id} cannot have a parent"
            )));
        }
    }
    if let Some(old) = record.parent_id.non_zero().and_then(|p| table.get(p)) {
        if old.children.contains(&id) {
            return Err(CoreError::invalid_operation(format!(
                "{id} is still listed as a child of {}",
                old.id
            )));
        }
    }
    let mut cursor = parent;
    for _ in 0..table.len() {
        if cursor.is_none() {
            return Ok(());
        }
        if cursor == id {
            return Err(CoreError::invalid_operation(format!(
                "making {parent} the parent of {id} creates a cycle"
            )));
        }
        cursor = table.get(cursor).map_or(FileId::NONE, |r| r.parent_id);
    }
    Err(CoreError::invalid_operation(format!(
        "parent chain above {parent} does not terminate"
    )))
}

fn mutate(state: &mut StoreState, operation: &Operation, name_id: NameId) -> CoreResult<()> {
    let StoreState {
        table,
        contents,
        attributes,
    } = state;
    let id = operation.file_id();
    if let Operation::AllocateRecord { .. } = operation {
        table.push(FileRecord::new(id));
        return Ok(());
    }
    match operation {
        Operation::CreateRoot { .. } => {
            table.roots_mut().insert(id);
            return Ok(());
        }
        Operation::RemoveRoot { .. } => {
            table.roots_mut().remove(&id);
            return Ok(());
        }
        _ => {}
    }

    let record = table
        .get_mut(id)
        .ok_or_else(|| CoreError::invalid_operation(format!("{id} is not allocated")))?;
    match operation {
        Operation::AllocateRecord { .. }
        | Operation::CreateRoot { .. }
        | Operation::RemoveRoot { .. } => {}
        Operation::SetFlags { flags, .. } => record.flags = *flags,
        Operation::SetParent { parent, .. } => record.parent_id = *parent,
        Operation::SetChildren { children, .. } => {
            record.children = children.clone();
            record.flags = record.flags.with(RecordFlag::ChildrenCached);
        }
        Operation::SetName { .. } => record.name_id = name_id,
        Operation::SetTimestamp { timestamp, .. } => record.timestamp = *timestamp,
        Operation::SetLength { length, .. } => record.length = *length,
        Operation::SetContent { content, .. } => {
            record.content_id = match content {
                Some(bytes) => contents.append(bytes)?,
                None => ContentId::NONE,
            };
        }
        Operation::SetAttribute {
            attribute_id,
            value,
            ..
        } => match value {
            Some(bytes) => {
                if record.attribute_record_id.is_none() {
                    record.attribute_record_id = attributes.create_record(id)?;
                }
                attributes.put(record.attribute_record_id, *attribute_id, bytes)?;
            }
            None => attributes.remove(record.attribute_record_id, *attribute_id)?,
        },
        Operation::Tombstone { .. } => {
            if let Some(rec) = record.attribute_record_id.non_zero() {
                attributes.delete_record(rec)?;
            }
            *record = FileRecord::tombstone(id);
        }
    }
    Ok(())
}

/// Rebuilds the whole store state from the log: the base snapshot, then
/// every entry after it. `contents` and `attributes` are emptied first.
///
/// Every entry was validated when it was logged, so one that no longer
/// applies means the log itself is damaged.
fn rebuild_from_log(
    log: &Arc<OperationLog>,
    names: &NameTable,
    mut contents: ContentStore,
    mut attributes: AttributeStore,
) -> CoreResult<StoreState> {
    let query = log.query();
    let base = query.get_base_snapshot(
        |reference| {
            Err(CoreError::snapshot_unavailable(
                reference.position,
                "snapshot file is missing",
            ))
        },
        |reference, e| Err(CoreError::snapshot_unavailable(reference.position, e.to_string())),
    )?;
    let mut operations: Vec<(Option<LogPosition>, Operation)> = match &base {
        Some(point) => snapshot_operations(&point.snapshot)
            .into_iter()
            .map(|operation| (None, operation))
            .collect(),
        None => Vec::new(),
    };
    for entry in query.entries() {
        let entry = entry?;
        match query.resolve(&entry)? {
            ResolvedOperation::Ready(operation) => operations.push((Some(entry.position), operation)),
            ResolvedOperation::PayloadUnavailable(_) => {
                return Err(CoreError::log_corrupt(format!(
                    "payload of entry {} is unavailable",
                    entry.position
                )));
            }
        }
    }

    contents.clear()?;
    attributes.clear()?;
    let mut state = StoreState {
        table: RecordTable::new(),
        contents,
        attributes,
    };
    for (position, operation) in &operations {
        let applied = validate(&state, operation).and_then(|()| {
            let name_id = match operation {
                Operation::SetName { name, .. } => names.intern(name)?,
                _ => NameId::NONE,
            };
            mutate(&mut state, operation, name_id)
        });
        match applied {
            Ok(()) => {}
            Err(e) if e.is_rejected_operation() => {
                let at = position.map_or_else(|| "base snapshot".to_string(), |p| p.to_string());
                return Err(CoreError::log_corrupt(format!(
                    "{at}: {} does not apply: {e}",
                    operation.kind()
                )));
            }
            Err(e) => return Err(e),
        }
    }
    info!(
        records = state.table.len(),
        entries = query.begin().distance_to(query.end()),
        from_snapshot = base.is_some(),
        "rebuilt record store from operation log"
    );
    Ok(state)
}

/// Structural checks run on a freshly loaded store.
fn validate_loaded(state: &StoreState) -> CoreResult<()> {
    let table = &state.table;
    for root in table.roots() {
        if !table.is_live(*root) {
            return Err(CoreError::corrupt_store(format!("root {root} is not live")));
        }
    }
    for record in table.iter().filter(|r| r.is_live()) {
        let id = record.id;
        if !record.parent_id.is_none() && !table.is_live(record.parent_id) {
            return Err(CoreError::corrupt_store(format!(
                "{id} has dead parent {}",
                record.parent_id
            )));
        }
        if let Some(child) = record.children.iter().find(|c| !table.is_live(**c)) {
            return Err(CoreError::corrupt_store(format!("{id} lists dead child {child}")));
        }
        if !record.content_id.is_none() && !state.contents.contains(record.content_id) {
            return Err(CoreError::corrupt_store(format!(
                "{id} refers to missing {}",
                record.content_id
            )));
        }
        if let Some(rec) = record.attribute_record_id.non_zero() {
            match state.attributes.owner(rec) {
                Some(owner) if owner == id => {}
                Some(owner) => {
                    return Err(CoreError::corrupt_store(format!(
                        "{rec} of {id} belongs to {owner}"
                    )))
                }
                None => {
                    return Err(CoreError::corrupt_store(format!("{id} refers to missing {rec}")))
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn memory_store() -> RecordStore {
        RecordStore::in_memory(Arc::new(NameTable::in_memory()))
    }

    fn dir_flags() -> RecordFlags {
        RecordFlags::from(RecordFlag::IsDirectory)
    }

    #[test]
    fn allocation_is_sequential() {
        let store = memory_store();
        assert_eq!(store.allocate_record().unwrap(), FileId(1));
        assert_eq!(store.allocate_record().unwrap(), FileId(2));
        assert_eq!(store.max_allocated_id().unwrap(), FileId(2));

        let err = store.apply(&Operation::AllocateRecord { id: FileId(7) }).unwrap_err();
        assert!(err.is_rejected_operation());
    }

    #[test]
    fn create_child_links_both_ways() {
        let store = memory_store();
        let root = store.add_root("/", dir_flags()).unwrap();
        let child = store.create_child(root, "src", dir_flags()).unwrap();

        assert_eq!(store.list_roots().unwrap(), vec![root]);
        assert_eq!(store.list_ids(root).unwrap(), vec![child]);
        assert_eq!(store.get_parent(child).unwrap(), Some(root));
        assert_eq!(store.get_name(child).unwrap().as_deref(), Some("src"));
        assert_eq!(store.get_flags(child).unwrap(), Some(dir_flags()));
        assert!(store
            .get_flags(root)
            .unwrap()
            .unwrap()
            .contains(RecordFlag::ChildrenCached));
    }

    #[test]
    fn snapshot_keeps_cleared_children_cached_flag() {
        let store = memory_store();
        let root = store.add_root("/", dir_flags()).unwrap();
        store.create_child(root, "a", RecordFlags::empty()).unwrap();
        store.set_flags(root, RecordFlags::empty()).unwrap();

        let snapshot = store.export_snapshot(LogPosition::FIRST).unwrap();
        let copy = memory_store();
        copy.load_snapshot(&snapshot).unwrap();
        assert_eq!(copy.get_flags(root).unwrap(), Some(RecordFlags::empty()));
        assert_eq!(copy.list_ids(root).unwrap(), store.list_ids(root).unwrap());
    }

    #[test]
    fn tombstone_resets_everything_but_id() {
        let store = memory_store();
        let root = store.add_root("/", dir_flags()).unwrap();
        let file = store.create_child(root, "a.txt", RecordFlags::empty()).unwrap();
        store.write_content(file, b"bytes").unwrap();
        store.write_attribute(file, AttributeId(1), b"x").unwrap();
        store.set_timestamp(file, 99).unwrap();

        store.delete_file(file).unwrap();

        assert!(store.is_deleted(file).unwrap());
        assert_eq!(store.get_flags(file).unwrap(), Some(RecordFlags::tombstone()));
        assert_eq!(store.record(file).unwrap(), Some(FileRecord::tombstone(file)));
        assert_eq!(store.get_timestamp(file).unwrap(), None);
        assert_eq!(store.read_content(file).unwrap(), None);
        assert!(!store.has_attribute(file, AttributeId(1)).unwrap());
        assert!(store.list_ids(root).unwrap().is_empty());
    }

    #[test]
    fn delete_file_takes_the_subtree() {
        let store = memory_store();
        let root = store.add_root("/", dir_flags()).unwrap();
        let dir = store.create_child(root, "dir", dir_flags()).unwrap();
        let nested = store.create_child(dir, "nested", dir_flags()).unwrap();
        let leaf = store.create_child(nested, "leaf", RecordFlags::empty()).unwrap();
        let sibling = store.create_child(root, "keep", RecordFlags::empty()).unwrap();

        store.delete_file(dir).unwrap();

        for id in [dir, nested, leaf] {
            assert!(store.is_deleted(id).unwrap(), "{id}");
        }
        assert_eq!(store.list_ids(root).unwrap(), vec![sibling]);
        assert_eq!(store.live_count().unwrap(), 2);
    }

    #[test]
    fn invalid_operations_change_nothing() {
        let store = memory_store();
        let root = store.add_root("/", dir_flags()).unwrap();
        let child = store.create_child(root, "c", RecordFlags::empty()).unwrap();
        let before = store.export_snapshot(LogPosition(1)).unwrap();

        let rejected = [
            Operation::Tombstone { id: root },
            Operation::Tombstone { id: child },
            Operation::SetParent { id: root, parent: child },
            Operation::SetParent { id: child, parent: child },
            Operation::SetChildren {
                id: root,
                children: vec![child, child],
            },
            Operation::SetFlags {
                id: child,
                flags: RecordFlags::tombstone(),
            },
            Operation::SetAttribute {
                id: child,
                attribute_id: AttributeId(3),
                value: None,
            },
            Operation::CreateRoot { id: child },
            Operation::RemoveRoot { id: child },
            Operation::SetName {
                id: FileId(40),
                name: "ghost".into(),
            },
        ];
        for op in &rejected {
            let err = store.apply(op).unwrap_err();
            assert!(err.is_rejected_operation(), "{op:?}: {err}");
        }
        assert_eq!(store.export_snapshot(LogPosition(1)).unwrap(), before);
    }

    #[test]
    fn cycles_are_rejected() {
        let store = memory_store();
        let root = store.add_root("/", dir_flags()).unwrap();
        let a = store.create_child(root, "a", dir_flags()).unwrap();
        let b = store.create_child(a, "b", dir_flags()).unwrap();
        store.set_children(root, Vec::new()).unwrap();

        let err = store.set_parent(a, b).unwrap_err();
        assert!(err.is_rejected_operation());
    }

    #[test]
    fn delete_attribute_reports_absence() {
        let store = memory_store();
        let root = store.add_root("/", dir_flags()).unwrap();
        assert!(!store.delete_attribute(root, AttributeId(1)).unwrap());
        store.write_attribute(root, AttributeId(1), b"v").unwrap();
        assert!(store.delete_attribute(root, AttributeId(1)).unwrap());
        assert_eq!(store.read_attribute_value(root, AttributeId(1)).unwrap(), None);
    }

    #[test]
    fn snapshot_rebuilds_an_equal_store() {
        let store = memory_store();
        let root = store.add_root("/", dir_flags()).unwrap();
        let a = store.create_child(root, "a", RecordFlags::empty()).unwrap();
        let b = store.create_child(root, "b", RecordFlags::empty()).unwrap();
        store.write_content(a, b"alpha").unwrap();
        store.write_attribute(b, AttributeId(9), b"meta").unwrap();
        store.set_length(a, 5).unwrap();
        store.delete_file(b).unwrap();

        let snapshot = store.export_snapshot(LogPosition(10)).unwrap();
        let copy = memory_store();
        copy.load_snapshot(&snapshot).unwrap();

        assert_eq!(copy.export_snapshot(LogPosition(10)).unwrap(), snapshot);
        assert_eq!(copy.read_content(a).unwrap().as_deref(), Some(&b"alpha"[..]));
    }

    #[test]
    fn persists_across_reconnect() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        let root;
        {
            let ConnectResult { store, created_anew } =
                RecordStore::connect(&path, Config::default()).unwrap();
            assert!(created_anew);
            root = store.add_root("/", dir_flags()).unwrap();
            let child = store.create_child(root, "x", RecordFlags::empty()).unwrap();
            store.write_content(child, b"payload").unwrap();
            store.disconnect().unwrap();
            assert!(matches!(store.list_roots(), Err(CoreError::StoreClosed)));
        }
        let ConnectResult { store, created_anew } =
            RecordStore::connect(&path, Config::default()).unwrap();
        assert!(!created_anew);
        assert!(!store.needs_recovery());
        assert_eq!(store.list_roots().unwrap(), vec![root]);
        let child = store.list_ids(root).unwrap()[0];
        assert_eq!(store.read_content(child).unwrap().as_deref(), Some(&b"payload"[..]));
        assert_eq!(store.log().unwrap().end(), LogPosition(10));
    }

    #[test]
    fn version_mismatch_touches_nothing() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        RecordStore::connect(&path, Config::default().version(Some(3)))
            .unwrap()
            .store
            .disconnect()
            .unwrap();
        let manifest_before = fs::read(path.join("MANIFEST")).unwrap();

        let err = RecordStore::connect(&path, Config::default().version(Some(4))).unwrap_err();
        assert!(matches!(
            err,
            CoreError::VersionMismatch {
                expected: 4,
                found: 3
            }
        ));
        assert_eq!(fs::read(path.join("MANIFEST")).unwrap(), manifest_before);

        let recreated =
            RecordStore::connect_or_recreate(&path, Config::default().version(Some(4))).unwrap();
        assert!(recreated.created_anew);
        assert_eq!(recreated.store.store_version(), 4);
    }

    #[test]
    fn second_writer_is_locked_out() {
        let temp = tempdir().unwrap();
        let _first = RecordStore::connect(temp.path(), Config::default()).unwrap();
        let err = RecordStore::connect(temp.path(), Config::default()).unwrap_err();
        assert!(matches!(err, CoreError::StoreLocked));
    }

    #[test]
    fn read_only_store_rejects_mutation() {
        let temp = tempdir().unwrap();
        RecordStore::connect(temp.path(), Config::default())
            .unwrap()
            .store
            .disconnect()
            .unwrap();
        let store = RecordStore::connect(temp.path(), Config::inspection())
            .unwrap()
            .store;
        assert!(matches!(store.allocate_record(), Err(CoreError::ReadOnly { .. })));
    }

    #[test]
    fn failed_connect_removes_new_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("fresh");
        fs::create_dir_all(path.join("oplog")).unwrap();
        fs::write(path.join("oplog").join("COMPACTION"), b"garbage").unwrap();
        // Not empty, so it survives the failed connect.
        assert!(RecordStore::connect(&path, Config::default()).is_err());
        assert!(path.exists());

        let empty = temp.path().join("empty");
        let err = RecordStore::connect(&empty, Config::default().create_if_missing(false));
        assert!(err.is_err());
        assert!(!empty.exists());
    }

    #[test]
    fn unclean_shutdown_is_reported() {
        let temp = tempdir().unwrap();
        {
            let store = RecordStore::connect(temp.path(), Config::default())
                .unwrap()
                .store;
            store.add_root("/", dir_flags()).unwrap();
            store.flush().unwrap();
            std::mem::forget(store);
        }
        let manifest = read_manifest(temp.path()).unwrap().unwrap();
        assert!(!manifest.clean_shutdown);
    }

    /// Drops the store without disconnecting, as a crashed process would.
    fn crash(store: RecordStore) {
        if let Some(dir) = &store.dir {
            dir.release();
        }
        std::mem::forget(store);
    }

    #[test]
    fn unclean_reconnect_rebuilds_from_log() {
        let temp = tempdir().unwrap();
        let records = temp.path().join("records.dat");
        {
            let store = RecordStore::connect(temp.path(), Config::default())
                .unwrap()
                .store;
            let root = store.add_root("/", dir_flags()).unwrap();
            let file = store.create_child(root, "doomed", RecordFlags::empty()).unwrap();
            store.write_attribute(file, AttributeId(1), b"v").unwrap();
            store.flush().unwrap();
            let stale = fs::read(&records).unwrap();

            store.delete_file(file).unwrap();
            store.create_child(root, "lost", RecordFlags::empty()).unwrap();
            crash(store);
            fs::write(&records, stale).unwrap();
        }

        let store = RecordStore::connect(temp.path(), Config::default())
            .unwrap()
            .store;
        assert!(store.needs_recovery());
        assert!(store.is_deleted(FileId(2)).unwrap());
        assert_eq!(store.list_ids(FileId(1)).unwrap(), vec![FileId(3)]);
        assert_eq!(store.get_name(FileId(3)).unwrap().as_deref(), Some("lost"));
        let next = store.create_child(FileId(1), "next", RecordFlags::empty()).unwrap();
        assert_eq!(next, FileId(4));
    }

    #[test]
    fn unclean_read_only_connect_rebuilds_in_memory() {
        let temp = tempdir().unwrap();
        let records = temp.path().join("records.dat");
        {
            let store = RecordStore::connect(temp.path(), Config::default())
                .unwrap()
                .store;
            let root = store.add_root("/", dir_flags()).unwrap();
            store.flush().unwrap();
            let file = store.create_child(root, "f", RecordFlags::empty()).unwrap();
            store.write_content(file, b"unflushed").unwrap();
            crash(store);
        }
        let before = fs::read(&records).unwrap();

        let store = RecordStore::connect(temp.path(), Config::default().read_only(true))
            .unwrap()
            .store;
        assert_eq!(
            store.read_content(FileId(2)).unwrap().as_deref(),
            Some(&b"unflushed"[..])
        );
        store.disconnect().unwrap();
        assert_eq!(fs::read(&records).unwrap(), before);
    }

    #[test]
    fn diverged_store_refuses_writes_and_stays_marked() {
        let temp = tempdir().unwrap();
        {
            let store = RecordStore::connect(temp.path(), Config::default())
                .unwrap()
                .store;
            store.add_root("/", dir_flags()).unwrap();
            *store.diverged.write() = true;

            let err = store.add_root("/tmp", dir_flags()).unwrap_err();
            assert!(matches!(err, CoreError::InvariantViolation { .. }), "{err}");
            store.disconnect().unwrap();
        }
        assert!(!read_manifest(temp.path()).unwrap().unwrap().clean_shutdown);

        let store = RecordStore::connect(temp.path(), Config::default())
            .unwrap()
            .store;
        assert!(store.needs_recovery());
        assert_eq!(store.list_roots().unwrap(), vec![FileId(1)]);
    }
}
