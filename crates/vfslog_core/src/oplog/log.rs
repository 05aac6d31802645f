//! The operation log.

use super::chunks::{ChunkSet, ENTRY_CHUNKS, PAYLOAD_CHUNKS};
use super::entry::{decode_entry, Decoded, LogEntry, Operation, PayloadRef};
use super::points::{decode_points, encode_points, SnapshotRef};
use super::query::LogQuery;
use crate::codec::{blob_len, checksum, len_u32};
use crate::config::Config;
use crate::dir::{atomic_write, sync_directory};
use crate::error::{CoreError, CoreResult};
use crate::snapshot::{snapshot_digest, RecordSnapshot};
use crate::types::LogPosition;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vfslog_storage::StorageBackend;

const COMPACTION_FILE: &str = "COMPACTION";
const SNAPSHOTS_DIR: &str = "snapshots";

/// Settings the log takes from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    /// Reject appends and compaction.
    pub read_only: bool,
    /// Sync chunks after every append.
    pub sync_on_write: bool,
    /// Chunk rotation size.
    pub max_chunk_size: u64,
    /// Snapshots kept by reclamation.
    pub retained_snapshots: usize,
}

impl From<&Config> for LogOptions {
    fn from(config: &Config) -> Self {
        Self {
            read_only: config.read_only,
            sync_on_write: config.sync_on_write,
            max_chunk_size: config.max_chunk_size,
            retained_snapshots: config.retained_snapshots,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EntryLocation {
    chunk: u32,
    offset: u64,
    len: u32,
}

/// Position -> location index, rebuilt by scanning at open.
#[derive(Debug)]
struct EntryIndex {
    first: LogPosition,
    locations: VecDeque<EntryLocation>,
    /// Last position stored in each entry chunk.
    chunk_last: BTreeMap<u32, LogPosition>,
    /// Last position referencing each payload chunk.
    payload_last_use: BTreeMap<u32, LogPosition>,
}

impl EntryIndex {
    fn new(first: LogPosition) -> Self {
        Self {
            first,
            locations: VecDeque::new(),
            chunk_last: BTreeMap::new(),
            payload_last_use: BTreeMap::new(),
        }
    }

    fn next(&self) -> LogPosition {
        LogPosition(self.first.0 + self.locations.len() as u64)
    }

    fn get(&self, position: LogPosition) -> Option<EntryLocation> {
        let index = position.0.checked_sub(self.first.0)?;
        self.locations.get(usize::try_from(index).ok()?).copied()
    }

    fn record(&mut self, entry: &LogEntry, location: EntryLocation) {
        if self.locations.is_empty() {
            self.first = entry.position;
        }
        self.locations.push_back(location);
        self.chunk_last.insert(location.chunk, entry.position);
        if let Some(payload) = entry.operation.payload() {
            self.payload_last_use.insert(payload.chunk, entry.position);
        }
    }
}

struct EntryState {
    chunks: ChunkSet,
    index: EntryIndex,
}

#[derive(Debug, Default)]
struct QueryRegistry {
    next_id: u64,
    open: BTreeMap<u64, LogPosition>,
}

/// What a reclamation pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReclaimStats {
    /// Entry chunks deleted.
    pub entry_chunks: usize,
    /// Payload chunks deleted.
    pub payload_chunks: usize,
    /// Snapshots deleted.
    pub snapshots: usize,
}

/// Summary of a log for inspection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LogStats {
    /// Oldest position a new query would start at.
    pub begin: LogPosition,
    /// Next position to be written.
    pub end: LogPosition,
    /// Oldest entry still on disk.
    pub first_retained: LogPosition,
    /// Entry chunk count.
    pub entry_chunks: usize,
    /// Payload chunk count.
    pub payload_chunks: usize,
    /// Recorded compaction points.
    pub compaction_points: Vec<SnapshotRef>,
    /// Open queries.
    pub open_queries: usize,
}

/// Why a snapshot could not be loaded.
#[derive(Debug)]
pub(crate) enum SnapshotLoadError {
    /// The file is gone.
    Missing,
    /// The file exists but does not match its reference.
    Corrupt(CoreError),
}

/// Append-only, position-addressed log of store mutations.
///
/// One writer appends; any number of [`LogQuery`]s read concurrently. A query
/// fixes its `[begin, end)` window when acquired and keeps that window
/// readable until dropped: compaction never reclaims anything a registered
/// query could still read.
pub struct OperationLog {
    dir: PathBuf,
    options: LogOptions,
    writer: Mutex<()>,
    entries: RwLock<EntryState>,
    payloads: RwLock<ChunkSet>,
    points: RwLock<Vec<SnapshotRef>>,
    queries: Mutex<QueryRegistry>,
    compaction: Mutex<()>,
}

impl std::fmt::Debug for OperationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationLog")
            .field("dir", &self.dir)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl OperationLog {
    /// Opens the log in `dir` with default settings.
    ///
    /// # Errors
    ///
    /// See [`OperationLog::open_with_options`].
    pub fn open(dir: &Path, read_only: bool) -> CoreResult<Arc<Self>> {
        Self::open_with_config(dir, &Config::default().read_only(read_only))
    }

    /// Opens the log in `dir` with the log settings of `config`.
    ///
    /// # Errors
    ///
    /// See [`OperationLog::open_with_options`].
    pub fn open_with_config(dir: &Path, config: &Config) -> CoreResult<Arc<Self>> {
        Self::open_with_options(dir, LogOptions::from(config))
    }

    /// Opens the log in `dir`.
    ///
    /// Scans every entry chunk to rebuild the position index. A torn entry at
    /// the end of the newest chunk is treated as end-of-log and, on a
    /// writable log, cut off.
    ///
    /// # Errors
    ///
    /// Returns `LogCorrupt` if an entry fails its checksum or envelope checks,
    /// if positions are not contiguous and increasing, if a sealed chunk ends
    /// in a torn entry, or if entries needed after the latest compaction point
    /// are missing.
    pub fn open_with_options(dir: &Path, options: LogOptions) -> CoreResult<Arc<Self>> {
        if !options.read_only {
            fs::create_dir_all(dir.join(SNAPSHOTS_DIR))?;
        }
        let points = match fs::read(dir.join(COMPACTION_FILE)) {
            Ok(bytes) => decode_points(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let latest_point = points.last().map(|p| p.position);

        let mut chunks = ChunkSet::open(dir, ENTRY_CHUNKS, options.read_only)?;
        let index = scan_entries(&mut chunks, options.read_only)?;
        let index = match index {
            Some(index) => {
                let floor = latest_point.unwrap_or(LogPosition::FIRST);
                if index.first > floor {
                    return Err(CoreError::log_corrupt(format!(
                        "entries before {} are missing, replay needs them from {floor}",
                        index.first
                    )));
                }
                if index.next() < floor {
                    return Err(CoreError::log_corrupt(format!(
                        "log ends at {} before its compaction point {floor}",
                        index.next()
                    )));
                }
                index
            }
            None => EntryIndex::new(latest_point.unwrap_or(LogPosition::FIRST)),
        };
        let payloads = ChunkSet::open(dir, PAYLOAD_CHUNKS, options.read_only)?;

        info!(
            dir = %dir.display(),
            first = %index.first,
            end = %index.next(),
            compaction_points = points.len(),
            read_only = options.read_only,
            "opened operation log"
        );

        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            options,
            writer: Mutex::new(()),
            entries: RwLock::new(EntryState { chunks, index }),
            payloads: RwLock::new(payloads),
            points: RwLock::new(points),
            queries: Mutex::new(QueryRegistry::default()),
            compaction: Mutex::new(()),
        }))
    }

    /// The log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns whether the log rejects writes.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Appends an operation and returns its position.
    ///
    /// The payload, if any, is written to the payload chunks first and the
    /// entry records where it went. Appends are serialized; readers are only
    /// blocked while the index is updated.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` on a read-only log, or an I/O error.
    pub fn append(&self, operation: &Operation) -> CoreResult<LogPosition> {
        if self.options.read_only {
            return Err(CoreError::read_only("operation log opened read-only"));
        }
        let _writer = self.writer.lock();

        let logged = operation.as_ref().try_map_payload(|bytes| self.write_payload(bytes))?;

        let mut state = self.entries.write();
        let state = &mut *state;
        let entry = LogEntry {
            position: state.index.next(),
            operation: logged,
        };
        let bytes = entry.encode();
        let (chunk, backend) = state.chunks.active_mut(self.options.max_chunk_size)?;
        let offset = backend.append(&bytes)?;
        if self.options.sync_on_write {
            backend.sync()?;
        }
        state.index.record(
            &entry,
            EntryLocation {
                chunk,
                offset,
                len: len_u32(bytes.len()),
            },
        );
        debug!(position = %entry.position, kind = %entry.operation.kind(), file = %entry.operation.file_id(), "appended");
        Ok(entry.position)
    }

    fn write_payload(&self, bytes: &[u8]) -> CoreResult<PayloadRef> {
        let len = blob_len(bytes.len())?;
        let mut payloads = self.payloads.write();
        let (chunk, backend) = payloads.active_mut(self.options.max_chunk_size)?;
        let offset = backend.append(bytes)?;
        if self.options.sync_on_write {
            backend.sync()?;
        }
        Ok(PayloadRef {
            chunk,
            offset,
            len,
            crc: checksum(bytes),
        })
    }

    /// Next position to be written.
    #[must_use]
    pub fn end(&self) -> LogPosition {
        self.entries.read().index.next()
    }

    /// Position a query acquired now would begin at.
    #[must_use]
    pub fn begin(&self) -> LogPosition {
        self.points
            .read()
            .last()
            .map_or(LogPosition::FIRST, |p| p.position)
    }

    /// Acquires a query over the current `[begin, end)` window.
    ///
    /// The query is registered until dropped.
    pub fn query(self: &Arc<Self>) -> LogQuery {
        let mut registry = self.queries.lock();
        let begin = self.begin();
        let end = self.end();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.open.insert(id, begin);
        debug!(query = id, %begin, %end, "acquired log query");
        LogQuery::new(Arc::clone(self), id, begin, end)
    }

    pub(crate) fn release_query(&self, id: u64) {
        self.queries.lock().open.remove(&id);
        debug!(query = id, "released log query");
    }

    /// Begins of every open query except `except`.
    pub(crate) fn open_query_begins(&self, except: Option<u64>) -> Vec<LogPosition> {
        self.queries
            .lock()
            .open
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .map(|(_, begin)| *begin)
            .collect()
    }

    pub(crate) fn compaction_guard(&self) -> MutexGuard<'_, ()> {
        self.compaction.lock()
    }

    /// Reads the entry at `position`.
    pub(crate) fn read_entry(&self, position: LogPosition) -> CoreResult<LogEntry> {
        let state = self.entries.read();
        let location = state.index.get(position).ok_or_else(|| {
            CoreError::log_corrupt(format!("entry {position} is not retained"))
        })?;
        let bytes = state
            .chunks
            .read(location.chunk, location.offset, location.len as usize)?
            .ok_or_else(|| {
                CoreError::log_corrupt(format!(
                    "entry {position} points past the end of chunk {}",
                    location.chunk
                ))
            })?;
        match decode_entry(&bytes)? {
            Decoded::Entry(entry, _) if entry.position == position => Ok(entry),
            Decoded::Entry(entry, _) => Err(CoreError::log_corrupt(format!(
                "expected entry {position}, found {}",
                entry.position
            ))),
            Decoded::Torn => Err(CoreError::log_corrupt(format!("entry {position} is torn"))),
        }
    }

    /// Reads a payload. `None` when it was reclaimed or fails its checksum.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures.
    pub fn read_payload(&self, payload: &PayloadRef) -> CoreResult<Option<Vec<u8>>> {
        let bytes = self
            .payloads
            .read()
            .read(payload.chunk, payload.offset, payload.len as usize)?;
        match bytes {
            Some(bytes) if checksum(&bytes) == payload.crc => Ok(Some(bytes)),
            Some(_) => {
                warn!(%payload, "payload checksum mismatch");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Recorded compaction points, oldest first.
    #[must_use]
    pub fn compaction_points(&self) -> Vec<SnapshotRef> {
        self.points.read().clone()
    }

    /// Summary for inspection.
    #[must_use]
    pub fn stats(&self) -> LogStats {
        let open_queries = self.queries.lock().open.len();
        let compaction_points = self.compaction_points();
        let (first_retained, end, entry_chunks) = {
            let state = self.entries.read();
            (
                state.index.first,
                state.index.next(),
                state.chunks.numbers().len(),
            )
        };
        LogStats {
            begin: self.begin(),
            end,
            first_retained,
            entry_chunks,
            payload_chunks: self.payloads.read().numbers().len(),
            compaction_points,
            open_queries,
        }
    }

    /// Syncs the active chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        if self.options.read_only {
            return Ok(());
        }
        let _writer = self.writer.lock();
        self.payloads.write().sync_active()?;
        self.entries.write().chunks.sync_active()
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.dir.join(SNAPSHOTS_DIR)
    }

    /// Loads the snapshot behind `reference` and checks its digest.
    pub(crate) fn load_snapshot(
        &self,
        reference: &SnapshotRef,
    ) -> Result<RecordSnapshot, SnapshotLoadError> {
        let path = self.snapshots_dir().join(&reference.file_name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotLoadError::Missing)
            }
            Err(e) => return Err(SnapshotLoadError::Corrupt(e.into())),
        };
        if snapshot_digest(&bytes) != reference.digest {
            return Err(SnapshotLoadError::Corrupt(CoreError::snapshot_unavailable(
                reference.position,
                "digest mismatch",
            )));
        }
        let snapshot = RecordSnapshot::from_cbor(&bytes).map_err(SnapshotLoadError::Corrupt)?;
        if snapshot.position != reference.position {
            return Err(SnapshotLoadError::Corrupt(CoreError::snapshot_unavailable(
                reference.position,
                format!("file holds snapshot for {}", snapshot.position),
            )));
        }
        Ok(snapshot)
    }

    /// Persists `snapshot` and records it as the newest compaction point.
    pub(crate) fn record_compaction(&self, snapshot: &RecordSnapshot) -> CoreResult<SnapshotRef> {
        if self.options.read_only {
            return Err(CoreError::read_only("operation log opened read-only"));
        }
        let bytes = snapshot.to_cbor()?;
        let reference = SnapshotRef {
            position: snapshot.position,
            file_name: SnapshotRef::file_name_for(snapshot.position),
            digest: snapshot_digest(&bytes),
            record_count: len_u32(snapshot.records.len()),
        };

        let snapshots = self.snapshots_dir();
        fs::create_dir_all(&snapshots)?;
        atomic_write(&snapshots, &reference.file_name, &bytes)?;

        let mut points = self.points.write();
        if let Some(last) = points.last() {
            if last.position >= reference.position {
                return Err(CoreError::invalid_operation(format!(
                    "compaction point {} does not follow {}",
                    reference.position, last.position
                )));
            }
        }
        let mut updated = points.clone();
        updated.push(reference.clone());
        atomic_write(&self.dir, COMPACTION_FILE, &encode_points(&updated))?;
        *points = updated;
        info!(position = %reference.position, records = reference.record_count, "recorded compaction point");
        Ok(reference)
    }

    /// Deletes chunks and snapshots that no open query and no future query
    /// can need, given a compaction at `boundary`. The query `except` (the
    /// compaction's own) does not hold anything back.
    ///
    /// The active chunks are never deleted.
    pub(crate) fn reclaim(
        &self,
        boundary: LogPosition,
        except: Option<u64>,
    ) -> CoreResult<ReclaimStats> {
        if self.options.read_only {
            return Err(CoreError::read_only("operation log opened read-only"));
        }
        let open = self.open_query_begins(except);
        let bound = open.iter().copied().fold(boundary, LogPosition::min);
        let mut stats = ReclaimStats::default();

        {
            let _writer = self.writer.lock();
            let mut state = self.entries.write();
            let state = &mut *state;
            let active = state.chunks.active_number();
            let doomed: Vec<u32> = state
                .index
                .chunk_last
                .iter()
                .filter(|(chunk, last)| Some(**chunk) != active && **last < bound)
                .map(|(chunk, _)| *chunk)
                .collect();
            for chunk in doomed {
                state.chunks.remove(chunk)?;
                state.index.chunk_last.remove(&chunk);
                stats.entry_chunks += 1;
            }
            while let Some(front) = state.index.locations.front() {
                if state.index.chunk_last.contains_key(&front.chunk) {
                    break;
                }
                state.index.locations.pop_front();
                state.index.first = state.index.first.next();
            }

            let mut payloads = self.payloads.write();
            let active = payloads.active_number();
            for chunk in payloads.numbers() {
                if Some(chunk) == active {
                    continue;
                }
                let last_use = state.index.payload_last_use.get(&chunk).copied();
                if last_use.map_or(true, |last| last < bound) {
                    payloads.remove(chunk)?;
                    state.index.payload_last_use.remove(&chunk);
                    stats.payload_chunks += 1;
                }
            }
        }

        stats.snapshots = self.prune_snapshots(&open)?;
        if stats != ReclaimStats::default() {
            sync_directory(&self.dir)?;
        }
        info!(
            %boundary,
            %bound,
            entry_chunks = stats.entry_chunks,
            payload_chunks = stats.payload_chunks,
            snapshots = stats.snapshots,
            "reclaimed log space"
        );
        Ok(stats)
    }

    /// Keeps the newest `retained_snapshots` points plus every point an open
    /// query starts from.
    fn prune_snapshots(&self, open_begins: &[LogPosition]) -> CoreResult<usize> {
        let mut points = self.points.write();
        let keep_from = points
            .len()
            .saturating_sub(self.options.retained_snapshots.max(1));
        let (kept, dropped): (Vec<_>, Vec<_>) = points
            .iter()
            .cloned()
            .enumerate()
            .partition(|(i, point)| *i >= keep_from || open_begins.contains(&point.position));
        if dropped.is_empty() {
            return Ok(0);
        }
        let kept: Vec<SnapshotRef> = kept.into_iter().map(|(_, p)| p).collect();
        atomic_write(&self.dir, COMPACTION_FILE, &encode_points(&kept))?;
        *points = kept;
        drop(points);

        let snapshots = self.snapshots_dir();
        for (_, point) in &dropped {
            match fs::remove_file(snapshots.join(&point.file_name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(dropped.len())
    }
}

/// Scans all entry chunks in order. Returns `None` for an empty log.
fn scan_entries(chunks: &mut ChunkSet, read_only: bool) -> CoreResult<Option<EntryIndex>> {
    let numbers = chunks.numbers();
    let last_chunk = numbers.last().copied();
    let mut index: Option<EntryIndex> = None;

    for number in numbers {
        let Some(backend) = chunks.get(number) else {
            continue;
        };
        let data = backend.read_all()?;
        let mut offset = 0usize;
        while offset < data.len() {
            match decode_entry(&data[offset..])? {
                Decoded::Entry(entry, used) => {
                    let index = index.get_or_insert_with(|| EntryIndex::new(entry.position));
                    let expected = index.next();
                    if entry.position != expected {
                        return Err(CoreError::log_corrupt(format!(
                            "entry {} found where {expected} was expected (chunk {number}, byte {offset})",
                            entry.position
                        )));
                    }
                    index.record(
                        &entry,
                        EntryLocation {
                            chunk: number,
                            offset: offset as u64,
                            len: len_u32(used),
                        },
                    );
                    offset += used;
                }
                Decoded::Torn => {
                    if Some(number) != last_chunk {
                        return Err(CoreError::log_corrupt(format!(
                            "torn entry inside sealed chunk {number}"
                        )));
                    }
                    warn!(
                        chunk = number,
                        offset,
                        dropped = data.len() - offset,
                        "dropping torn tail of operation log"
                    );
                    if !read_only {
                        if let Some(backend) = chunks.get_mut(number) {
                            backend.truncate(offset as u64)?;
                        }
                    }
                    break;
                }
            }
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttributeId, FileId};
    use tempfile::tempdir;

    fn alloc(id: u32) -> Operation {
        Operation::AllocateRecord { id: FileId(id) }
    }

    #[test]
    fn positions_start_at_one_and_increase() {
        let temp = tempdir().unwrap();
        let log = OperationLog::open(temp.path(), false).unwrap();
        assert_eq!(log.end(), LogPosition(1));

        let p1 = log.append(&alloc(1)).unwrap();
        let p2 = log.append(&alloc(2)).unwrap();
        assert_eq!((p1, p2), (LogPosition(1), LogPosition(2)));
        assert_eq!(log.end(), LogPosition(3));
        assert_eq!(log.read_entry(p2).unwrap().operation.file_id(), FileId(2));
    }

    #[test]
    fn payloads_are_stored_out_of_line() {
        let temp = tempdir().unwrap();
        let log = OperationLog::open(temp.path(), false).unwrap();
        log.append(&alloc(1)).unwrap();
        let pos = log
            .append(&Operation::SetAttribute {
                id: FileId(1),
                attribute_id: AttributeId(5),
                value: Some(b"attr-bytes".to_vec()),
            })
            .unwrap();

        let entry = log.read_entry(pos).unwrap();
        let payload = *entry.operation.payload().unwrap();
        assert_eq!(payload.len, 10);
        assert_eq!(
            log.read_payload(&payload).unwrap().as_deref(),
            Some(&b"attr-bytes"[..])
        );
    }

    #[test]
    fn index_rebuilt_across_chunks() {
        let temp = tempdir().unwrap();
        let options = LogOptions {
            read_only: false,
            sync_on_write: true,
            max_chunk_size: 64,
            retained_snapshots: 1,
        };
        {
            let log = OperationLog::open_with_options(temp.path(), options).unwrap();
            for id in 1..=20 {
                log.append(&alloc(id)).unwrap();
            }
            assert!(log.stats().entry_chunks > 1);
        }
        let log = OperationLog::open_with_options(temp.path(), options).unwrap();
        assert_eq!(log.end(), LogPosition(21));
        for id in 1..=20u32 {
            let entry = log.read_entry(LogPosition(u64::from(id))).unwrap();
            assert_eq!(entry.operation, Operation::AllocateRecord { id: FileId(id) });
        }
    }

    #[test]
    fn torn_tail_truncated_on_open() {
        let temp = tempdir().unwrap();
        {
            let log = OperationLog::open(temp.path(), false).unwrap();
            log.append(&alloc(1)).unwrap();
            log.append(&alloc(2)).unwrap();
            log.sync().unwrap();
        }
        let chunk = temp.path().join("ops-000001.log");
        let len = fs::metadata(&chunk).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&chunk).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let log = OperationLog::open(temp.path(), false).unwrap();
        assert_eq!(log.end(), LogPosition(2));
        assert_eq!(log.append(&alloc(2)).unwrap(), LogPosition(2));
    }

    #[test]
    fn damaged_entry_is_log_corrupt() {
        let temp = tempdir().unwrap();
        {
            let log = OperationLog::open(temp.path(), false).unwrap();
            log.append(&alloc(1)).unwrap();
            log.append(&alloc(2)).unwrap();
        }
        let chunk = temp.path().join("ops-000001.log");
        let mut bytes = fs::read(&chunk).unwrap();
        bytes[10] ^= 0x55;
        fs::write(&chunk, bytes).unwrap();

        assert!(matches!(
            OperationLog::open(temp.path(), false),
            Err(CoreError::LogCorrupt { .. })
        ));
    }

    #[test]
    fn duplicate_position_is_log_corrupt() {
        let temp = tempdir().unwrap();
        let first = LogEntry {
            position: LogPosition(1),
            operation: Operation::CreateRoot { id: FileId(1) },
        };
        let mut bytes = first.encode();
        bytes.extend_from_slice(&first.encode());
        fs::write(temp.path().join("ops-000001.log"), bytes).unwrap();

        let err = OperationLog::open(temp.path(), true).unwrap_err();
        assert!(matches!(err, CoreError::LogCorrupt { .. }), "{err}");
    }

    #[test]
    fn read_only_log_rejects_appends() {
        let temp = tempdir().unwrap();
        OperationLog::open(temp.path(), false)
            .unwrap()
            .append(&alloc(1))
            .unwrap();
        let log = OperationLog::open(temp.path(), true).unwrap();
        assert_eq!(log.end(), LogPosition(2));
        assert!(matches!(log.append(&alloc(2)), Err(CoreError::ReadOnly { .. })));
    }

    #[test]
    fn query_registration_follows_guard() {
        let temp = tempdir().unwrap();
        let log = OperationLog::open(temp.path(), false).unwrap();
        let query = log.query();
        assert_eq!(log.open_query_begins(None), vec![LogPosition(1)]);
        assert!(log.open_query_begins(Some(query.id())).is_empty());
        drop(query);
        assert!(log.open_query_begins(None).is_empty());
    }
}
