//! Append-only content blob store (`contents.dat`).

use crate::codec::{blob_len, encode_frame, scan_frames, FrameSpan, FRAME_HEADER};
use crate::error::{CoreError, CoreResult};
use crate::types::ContentId;
use std::path::Path;
use tracing::warn;
use vfslog_storage::{FileBackend, InMemoryBackend, StorageBackend};

/// Content blobs addressed by [`ContentId`]; the id is the frame ordinal.
pub(crate) struct ContentStore {
    backend: Box<dyn StorageBackend>,
    index: Vec<FrameSpan>,
}

impl ContentStore {
    pub(crate) fn in_memory() -> Self {
        Self {
            backend: Box::new(InMemoryBackend::new()),
            index: Vec::new(),
        }
    }

    pub(crate) fn open(path: &Path, read_only: bool) -> CoreResult<Self> {
        let mut backend = if read_only {
            FileBackend::open_read_only(path)?
        } else {
            FileBackend::open(path)?
        };
        let data = backend.read_all()?;
        let scan = scan_frames(&data, "contents.dat")?;
        if scan.valid_len < data.len() as u64 {
            warn!(path = %path.display(), "dropping torn tail of content store");
            if !read_only {
                backend.truncate(scan.valid_len)?;
            }
        }
        Ok(Self {
            backend: Box::new(backend),
            index: scan.frames,
        })
    }

    /// Drops every blob. Used when the store is rebuilt from its log.
    pub(crate) fn clear(&mut self) -> CoreResult<()> {
        self.backend.truncate(0)?;
        self.index.clear();
        Ok(())
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) -> CoreResult<ContentId> {
        let len = blob_len(bytes.len())?;
        let offset = self.backend.append(&encode_frame(bytes))?;
        self.index.push(FrameSpan {
            offset: offset + FRAME_HEADER as u64,
            len,
        });
        Ok(ContentId(crate::codec::len_u32(self.index.len())))
    }

    pub(crate) fn contains(&self, id: ContentId) -> bool {
        !id.is_none() && (id.0 as usize) <= self.index.len()
    }

    pub(crate) fn read(&self, id: ContentId) -> CoreResult<Option<Vec<u8>>> {
        let Some(span) = (id.0 as usize)
            .checked_sub(1)
            .and_then(|index| self.index.get(index))
        else {
            return Ok(None);
        };
        let bytes = self.backend.read_at(span.offset, span.len as usize)?;
        Ok(Some(bytes))
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn sync(&mut self) -> CoreResult<()> {
        self.backend.sync().map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn blobs_addressed_by_ordinal() {
        let mut store = ContentStore::in_memory();
        let a = store.append(b"hello").unwrap();
        let b = store.append(b"").unwrap();
        assert_eq!(a, ContentId(1));
        assert_eq!(b, ContentId(2));
        assert_eq!(store.read(a).unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(store.read(b).unwrap().as_deref(), Some(&b""[..]));
        assert_eq!(store.read(ContentId(3)).unwrap(), None);
        assert!(!store.contains(ContentId::NONE));
    }

    #[test]
    fn index_rebuilt_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("contents.dat");
        {
            let mut store = ContentStore::open(&path, false).unwrap();
            store.append(b"one").unwrap();
            store.append(b"two").unwrap();
            store.sync().unwrap();
        }
        let store = ContentStore::open(&path, true).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.read(ContentId(2)).unwrap().as_deref(), Some(&b"two"[..]));
    }
}
