//! In-memory byte store.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// A byte store held entirely in memory.
///
/// Backs in-memory record stores (scratch stores used while compacting) and
/// name tables that are never persisted.
///
/// ```rust
/// use vfslog_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// assert_eq!(backend.append(b"blob").unwrap(), 0);
/// assert_eq!(backend.size().unwrap(), 4);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding `data`, e.g. a deliberately damaged file image.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(len);
        if start > data.len() || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncatePastEnd {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sequential_appends() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"ab").unwrap(), 0);
        assert_eq!(backend.append(b"").unwrap(), 2);
        assert_eq!(backend.append(b"cde").unwrap(), 2);
        assert_eq!(backend.data(), b"abcde");
    }

    #[test]
    fn read_past_end() {
        let backend = InMemoryBackend::with_data(b"abc".to_vec());
        assert!(matches!(
            backend.read_at(1, 3),
            Err(StorageError::ReadPastEnd { offset: 1, len: 3, size: 3 })
        ));
        assert!(backend.read_at(3, 0).unwrap().is_empty());
    }

    #[test]
    fn truncate_bounds() {
        let mut backend = InMemoryBackend::with_data(b"abcdef".to_vec());
        backend.truncate(2).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"ab");
        assert!(matches!(
            backend.truncate(3),
            Err(StorageError::TruncatePastEnd { .. })
        ));
    }

    proptest! {
        #[test]
        fn appended_chunks_read_back(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..16)) {
            let mut backend = InMemoryBackend::new();
            let mut placed = Vec::new();
            for chunk in &chunks {
                placed.push(backend.append(chunk).unwrap());
            }
            for (chunk, offset) in chunks.iter().zip(placed) {
                prop_assert_eq!(&backend.read_at(offset, chunk.len()).unwrap(), chunk);
            }
        }
    }
}
