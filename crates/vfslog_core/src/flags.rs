//! Record status flags.
//!
//! [`RecordFlags`] is an enum-set over [`RecordFlag`]. The tombstone bit
//! dominates: any set containing [`RecordFlag::FreeRecord`] is exactly
//! `{FreeRecord}`, and every constructor enforces that.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single status bit of a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum RecordFlag {
    /// The children list is authoritative.
    ChildrenCached = 0,
    /// The record is a directory.
    IsDirectory = 1,
    /// The file is read-only on disk.
    IsReadOnly = 2,
    /// Stored content is stale and must be reloaded.
    MustReloadContent = 3,
    /// The record is a symbolic link.
    IsSymlink = 4,
    /// The record is a special file (device, fifo, socket).
    IsSpecial = 5,
    /// The file is hidden.
    IsHidden = 6,
    /// Stored length is stale and must be reloaded.
    MustReloadLength = 7,
    /// Child names compare case-sensitively.
    ChildrenCaseSensitive = 8,
    /// `ChildrenCaseSensitive` is known rather than defaulted.
    ChildrenCaseSensitivityCached = 9,
    /// Tombstone.
    FreeRecord = 10,
    /// The file is not loaded unless explicitly requested.
    OfflineByDefault = 11,
}

impl RecordFlag {
    /// All flags in declaration order.
    pub const ALL: [Self; 12] = [
        Self::ChildrenCached,
        Self::IsDirectory,
        Self::IsReadOnly,
        Self::MustReloadContent,
        Self::IsSymlink,
        Self::IsSpecial,
        Self::IsHidden,
        Self::MustReloadLength,
        Self::ChildrenCaseSensitive,
        Self::ChildrenCaseSensitivityCached,
        Self::FreeRecord,
        Self::OfflineByDefault,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u8)
    }
}

impl fmt::Display for RecordFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

const KNOWN_BITS: u16 = (1 << 12) - 1;

/// A normalized set of [`RecordFlag`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub struct RecordFlags(u16);

impl RecordFlags {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The tombstone set, `{FreeRecord}`.
    #[must_use]
    pub const fn tombstone() -> Self {
        Self(RecordFlag::FreeRecord.bit())
    }

    /// Builds a set from raw bits.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if a bit outside the known flags is set.
    pub fn from_bits(bits: u16) -> CoreResult<Self> {
        if bits & !KNOWN_BITS != 0 {
            return Err(CoreError::invalid_format(format!(
                "unknown record flag bits {:#06x}",
                bits & !KNOWN_BITS
            )));
        }
        Ok(Self::normalized(bits))
    }

    const fn normalized(bits: u16) -> Self {
        if bits & RecordFlag::FreeRecord.bit() != 0 {
            Self::tombstone()
        } else {
            Self(bits)
        }
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns true if `flag` is in the set.
    #[must_use]
    pub const fn contains(self, flag: RecordFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Returns true for the tombstone set.
    #[must_use]
    pub const fn is_free(self) -> bool {
        self.contains(RecordFlag::FreeRecord)
    }

    /// Returns true if no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Adds `flag`. Adding `FreeRecord` collapses the set to `{FreeRecord}`.
    pub fn insert(&mut self, flag: RecordFlag) {
        *self = Self::normalized(self.0 | flag.bit());
    }

    /// Returns a copy with `flag` added.
    #[must_use]
    pub fn with(mut self, flag: RecordFlag) -> Self {
        self.insert(flag);
        self
    }

    /// Removes `flag`.
    pub fn remove(&mut self, flag: RecordFlag) {
        self.0 &= !flag.bit();
    }

    /// Returns a copy with `flag` removed.
    #[must_use]
    pub fn without(mut self, flag: RecordFlag) -> Self {
        self.remove(flag);
        self
    }

    /// Flags in `self` that are not in `other`.
    #[must_use]
    pub fn difference(self, other: Self) -> Vec<RecordFlag> {
        Self(self.0 & !other.0).iter().collect()
    }

    /// Iterates the set in declaration order.
    pub fn iter(self) -> impl Iterator<Item = RecordFlag> {
        RecordFlag::ALL.into_iter().filter(move |flag| self.contains(*flag))
    }
}

impl FromIterator<RecordFlag> for RecordFlags {
    fn from_iter<I: IntoIterator<Item = RecordFlag>>(iter: I) -> Self {
        let bits = iter.into_iter().fold(0, |bits, flag| bits | flag.bit());
        Self::normalized(bits)
    }
}

impl From<RecordFlag> for RecordFlags {
    fn from(flag: RecordFlag) -> Self {
        Self::normalized(flag.bit())
    }
}

impl From<RecordFlags> for u16 {
    fn from(flags: RecordFlags) -> Self {
        flags.0
    }
}

impl TryFrom<u16> for RecordFlags {
    type Error = CoreError;

    fn try_from(bits: u16) -> CoreResult<Self> {
        Self::from_bits(bits)
    }
}

impl fmt::Display for RecordFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, flag) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{flag}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn free_record_dominates() {
        let flags: RecordFlags = [
            RecordFlag::IsDirectory,
            RecordFlag::FreeRecord,
            RecordFlag::IsHidden,
        ]
        .into_iter()
        .collect();
        assert_eq!(flags, RecordFlags::tombstone());

        let mut flags = RecordFlags::from(RecordFlag::IsSymlink);
        flags.insert(RecordFlag::FreeRecord);
        assert_eq!(flags.iter().collect::<Vec<_>>(), vec![RecordFlag::FreeRecord]);
        flags.insert(RecordFlag::IsReadOnly);
        assert_eq!(flags, RecordFlags::tombstone());
    }

    #[test]
    fn unknown_bits_rejected() {
        assert!(RecordFlags::from_bits(1 << 12).is_err());
        assert!(RecordFlags::from_bits(0x0fff).unwrap().is_free());
    }

    #[test]
    fn difference_and_display() {
        let base = RecordFlags::empty()
            .with(RecordFlag::IsDirectory)
            .with(RecordFlag::ChildrenCached);
        let target = RecordFlags::from(RecordFlag::IsDirectory);
        assert_eq!(base.difference(target), vec![RecordFlag::ChildrenCached]);
        assert!(target.difference(base).is_empty());
        assert_eq!(base.to_string(), "{ChildrenCached, IsDirectory}");
        assert_eq!(RecordFlags::empty().to_string(), "{}");
    }

    proptest! {
        #[test]
        fn every_construction_is_normalized(bits in 0u16..(1 << 12)) {
            let flags = RecordFlags::from_bits(bits).unwrap();
            if flags.contains(RecordFlag::FreeRecord) {
                prop_assert_eq!(flags.iter().count(), 1);
            }
            let rebuilt: RecordFlags = flags.iter().collect();
            prop_assert_eq!(rebuilt, flags);
        }
    }
}
