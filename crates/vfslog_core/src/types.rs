//! Identifier types shared by the record store and the operation log.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! u32_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// The reserved "nothing" value.
            pub const NONE: Self = Self(0);

            /// Creates an id from its raw value.
            #[must_use]
            pub const fn new(id: u32) -> Self {
                Self(id)
            }

            /// Returns the raw id value.
            #[must_use]
            pub const fn as_u32(self) -> u32 {
                self.0
            }

            /// Returns true for the reserved zero id.
            #[must_use]
            pub const fn is_none(self) -> bool {
                self.0 == 0
            }

            /// Returns `None` for the reserved zero id.
            #[must_use]
            pub const fn non_zero(self) -> Option<Self> {
                if self.0 == 0 {
                    None
                } else {
                    Some(self)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

u32_id!(
    /// Primary key of a file record.
    ///
    /// Allocated sequentially from 1 and never reused while the store lives;
    /// tombstoned records keep their id.
    FileId,
    "file"
);

u32_id!(
    /// Handle of an interned file name. Zero means unnamed.
    NameId,
    "name"
);

u32_id!(
    /// Handle of a content blob. Zero means no content is stored.
    ContentId,
    "content"
);

u32_id!(
    /// Handle of a file's attribute record. Zero means the file has no attributes.
    AttributeRecordId,
    "attrs"
);

u32_id!(
    /// Caller-chosen attribute kind.
    AttributeId,
    "attr"
);

/// Ordinal of an operation log entry.
///
/// The first entry ever written is at position 1. Positions are assigned by
/// the log writer only and strictly increase.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogPosition(pub u64);

impl LogPosition {
    /// Position of the first entry of a log that was never compacted.
    pub const FIRST: Self = Self(1);

    /// Creates a position from its raw value.
    #[must_use]
    pub const fn new(position: u64) -> Self {
        Self(position)
    }

    /// Returns the raw position value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following position.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Number of positions in `[self, end)`, zero when `end <= self`.
    #[must_use]
    pub const fn distance_to(self, end: Self) -> u64 {
        end.0.saturating_sub(self.0)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ids_are_none() {
        assert!(FileId::NONE.is_none());
        assert_eq!(FileId::new(0).non_zero(), None);
        assert_eq!(FileId::new(7).non_zero(), Some(FileId(7)));
        assert_eq!(ContentId::default(), ContentId::NONE);
    }

    #[test]
    fn display_is_prefixed() {
        assert_eq!(FileId(3).to_string(), "file:3");
        assert_eq!(AttributeId(9).to_string(), "attr:9");
        assert_eq!(LogPosition(42).to_string(), "@42");
    }

    #[test]
    fn position_arithmetic() {
        assert_eq!(LogPosition::FIRST.next(), LogPosition(2));
        assert_eq!(LogPosition(3).distance_to(LogPosition(10)), 7);
        assert_eq!(LogPosition(10).distance_to(LogPosition(3)), 0);
    }
}
