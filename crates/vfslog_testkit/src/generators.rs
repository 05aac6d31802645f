//! Property-based test generators using proptest.
//!
//! Scripts are sequences of [`StoreAction`]s. Actions address records by
//! index into the live ids at the time they run, so every generated script
//! is valid against any store state.

use crate::fixtures::live_ids;
use proptest::prelude::*;
use vfslog_core::{AttributeId, CoreResult, RecordFlag, RecordFlags, RecordStore};

/// One mutation of a store.
#[derive(Debug, Clone)]
pub enum StoreAction {
    /// Add a named root.
    AddRoot {
        /// Name
        name: String,
    },
    /// Create a child under a live record.
    CreateChild {
        /// Index of the parent among live ids
        parent: usize,
        /// Name
        name: String,
        /// Whether to flag the child as a directory
        directory: bool,
    },
    /// Replace content.
    WriteContent {
        /// Index of the file among live ids
        target: usize,
        /// New content
        content: Vec<u8>,
    },
    /// Drop content.
    ClearContent {
        /// Index of the file among live ids
        target: usize,
    },
    /// Replace flags.
    SetFlags {
        /// Index of the file among live ids
        target: usize,
        /// Flag bits; the tombstone bit is ignored
        bits: u16,
    },
    /// Set the timestamp.
    SetTimestamp {
        /// Index of the file among live ids
        target: usize,
        /// Timestamp
        timestamp: i64,
    },
    /// Set the length.
    SetLength {
        /// Index of the file among live ids
        target: usize,
        /// Length
        length: i64,
    },
    /// Rename.
    Rename {
        /// Index of the file among live ids
        target: usize,
        /// New name
        name: String,
    },
    /// Write an attribute.
    WriteAttribute {
        /// Index of the file among live ids
        target: usize,
        /// Attribute id
        attribute: u32,
        /// Value
        value: Vec<u8>,
    },
    /// Delete an attribute if present.
    DeleteAttribute {
        /// Index of the file among live ids
        target: usize,
        /// Attribute id
        attribute: u32,
    },
    /// Delete a file and its subtree.
    Delete {
        /// Index of the file among live ids
        target: usize,
    },
}

/// Flags built from the low bits of `bits`, without the tombstone bit.
pub fn flags_from_bits(bits: u16) -> RecordFlags {
    RecordFlag::ALL
        .into_iter()
        .filter(|flag| *flag != RecordFlag::FreeRecord && bits & (1 << (*flag as u16)) != 0)
        .collect()
}

/// Applies one action. Returns false if it was skipped because the store
/// had nothing to apply it to.
///
/// # Errors
///
/// Whatever the store returns; generated actions are always valid.
pub fn apply_action(store: &RecordStore, action: &StoreAction) -> CoreResult<bool> {
    if let StoreAction::AddRoot { name } = action {
        store.add_root(name, RecordFlags::from(RecordFlag::IsDirectory))?;
        return Ok(true);
    }

    let ids = live_ids(store);
    let pick = |index: usize| ids.get(index % ids.len().max(1)).copied();
    let index = match action {
        StoreAction::AddRoot { .. } => return Ok(true),
        StoreAction::CreateChild { parent, .. } => *parent,
        StoreAction::WriteContent { target, .. }
        | StoreAction::ClearContent { target }
        | StoreAction::SetFlags { target, .. }
        | StoreAction::SetTimestamp { target, .. }
        | StoreAction::SetLength { target, .. }
        | StoreAction::Rename { target, .. }
        | StoreAction::WriteAttribute { target, .. }
        | StoreAction::DeleteAttribute { target, .. }
        | StoreAction::Delete { target } => *target,
    };
    let Some(id) = pick(index) else {
        return Ok(false);
    };

    match action {
        StoreAction::AddRoot { .. } => {}
        StoreAction::CreateChild {
            name, directory, ..
        } => {
            let flags = if *directory {
                RecordFlags::from(RecordFlag::IsDirectory)
            } else {
                RecordFlags::empty()
            };
            store.create_child(id, name, flags)?;
        }
        StoreAction::WriteContent { content, .. } => store.write_content(id, content)?,
        StoreAction::ClearContent { .. } => store.clear_content(id)?,
        StoreAction::SetFlags { bits, .. } => store.set_flags(id, flags_from_bits(*bits))?,
        StoreAction::SetTimestamp { timestamp, .. } => store.set_timestamp(id, *timestamp)?,
        StoreAction::SetLength { length, .. } => store.set_length(id, *length)?,
        StoreAction::Rename { name, .. } => store.set_name(id, name)?,
        StoreAction::WriteAttribute {
            attribute, value, ..
        } => store.write_attribute(id, AttributeId(*attribute), value)?,
        StoreAction::DeleteAttribute { attribute, .. } => {
            store.delete_attribute(id, AttributeId(*attribute))?;
        }
        StoreAction::Delete { .. } => store.delete_file(id)?,
    }
    Ok(true)
}

/// Applies a script, returning how many actions were not skipped.
///
/// # Errors
///
/// The first error the store returns.
pub fn apply_script(store: &RecordStore, script: &[StoreAction]) -> CoreResult<usize> {
    let mut applied = 0;
    for action in script {
        if apply_action(store, action)? {
            applied += 1;
        }
    }
    Ok(applied)
}

/// Strategy for generating file names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_.]{0,11}").expect("Invalid regex")
}

/// Strategy for generating file content.
pub fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// Strategy for generating one action.
pub fn store_action_strategy() -> impl Strategy<Value = StoreAction> {
    let index = any::<usize>();
    prop_oneof![
        1 => name_strategy().prop_map(|name| StoreAction::AddRoot { name }),
        4 => (index, name_strategy(), any::<bool>()).prop_map(|(parent, name, directory)| {
            StoreAction::CreateChild { parent, name, directory }
        }),
        3 => (index, content_strategy())
            .prop_map(|(target, content)| StoreAction::WriteContent { target, content }),
        1 => index.prop_map(|target| StoreAction::ClearContent { target }),
        1 => (index, any::<u16>()).prop_map(|(target, bits)| StoreAction::SetFlags { target, bits }),
        1 => (index, any::<i64>())
            .prop_map(|(target, timestamp)| StoreAction::SetTimestamp { target, timestamp }),
        1 => (index, 0..i64::from(u32::MAX))
            .prop_map(|(target, length)| StoreAction::SetLength { target, length }),
        1 => (index, name_strategy()).prop_map(|(target, name)| StoreAction::Rename { target, name }),
        2 => (index, 1..4u32, content_strategy()).prop_map(|(target, attribute, value)| {
            StoreAction::WriteAttribute { target, attribute, value }
        }),
        1 => (index, 1..4u32)
            .prop_map(|(target, attribute)| StoreAction::DeleteAttribute { target, attribute }),
        1 => index.prop_map(|target| StoreAction::Delete { target }),
    ]
}

/// Strategy for generating a script. Scripts always start with a root.
pub fn store_script_strategy(
    min_actions: usize,
    max_actions: usize,
) -> impl Strategy<Value = Vec<StoreAction>> {
    (
        name_strategy(),
        prop::collection::vec(store_action_strategy(), min_actions..max_actions),
    )
        .prop_map(|(root, mut actions)| {
            actions.insert(0, StoreAction::AddRoot { name: root });
            actions
        })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 500,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests. Each case touches disk.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 5000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::memory_store;

    #[test]
    fn tombstone_bit_is_never_generated() {
        assert!(!flags_from_bits(u16::MAX).contains(RecordFlag::FreeRecord));
        assert!(flags_from_bits(u16::MAX).contains(RecordFlag::IsHidden));
        assert!(flags_from_bits(0).is_empty());
    }

    #[test]
    fn actions_on_an_empty_store_are_skipped() {
        let store = memory_store();
        let applied = apply_action(&store, &StoreAction::Delete { target: 3 }).unwrap();
        assert!(!applied);
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn generated_scripts_apply_cleanly(script in store_script_strategy(1, 40)) {
            let store = memory_store();
            let applied = apply_script(&store, &script).unwrap();
            prop_assert!(applied >= 1);
        }
    }
}
