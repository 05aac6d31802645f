//! Structural comparison of two record stores.
//!
//! The oracle walks both stores breadth-first from the roots they have in
//! common and reports every field that differs. Records not reachable from a
//! common root are not compared. Differences are data; only a store that is
//! inconsistent in itself makes the walk fail.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::flags::RecordFlag;
use crate::store::RecordStore;
use crate::types::{AttributeId, FileId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tracing::debug;

/// Which side of an attribute comparison is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeMismatch {
    /// Present in the base store only.
    MissingInTarget,
    /// Present in the target store only.
    MissingInBase,
    /// Present in both with different bytes.
    ValueDiffers,
}

impl fmt::Display for AttributeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MissingInTarget => "missing in target",
            Self::MissingInBase => "missing in base",
            Self::ValueDiffers => "value differs",
        })
    }
}

/// One difference between two stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffElement {
    /// The root sets differ.
    Roots {
        /// Roots of the base store only.
        only_in_base: Vec<FileId>,
        /// Roots of the target store only.
        only_in_target: Vec<FileId>,
    },
    /// Flag sets differ.
    Flags {
        /// The file.
        id: FileId,
        /// Flags set in the base store only.
        only_in_base: Vec<RecordFlag>,
        /// Flags set in the target store only.
        only_in_target: Vec<RecordFlag>,
    },
    /// Children sets differ.
    Children {
        /// The parent.
        id: FileId,
        /// Children in the base store only.
        only_in_base: Vec<FileId>,
        /// Children in the target store only.
        only_in_target: Vec<FileId>,
    },
    /// Content bytes differ.
    Content {
        /// The file.
        id: FileId,
        /// Content length in the base store, None without content.
        base_len: Option<usize>,
        /// Content length in the target store, None without content.
        target_len: Option<usize>,
    },
    /// Names differ.
    Name {
        /// The file.
        id: FileId,
        /// Name in the base store.
        base: Option<String>,
        /// Name in the target store.
        target: Option<String>,
    },
    /// Parents differ.
    Parent {
        /// The file.
        id: FileId,
        /// Parent in the base store.
        base: Option<FileId>,
        /// Parent in the target store.
        target: Option<FileId>,
    },
    /// Timestamps differ.
    Timestamp {
        /// The file.
        id: FileId,
        /// Timestamp in the base store.
        base: Option<i64>,
        /// Timestamp in the target store.
        target: Option<i64>,
    },
    /// Lengths differ.
    Length {
        /// The file.
        id: FileId,
        /// Length in the base store.
        base: Option<i64>,
        /// Length in the target store.
        target: Option<i64>,
    },
    /// An attribute differs.
    Attribute {
        /// The file.
        id: FileId,
        /// The attribute.
        attribute_id: AttributeId,
        /// How it differs.
        mismatch: AttributeMismatch,
    },
}

struct Ids<'a, T>(&'a [T]);

impl<T: fmt::Display> fmt::Display for Ids<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id}")?;
        }
        f.write_str("]")
    }
}

struct Opt<'a, T>(&'a Option<T>);

impl<T: fmt::Display> fmt::Display for Opt<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{value}"),
            None => f.write_str("-"),
        }
    }
}

impl fmt::Display for DiffElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Roots {
                only_in_base,
                only_in_target,
            } => write!(
                f,
                "roots: base only {}, target only {}",
                Ids(only_in_base),
                Ids(only_in_target)
            ),
            Self::Flags {
                id,
                only_in_base,
                only_in_target,
            } => write!(
                f,
                "{id} flags: base only {}, target only {}",
                Ids(only_in_base),
                Ids(only_in_target)
            ),
            Self::Children {
                id,
                only_in_base,
                only_in_target,
            } => write!(
                f,
                "{id} children: base only {}, target only {}",
                Ids(only_in_base),
                Ids(only_in_target)
            ),
            Self::Content {
                id,
                base_len,
                target_len,
            } => write!(
                f,
                "{id} content: {} bytes vs {} bytes",
                Opt(base_len),
                Opt(target_len)
            ),
            Self::Name { id, base, target } => {
                write!(f, "{id} name: {:?} vs {:?}", base, target)
            }
            Self::Parent { id, base, target } => {
                write!(f, "{id} parent: {} vs {}", Opt(base), Opt(target))
            }
            Self::Timestamp { id, base, target } => {
                write!(f, "{id} timestamp: {} vs {}", Opt(base), Opt(target))
            }
            Self::Length { id, base, target } => {
                write!(f, "{id} length: {} vs {}", Opt(base), Opt(target))
            }
            Self::Attribute {
                id,
                attribute_id,
                mismatch,
            } => write!(f, "{id} {attribute_id}: {mismatch}"),
        }
    }
}

/// Outcome of a comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    /// Records compared.
    pub files_visited: u64,
    /// Attribute keys compared.
    pub attributes_checked: u64,
    /// Differences found, in discovery order.
    pub elements: Vec<DiffElement>,
    /// True if more differences exist than `elements` holds; the walk
    /// stopped at the first one that did not fit.
    pub truncated: bool,
}

impl DiffResult {
    /// True if no difference was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl fmt::Display for DiffResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files visited, {} attributes checked, {} differences",
            self.files_visited,
            self.attributes_checked,
            self.elements.len()
        )?;
        if self.truncated {
            f.write_str(" (stopped early)")?;
        }
        for element in &self.elements {
            write!(f, "\n  {element}")?;
        }
        Ok(())
    }
}

struct Collector {
    elements: Vec<DiffElement>,
    max: usize,
    /// Set once a difference had to be dropped.
    overflowed: bool,
}

impl Collector {
    fn push(&mut self, element: DiffElement) {
        if self.elements.len() < self.max {
            self.elements.push(element);
        } else {
            self.overflowed = true;
        }
    }

    fn compare<T: PartialEq>(&mut self, base: T, target: T, element: impl FnOnce(T, T) -> DiffElement) {
        if base != target {
            self.push(element(base, target));
        }
    }
}

fn split<T: Ord + Copy>(base: &[T], target: &[T]) -> (Vec<T>, Vec<T>) {
    let base_set: BTreeSet<T> = base.iter().copied().collect();
    let target_set: BTreeSet<T> = target.iter().copied().collect();
    (
        base_set.difference(&target_set).copied().collect(),
        target_set.difference(&base_set).copied().collect(),
    )
}

/// Compares `target` against `base`, stopping after `max_diff_elements`
/// differences.
///
/// # Errors
///
/// `InvariantViolation` if a child present only in `base` is not a live
/// record whose parent is the visited id. Read errors from either store are
/// passed through.
pub fn build_diff(
    base: &RecordStore,
    target: &RecordStore,
    max_diff_elements: usize,
) -> CoreResult<DiffResult> {
    let mut out = Collector {
        elements: Vec::new(),
        max: max_diff_elements,
        overflowed: false,
    };

    let base_roots = base.list_roots()?;
    let target_roots = target.list_roots()?;
    let (only_in_base, only_in_target) = split(&base_roots, &target_roots);
    if !only_in_base.is_empty() || !only_in_target.is_empty() {
        out.push(DiffElement::Roots {
            only_in_base,
            only_in_target,
        });
    }

    let target_root_set: BTreeSet<FileId> = target_roots.into_iter().collect();
    let mut queue: VecDeque<FileId> = base_roots
        .into_iter()
        .filter(|id| target_root_set.contains(id))
        .collect();
    let mut visited = BTreeSet::new();

    while let Some(id) = queue.pop_front() {
        if out.overflowed {
            break;
        }
        if !visited.insert(id) {
            continue;
        }
        queue.extend(compare_file(base, target, id, &mut out)?);
    }
    let files_visited = visited.len() as u64;

    let attributes_checked = if out.overflowed {
        0
    } else {
        compare_attributes(base, target, &visited, &mut out)?
    };

    debug!(
        files_visited,
        attributes_checked,
        differences = out.elements.len(),
        "diff finished"
    );
    let Collector {
        elements,
        overflowed,
        ..
    } = out;
    Ok(DiffResult {
        files_visited,
        attributes_checked,
        elements,
        truncated: overflowed,
    })
}

/// Compares one record and returns the children to visit next.
fn compare_file(
    base: &RecordStore,
    target: &RecordStore,
    id: FileId,
    out: &mut Collector,
) -> CoreResult<Vec<FileId>> {
    let base_flags = base.get_flags(id)?.unwrap_or_default();
    let target_flags = target.get_flags(id)?.unwrap_or_default();
    if base_flags != target_flags {
        out.push(DiffElement::Flags {
            id,
            only_in_base: base_flags.difference(target_flags),
            only_in_target: target_flags.difference(base_flags),
        });
    }

    let base_children = base.list_ids(id)?;
    let target_children = target.list_ids(id)?;
    let (only_in_base, only_in_target) = split(&base_children, &target_children);
    for child in &only_in_base {
        if base.get_parent(*child)? != Some(id) {
            return Err(CoreError::invariant_violation(format!(
                "{child} is listed under {id} in the base store but is not a live child of it"
            )));
        }
    }
    if !only_in_base.is_empty() || !only_in_target.is_empty() {
        out.push(DiffElement::Children {
            id,
            only_in_base,
            only_in_target,
        });
    }

    let base_content = base.read_content(id)?;
    let target_content = target.read_content(id)?;
    if base_content != target_content {
        out.push(DiffElement::Content {
            id,
            base_len: base_content.as_ref().map(Vec::len),
            target_len: target_content.as_ref().map(Vec::len),
        });
    }

    out.compare(base.get_name(id)?, target.get_name(id)?, |base, target| {
        DiffElement::Name { id, base, target }
    });
    out.compare(base.get_parent(id)?, target.get_parent(id)?, |base, target| {
        DiffElement::Parent { id, base, target }
    });
    out.compare(
        base.get_timestamp(id)?,
        target.get_timestamp(id)?,
        |base, target| DiffElement::Timestamp { id, base, target },
    );
    out.compare(base.get_length(id)?, target.get_length(id)?, |base, target| {
        DiffElement::Length { id, base, target }
    });

    let target_set: BTreeSet<FileId> = target_children.into_iter().collect();
    Ok(base_children
        .into_iter()
        .filter(|child| target_set.contains(child))
        .collect())
}

fn attributes_of(
    store: &RecordStore,
    visited: &BTreeSet<FileId>,
) -> CoreResult<BTreeMap<(FileId, AttributeId), Vec<u8>>> {
    let mut values = BTreeMap::new();
    store.for_each_attribute(|_, file, attribute, bytes| {
        if visited.contains(&file) {
            values.insert((file, attribute), bytes.to_vec());
        }
    })?;
    Ok(values)
}

fn compare_attributes(
    base: &RecordStore,
    target: &RecordStore,
    visited: &BTreeSet<FileId>,
    out: &mut Collector,
) -> CoreResult<u64> {
    let base_values = attributes_of(base, visited)?;
    let target_values = attributes_of(target, visited)?;
    let keys: BTreeSet<&(FileId, AttributeId)> =
        base_values.keys().chain(target_values.keys()).collect();

    let mut checked = 0;
    for key in keys {
        if out.overflowed {
            break;
        }
        checked += 1;
        let mismatch = match (base_values.get(key), target_values.get(key)) {
            (Some(a), Some(b)) if a == b => continue,
            (Some(_), Some(_)) => AttributeMismatch::ValueDiffers,
            (Some(_), None) => AttributeMismatch::MissingInTarget,
            (None, _) => AttributeMismatch::MissingInBase,
        };
        out.push(DiffElement::Attribute {
            id: key.0,
            attribute_id: key.1,
            mismatch,
        });
    }
    Ok(checked)
}

/// [`build_diff`] with a fixed element limit.
#[derive(Debug, Clone, Copy)]
pub struct DiffOracle {
    max_elements: usize,
}

impl DiffOracle {
    /// Creates an oracle that stops after `max_elements` differences.
    #[must_use]
    pub const fn new(max_elements: usize) -> Self {
        Self { max_elements }
    }

    /// Creates an oracle using `config.max_diff_elements`.
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self::new(config.max_diff_elements)
    }

    /// Compares two stores.
    ///
    /// # Errors
    ///
    /// See [`build_diff`].
    pub fn diff(&self, base: &RecordStore, target: &RecordStore) -> CoreResult<DiffResult> {
        build_diff(base, target, self.max_elements)
    }
}

impl Default for DiffOracle {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::RecordFlags;
    use crate::names::NameTable;
    use std::sync::Arc;

    fn tree() -> RecordStore {
        let store = RecordStore::in_memory(Arc::new(NameTable::in_memory()));
        let root = store
            .add_root("/", RecordFlags::from(RecordFlag::IsDirectory))
            .unwrap();
        let a = store.create_child(root, "a", RecordFlags::empty()).unwrap();
        store.write_content(a, b"alpha").unwrap();
        store.write_attribute(a, AttributeId(1), b"x").unwrap();
        store.create_child(root, "b", RecordFlags::empty()).unwrap();
        store
    }

    #[test]
    fn equal_stores_have_no_differences() {
        let result = build_diff(&tree(), &tree(), 100).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.files_visited, 3);
        assert_eq!(result.attributes_checked, 1);
        assert!(!result.truncated);
    }

    #[test]
    fn field_differences_are_reported() {
        let base = tree();
        let target = tree();
        target.write_content(FileId(2), b"beta!").unwrap();
        target.set_length(FileId(3), 12).unwrap();
        target.write_attribute(FileId(2), AttributeId(1), b"y").unwrap();
        target.write_attribute(FileId(3), AttributeId(4), b"z").unwrap();

        let result = build_diff(&base, &target, 100).unwrap();
        assert_eq!(
            result.elements,
            vec![
                DiffElement::Content {
                    id: FileId(2),
                    base_len: Some(5),
                    target_len: Some(5),
                },
                DiffElement::Length {
                    id: FileId(3),
                    base: Some(0),
                    target: Some(12),
                },
                DiffElement::Attribute {
                    id: FileId(2),
                    attribute_id: AttributeId(1),
                    mismatch: AttributeMismatch::ValueDiffers,
                },
                DiffElement::Attribute {
                    id: FileId(3),
                    attribute_id: AttributeId(4),
                    mismatch: AttributeMismatch::MissingInBase,
                },
            ]
        );
    }

    #[test]
    fn deleted_child_shows_up_under_its_parent() {
        let base = tree();
        let target = tree();
        target.delete_file(FileId(3)).unwrap();

        let result = build_diff(&base, &target, 100).unwrap();
        assert_eq!(
            result.elements,
            vec![DiffElement::Children {
                id: FileId(1),
                only_in_base: vec![FileId(3)],
                only_in_target: vec![],
            }]
        );
        assert_eq!(result.files_visited, 2);
    }

    #[test]
    fn root_sets_are_compared() {
        let base = tree();
        let target = tree();
        target.add_root("/other", RecordFlags::empty()).unwrap();

        let result = build_diff(&base, &target, 100).unwrap();
        assert_eq!(
            result.elements,
            vec![DiffElement::Roots {
                only_in_base: vec![],
                only_in_target: vec![FileId(4)],
            }]
        );
    }

    #[test]
    fn stops_at_the_limit() {
        let base = tree();
        let target = tree();
        target.set_timestamp(FileId(1), 1).unwrap();
        target.set_timestamp(FileId(2), 2).unwrap();
        target.set_timestamp(FileId(3), 3).unwrap();

        let result = build_diff(&base, &target, 1).unwrap();
        assert_eq!(result.elements.len(), 1);
        assert_eq!(result.files_visited, 2);
        assert_eq!(result.attributes_checked, 0);
        assert!(result.truncated);
    }

    #[test]
    fn exactly_the_limit_is_not_truncated() {
        let base = tree();
        let target = tree();
        target.set_timestamp(FileId(3), 3).unwrap();

        let result = build_diff(&base, &target, 1).unwrap();
        assert_eq!(result.elements.len(), 1);
        assert_eq!(result.files_visited, 3);
        assert_eq!(result.attributes_checked, 1);
        assert!(!result.truncated);
    }

    #[test]
    fn display_lists_elements() {
        let base = tree();
        let target = tree();
        target.set_timestamp(FileId(2), 7).unwrap();
        let text = build_diff(&base, &target, 10).unwrap().to_string();
        assert!(text.starts_with("3 files visited, 1 attributes checked, 1 differences"));
        assert!(text.contains("timestamp: 0 vs 7"));
    }
}
