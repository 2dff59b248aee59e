//! Hive differencer -- key and value changes between two registry snapshots.
//!
//! Snapshots store keys flat under their full path in a `BTreeMap`, so the
//! union of key paths is walked with one merge pass, the same way the tree
//! differencer walks two content indices. Values are compared by name; a
//! value's identity is its `(type, data)` pair.
use crate::model::{HiveSnapshot, RegistryKey, RegistryValue};
use compact_str::CompactString;
use std::cmp::Ordering;

/// Change to one value of a key present in both snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueChange {
    Created(RegistryValue),
    Deleted(RegistryValue),
    Modified {
        name: CompactString,
        old: RegistryValue,
        new: RegistryValue,
    },
}

impl ValueChange {
    pub fn name(&self) -> &str {
        match self {
            Self::Created(value) | Self::Deleted(value) => &value.name,
            Self::Modified { name, .. } => name,
        }
    }
}

/// Change record for one key.
///
/// A created or deleted key carries its own values; keys below it get their
/// own records, and no separate value records are emitted for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HiveChange {
    CreatedKey {
        path: String,
        values: Vec<RegistryValue>,
    },
    DeletedKey {
        path: String,
        values: Vec<RegistryValue>,
    },
    /// Key present on both sides with at least one differing value.
    /// `changes` is sorted by value name.
    ModifiedKey {
        path: String,
        changes: Vec<ValueChange>,
    },
}

impl HiveChange {
    pub fn path(&self) -> &str {
        match self {
            Self::CreatedKey { path, .. }
            | Self::DeletedKey { path, .. }
            | Self::ModifiedKey { path, .. } => path,
        }
    }
}

/// Ordered change set for two hive snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HiveDiff {
    /// Sorted by key path.
    pub records: Vec<HiveChange>,
    /// Set if either snapshot is partial; `DeletedKey` and `CreatedKey`
    /// records may then stem from unreadable subtrees.
    pub partial: bool,
}

impl HiveDiff {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Classify key and value differences between `old` and `new`.
pub fn diff_hives(old: &HiveSnapshot, new: &HiveSnapshot) -> HiveDiff {
    let mut records = Vec::new();
    let mut old_iter = old.keys().iter().peekable();
    let mut new_iter = new.keys().iter().peekable();

    loop {
        let order = match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((o, _)), Some((n, _))) => o.cmp(n),
        };
        match order {
            Ordering::Less => {
                if let Some((path, key)) = old_iter.next() {
                    records.push(HiveChange::DeletedKey {
                        path: path.clone(),
                        values: key.values().cloned().collect(),
                    });
                }
            }
            Ordering::Greater => {
                if let Some((path, key)) = new_iter.next() {
                    records.push(HiveChange::CreatedKey {
                        path: path.clone(),
                        values: key.values().cloned().collect(),
                    });
                }
            }
            Ordering::Equal => {
                if let (Some((path, o)), Some((_, n))) = (old_iter.next(), new_iter.next()) {
                    let changes = diff_values(o, n);
                    if !changes.is_empty() {
                        records.push(HiveChange::ModifiedKey {
                            path: path.clone(),
                            changes,
                        });
                    }
                }
            }
        }
    }

    HiveDiff {
        records,
        partial: old.is_partial() || new.is_partial(),
    }
}

/// Value changes of one key, sorted by name.
fn diff_values(old: &RegistryKey, new: &RegistryKey) -> Vec<ValueChange> {
    let mut changes = Vec::new();
    let mut old_iter = old.values().peekable();
    let mut new_iter = new.values().peekable();

    loop {
        let order = match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(o), Some(n)) => o.name.cmp(&n.name),
        };
        match order {
            Ordering::Less => changes.extend(old_iter.next().cloned().map(ValueChange::Deleted)),
            Ordering::Greater => changes.extend(new_iter.next().cloned().map(ValueChange::Created)),
            Ordering::Equal => {
                if let (Some(o), Some(n)) = (old_iter.next(), new_iter.next()) {
                    if !o.same_content(n) {
                        changes.push(ValueChange::Modified {
                            name: o.name.clone(),
                            old: o.clone(),
                            new: n.clone(),
                        });
                    }
                }
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ValueType;

    const RUN: &str = "\\HKLM\\SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\Run";

    fn snapshot(keys: Vec<(&str, Vec<RegistryValue>)>) -> HiveSnapshot {
        HiveSnapshot::from_keys(keys.into_iter().map(|(p, v)| (p.to_string(), v)))
    }

    #[test]
    fn identical_snapshots_produce_nothing() {
        let keys = vec![(RUN, vec![RegistryValue::string("a", "b")])];
        let diff = diff_hives(&snapshot(keys.clone()), &snapshot(keys));
        assert!(diff.is_empty());
        assert!(!diff.partial);
    }

    #[test]
    fn added_value_is_one_created_value() {
        let old = snapshot(vec![(RUN, vec![RegistryValue::string("Keep", "x")])]);
        let new = snapshot(vec![(
            RUN,
            vec![
                RegistryValue::string("Keep", "x"),
                RegistryValue::string("Updater", "C:\\evil.exe"),
            ],
        )]);

        let diff = diff_hives(&old, &new);
        assert_eq!(diff.records.len(), 1);
        match &diff.records[0] {
            HiveChange::ModifiedKey { path, changes } => {
                assert_eq!(path, RUN);
                assert_eq!(changes.len(), 1);
                assert!(matches!(&changes[0], ValueChange::Created(v) if v.name == "Updater"));
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn removed_key_is_one_deleted_key_without_value_records() {
        let old = snapshot(vec![
            ("\\HKLM\\SOFTWARE", vec![]),
            (
                "\\HKLM\\SOFTWARE\\Vendor",
                vec![RegistryValue::dword("a", 1), RegistryValue::dword("b", 2)],
            ),
        ]);
        let new = snapshot(vec![("\\HKLM\\SOFTWARE", vec![])]);

        let diff = diff_hives(&old, &new);
        assert_eq!(diff.records.len(), 1);
        assert!(matches!(
            &diff.records[0],
            HiveChange::DeletedKey { path, values }
                if path == "\\HKLM\\SOFTWARE\\Vendor" && values.len() == 2
        ));
    }

    #[test]
    fn type_change_with_same_bytes_is_modified() {
        let old = snapshot(vec![(
            RUN,
            vec![RegistryValue::new("v", ValueType::Binary, vec![1, 0, 0, 0])],
        )]);
        let new = snapshot(vec![(RUN, vec![RegistryValue::dword("v", 1)])]);

        let diff = diff_hives(&old, &new);
        assert!(matches!(
            &diff.records[0],
            HiveChange::ModifiedKey { changes, .. }
                if matches!(changes[0], ValueChange::Modified { .. })
        ));
    }

    #[test]
    fn records_sorted_by_key_then_value_name() {
        let old = snapshot(vec![
            ("\\HKLM\\B", vec![RegistryValue::dword("z", 1), RegistryValue::dword("a", 1)]),
            ("\\HKLM\\C", vec![]),
        ]);
        let new = snapshot(vec![
            ("\\HKLM\\A", vec![]),
            ("\\HKLM\\B", vec![RegistryValue::dword("z", 2), RegistryValue::dword("a", 2)]),
        ]);

        let diff = diff_hives(&old, &new);
        let paths: Vec<&str> = diff.records.iter().map(HiveChange::path).collect();
        assert_eq!(paths, vec!["\\HKLM\\A", "\\HKLM\\B", "\\HKLM\\C"]);
        let HiveChange::ModifiedKey { changes, .. } = &diff.records[1] else {
            panic!("expected modified key");
        };
        let names: Vec<&str> = changes.iter().map(ValueChange::name).collect();
        assert_eq!(names, vec!["a", "z"]);
    }
}
