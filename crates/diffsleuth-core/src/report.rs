//! Report assembler -- merges the tree and hive diffs into one document.
//!
//! Assembly is a pure function of its inputs. Field order is fixed by the
//! struct declarations below and every list or map is already path ordered,
//! so serialising the same comparison twice yields identical bytes.
use crate::content::Digest;
use crate::diff::{ChangeRecord, HiveChange, HiveDiff, TreeDiff, ValueChange};
use crate::model::{Diagnostic, EntryKind, RegistryValue};
use compact_str::CompactString;
use serde::Serialize;
use std::collections::BTreeMap;

/// A path present only in the new image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedFile {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub digest: Option<Digest>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_signature: Option<String>,
}

/// A path present only in the old image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedFile {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub original_digest: Option<Digest>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_signature: Option<String>,
}

/// A path present in both images whose content or kind changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModifiedFile {
    pub path: String,
    pub old_kind: EntryKind,
    pub new_kind: EntryKind,
    pub old_size: u64,
    pub new_size: u64,
    pub old_digest: Option<Digest>,
    pub new_digest: Option<Digest>,
    /// Type of the new content.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_signature: Option<String>,
    /// One side had no digest; the change is reported conservatively.
    pub unverifiable: bool,
}

/// `[name, type, data]` with data rendered according to its type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueRecord(pub CompactString, pub CompactString, pub serde_json::Value);

impl From<&RegistryValue> for ValueRecord {
    fn from(value: &RegistryValue) -> Self {
        Self(value.name.clone(), value.value_type.name(), value.render())
    }
}

/// Type and rendered data of one side of a modified value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueState {
    #[serde(rename = "type")]
    pub value_type: CompactString,
    pub data: serde_json::Value,
}

impl From<&RegistryValue> for ValueState {
    fn from(value: &RegistryValue) -> Self {
        Self {
            value_type: value.value_type.name(),
            data: value.render(),
        }
    }
}

/// `[name, old, new]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModifiedValue(pub CompactString, pub ValueState, pub ValueState);

/// Registry section of the report. Every map is keyed by full key path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryReport {
    pub created_keys: BTreeMap<String, Vec<ValueRecord>>,
    pub deleted_keys: BTreeMap<String, Vec<ValueRecord>>,
    pub created_values: BTreeMap<String, Vec<ValueRecord>>,
    pub deleted_values: BTreeMap<String, Vec<ValueRecord>>,
    pub modified_values: BTreeMap<String, Vec<ModifiedValue>>,
}

impl RegistryReport {
    pub fn is_empty(&self) -> bool {
        self.created_keys.is_empty()
            && self.deleted_keys.is_empty()
            && self.created_values.is_empty()
            && self.deleted_values.is_empty()
            && self.modified_values.is_empty()
    }
}

/// The complete result of one comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub created_files: Vec<CreatedFile>,
    pub deleted_files: Vec<DeletedFile>,
    pub modified_files: Vec<ModifiedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryReport>,
    /// Some subtree, file or key could not be fully read.
    pub partial: bool,
    /// Every localized problem, sorted.
    pub diagnostics: Vec<Diagnostic>,
}

impl ComparisonReport {
    /// `true` if no file or registry change was found.
    pub fn is_empty(&self) -> bool {
        self.created_files.is_empty()
            && self.deleted_files.is_empty()
            && self.modified_files.is_empty()
            && self.registry.as_ref().is_none_or(RegistryReport::is_empty)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Merge the diffs and diagnostics of one comparison into a report.
pub fn assemble(
    tree: &TreeDiff,
    hive: Option<&HiveDiff>,
    diagnostics: &[Diagnostic],
) -> ComparisonReport {
    let mut created_files = Vec::new();
    let mut deleted_files = Vec::new();
    let mut modified_files = Vec::new();

    for record in &tree.records {
        match record {
            ChangeRecord::Created(entry) => created_files.push(CreatedFile {
                path: entry.path.clone(),
                kind: entry.kind,
                size: entry.size,
                digest: entry.content_digest.clone(),
                type_signature: entry.type_signature.clone(),
            }),
            ChangeRecord::Deleted(entry) => deleted_files.push(DeletedFile {
                path: entry.path.clone(),
                kind: entry.kind,
                size: entry.size,
                original_digest: entry.content_digest.clone(),
                type_signature: entry.type_signature.clone(),
            }),
            ChangeRecord::Modified {
                path,
                old,
                new,
                unverifiable,
            } => modified_files.push(ModifiedFile {
                path: path.clone(),
                old_kind: old.kind,
                new_kind: new.kind,
                old_size: old.size,
                new_size: new.size,
                old_digest: old.content_digest.clone(),
                new_digest: new.content_digest.clone(),
                type_signature: new.type_signature.clone(),
                unverifiable: *unverifiable,
            }),
        }
    }

    let registry = hive.map(registry_section);

    let mut diagnostics = diagnostics.to_vec();
    diagnostics.sort();
    diagnostics.dedup();

    let partial = tree.partial || hive.is_some_and(|h| h.partial) || !diagnostics.is_empty();

    ComparisonReport {
        created_files,
        deleted_files,
        modified_files,
        registry,
        partial,
        diagnostics,
    }
}

fn registry_section(diff: &HiveDiff) -> RegistryReport {
    let mut report = RegistryReport::default();

    for change in &diff.records {
        match change {
            HiveChange::CreatedKey { path, values } => {
                report.created_keys.insert(path.clone(), value_records(values));
            }
            HiveChange::DeletedKey { path, values } => {
                report.deleted_keys.insert(path.clone(), value_records(values));
            }
            HiveChange::ModifiedKey { path, changes } => {
                for change in changes {
                    match change {
                        ValueChange::Created(value) => report
                            .created_values
                            .entry(path.clone())
                            .or_default()
                            .push(value.into()),
                        ValueChange::Deleted(value) => report
                            .deleted_values
                            .entry(path.clone())
                            .or_default()
                            .push(value.into()),
                        ValueChange::Modified { name, old, new } => report
                            .modified_values
                            .entry(path.clone())
                            .or_default()
                            .push(ModifiedValue(name.clone(), old.into(), new.into())),
                    }
                }
            }
        }
    }
    report
}

fn value_records(values: &[RegistryValue]) -> Vec<ValueRecord> {
    values.iter().map(ValueRecord::from).collect()
}
