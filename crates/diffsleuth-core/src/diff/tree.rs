//! Tree differencer -- classifies every path in the union of two indices.
//!
//! Both indices iterate in ascending path order, so a single merge-join pass
//! produces records that are already sorted; no separate sort is needed and
//! the output is identical however the indices were built.
use crate::model::{ContentIndex, Entry, EntryKind};
use std::cmp::Ordering;

/// One classified change between two images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    /// Present only in the new image.
    Created(Entry),
    /// Present only in the old image; original metadata preserved.
    Deleted(Entry),
    /// Present in both with a differing kind, digest, size or link target.
    Modified {
        path: String,
        old: Entry,
        new: Entry,
        /// Either side lacks a digest, so the change could not be confirmed.
        unverifiable: bool,
    },
}

impl ChangeRecord {
    pub fn path(&self) -> &str {
        match self {
            Self::Created(entry) | Self::Deleted(entry) => &entry.path,
            Self::Modified { path, .. } => path,
        }
    }
}

/// Ordered change set for two content indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDiff {
    /// Sorted by path.
    pub records: Vec<ChangeRecord>,
    /// Set if either index is partial.
    pub partial: bool,
}

impl TreeDiff {
    pub fn created(&self) -> impl Iterator<Item = &Entry> {
        self.records.iter().filter_map(|r| match r {
            ChangeRecord::Created(entry) => Some(entry),
            _ => None,
        })
    }

    pub fn deleted(&self) -> impl Iterator<Item = &Entry> {
        self.records.iter().filter_map(|r| match r {
            ChangeRecord::Deleted(entry) => Some(entry),
            _ => None,
        })
    }

    pub fn modified(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r, ChangeRecord::Modified { .. }))
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Classify the differences between `old` and `new`.
pub fn diff_trees(old: &ContentIndex, new: &ContentIndex) -> TreeDiff {
    let mut records = Vec::new();
    let mut old_iter = old.iter().peekable();
    let mut new_iter = new.iter().peekable();

    loop {
        let order = match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(o), Some(n)) => o.path.cmp(&n.path),
        };
        match order {
            Ordering::Less => {
                if let Some(entry) = old_iter.next() {
                    records.push(ChangeRecord::Deleted(entry.clone()));
                }
            }
            Ordering::Greater => {
                if let Some(entry) = new_iter.next() {
                    records.push(ChangeRecord::Created(entry.clone()));
                }
            }
            Ordering::Equal => {
                if let (Some(o), Some(n)) = (old_iter.next(), new_iter.next()) {
                    if let Some(unverifiable) = compare_pair(o, n) {
                        records.push(ChangeRecord::Modified {
                            path: o.path.clone(),
                            old: o.clone(),
                            new: n.clone(),
                            unverifiable,
                        });
                    }
                }
            }
        }
    }

    TreeDiff {
        records,
        partial: old.is_partial() || new.is_partial(),
    }
}

/// `None` if the pair is unchanged, otherwise `Some(unverifiable)`.
fn compare_pair(old: &Entry, new: &Entry) -> Option<bool> {
    // An error placeholder's kind is not real, so only flag the pair.
    if old.is_error() || new.is_error() {
        return Some(true);
    }
    if old.kind != new.kind {
        return Some(false);
    }
    match old.kind {
        EntryKind::Directory => None,
        EntryKind::File => match (&old.content_digest, &new.content_digest) {
            (Some(a), Some(b)) => (a != b || old.size != new.size).then_some(false),
            _ => Some(true),
        },
        EntryKind::Symlink => (old.link_target != new.link_target).then_some(false),
        EntryKind::Special => (old.size != new.size).then_some(false),
    }
}
