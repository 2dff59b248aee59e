//! Path-keyed content index for one guest image.
//!
//! The index is built once by the scanner and is immutable afterwards: there
//! is no public way to insert or remove entries, so it can be shared
//! read-only with the differencer without any locking.
use super::entry::{Diagnostic, Entry, Side};
use std::collections::BTreeMap;

/// Mapping from guest path to [`Entry`], plus the diagnostics gathered while
/// building it.
///
/// Backed by a `BTreeMap` so iteration is always in ascending path order,
/// which makes the diff output reproducible regardless of walk order.
#[derive(Debug, Clone)]
pub struct ContentIndex {
    side: Side,
    entries: BTreeMap<String, Entry>,
    diagnostics: Vec<Diagnostic>,
}

/// Returned by [`ContentIndex::from_entries`] when two entries share a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicatePath(pub String);

impl ContentIndex {
    /// An index with no entries.
    pub fn empty(side: Side) -> Self {
        Self {
            side,
            entries: BTreeMap::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Build an index from finished entries, rejecting duplicate paths.
    pub fn from_entries(
        side: Side,
        entries: impl IntoIterator<Item = Entry>,
    ) -> Result<Self, DuplicatePath> {
        let mut map = BTreeMap::new();
        for entry in entries {
            if map.contains_key(&entry.path) {
                return Err(DuplicatePath(entry.path));
            }
            map.insert(entry.path.clone(), entry);
        }
        Ok(Self {
            side,
            entries: map,
            diagnostics: Vec::new(),
        })
    }

    /// Assemble an index from a map the scanner has already de-duplicated.
    pub(crate) fn from_parts(
        side: Side,
        entries: BTreeMap<String, Entry>,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Self {
        diagnostics.sort();
        Self {
            side,
            entries,
            diagnostics,
        }
    }

    /// Which image this index describes.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Look up an entry by exact path.
    #[inline]
    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    /// Iterate entries in ascending path order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Ordered path-to-entry map.
    pub fn entries(&self) -> &BTreeMap<String, Entry> {
        &self.entries
    }

    /// Problems recorded while building the index, sorted.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// `true` if any part of the tree could not be fully read.
    pub fn is_partial(&self) -> bool {
        !self.diagnostics.is_empty() || self.entries.values().any(Entry::is_error)
    }

    /// Number of regular files that carry a digest.
    pub fn hashed_files(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.content_digest.is_some())
            .count()
    }

    /// Total number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the index contains no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entry::Stage;

    #[test]
    fn from_entries_rejects_duplicates() {
        let result = ContentIndex::from_entries(
            Side::Old,
            vec![Entry::new_file("/a", 1), Entry::new_file("/a", 2)],
        );
        assert_eq!(result.unwrap_err(), DuplicatePath("/a".to_string()));
    }

    #[test]
    fn iteration_is_path_ordered() {
        let index = ContentIndex::from_entries(
            Side::New,
            vec![
                Entry::new_file("/z", 1),
                Entry::new_dir("/a"),
                Entry::new_file("/m", 2),
            ],
        )
        .unwrap();
        let paths: Vec<&str> = index.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/m", "/z"]);
    }

    #[test]
    fn error_entries_make_index_partial() {
        let clean = ContentIndex::from_entries(Side::Old, vec![Entry::new_dir("/a")]).unwrap();
        assert!(!clean.is_partial());

        let broken =
            ContentIndex::from_entries(Side::Old, vec![Entry::new_error("/b", "denied")]).unwrap();
        assert!(broken.is_partial());

        let with_diag = ContentIndex::from_parts(
            Side::Old,
            BTreeMap::new(),
            vec![Diagnostic::new(Some(Side::Old), Stage::Walk, "/x", "too deep")],
        );
        assert!(with_diag.is_partial());
    }
}
