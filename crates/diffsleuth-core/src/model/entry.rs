//! A single filesystem object as seen through a guest adapter.
//!
//! Entries are keyed by their full guest path inside a [`ContentIndex`]
//! (see [`super::index`]). Only regular files carry a content digest; the
//! digest is absent for directories, symlinks, special files and for files
//! whose content could not be read.
use crate::content::Digest;
use serde::Serialize;
use std::fmt;

/// What kind of filesystem object an entry is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Devices, FIFOs, sockets and anything else the adapter cannot classify.
    Special,
}

impl EntryKind {
    /// Short label used in logs and diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Symlink => "symlink",
            Self::Special => "special",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One filesystem object in a content index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    /// Absolute guest path, compared byte-exactly.
    pub path: String,
    pub kind: EntryKind,
    /// Logical size in bytes as reported by the adapter.
    pub size: u64,
    /// Digest of the full byte stream. Present only for readable regular files.
    pub content_digest: Option<Digest>,
    /// Human-readable type string from the type identifier, if requested.
    pub type_signature: Option<String>,
    /// Target of a symlink, verbatim.
    pub link_target: Option<String>,
    /// Set when the entry (or its content) could not be read.
    /// The entry stays in the index so the diff can flag it instead of
    /// silently dropping it.
    pub error: Option<String>,
}

impl Entry {
    /// Create a regular file entry with no digest yet.
    pub fn new_file(path: impl Into<String>, size: u64) -> Self {
        Self::new(path, EntryKind::File, size, None)
    }

    /// Create a directory entry.
    pub fn new_dir(path: impl Into<String>) -> Self {
        Self::new(path, EntryKind::Directory, 0, None)
    }

    /// Create a symlink entry pointing at `target`.
    pub fn new_symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        let target = target.into();
        let size = target.len() as u64;
        Self::new(path, EntryKind::Symlink, size, Some(target))
    }

    /// Create an entry of arbitrary kind.
    pub fn new(
        path: impl Into<String>,
        kind: EntryKind,
        size: u64,
        link_target: Option<String>,
    ) -> Self {
        Self {
            path: path.into(),
            kind,
            size,
            content_digest: None,
            type_signature: None,
            link_target,
            error: None,
        }
    }

    /// Create an error placeholder for a path the adapter failed to list.
    ///
    /// Listing failures almost always come from directory reads, so the
    /// placeholder is recorded as a directory.
    pub fn new_error(path: impl Into<String>, message: impl Into<String>) -> Self {
        let mut entry = Self::new(path, EntryKind::Directory, 0, None);
        entry.error = Some(message.into());
        entry
    }

    /// Attach a digest, consuming and returning the entry.
    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.content_digest = Some(digest);
        self
    }

    /// `true` for a regular file whose content digest is missing.
    pub fn is_unverifiable(&self) -> bool {
        self.kind == EntryKind::File && self.content_digest.is_none()
    }

    /// `true` if the adapter reported an error for this entry.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Number of path components, used for the traversal depth bound.
    pub fn depth(&self) -> usize {
        path_depth(&self.path)
    }
}

/// Count non-empty components of a guest path. Both `/` and `\` separate.
pub fn path_depth(path: &str) -> usize {
    path.split(['/', '\\']).filter(|c| !c.is_empty()).count()
}

/// Which of the two compared images something belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Old,
    New,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Old => "old",
            Self::New => "new",
        })
    }
}

/// Pipeline stage a diagnostic or error originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Listing the guest tree.
    Walk,
    /// Reading and digesting file content.
    Digest,
    /// Loading a registry hive snapshot.
    Hive,
    /// Scheduling (pool-level failures such as timeouts or panics).
    Schedule,
    /// Differencing and report assembly.
    Diff,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Walk => "walk",
            Self::Digest => "digest",
            Self::Hive => "hive",
            Self::Schedule => "schedule",
            Self::Diff => "diff",
        })
    }
}

/// A localized, non-fatal problem recorded during a comparison.
///
/// Any diagnostic makes the final report `partial`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Diagnostic {
    pub side: Option<Side>,
    pub stage: Stage,
    /// Guest path, hive key path or unit label the problem relates to.
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(
        side: Option<Side>,
        stage: Stage,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            side,
            stage,
            path: path.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_ignores_empty_components() {
        assert_eq!(path_depth("/"), 0);
        assert_eq!(path_depth("/a/b/c"), 3);
        assert_eq!(path_depth("C:\\Windows\\System32"), 3);
        assert_eq!(path_depth("//a//b/"), 2);
    }

    #[test]
    fn unreadable_file_is_unverifiable() {
        let file = Entry::new_file("/a", 10);
        assert!(file.is_unverifiable());

        let dir = Entry::new_dir("/d");
        assert!(!dir.is_unverifiable(), "directories never carry digests");
    }

    #[test]
    fn error_placeholder_is_a_directory() {
        let entry = Entry::new_error("/locked", "permission denied");
        assert_eq!(entry.kind, EntryKind::Directory);
        assert!(entry.is_error());
    }
}
