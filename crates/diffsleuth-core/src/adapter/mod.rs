//! Adapter contracts for the external collaborators.
//!
//! Mounting a disk image and parsing hive files are outside this crate. The
//! engine only needs the two capabilities below:
//!
//! - [`GuestAccess`] -- list a guest filesystem tree and stream file content.
//! - [`HiveAccess`] -- open a registry hive and enumerate keys and values.
//!
//! Adapters are single-reader-per-handle unless
//! [`GuestAccess::allows_concurrent_reads`] says otherwise; the scanner
//! honours that by serialising reads through one handle while still running
//! the two images in parallel.
//!
//! Two implementations ship with the crate: [`local::LocalGuest`] for a host
//! directory holding a mounted image, and the in-memory fakes in [`memory`].
pub mod local;
pub mod memory;

use crate::error::{AdapterError, HiveError};
use crate::model::{EntryKind, RegistryValue};
use std::io::Read;

/// One item of a guest listing: `(path, kind, size, link_target)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub link_target: Option<String>,
}

impl RawEntry {
    pub fn new(path: impl Into<String>, kind: EntryKind, size: u64) -> Self {
        Self {
            path: path.into(),
            kind,
            size,
            link_target: None,
        }
    }
}

/// Stream of listing results. Per-item errors do not end the stream.
pub type EntryStream<'a> = Box<dyn Iterator<Item = Result<RawEntry, AdapterError>> + 'a>;

/// Byte stream for one file's content.
pub type ContentStream<'a> = Box<dyn Read + Send + 'a>;

/// Read-only access to one mounted guest filesystem.
pub trait GuestAccess: Send + Sync {
    /// List every entry under `root` (not including `root` itself).
    ///
    /// Returns `Err(AdapterError::NotFound)` if `root` does not exist.
    /// Unreadable subtrees are reported as `Err` items in the stream.
    fn list_entries(&self, root: &str) -> Result<EntryStream<'_>, AdapterError>;

    /// Open the full content of a regular file.
    fn read_content(&self, path: &str) -> Result<ContentStream<'_>, AdapterError>;

    /// `true` if `read_content` may be called from several threads at once.
    fn allows_concurrent_reads(&self) -> bool {
        false
    }

    /// Short description for logs (image path, mount point, ...).
    fn describe(&self) -> String {
        "guest".to_string()
    }
}

/// Opaque handle to an open hive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HiveHandle(pub u64);

/// Read-only access to the registry hives of one guest image.
///
/// Key paths passed to and returned from the adapter are relative to the
/// hive root and use `\` separators; the root itself is the empty string.
pub trait HiveAccess: Send + Sync {
    /// Open a hive by name (its guest path, e.g.
    /// `/Windows/System32/config/SOFTWARE`).
    fn open_hive(&self, name: &str) -> Result<HiveHandle, HiveError>;

    /// Full relative paths of the direct children of `key_path`.
    fn list_keys(&self, handle: HiveHandle, key_path: &str) -> Result<Vec<String>, HiveError>;

    /// Values of `key_path`, in stored order.
    fn list_values(
        &self,
        handle: HiveHandle,
        key_path: &str,
    ) -> Result<Vec<RegistryValue>, HiveError>;

    /// Release a handle. Called exactly once per successful `open_hive`.
    fn close_hive(&self, handle: HiveHandle);
}

/// Scoped hive handle: closes the hive when dropped, on every exit path
/// including early returns on cancellation.
pub struct HiveGuard<'a> {
    access: &'a dyn HiveAccess,
    handle: HiveHandle,
}

impl<'a> HiveGuard<'a> {
    pub fn open(access: &'a dyn HiveAccess, name: &str) -> Result<Self, HiveError> {
        let handle = access.open_hive(name)?;
        Ok(Self { access, handle })
    }

    pub fn handle(&self) -> HiveHandle {
        self.handle
    }

    pub fn list_keys(&self, key_path: &str) -> Result<Vec<String>, HiveError> {
        self.access.list_keys(self.handle, key_path)
    }

    pub fn list_values(&self, key_path: &str) -> Result<Vec<RegistryValue>, HiveError> {
        self.access.list_values(self.handle, key_path)
    }
}

impl Drop for HiveGuard<'_> {
    fn drop(&mut self) {
        self.access.close_hive(self.handle);
    }
}
