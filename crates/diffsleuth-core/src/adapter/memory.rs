//! In-memory adapters for tests and dry runs.
//!
//! [`MemoryGuest`] and [`MemoryHive`] are built with chained builder calls and
//! support fault injection: unreadable files, slow reads, listing errors,
//! corrupt registry keys. They also count reads and open handles so callers
//! can check the engine's concurrency and cleanup behaviour.
use super::{ContentStream, EntryStream, GuestAccess, HiveAccess, HiveHandle, RawEntry};
use crate::error::{AdapterError, HiveError};
use crate::model::{EntryKind, RegistryValue};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

// ── Guest ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Listed {
    Entry(RawEntry),
    Error(String),
}

#[derive(Debug, Default)]
struct ReadTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

/// A guest filesystem held entirely in memory.
///
/// Entries are listed in insertion order. Adding the same path twice makes
/// the adapter list it twice, which the scanner must reject.
#[derive(Debug, Default)]
pub struct MemoryGuest {
    listing: Vec<Listed>,
    contents: HashMap<String, Vec<u8>>,
    unreadable: HashSet<String>,
    slow: HashMap<String, Duration>,
    listing_delay: Option<Duration>,
    concurrent_reads: bool,
    reads: ReadTracker,
}

impl MemoryGuest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a regular file.
    pub fn file(mut self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        self.listing.push(Listed::Entry(RawEntry::new(
            path,
            EntryKind::File,
            content.len() as u64,
        )));
        self.contents.insert(path.to_string(), content);
        self
    }

    /// Add a directory.
    pub fn dir(mut self, path: &str) -> Self {
        self.listing
            .push(Listed::Entry(RawEntry::new(path, EntryKind::Directory, 0)));
        self
    }

    /// Add a symlink. Its size is the length of the target.
    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut raw = RawEntry::new(path, EntryKind::Symlink, target.len() as u64);
        raw.link_target = Some(target.to_string());
        self.listing.push(Listed::Entry(raw));
        self
    }

    /// Add a device, FIFO or socket.
    pub fn special(mut self, path: &str, size: u64) -> Self {
        self.listing
            .push(Listed::Entry(RawEntry::new(path, EntryKind::Special, size)));
        self
    }

    /// Add a file that is listed but whose content cannot be read.
    pub fn unreadable(mut self, path: &str, size: u64) -> Self {
        self.listing
            .push(Listed::Entry(RawEntry::new(path, EntryKind::File, size)));
        self.unreadable.insert(path.to_string());
        self
    }

    /// Add a file whose first read blocks for `delay`.
    pub fn slow(mut self, path: &str, content: impl Into<Vec<u8>>, delay: Duration) -> Self {
        self = self.file(path, content);
        self.slow.insert(path.to_string(), delay);
        self
    }

    /// Make the listing fail for `path` (a permission error on a directory).
    pub fn listing_error(mut self, path: &str) -> Self {
        self.listing.push(Listed::Error(path.to_string()));
        self
    }

    /// Sleep before yielding each listing item.
    pub fn listing_delay(mut self, delay: Duration) -> Self {
        self.listing_delay = Some(delay);
        self
    }

    pub fn concurrent_reads(mut self, allowed: bool) -> Self {
        self.concurrent_reads = allowed;
        self
    }

    /// Highest number of content streams open at the same time.
    pub fn peak_concurrent_reads(&self) -> usize {
        self.reads.peak.load(Ordering::SeqCst)
    }

    /// Number of `read_content` calls that returned a stream.
    pub fn total_reads(&self) -> usize {
        self.reads.total.load(Ordering::SeqCst)
    }

    fn root_exists(&self, root: &str) -> bool {
        root == "/"
            || self.listing.iter().any(|item| {
                matches!(item, Listed::Entry(raw) if raw.path == root && raw.kind == EntryKind::Directory)
            })
    }
}

fn under_root(path: &str, root: &str) -> bool {
    if root == "/" {
        return path != "/";
    }
    path.strip_prefix(root)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Content stream that keeps the read tracker up to date.
struct TrackedReader<'a> {
    inner: io::Cursor<&'a [u8]>,
    delay: Option<Duration>,
    tracker: &'a ReadTracker,
}

impl Read for TrackedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(delay) = self.delay.take() {
            thread::sleep(delay);
        }
        self.inner.read(buf)
    }
}

impl Drop for TrackedReader<'_> {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GuestAccess for MemoryGuest {
    fn list_entries(&self, root: &str) -> Result<EntryStream<'_>, AdapterError> {
        if !self.root_exists(root) {
            return Err(AdapterError::NotFound {
                path: root.to_string(),
            });
        }
        let root = root.to_string();
        let delay = self.listing_delay;

        Ok(Box::new(self.listing.iter().filter_map(move |item| {
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            match item {
                Listed::Entry(raw) if under_root(&raw.path, &root) => Some(Ok(raw.clone())),
                Listed::Error(path) if under_root(path, &root) => {
                    Some(Err(AdapterError::PermissionDenied { path: path.clone() }))
                }
                _ => None,
            }
        })))
    }

    fn read_content(&self, path: &str) -> Result<ContentStream<'_>, AdapterError> {
        if self.unreadable.contains(path) {
            return Err(AdapterError::PermissionDenied {
                path: path.to_string(),
            });
        }
        let content = self.contents.get(path).ok_or_else(|| AdapterError::NotFound {
            path: path.to_string(),
        })?;

        let active = self.reads.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.reads.peak.fetch_max(active, Ordering::SeqCst);
        self.reads.total.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(TrackedReader {
            inner: io::Cursor::new(content.as_slice()),
            delay: self.slow.get(path).copied(),
            tracker: &self.reads,
        }))
    }

    fn allows_concurrent_reads(&self) -> bool {
        self.concurrent_reads
    }

    fn describe(&self) -> String {
        format!("memory guest ({} items)", self.listing.len())
    }
}

// ── Hives ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryHiveData {
    /// Relative key path (root is `""`) to its values.
    keys: BTreeMap<String, Vec<RegistryValue>>,
    corrupt_subkeys: HashSet<String>,
    corrupt_values: HashSet<String>,
    unreadable: bool,
}

fn parent_key(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rfind('\\').map_or("", |pos| &path[..pos]))
}

/// Registry hives held in memory, addressed by their guest path.
#[derive(Debug, Default)]
pub struct MemoryHive {
    hives: HashMap<String, MemoryHiveData>,
    open: Mutex<HashMap<u64, String>>,
    next_handle: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl MemoryHive {
    pub fn new() -> Self {
        Self::default()
    }

    fn hive_mut(&mut self, hive: &str) -> &mut MemoryHiveData {
        let data = self.hives.entry(hive.to_string()).or_default();
        data.keys.entry(String::new()).or_default();
        data
    }

    /// Add an empty hive.
    pub fn hive(mut self, hive: &str) -> Self {
        self.hive_mut(hive);
        self
    }

    /// Add a key (and any missing ancestors) with the given values.
    pub fn key(mut self, hive: &str, path: &str, values: Vec<RegistryValue>) -> Self {
        let data = self.hive_mut(hive);
        let mut ancestor = parent_key(path);
        while let Some(parent) = ancestor {
            data.keys.entry(parent.to_string()).or_default();
            ancestor = parent_key(parent);
        }
        data.keys.insert(path.to_string(), values);
        self
    }

    /// Make enumerating the subkeys of `path` fail.
    pub fn corrupt_subkeys(mut self, hive: &str, path: &str) -> Self {
        self.hive_mut(hive).corrupt_subkeys.insert(path.to_string());
        self
    }

    /// Make reading the values of `path` fail.
    pub fn corrupt_values(mut self, hive: &str, path: &str) -> Self {
        self.hive_mut(hive).corrupt_values.insert(path.to_string());
        self
    }

    /// Make opening `hive` fail with an I/O error.
    pub fn unreadable(mut self, hive: &str) -> Self {
        self.hive_mut(hive).unreadable = true;
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.open.lock().len()
    }

    fn resolve(&self, handle: HiveHandle) -> Result<(&str, &MemoryHiveData), HiveError> {
        let name = self
            .open
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or(HiveError::InvalidHandle(handle.0))?;
        self.hives
            .get_key_value(&name)
            .map(|(name, data)| (name.as_str(), data))
            .ok_or(HiveError::InvalidHandle(handle.0))
    }
}

impl HiveAccess for MemoryHive {
    fn open_hive(&self, name: &str) -> Result<HiveHandle, HiveError> {
        let data = self.hives.get(name).ok_or_else(|| HiveError::NotFound {
            hive: name.to_string(),
        })?;
        if data.unreadable {
            return Err(HiveError::Io {
                hive: name.to_string(),
                detail: "bad sector".into(),
            });
        }
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.open.lock().insert(id, name.to_string());
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(HiveHandle(id))
    }

    fn list_keys(&self, handle: HiveHandle, key_path: &str) -> Result<Vec<String>, HiveError> {
        let (name, data) = self.resolve(handle)?;
        if data.corrupt_subkeys.contains(key_path) || !data.keys.contains_key(key_path) {
            return Err(HiveError::Corrupt {
                hive: name.to_string(),
                key: key_path.to_string(),
                detail: "bad subkey list".into(),
            });
        }
        Ok(data
            .keys
            .keys()
            .filter(|path| parent_key(path) == Some(key_path))
            .cloned()
            .collect())
    }

    fn list_values(
        &self,
        handle: HiveHandle,
        key_path: &str,
    ) -> Result<Vec<RegistryValue>, HiveError> {
        let (name, data) = self.resolve(handle)?;
        match data.keys.get(key_path) {
            Some(values) if !data.corrupt_values.contains(key_path) => Ok(values.clone()),
            _ => Err(HiveError::Corrupt {
                hive: name.to_string(),
                key: key_path.to_string(),
                detail: "bad value list".into(),
            }),
        }
    }

    fn close_hive(&self, handle: HiveHandle) {
        if self.open.lock().remove(&handle.0).is_some() {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
