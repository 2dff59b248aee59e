//! Guest adapter over a host directory -- typically a read-only mount of a
//! guest disk image.
//!
//! Listing uses `jwalk`'s rayon-backed parallel traversal. Links are never
//! followed, so a symlink cycle inside the image cannot make the walk loop;
//! each symlink is reported once with its target.
//!
//! Guest paths are the host paths relative to the mount base, rendered with
//! `/` separators and a leading `/`. Name bytes that are not valid UTF-8, and
//! literal backslashes, are written as `\xNN` escapes so every host name maps
//! to exactly one guest path and back.
use super::{ContentStream, EntryStream, GuestAccess, RawEntry};
use crate::error::AdapterError;
use crate::model::EntryKind;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Exposes a host directory through the guest access contract.
#[derive(Debug, Clone)]
pub struct LocalGuest {
    base: PathBuf,
    threads: usize,
}

impl LocalGuest {
    /// Adapter rooted at `base`, walking with one thread per CPU.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            threads: num_cpus::get().max(1),
        }
    }

    /// Override the number of walker threads.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve a guest path under the mount base. `..` components are
    /// dropped so a guest path can never escape the base.
    fn host_path(&self, guest: &str) -> PathBuf {
        let mut host = self.base.clone();
        for part in guest.split('/').flat_map(decode_segment) {
            if part.is_empty() || part == "." || part == ".." {
                continue;
            }
            host.push(part);
        }
        host
    }

    /// Render a host path below the base as a guest path.
    fn guest_path(&self, host: &Path) -> Option<String> {
        let relative = host.strip_prefix(&self.base).ok()?;
        let mut guest = String::new();
        for component in relative.components() {
            if let Component::Normal(part) = component {
                guest.push('/');
                encode_name(part, &mut guest);
            }
        }
        if guest.is_empty() {
            guest.push('/');
        }
        Some(guest)
    }

    fn convert(
        &self,
        item: Result<jwalk::DirEntry<((), ())>, jwalk::Error>,
    ) -> Option<Result<RawEntry, AdapterError>> {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                // jwalk errors are typically unreadable directories.
                let guest = err
                    .path()
                    .and_then(|p| self.guest_path(p))
                    .unwrap_or_else(|| "/".to_string());
                let io_err: io::Error = err.into();
                return Some(Err(AdapterError::from_io(guest, io_err)));
            }
        };

        // The walk root itself is not part of the listing.
        if entry.depth == 0 {
            return None;
        }

        let path = entry.path();
        let guest = self.guest_path(&path)?;
        let file_type = entry.file_type();

        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Special
        };

        // A failed stat leaves size at zero; the later content read reports
        // the real error against the entry.
        let size = match kind {
            EntryKind::Directory => 0,
            _ => fs::symlink_metadata(&path).map(|m| m.len()).unwrap_or(0),
        };

        let link_target = if kind == EntryKind::Symlink {
            match fs::read_link(&path) {
                Ok(target) => {
                    let mut rendered = String::new();
                    encode_name(target.as_os_str(), &mut rendered);
                    Some(rendered)
                }
                Err(err) => return Some(Err(AdapterError::from_io(guest, err))),
            }
        } else {
            None
        };

        Some(Ok(RawEntry {
            path: guest,
            kind,
            size,
            link_target,
        }))
    }
}

impl GuestAccess for LocalGuest {
    fn list_entries(&self, root: &str) -> Result<EntryStream<'_>, AdapterError> {
        let host_root = self.host_path(root);
        let meta = fs::symlink_metadata(&host_root).map_err(|e| AdapterError::from_io(root, e))?;
        if !meta.is_dir() {
            return Err(AdapterError::Corrupt {
                path: root.to_string(),
                detail: "listing root is not a directory".into(),
            });
        }

        debug!("Listing {} with {} walker threads", host_root.display(), self.threads);

        let walker = jwalk::WalkDir::new(&host_root)
            .skip_hidden(false)
            .follow_links(false)
            .parallelism(jwalk::Parallelism::RayonNewPool(self.threads));

        Ok(Box::new(
            walker.into_iter().filter_map(move |item| self.convert(item)),
        ))
    }

    fn read_content(&self, path: &str) -> Result<ContentStream<'_>, AdapterError> {
        let host = self.host_path(path);
        let file = fs::File::open(&host).map_err(|e| AdapterError::from_io(path, e))?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn allows_concurrent_reads(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        self.base.display().to_string()
    }
}

// ── Name encoding ───────────────────────────────────────────────────────────

/// Append `name` to `out`, escaping invalid UTF-8 bytes and backslashes.
#[cfg(unix)]
fn encode_name(name: &OsStr, out: &mut String) {
    use std::os::unix::ffi::OsStrExt;

    for chunk in name.as_bytes().utf8_chunks() {
        push_escaped(chunk.valid(), out);
        for byte in chunk.invalid() {
            out.push_str(&format!("\\x{byte:02x}"));
        }
    }
}

#[cfg(not(unix))]
fn encode_name(name: &OsStr, out: &mut String) {
    push_escaped(&name.to_string_lossy(), out);
}

fn push_escaped(valid: &str, out: &mut String) {
    for c in valid.chars() {
        if c == '\\' {
            out.push_str("\\x5c");
        } else {
            out.push(c);
        }
    }
}

/// Decode one `/`-separated guest segment into host name components.
///
/// `\xNN` turns back into the raw byte. Any other backslash separates
/// components, so Windows-style guest paths still resolve.
fn decode_segment(segment: &str) -> Vec<OsString> {
    let bytes = segment.as_bytes();
    let mut parts = Vec::new();
    let mut current = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(byte) = escaped_byte(&bytes[i + 1..]) {
                current.push(byte);
                i += 4;
                continue;
            }
            parts.push(bytes_to_os(std::mem::take(&mut current)));
            i += 1;
            continue;
        }
        current.push(bytes[i]);
        i += 1;
    }
    parts.push(bytes_to_os(current));
    parts
}

/// Parse the `xNN` tail of an escape.
fn escaped_byte(rest: &[u8]) -> Option<u8> {
    match rest {
        [b'x', hi, lo, ..] if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
            let hex = [*hi, *lo];
            u8::from_str_radix(std::str::from_utf8(&hex).ok()?, 16).ok()
        }
        _ => None,
    }
}

#[cfg(unix)]
fn bytes_to_os(bytes: Vec<u8>) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(bytes)
}

#[cfg(not(unix))]
fn bytes_to_os(bytes: Vec<u8>) -> OsString {
    OsString::from(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn guest_paths_are_rooted_and_slash_separated() {
        let guest = LocalGuest::new("/mnt/image");
        let host = Path::new("/mnt/image/Windows/System32/cmd.exe");
        assert_eq!(
            guest.guest_path(host).as_deref(),
            Some("/Windows/System32/cmd.exe")
        );
        assert_eq!(guest.guest_path(Path::new("/mnt/image")).as_deref(), Some("/"));
        assert_eq!(guest.guest_path(Path::new("/elsewhere")), None);
    }

    #[test]
    fn host_path_cannot_escape_base() {
        let guest = LocalGuest::new("/mnt/image");
        assert_eq!(
            guest.host_path("/../../etc/passwd"),
            PathBuf::from("/mnt/image/etc/passwd")
        );
        assert_eq!(
            guest.host_path("\\Windows\\win.ini"),
            PathBuf::from("/mnt/image/Windows/win.ini")
        );
    }

    #[test]
    fn lists_and_reads_a_real_tree() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        fs::write(tmp.path().join("etc/hosts"), b"127.0.0.1 localhost\n").unwrap();

        let guest = LocalGuest::new(tmp.path()).with_threads(2);
        let mut entries: Vec<RawEntry> = guest
            .list_entries("/")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/etc");
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[1].path, "/etc/hosts");
        assert_eq!(entries[1].kind, EntryKind::File);
        assert_eq!(entries[1].size, 20);

        let mut content = String::new();
        guest
            .read_content("/etc/hosts")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "127.0.0.1 localhost\n");
    }

    #[cfg(unix)]
    #[test]
    fn literal_backslash_round_trips() {
        let guest = LocalGuest::new("/mnt/image");
        let host = Path::new("/mnt/image/dir/a\\xff");
        let rendered = guest.guest_path(host).unwrap();
        assert_eq!(rendered, "/dir/a\\x5cxff");
        assert_eq!(guest.host_path(&rendered), host);
    }

    #[cfg(unix)]
    #[test]
    fn invalid_utf8_names_are_escaped_losslessly() {
        use std::os::unix::ffi::OsStrExt;

        let guest = LocalGuest::new("/mnt/image");
        let ff = Path::new("/mnt/image").join(OsStr::from_bytes(b"a\xff"));
        let fe = Path::new("/mnt/image").join(OsStr::from_bytes(b"a\xfe"));

        let ff_guest = guest.guest_path(&ff).unwrap();
        let fe_guest = guest.guest_path(&fe).unwrap();
        assert_eq!(ff_guest, "/a\\xff");
        assert_eq!(fe_guest, "/a\\xfe");
        assert_eq!(guest.host_path(&ff_guest), ff);
        assert_eq!(guest.host_path(&fe_guest), fe);
    }

    #[test]
    fn missing_root_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let guest = LocalGuest::new(tmp.path());
        let err = guest.list_entries("/does/not/exist").err().unwrap();
        assert!(err.is_not_found());
    }
}
