/// Scanner module -- builds the content index for one guest image.
///
/// Indexing runs in two phases:
/// - **Listing:** the adapter's entry stream is drained on the calling
///   thread into a path-keyed map, enforcing path uniqueness and the depth
///   bound.
/// - **Digesting:** every regular file becomes one [`WorkUnit`] on a
///   [`WorkerPool`], so one slow or stuck read times out on its own without
///   holding up the rest of the tree.
///
/// Unreadable entries stay in the index with `content_digest = None` and an
/// error message; they are never dropped.
pub mod progress;

use crate::adapter::GuestAccess;
use crate::content::{inspect_stream, Digester, Inspection, Sha256Digester, TypeIdentifier};
use crate::error::{AdapterError, CompareError, CompareResult};
use crate::model::{ContentIndex, Diagnostic, Entry, EntryKind, Side, Stage};
use crate::pool::{
    CancelToken, PoolConfig, UnitOutcome, WorkUnit, WorkerPool, CANCEL_POLL_INTERVAL,
};
use parking_lot::{Mutex, MutexGuard};
use progress::{CompareProgress, ProgressSink};
use std::collections::btree_map::Entry as MapEntry;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cancellation is checked once per this many listed entries.
const CANCEL_CHECK_INTERVAL: u64 = 1_000;

/// A listing progress message is sent once per this many entries.
const PROGRESS_INTERVAL: u64 = 5_000;

/// Knobs for one index build.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Guest path to start listing from.
    pub root: String,
    /// Entries with more path components than this are not indexed.
    pub max_depth: usize,
    /// Digest workers, used only when the adapter allows concurrent reads.
    pub workers: usize,
    /// Per-file digest timeout.
    pub file_timeout: Option<Duration>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            root: "/".into(),
            max_depth: 4_096,
            workers: num_cpus::get().max(1),
            file_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Builds a [`ContentIndex`] for one image.
#[derive(Clone)]
pub struct IndexBuilder {
    side: Side,
    guest: Arc<dyn GuestAccess>,
    digester: Arc<dyn Digester>,
    identifier: Option<Arc<dyn TypeIdentifier>>,
    options: ScanOptions,
    progress: ProgressSink,
}

impl IndexBuilder {
    pub fn new(side: Side, guest: Arc<dyn GuestAccess>, options: ScanOptions) -> Self {
        Self {
            side,
            guest,
            digester: Arc::new(Sha256Digester),
            identifier: None,
            options,
            progress: ProgressSink::disabled(),
        }
    }

    pub fn with_digester(mut self, digester: Arc<dyn Digester>) -> Self {
        self.digester = digester;
        self
    }

    /// Attach a type identifier; without one, `type_signature` stays empty.
    pub fn with_identifier(mut self, identifier: Option<Arc<dyn TypeIdentifier>>) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// List and digest the whole tree under the configured root.
    ///
    /// Fails only on contract violations (duplicate paths), a missing root,
    /// an adapter that cannot list at all, or cancellation.
    pub fn build(&self, cancel: &CancelToken) -> CompareResult<ContentIndex> {
        let start = Instant::now();
        info!(
            "Indexing {} image {} from {}",
            self.side,
            self.guest.describe(),
            self.options.root
        );
        self.progress.send(CompareProgress::StageStarted {
            side: Some(self.side),
            stage: Stage::Walk,
        });

        let (mut entries, mut diagnostics) = self.list(cancel)?;
        debug!(
            "{} image: listed {} entries in {:?}",
            self.side,
            entries.len(),
            start.elapsed()
        );

        self.digest_files(&mut entries, &mut diagnostics, cancel)?;

        let index = ContentIndex::from_parts(self.side, entries, diagnostics);
        info!(
            "{} image indexed: {} entries, {} hashed, {} diagnostics in {:?}",
            self.side,
            index.len(),
            index.hashed_files(),
            index.diagnostics().len(),
            start.elapsed()
        );
        Ok(index)
    }

    // ── Listing ─────────────────────────────────────────────────

    fn list(
        &self,
        cancel: &CancelToken,
    ) -> CompareResult<(BTreeMap<String, Entry>, Vec<Diagnostic>)> {
        let side = self.side;
        let root = &self.options.root;

        let stream = self.guest.list_entries(root).map_err(|source| {
            if source.is_not_found() {
                CompareError::RootNotFound {
                    side,
                    root: root.clone(),
                }
            } else {
                CompareError::Adapter {
                    side,
                    stage: Stage::Walk,
                    source,
                }
            }
        })?;

        let mut entries: BTreeMap<String, Entry> = BTreeMap::new();
        let mut diagnostics = Vec::new();
        let mut placeholders: HashSet<String> = HashSet::new();
        let mut counter: u64 = 0;

        for item in stream {
            counter += 1;
            if counter.is_multiple_of(CANCEL_CHECK_INTERVAL) && cancel.is_cancelled() {
                return Err(CompareError::Cancelled);
            }

            let entry = match item {
                Ok(raw) => Entry::new(raw.path, raw.kind, raw.size, raw.link_target),
                Err(err) => {
                    let message = err.to_string();
                    diagnostics.push(Diagnostic::new(
                        Some(side),
                        Stage::Walk,
                        err.path(),
                        message.clone(),
                    ));
                    self.progress.send(CompareProgress::UnitFailed {
                        side: Some(side),
                        stage: Stage::Walk,
                        label: err.path().to_string(),
                        reason: message.clone(),
                    });
                    Entry::new_error(err.path(), message)
                }
            };

            if entry.depth() > self.options.max_depth {
                diagnostics.push(Diagnostic::new(
                    Some(side),
                    Stage::Walk,
                    entry.path.as_str(),
                    format!(
                        "exceeds maximum depth of {} components",
                        self.options.max_depth
                    ),
                ));
                continue;
            }

            if counter.is_multiple_of(PROGRESS_INTERVAL) {
                self.progress.send(CompareProgress::EntriesListed {
                    side,
                    entries: counter,
                    current_path: entry.path.clone(),
                });
            }

            insert_entry(&mut entries, &mut placeholders, entry)
                .map_err(|path| CompareError::DuplicatePath { side, path })?;
        }

        if cancel.is_cancelled() {
            return Err(CompareError::Cancelled);
        }
        Ok((entries, diagnostics))
    }

    // ── Digesting ───────────────────────────────────────────────

    fn digest_files(
        &self,
        entries: &mut BTreeMap<String, Entry>,
        diagnostics: &mut Vec<Diagnostic>,
        cancel: &CancelToken,
    ) -> CompareResult<()> {
        let side = self.side;
        let paths: Vec<String> = entries
            .values()
            .filter(|e| e.kind == EntryKind::File && !e.is_error())
            .map(|e| e.path.clone())
            .collect();
        let total = paths.len() as u64;
        if paths.is_empty() {
            return Ok(());
        }

        self.progress.send(CompareProgress::StageStarted {
            side: Some(side),
            stage: Stage::Digest,
        });

        // One reader per handle unless the adapter says otherwise. The gate
        // also covers an abandoned read still draining after its timeout.
        let concurrent = self.guest.allows_concurrent_reads();
        let gate = (!concurrent).then(|| Arc::new(Mutex::new(())));
        let workers = if concurrent { self.options.workers } else { 1 };

        let pool = WorkerPool::new(PoolConfig {
            workers,
            default_timeout: self.options.file_timeout,
            thread_name: format!("diffsleuth-{side}-digest"),
        });
        debug!("{side} image: digesting {total} files on {workers} workers");

        let units: Vec<WorkUnit<Inspection, AdapterError>> = paths
            .iter()
            .map(|path| self.digest_unit(path.clone(), gate.clone()))
            .collect();

        let reports = pool.run(units, cancel);
        if cancel.is_cancelled() {
            return Err(CompareError::Cancelled);
        }

        let mut hashed: u64 = 0;
        for (path, report) in paths.into_iter().zip(reports) {
            let Some(entry) = entries.get_mut(&path) else {
                continue;
            };
            let (stage, reason) = match report.outcome {
                UnitOutcome::Completed(inspection) => {
                    entry.content_digest = Some(inspection.digest);
                    entry.type_signature = inspection.type_signature;
                    hashed += 1;
                    if hashed.is_multiple_of(CANCEL_CHECK_INTERVAL) {
                        self.progress.send(CompareProgress::FilesHashed { side, hashed, total });
                    }
                    continue;
                }
                UnitOutcome::Failed(err) => (Stage::Digest, err.to_string()),
                other => (Stage::Schedule, other.failure_reason().unwrap_or_default()),
            };

            warn!("{side} image: cannot digest {path}: {reason}");
            self.progress.send(CompareProgress::UnitFailed {
                side: Some(side),
                stage,
                label: path.clone(),
                reason: reason.clone(),
            });
            entry.error = Some(reason.clone());
            diagnostics.push(Diagnostic::new(Some(side), stage, path, reason));
        }

        self.progress
            .send(CompareProgress::FilesHashed { side, hashed, total });
        Ok(())
    }

    fn digest_unit(
        &self,
        path: String,
        gate: Option<Arc<Mutex<()>>>,
    ) -> WorkUnit<Inspection, AdapterError> {
        let guest = self.guest.clone();
        let digester = self.digester.clone();
        let identifier = self.identifier.clone();

        WorkUnit::new(path.clone(), move |token: &CancelToken| {
            let _permit = match &gate {
                Some(gate) => Some(acquire(gate, token).ok_or_else(|| AdapterError::Io {
                    path: path.clone(),
                    source: io::Error::other("read cancelled"),
                })?),
                None => None,
            };
            let stream = guest.read_content(&path)?;
            inspect_stream(stream, digester.as_ref(), identifier.as_deref(), token)
                .map_err(|err| AdapterError::from_io(path.as_str(), err))
        })
    }
}

/// Insert a listed entry, merging listing errors with real entries.
///
/// A listing error and a real entry for the same path collapse into one
/// entry that keeps the error message. Two real entries for the same path
/// are a contract violation and return the path.
fn insert_entry(
    entries: &mut BTreeMap<String, Entry>,
    placeholders: &mut HashSet<String>,
    entry: Entry,
) -> Result<(), String> {
    match entries.entry(entry.path.clone()) {
        MapEntry::Vacant(slot) => {
            if entry.is_error() {
                placeholders.insert(entry.path.clone());
            }
            slot.insert(entry);
            Ok(())
        }
        MapEntry::Occupied(mut slot) => {
            let existing = slot.get_mut();
            if entry.is_error() {
                if existing.error.is_none() {
                    existing.error = entry.error;
                }
                return Ok(());
            }
            if placeholders.remove(&entry.path) {
                let error = existing.error.take();
                *existing = entry;
                existing.error = error;
                return Ok(());
            }
            Err(entry.path)
        }
    }
}

/// Wait for the per-handle read gate, giving up once `token` is cancelled.
fn acquire<'a>(gate: &'a Mutex<()>, token: &CancelToken) -> Option<MutexGuard<'a, ()>> {
    loop {
        if let Some(guard) = gate.try_lock_for(CANCEL_POLL_INTERVAL) {
            return Some(guard);
        }
        if token.is_cancelled() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryGuest;
    use crate::content::sha256;

    fn build(guest: MemoryGuest, options: ScanOptions) -> CompareResult<ContentIndex> {
        IndexBuilder::new(Side::Old, Arc::new(guest), options).build(&CancelToken::new())
    }

    #[test]
    fn files_get_digests_and_dirs_do_not() {
        let guest = MemoryGuest::new()
            .dir("/etc")
            .file("/etc/hosts", "127.0.0.1")
            .symlink("/etc/localtime", "/usr/share/zoneinfo/UTC");
        let index = build(guest, ScanOptions::default()).unwrap();

        assert_eq!(index.len(), 3);
        assert_eq!(
            index.get("/etc/hosts").unwrap().content_digest,
            Some(sha256(b"127.0.0.1"))
        );
        assert!(index.get("/etc").unwrap().content_digest.is_none());
        assert!(index.get("/etc/localtime").unwrap().content_digest.is_none());
        assert!(!index.is_partial());
    }

    #[test]
    fn unreadable_file_is_kept_with_error() {
        let guest = MemoryGuest::new().file("/ok", "x").unreadable("/locked", 5);
        let index = build(guest, ScanOptions::default()).unwrap();

        let locked = index.get("/locked").unwrap();
        assert!(locked.is_unverifiable());
        assert!(locked.is_error());
        assert!(index.is_partial());
        assert_eq!(index.diagnostics().len(), 1);
        assert_eq!(index.diagnostics()[0].stage, Stage::Digest);
    }

    #[test]
    fn duplicate_path_is_fatal() {
        let guest = MemoryGuest::new().file("/a", "1").file("/a", "2");
        let err = build(guest, ScanOptions::default()).unwrap_err();
        assert!(matches!(err, CompareError::DuplicatePath { ref path, .. } if path == "/a"));
    }

    #[test]
    fn listing_error_merges_with_real_directory() {
        let guest = MemoryGuest::new().listing_error("/secret").dir("/secret");
        let index = build(guest, ScanOptions::default()).unwrap();

        assert_eq!(index.len(), 1);
        let secret = index.get("/secret").unwrap();
        assert_eq!(secret.kind, EntryKind::Directory);
        assert!(secret.is_error());
    }

    #[test]
    fn missing_root_is_reported_with_side() {
        let options = ScanOptions {
            root: "/nope".into(),
            ..ScanOptions::default()
        };
        let err = build(MemoryGuest::new(), options).unwrap_err();
        assert!(matches!(err, CompareError::RootNotFound { side: Side::Old, .. }));
    }

    #[test]
    fn entries_beyond_depth_bound_become_diagnostics() {
        let guest = MemoryGuest::new()
            .dir("/a")
            .dir("/a/b")
            .file("/a/b/c", "deep");
        let options = ScanOptions {
            max_depth: 2,
            ..ScanOptions::default()
        };
        let index = build(guest, options).unwrap();

        assert!(index.get("/a/b/c").is_none());
        assert!(index.is_partial());
        assert!(index.diagnostics()[0].message.contains("maximum depth"));
    }

    #[test]
    fn serial_adapter_never_sees_concurrent_reads() {
        let mut guest = MemoryGuest::new().concurrent_reads(false);
        for i in 0..50 {
            guest = guest.file(&format!("/f{i}"), format!("content {i}"));
        }
        let guest = Arc::new(guest);
        let options = ScanOptions {
            workers: 8,
            ..ScanOptions::default()
        };
        let index = IndexBuilder::new(Side::New, guest.clone(), options)
            .build(&CancelToken::new())
            .unwrap();

        assert_eq!(index.hashed_files(), 50);
        assert_eq!(guest.peak_concurrent_reads(), 1);
    }

    #[test]
    fn slow_file_times_out_alone() {
        let guest = MemoryGuest::new()
            .concurrent_reads(true)
            .slow("/slow", "zzz", Duration::from_secs(2))
            .file("/fast", "quick");
        let options = ScanOptions {
            file_timeout: Some(Duration::from_millis(100)),
            ..ScanOptions::default()
        };
        let index = build(guest, options).unwrap();

        assert!(index.get("/slow").unwrap().is_unverifiable());
        assert!(index.get("/fast").unwrap().content_digest.is_some());
        let diag = &index.diagnostics()[0];
        assert_eq!(diag.stage, Stage::Schedule);
        assert!(diag.message.starts_with("timed out"));
    }

    #[test]
    fn cancelled_build_fails() {
        let token = CancelToken::new();
        token.cancel();
        let guest = MemoryGuest::new().file("/a", "1");
        let err = IndexBuilder::new(Side::Old, Arc::new(guest), ScanOptions::default())
            .build(&token)
            .unwrap_err();
        assert!(matches!(err, CompareError::Cancelled));
    }
}
