/// Registry module -- loads hive snapshots through the hive access adapter.
///
/// Each hive is walked iteratively with an explicit stack, so an adversarial
/// or corrupt hive with very deep nesting cannot exhaust the thread stack.
/// Corruption is handled per key: the unreadable subtree is left out of the
/// snapshot and a diagnostic marks the snapshot partial.
pub mod locations;

use crate::adapter::{HiveAccess, HiveGuard};
use crate::error::{CompareError, CompareResult, HiveError};
use crate::model::{Diagnostic, HiveSnapshot, RegistryKey, Side, Stage};
use crate::pool::CancelToken;
use crate::scanner::progress::{CompareProgress, ProgressSink};
use locations::HiveSource;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Loads [`HiveSnapshot`]s for one image.
#[derive(Clone)]
pub struct SnapshotLoader {
    side: Side,
    access: Arc<dyn HiveAccess>,
    max_depth: usize,
    progress: ProgressSink,
}

impl SnapshotLoader {
    pub fn new(side: Side, access: Arc<dyn HiveAccess>, max_depth: usize) -> Self {
        Self {
            side,
            access,
            max_depth,
            progress: ProgressSink::disabled(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Load every hive in `sources` into one snapshot.
    ///
    /// A hive the adapter does not have is simply absent (its keys show up as
    /// created or deleted). Every other hive error becomes a diagnostic. Only
    /// cancellation fails the load.
    pub fn load(
        &self,
        sources: &[HiveSource],
        cancel: &CancelToken,
    ) -> CompareResult<HiveSnapshot> {
        let start = Instant::now();
        self.progress.send(CompareProgress::StageStarted {
            side: Some(self.side),
            stage: Stage::Hive,
        });

        let mut snapshot = HiveSnapshot::new();
        for source in sources {
            if cancel.is_cancelled() {
                return Err(CompareError::Cancelled);
            }
            self.load_hive(source, &mut snapshot, cancel)?;
        }

        let snapshot = snapshot.finish();
        info!(
            "{} image: loaded {} hives, {} keys in {:?}",
            self.side,
            sources.len(),
            snapshot.len(),
            start.elapsed()
        );
        Ok(snapshot)
    }

    fn load_hive(
        &self,
        source: &HiveSource,
        snapshot: &mut HiveSnapshot,
        cancel: &CancelToken,
    ) -> CompareResult<()> {
        let guard = match HiveGuard::open(self.access.as_ref(), &source.path) {
            Ok(guard) => guard,
            Err(err) if err.is_not_found() => {
                debug!("{} image: hive {} not present", self.side, source.path);
                return Ok(());
            }
            Err(err) => {
                self.record(snapshot, &source.root_key, &err);
                return Ok(());
            }
        };

        // (relative key path, depth below the hive root)
        let mut stack: Vec<(String, usize)> = vec![(String::new(), 0)];
        while let Some((relative, depth)) = stack.pop() {
            if cancel.is_cancelled() {
                return Err(CompareError::Cancelled);
            }
            let full = join_key(&source.root_key, &relative);

            // Unreadable values: the key and its subtree are treated as absent.
            let values = match guard.list_values(&relative) {
                Ok(values) => values,
                Err(err) => {
                    self.record(snapshot, &full, &err);
                    continue;
                }
            };

            let mut key = RegistryKey::default();
            for value in values {
                if key.values.contains_key(&value.name) {
                    snapshot.push_diagnostic(Diagnostic::new(
                        Some(self.side),
                        Stage::Hive,
                        full.as_str(),
                        format!("duplicate value name '{}'", value.name),
                    ));
                    continue;
                }
                key.values.insert(value.name.clone(), value);
            }

            if !snapshot.insert_key(full.clone(), key) {
                snapshot.push_diagnostic(Diagnostic::new(
                    Some(self.side),
                    Stage::Hive,
                    full.as_str(),
                    "key listed twice",
                ));
                continue;
            }

            let children = match guard.list_keys(&relative) {
                Ok(children) => children,
                Err(err) => {
                    self.record(snapshot, &full, &err);
                    continue;
                }
            };
            if children.is_empty() {
                continue;
            }
            if depth >= self.max_depth {
                snapshot.push_diagnostic(Diagnostic::new(
                    Some(self.side),
                    Stage::Hive,
                    full.as_str(),
                    format!("subkeys exceed maximum depth of {}", self.max_depth),
                ));
                continue;
            }
            stack.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
        }
        Ok(())
    }

    fn record(&self, snapshot: &mut HiveSnapshot, key: &str, err: &HiveError) {
        warn!("{} image: {err}", self.side);
        self.progress.send(CompareProgress::UnitFailed {
            side: Some(self.side),
            stage: Stage::Hive,
            label: key.to_string(),
            reason: err.to_string(),
        });
        snapshot.push_diagnostic(Diagnostic::new(
            Some(self.side),
            Stage::Hive,
            key,
            err.to_string(),
        ));
    }
}

/// Full key path for a hive-relative path.
fn join_key(root_key: &str, relative: &str) -> String {
    if relative.is_empty() {
        root_key.to_string()
    } else {
        format!("{root_key}\\{relative}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryHive;
    use crate::model::RegistryValue;

    const SOFTWARE: &str = "/Windows/System32/config/SOFTWARE";

    fn software() -> Vec<HiveSource> {
        vec![HiveSource::from_path(SOFTWARE)]
    }

    fn load(hive: Arc<MemoryHive>, max_depth: usize) -> HiveSnapshot {
        SnapshotLoader::new(Side::Old, hive, max_depth)
            .load(&software(), &CancelToken::new())
            .unwrap()
    }

    #[test]
    fn keys_are_mounted_under_root_key() {
        let hive = Arc::new(MemoryHive::new().key(
            SOFTWARE,
            "Microsoft\\Windows\\CurrentVersion\\Run",
            vec![RegistryValue::string("Updater", "C:\\evil.exe")],
        ));
        let snapshot = load(hive.clone(), 512);

        assert_eq!(snapshot.len(), 5);
        let run = snapshot
            .get("\\HKLM\\SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\Run")
            .unwrap();
        assert_eq!(run.values.len(), 1);
        assert!(!snapshot.is_partial());
        assert_eq!(hive.open_handles(), 0);
    }

    #[test]
    fn corrupt_subtree_is_absent_and_partial() {
        let hive = Arc::new(
            MemoryHive::new()
                .key(SOFTWARE, "Good", vec![])
                .key(SOFTWARE, "Bad\\Child", vec![])
                .corrupt_values(SOFTWARE, "Bad"),
        );
        let snapshot = load(hive, 512);

        assert!(snapshot.get("\\HKLM\\SOFTWARE\\Good").is_some());
        assert!(snapshot.get("\\HKLM\\SOFTWARE\\Bad").is_none());
        assert!(snapshot.get("\\HKLM\\SOFTWARE\\Bad\\Child").is_none());
        assert!(snapshot.is_partial());
        assert_eq!(snapshot.diagnostics()[0].path, "\\HKLM\\SOFTWARE\\Bad");
    }

    #[test]
    fn depth_bound_stops_descent() {
        let hive = Arc::new(MemoryHive::new().key(SOFTWARE, "A\\B\\C", vec![]));
        let snapshot = load(hive, 2);

        assert!(snapshot.get("\\HKLM\\SOFTWARE\\A\\B").is_some());
        assert!(snapshot.get("\\HKLM\\SOFTWARE\\A\\B\\C").is_none());
        assert!(snapshot.is_partial());
    }

    #[test]
    fn missing_hive_is_absent_not_partial() {
        let snapshot = load(Arc::new(MemoryHive::new()), 512);
        assert!(snapshot.is_empty());
        assert!(!snapshot.is_partial());
    }

    #[test]
    fn unreadable_hive_is_partial() {
        let hive = Arc::new(MemoryHive::new().unreadable(SOFTWARE));
        let snapshot = load(hive, 512);
        assert!(snapshot.is_empty());
        assert!(snapshot.is_partial());
    }

    #[test]
    fn cancellation_releases_handle() {
        let hive = Arc::new(MemoryHive::new().key(SOFTWARE, "A", vec![]));
        let token = CancelToken::new();
        token.cancel();
        let err = SnapshotLoader::new(Side::New, hive.clone(), 512)
            .load(&software(), &token)
            .unwrap_err();
        assert!(matches!(err, CompareError::Cancelled));
        assert_eq!(hive.open_handles(), 0);
    }
}
