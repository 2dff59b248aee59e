//! Comparison orchestrator -- runs both image walks (and optionally both hive
//! loads) as top-level units on a [`WorkerPool`], then diffs and assembles.
//!
//! Stage layout:
//!
//! 1. `walk old` and `walk new` run concurrently. With explicit hive paths
//!    configured, `hive old` and `hive new` join them in the same run.
//! 2. Without explicit hive paths, hives are discovered in the finished
//!    indices and loaded in a second run.
//! 3. Tree diff, hive diff and report assembly run on the calling thread.
//!
//! A walk that fails, panics or times out aborts the comparison. A hive unit
//! that does so only drops the registry section to an empty, partial one.
use crate::adapter::{GuestAccess, HiveAccess};
use crate::config::CompareConfig;
use crate::content::{Digester, MagicIdentifier, Sha256Digester, TypeIdentifier};
use crate::diff::{diff_hives, diff_trees, HiveDiff};
use crate::error::{CompareError, CompareResult};
use crate::model::{ContentIndex, Diagnostic, HiveSnapshot, Side, Stage};
use crate::pool::{CancelToken, UnitOutcome, UnitReport, WorkUnit, WorkerPool};
use crate::registry::locations::{plan_hives, HiveSource};
use crate::registry::SnapshotLoader;
use crate::report::{assemble, ComparisonReport};
use crate::scanner::progress::{CompareProgress, ProgressSink};
use crate::scanner::IndexBuilder;
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The adapters for one image.
#[derive(Clone)]
pub struct ImageSources {
    pub guest: Arc<dyn GuestAccess>,
    /// Required only when registry comparison is enabled.
    pub hives: Option<Arc<dyn HiveAccess>>,
}

impl ImageSources {
    pub fn new(guest: Arc<dyn GuestAccess>) -> Self {
        Self { guest, hives: None }
    }

    pub fn with_hives(mut self, hives: Arc<dyn HiveAccess>) -> Self {
        self.hives = Some(hives);
        self
    }
}

/// Counters for one finished comparison.
#[derive(Debug, Clone)]
pub struct CompareStats {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub old_entries: usize,
    pub new_entries: usize,
    pub hashed_files: usize,
    pub hives_loaded: usize,
    /// Hives left out because their file digest was unchanged.
    pub hives_skipped: usize,
}

/// Report plus run statistics.
#[derive(Debug, Clone)]
pub struct CompareOutcome {
    pub report: ComparisonReport,
    pub stats: CompareStats,
}

/// What a top-level unit produced.
enum StageOutput {
    Index(ContentIndex),
    Snapshot(HiveSnapshot),
}

type StageReport = UnitReport<StageOutput, CompareError>;

/// First fatal error raised inside a unit. Stored before the run token is
/// cancelled so the supervisor cannot report the unit as merely cancelled.
type FatalSlot = Arc<Mutex<Option<CompareError>>>;

/// Compares two images.
///
/// The comparator holds no per-run state; every [`Comparator::compare`] call
/// builds fresh indices and snapshots. Cancelling it aborts the running
/// comparison and every later one.
pub struct Comparator {
    config: CompareConfig,
    digester: Arc<dyn Digester>,
    identifier: Arc<dyn TypeIdentifier>,
    progress: ProgressSink,
    cancel: CancelToken,
}

impl Comparator {
    /// Create a comparator. Fails if `config` does not validate.
    pub fn new(config: CompareConfig) -> CompareResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            digester: Arc::new(Sha256Digester),
            identifier: Arc::new(MagicIdentifier),
            progress: ProgressSink::disabled(),
            cancel: CancelToken::new(),
        })
    }

    pub fn with_digester(mut self, digester: Arc<dyn Digester>) -> Self {
        self.digester = digester;
        self
    }

    /// Replace the type identifier. It only runs when `identify` is set.
    pub fn with_identifier(mut self, identifier: Arc<dyn TypeIdentifier>) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_progress(mut self, tx: Sender<CompareProgress>) -> Self {
        self.progress = ProgressSink::new(tx);
        self
    }

    pub fn config(&self) -> &CompareConfig {
        &self.config
    }

    /// Token that aborts this comparator's runs when cancelled from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Compare `old` against `new`.
    ///
    /// Returns a complete report (possibly `partial`) or one fatal error.
    pub fn compare(&self, old: &ImageSources, new: &ImageSources) -> CompareResult<CompareOutcome> {
        let started_at = Utc::now();
        let start = Instant::now();
        let registry = &self.config.registry;

        let hive_adapters = if registry.enabled {
            Some((hive_access(old, Side::Old)?, hive_access(new, Side::New)?))
        } else {
            None
        };

        info!(
            "Comparing {} against {} (registry: {})",
            old.guest.describe(),
            new.guest.describe(),
            if registry.enabled { "on" } else { "off" }
        );

        // Fatal errors cancel this run only, never the comparator itself.
        let run = self.cancel.child();
        let fatal: FatalSlot = Arc::new(Mutex::new(None));
        let mut diagnostics: Vec<Diagnostic> = Vec::new();

        let explicit: Option<Vec<HiveSource>> = (registry.enabled && !registry.hives.is_empty())
            .then(|| registry.hives.iter().map(|p| HiveSource::from_path(p)).collect());

        let mut units = vec![
            self.walk_unit(Side::Old, old.guest.clone(), &fatal, &run),
            self.walk_unit(Side::New, new.guest.clone(), &fatal, &run),
        ];
        if let (Some(sources), Some((old_hives, new_hives))) = (&explicit, &hive_adapters) {
            units.push(self.hive_unit(Side::Old, old_hives.clone(), sources.clone()));
            units.push(self.hive_unit(Side::New, new_hives.clone(), sources.clone()));
        }

        let mut reports = self.run_stage(units, &run, &fatal)?.into_iter();
        let old_index = take_index(reports.next(), Side::Old)?;
        let new_index = take_index(reports.next(), Side::New)?;

        let mut hives_skipped = 0;
        let mut hives_loaded = 0;
        let mut snapshots: Option<(Option<HiveSnapshot>, Option<HiveSnapshot>)> = None;

        if let Some((old_hives, new_hives)) = &hive_adapters {
            match &explicit {
                Some(sources) => {
                    hives_loaded = sources.len() * 2;
                    let old_snap = self.take_snapshot(reports.next(), Side::Old, &mut diagnostics);
                    let new_snap = self.take_snapshot(reports.next(), Side::New, &mut diagnostics);
                    snapshots = Some((old_snap, new_snap));
                }
                None => {
                    let plan = plan_hives(&old_index, &new_index, registry.skip_unchanged);
                    hives_skipped = plan.unchanged.len();
                    hives_loaded = plan.old.len() + plan.new.len();
                    info!(
                        "Hive plan: {} old, {} new, {} unchanged",
                        plan.old.len(),
                        plan.new.len(),
                        hives_skipped
                    );
                    let units = vec![
                        self.hive_unit(Side::Old, old_hives.clone(), plan.old),
                        self.hive_unit(Side::New, new_hives.clone(), plan.new),
                    ];
                    let mut reports = self.run_stage(units, &run, &fatal)?.into_iter();
                    let old_snap = self.take_snapshot(reports.next(), Side::Old, &mut diagnostics);
                    let new_snap = self.take_snapshot(reports.next(), Side::New, &mut diagnostics);
                    snapshots = Some((old_snap, new_snap));
                }
            }
        }

        self.progress.send(CompareProgress::StageStarted {
            side: None,
            stage: Stage::Diff,
        });

        diagnostics.extend_from_slice(old_index.diagnostics());
        diagnostics.extend_from_slice(new_index.diagnostics());

        let tree = diff_trees(&old_index, &new_index);
        let hive = snapshots.map(|pair| match pair {
            (Some(old_snap), Some(new_snap)) => {
                diagnostics.extend_from_slice(old_snap.diagnostics());
                diagnostics.extend_from_slice(new_snap.diagnostics());
                diff_hives(&old_snap, &new_snap)
            }
            // One side is missing entirely; diffing would invent changes.
            (old_snap, new_snap) => {
                for snap in [old_snap, new_snap].into_iter().flatten() {
                    diagnostics.extend_from_slice(snap.diagnostics());
                }
                HiveDiff {
                    records: Vec::new(),
                    partial: true,
                }
            }
        });
        let report = assemble(&tree, hive.as_ref(), &diagnostics);

        let elapsed = start.elapsed();
        self.progress.send(CompareProgress::Complete {
            duration: elapsed,
            partial: report.partial,
        });
        info!(
            "Comparison complete: {} created, {} deleted, {} modified files{} in {:?}",
            report.created_files.len(),
            report.deleted_files.len(),
            report.modified_files.len(),
            if report.partial { " (partial)" } else { "" },
            elapsed
        );

        let stats = CompareStats {
            started_at,
            elapsed,
            old_entries: old_index.len(),
            new_entries: new_index.len(),
            hashed_files: old_index.hashed_files() + new_index.hashed_files(),
            hives_loaded,
            hives_skipped,
        };
        Ok(CompareOutcome { report, stats })
    }

    // ── Units ───────────────────────────────────────────────────

    fn walk_unit(
        &self,
        side: Side,
        guest: Arc<dyn GuestAccess>,
        fatal: &FatalSlot,
        run: &CancelToken,
    ) -> WorkUnit<StageOutput, CompareError> {
        let identifier = self.config.identify.then(|| self.identifier.clone());
        let builder = IndexBuilder::new(side, guest, self.config.scan_options())
            .with_digester(self.digester.clone())
            .with_identifier(identifier)
            .with_progress(self.progress.clone());
        let fatal = fatal.clone();
        let run = run.clone();

        WorkUnit::new(format!("walk {side}"), move |token: &CancelToken| {
            match builder.build(token) {
                Ok(index) => Ok(StageOutput::Index(index)),
                Err(CompareError::Cancelled) => Err(CompareError::Cancelled),
                Err(err) => {
                    warn!("{side} image walk failed: {err}");
                    let mut slot = fatal.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    drop(slot);
                    // The sibling walk cannot produce a usable report now.
                    run.cancel();
                    Err(CompareError::Cancelled)
                }
            }
        })
        .with_timeout(self.config.walk_timeout())
    }

    fn hive_unit(
        &self,
        side: Side,
        access: Arc<dyn HiveAccess>,
        sources: Vec<HiveSource>,
    ) -> WorkUnit<StageOutput, CompareError> {
        let loader = SnapshotLoader::new(side, access, self.config.registry.max_depth)
            .with_progress(self.progress.clone());
        WorkUnit::new(format!("hive {side}"), move |token: &CancelToken| {
            loader.load(&sources, token).map(StageOutput::Snapshot)
        })
        .with_timeout(self.config.registry.timeout())
    }

    /// Run one batch of top-level units and surface fatal errors and aborts.
    fn run_stage(
        &self,
        units: Vec<WorkUnit<StageOutput, CompareError>>,
        run: &CancelToken,
        fatal: &FatalSlot,
    ) -> CompareResult<Vec<StageReport>> {
        let pool = WorkerPool::new(self.config.stage_pool());
        debug!("Stage run: {} units", units.len());
        let reports = pool.run(units, run);

        if let Some(err) = fatal.lock().take() {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            info!("Comparison cancelled");
            self.progress.send(CompareProgress::Cancelled);
            return Err(CompareError::Cancelled);
        }
        Ok(reports)
    }

    /// Snapshot from a hive unit. A failed unit becomes a diagnostic.
    fn take_snapshot(
        &self,
        report: Option<StageReport>,
        side: Side,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<HiveSnapshot> {
        let (label, reason) = match report {
            Some(UnitReport {
                outcome: UnitOutcome::Completed(StageOutput::Snapshot(snapshot)),
                ..
            }) => return Some(snapshot),
            Some(report) => {
                let reason = report
                    .outcome
                    .failure_reason()
                    .unwrap_or_else(|| "unexpected stage output".into());
                (report.label, reason)
            }
            None => (format!("hive {side}"), "no report for unit".to_string()),
        };

        warn!("{side} image: {label} did not complete: {reason}");
        self.progress.send(CompareProgress::UnitFailed {
            side: Some(side),
            stage: Stage::Hive,
            label: label.clone(),
            reason: reason.clone(),
        });
        diagnostics.push(Diagnostic::new(Some(side), Stage::Hive, label, reason));
        None
    }
}

fn hive_access(sources: &ImageSources, side: Side) -> CompareResult<Arc<dyn HiveAccess>> {
    sources.hives.clone().ok_or_else(|| {
        CompareError::InvalidConfig(format!(
            "registry.enabled: {side} image has no hive access adapter"
        ))
    })
}

/// Index from a walk unit. Anything but completion is fatal.
fn take_index(report: Option<StageReport>, side: Side) -> CompareResult<ContentIndex> {
    let Some(report) = report else {
        return Err(CompareError::StageFailed {
            side,
            stage: Stage::Walk,
            reason: "no report for unit".into(),
        });
    };
    match report.outcome {
        UnitOutcome::Completed(StageOutput::Index(index)) => Ok(index),
        UnitOutcome::Failed(err) => Err(err),
        UnitOutcome::Cancelled => Err(CompareError::Cancelled),
        other => Err(CompareError::StageFailed {
            side,
            stage: Stage::Walk,
            reason: other
                .failure_reason()
                .unwrap_or_else(|| "unexpected stage output".into()),
        }),
    }
}
