/// DiffSleuth Core -- forensic differencing of two guest disk images.
///
/// This crate contains the whole engine with zero CLI dependencies: it
/// indexes two mounted guest filesystems, classifies created, deleted and
/// modified files, diffs Windows registry hives key by key, and assembles a
/// deterministic JSON-serialisable report.
///
/// # Modules
///
/// - [`adapter`] -- Guest and hive access contracts, plus local and in-memory adapters.
/// - [`content`] -- Pluggable digest and type identification over byte streams.
/// - [`pool`] -- Bounded worker pool with per-unit timeouts and cancellation.
/// - [`scanner`] -- Content index builder and progress reporting.
/// - [`registry`] -- Hive snapshot loading and standard hive discovery.
/// - [`diff`] -- Tree and hive differencers.
/// - [`report`] -- Report assembly and serialisation.
/// - [`compare`] -- Orchestrates one full comparison.
/// - [`extract`] -- Copies guest files out by digest.
/// - [`config`] -- JSON configuration with validation.
pub mod adapter;
pub mod compare;
pub mod config;
pub mod content;
pub mod diff;
pub mod error;
pub mod extract;
pub mod model;
pub mod pool;
pub mod registry;
pub mod report;
pub mod scanner;

pub use compare::{CompareOutcome, CompareStats, Comparator, ImageSources};
pub use config::{CompareConfig, RegistryConfig};
pub use error::{AdapterError, CompareError, CompareResult, HiveError};
pub use report::ComparisonReport;
