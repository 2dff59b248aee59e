//! Comparison configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config and
//! a config file only needs to name what it changes.
use crate::error::{CompareError, CompareResult};
use crate::pool::PoolConfig;
use crate::scanner::ScanOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Registry comparison settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Compare registry hives at all.
    pub enabled: bool,
    /// Guest paths of the hives to load. Empty means discover the standard
    /// hives in the content indices.
    pub hives: Vec<String>,
    /// When discovering, skip hives whose file digest is unchanged.
    pub skip_unchanged: bool,
    /// Timeout for loading all hives of one image.
    pub timeout_secs: Option<u64>,
    /// Maximum key nesting below a hive root.
    pub max_depth: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hives: Vec::new(),
            skip_unchanged: true,
            timeout_secs: Some(300),
            max_depth: 512,
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Settings for one comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareConfig {
    /// Guest path both trees are listed from.
    pub root: String,
    /// Worker threads for digesting (per image).
    pub workers: usize,
    /// Timeout for reading and digesting one file.
    pub file_timeout_secs: Option<u64>,
    /// Timeout for indexing one whole image.
    pub walk_timeout_secs: Option<u64>,
    /// Maximum path components of an indexed entry.
    pub max_depth: usize,
    /// Run the type identifier over every file.
    pub identify: bool,
    pub registry: RegistryConfig,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            root: "/".into(),
            workers: num_cpus::get().max(1),
            file_timeout_secs: Some(300),
            walk_timeout_secs: None,
            max_depth: 4_096,
            identify: false,
            registry: RegistryConfig::default(),
        }
    }
}

impl CompareConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: &Path) -> CompareResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CompareError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&content).map_err(|source| CompareError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with. All problems are
    /// reported together.
    pub fn validate(&self) -> CompareResult<()> {
        let mut problems: Vec<String> = Vec::new();

        if !self.root.starts_with('/') {
            problems.push(format!("root: '{}' is not an absolute guest path", self.root));
        }
        if self.workers == 0 {
            problems.push("workers: must be at least 1".into());
        }
        if self.max_depth == 0 {
            problems.push("max_depth: must be at least 1".into());
        }
        if self.registry.max_depth == 0 {
            problems.push("registry.max_depth: must be at least 1".into());
        }
        for (field, value) in [
            ("file_timeout_secs", self.file_timeout_secs),
            ("walk_timeout_secs", self.walk_timeout_secs),
            ("registry.timeout_secs", self.registry.timeout_secs),
        ] {
            if value == Some(0) {
                problems.push(format!("{field}: must be positive (omit it for no timeout)"));
            }
        }
        for hive in &self.registry.hives {
            if !hive.starts_with('/') {
                problems.push(format!("registry.hives: '{hive}' is not an absolute guest path"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CompareError::InvalidConfig(problems.join("; ")))
        }
    }

    pub fn file_timeout(&self) -> Option<Duration> {
        self.file_timeout_secs.map(Duration::from_secs)
    }

    pub fn walk_timeout(&self) -> Option<Duration> {
        self.walk_timeout_secs.map(Duration::from_secs)
    }

    /// Index-builder options derived from this config.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            root: self.root.clone(),
            max_depth: self.max_depth,
            workers: self.workers,
            file_timeout: self.file_timeout(),
        }
    }

    /// Pool for the top-level units (two walks, optionally two hive loads).
    pub fn stage_pool(&self) -> PoolConfig {
        PoolConfig {
            workers: 4,
            default_timeout: None,
            thread_name: "diffsleuth-stage".into(),
        }
    }
}
