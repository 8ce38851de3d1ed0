//! Configuration management for platewatch
//!
//! Handles loading and validation of `platewatch.toml`. Every section has
//! defaults, so an empty file (or no file at all) yields a usable config
//! for the standard Illumina host layout.
//!
//! Resolution order: explicit `--config` path, then `$PLATEWATCH_CONFIG`,
//! then `./platewatch.toml`, then built-in defaults.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::{LogConfig, LogLevel};
use crate::plate::{Tier, TierRoots};
use crate::retention::RetentionConfig;

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "PLATEWATCH_CONFIG";

/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "platewatch.toml";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatewatchConfig {
    /// Tier root directories
    pub roots: TierRoots,
    /// Marker detection and debounce
    pub watch: WatchConfig,
    /// Object storage target
    pub storage: StorageConfig,
    /// Format conversion tool
    pub conversion: ConversionConfig,
    /// Downstream analysis pipelines, matched by project code
    pub pipelines: Vec<PipelineConfig>,
    pub retention: RetentionConfig,
    pub workers: WorkerConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LogConfig,
}

/// `[watch]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// File the sequencer writes last into a run folder.
    pub marker: String,
    /// Repeated events for one marker path within this window are dropped.
    pub debounce_ms: u64,
    /// Enqueue marked run folders that have no backup yet on startup.
    pub catch_up_on_start: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            marker: "CopyComplete.txt".to_string(),
            debounce_ms: 2_000,
            catch_up_on_start: false,
        }
    }
}

/// `[storage]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Upload bucket
    pub bucket: String,
    /// Key prefix uploads are placed under (may be empty)
    pub fastq_key: String,
    /// Alternative S3 endpoint, e.g. a local gateway
    pub endpoint_url: Option<String>,
    /// `aws` CLI binary
    pub aws_program: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "s3-csu-001".to_string(),
            fastq_key: String::new(),
            endpoint_url: None,
            aws_program: PathBuf::from("aws"),
        }
    }
}

/// `[conversion]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub program: PathBuf,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("bcl-convert"),
        }
    }
}

/// One `[[pipelines]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    /// Project codes whose uploads trigger this pipeline
    pub project_codes: Vec<String>,
    pub job_queue: String,
    pub job_definition: String,
    pub output_bucket: String,
    pub output_prefix: String,
    pub vcpus: u32,
    pub memory_mib: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            project_codes: Vec::new(),
            job_queue: String::new(),
            job_definition: String::new(),
            output_bucket: String::new(),
            output_prefix: String::new(),
            vcpus: 4,
            memory_mib: 8_192,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn matches(&self, project_code: &str) -> bool {
        self.project_codes.iter().any(|code| code == project_code)
    }
}

/// `[workers]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Plates processed at once
    pub max_concurrent: usize,
    /// Detected plates buffered between watcher and workers
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            queue_capacity: 64,
        }
    }
}

/// `[timeouts]`, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub conversion_secs: u64,
    pub upload_secs: u64,
    pub submit_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            conversion_secs: 6 * 3_600,
            upload_secs: 4 * 3_600,
            submit_secs: 300,
        }
    }
}

impl PlatewatchConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config = toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Load from the resolved location, or defaults when there is none.
    pub fn load(explicit: Option<&Path>) -> crate::Result<Self> {
        match Self::resolve_path(explicit) {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Config file to load, if any.
    #[must_use]
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        let env = std::env::var(CONFIG_ENV_VAR).ok();
        let cwd = std::env::current_dir().unwrap_or_default();
        resolve_path_with(explicit, env.as_deref(), &cwd)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> crate::Result<String> {
        let rendered =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))?;
        Ok(rendered)
    }

    /// Check field values without touching the filesystem.
    pub fn validate_values(&self) -> Result<(), ConfigError> {
        let marker = &self.watch.marker;
        if marker.is_empty() || marker.contains('/') || marker.contains('\\') {
            return Err(ConfigError::ValidationError(format!(
                "watch.marker {marker:?} must be a plain file name"
            )));
        }
        if self.storage.bucket.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.bucket must not be empty".into(),
            ));
        }
        if self.workers.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "workers.max_concurrent must be >= 1".into(),
            ));
        }
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "workers.queue_capacity must be >= 1".into(),
            ));
        }
        for (name, secs) in [
            ("conversion_secs", self.timeouts.conversion_secs),
            ("upload_secs", self.timeouts.upload_secs),
            ("submit_secs", self.timeouts.submit_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "timeouts.{name} must be > 0"
                )));
            }
        }
        for pipeline in &self.pipelines {
            validate_pipeline(pipeline)?;
        }
        self.retention.validate()?;
        self.logging
            .level
            .parse::<LogLevel>()
            .map_err(ConfigError::ValidationError)?;
        Ok(())
    }

    /// Full validation: values, root existence, and root nesting.
    ///
    /// Backup and converted roots may not sit inside the watched root, or
    /// the watcher would see the engine's own writes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_values()?;

        for tier in Tier::ALL {
            let root = self.roots.root(tier);
            if !root.is_dir() {
                return Err(ConfigError::MissingRoot {
                    tier: tier.to_string(),
                    path: root.display().to_string(),
                });
            }
        }

        let watch = canonical(self.roots.root(Tier::Raw));
        for tier in [Tier::Backup, Tier::Converted] {
            let root = canonical(self.roots.root(tier));
            if is_subdirectory(&root, &watch) {
                return Err(ConfigError::NestedRoot {
                    tier: tier.to_string(),
                    path: self.roots.root(tier).display().to_string(),
                    watch: self.roots.root(Tier::Raw).display().to_string(),
                });
            }
        }
        Ok(())
    }
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    let name = if pipeline.name.is_empty() {
        "<unnamed>"
    } else {
        pipeline.name.as_str()
    };
    let required = [
        ("name", &pipeline.name),
        ("job_queue", &pipeline.job_queue),
        ("job_definition", &pipeline.job_definition),
        ("output_bucket", &pipeline.output_bucket),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "pipeline {name}: {field} must not be empty"
            )));
        }
    }
    if pipeline.project_codes.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "pipeline {name}: project_codes must not be empty"
        )));
    }
    if pipeline.vcpus == 0 || pipeline.memory_mib == 0 {
        return Err(ConfigError::ValidationError(format!(
            "pipeline {name}: vcpus and memory_mib must be > 0"
        )));
    }
    Ok(())
}

fn resolve_path_with(explicit: Option<&Path>, env: Option<&str>, cwd: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env.filter(|p| !p.trim().is_empty()) {
        return Some(PathBuf::from(path));
    }
    let local = cwd.join(DEFAULT_CONFIG_FILE);
    local.is_file().then_some(local)
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// True when `child` equals `parent` or lies below it.
#[must_use]
pub fn is_subdirectory(child: &Path, parent: &Path) -> bool {
    child.starts_with(parent)
}
