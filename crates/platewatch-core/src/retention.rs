//! Tier retention and eviction.
//!
//! Reclaims disk space across the raw, backup and converted tiers. A plate
//! is a candidate only once its converted directory is *complete*, i.e.
//! holds every configured completion marker (the analysis pipeline writes
//! `Logs/` and `Reports/` last).
//!
//! # Policies
//!
//! - **Age**: delete the raw copy of every complete plate; delete converted
//!   and backup once the converted directory is older than `max_age_days`
//!   whole days.
//! - **Space**: while the filesystem hosting the converted root is below
//!   `min_free_fraction` free, evict the oldest complete plate from all three
//!   tiers. Disk usage is re-read before every decision.
//!
//! Deletion failures never abort a pass. They are logged and collected in
//! the [`RetentionReport`].

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::disk::{DiskProbe, FsDiskProbe};
use crate::error::ConfigError;
use crate::plate::{Tier, TierRoots};

const SECS_PER_DAY: u64 = 86_400;

/// Which eviction rule a retention pass applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    #[default]
    Age,
    Space,
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Age => f.write_str("age"),
            Self::Space => f.write_str("space"),
        }
    }
}

impl FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "age" => Ok(Self::Age),
            "space" => Ok(Self::Space),
            _ => Err(format!(
                "unknown retention policy: {s}. Expected one of: age, space"
            )),
        }
    }
}

/// `[retention]` configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub policy: RetentionPolicy,
    /// Converted data strictly older than this many whole days is evicted.
    pub max_age_days: u64,
    /// Space policy evicts until this fraction of the disk is free.
    pub min_free_fraction: f64,
    /// Entries a converted plate directory must contain to be evictable.
    pub completion_markers: Vec<String>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            policy: RetentionPolicy::Age,
            max_age_days: 21,
            min_free_fraction: 0.5,
            completion_markers: vec!["Logs".to_string(), "Reports".to_string()],
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.min_free_fraction) {
            return Err(ConfigError::ValidationError(format!(
                "retention.min_free_fraction must be within [0, 1], got {}",
                self.min_free_fraction
            )));
        }
        for marker in &self.completion_markers {
            if marker.is_empty() || marker.contains('/') || marker.contains('\\') {
                return Err(ConfigError::ValidationError(format!(
                    "retention.completion_markers entry {marker:?} must be a plain file name"
                )));
            }
        }
        Ok(())
    }
}

/// Why a tier directory was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvictionReason {
    /// Raw copy of a plate whose converted output is complete.
    Processed,
    /// Converted output older than the age threshold.
    Aged { age_days: u64 },
    /// Disk below the free-space threshold.
    LowSpace { free_fraction: f64 },
}

/// A tier directory that was (or in dry-run mode would be) deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eviction {
    pub plate_id: String,
    pub tier: Tier,
    pub path: PathBuf,
    pub reason: EvictionReason,
}

/// A tier directory that could not be deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionFailure {
    pub plate_id: String,
    pub tier: Tier,
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotADirectory,
    /// Missing one or more completion markers.
    Incomplete,
}

/// Entry of the converted root that was not considered for eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub policy: RetentionPolicy,
    pub dry_run: bool,
    pub evictions: Vec<Eviction>,
    pub failures: Vec<EvictionFailure>,
    pub skipped: Vec<SkippedEntry>,
    /// Free fraction at the first space-policy reading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_fraction_before: Option<f64>,
    /// Free fraction at the last space-policy reading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_fraction_after: Option<f64>,
    /// Set when the space policy ran out of candidates while still short.
    pub exhausted: bool,
}

impl RetentionReport {
    fn new(policy: RetentionPolicy, dry_run: bool) -> Self {
        Self {
            policy,
            dry_run,
            evictions: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
            free_fraction_before: None,
            free_fraction_after: None,
            exhausted: false,
        }
    }

    /// Whether `plate_id` was evicted from `tier` in this pass.
    #[must_use]
    pub fn evicted(&self, tier: Tier, plate_id: &str) -> bool {
        self.evictions
            .iter()
            .any(|e| e.tier == tier && e.plate_id == plate_id)
    }

    /// Distinct plates with at least one eviction, in eviction order.
    #[must_use]
    pub fn evicted_plates(&self) -> Vec<&str> {
        let mut plates: Vec<&str> = Vec::new();
        for eviction in &self.evictions {
            if !plates.contains(&eviction.plate_id.as_str()) {
                plates.push(&eviction.plate_id);
            }
        }
        plates
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A complete converted plate directory.
#[derive(Debug, Clone)]
struct Candidate {
    plate_id: String,
    path: PathBuf,
}

/// Applies a [`RetentionConfig`] to a set of tier roots.
///
/// Synchronous; callers on a runtime should use `spawn_blocking`.
#[derive(Clone)]
pub struct RetentionEngine {
    roots: TierRoots,
    config: RetentionConfig,
    probe: Arc<dyn DiskProbe>,
    dry_run: bool,
}

impl fmt::Debug for RetentionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetentionEngine")
            .field("roots", &self.roots)
            .field("config", &self.config)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl RetentionEngine {
    #[must_use]
    pub fn new(roots: TierRoots, config: RetentionConfig) -> Self {
        Self {
            roots,
            config,
            probe: Arc::new(FsDiskProbe),
            dry_run: false,
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn DiskProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Report what would be evicted without deleting anything.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetentionPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    #[must_use]
    pub fn probe(&self) -> Arc<dyn DiskProbe> {
        Arc::clone(&self.probe)
    }

    /// Run the configured policy.
    pub fn run(&self) -> RetentionReport {
        let report = match self.config.policy {
            RetentionPolicy::Age => self.run_age_policy(SystemTime::now()),
            RetentionPolicy::Space => self.run_space_policy(),
        };
        info!(
            policy = %report.policy,
            dry_run = report.dry_run,
            evicted = report.evictions.len(),
            failed = report.failures.len(),
            skipped = report.skipped.len(),
            "Retention pass finished"
        );
        report
    }

    /// Age policy evaluated at `now`.
    pub fn run_age_policy(&self, now: SystemTime) -> RetentionReport {
        let mut report = RetentionReport::new(RetentionPolicy::Age, self.dry_run);

        for candidate in self.scan_candidates(&mut report) {
            self.evict(&mut report, &candidate.plate_id, Tier::Raw, EvictionReason::Processed);

            let modified = match fs::metadata(&candidate.path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    warn!(
                        plate_id = %candidate.plate_id,
                        path = %candidate.path.display(),
                        error = %err,
                        "Cannot read plate age; skipping"
                    );
                    continue;
                }
            };
            let age_days = whole_days(now.duration_since(modified).unwrap_or(Duration::ZERO));

            if age_days > self.config.max_age_days {
                let reason = EvictionReason::Aged { age_days };
                self.evict(&mut report, &candidate.plate_id, Tier::Converted, reason);
                self.evict(&mut report, &candidate.plate_id, Tier::Backup, reason);
            } else {
                debug!(
                    plate_id = %candidate.plate_id,
                    age_days,
                    max_age_days = self.config.max_age_days,
                    "Plate within retention window"
                );
            }
        }

        report
    }

    /// Space policy: evict oldest complete plates until enough is free.
    pub fn run_space_policy(&self) -> RetentionReport {
        let mut report = RetentionReport::new(RetentionPolicy::Space, self.dry_run);

        let mut ranked: Vec<(SystemTime, Candidate)> = self
            .scan_candidates(&mut report)
            .into_iter()
            .filter_map(|candidate| match creation_time(&candidate.path) {
                Ok(created) => Some((created, candidate)),
                Err(err) => {
                    warn!(
                        plate_id = %candidate.plate_id,
                        error = %err,
                        "Cannot read plate creation time; skipping"
                    );
                    None
                }
            })
            .collect();
        ranked.sort_by(|(a_time, a), (b_time, b)| {
            a_time.cmp(b_time).then_with(|| a.plate_id.cmp(&b.plate_id))
        });
        let mut queue = ranked.into_iter().map(|(_, candidate)| candidate);

        let converted_root = self.roots.root(Tier::Converted);
        loop {
            let free_fraction = match self.probe.usage(converted_root) {
                Ok(usage) => usage.free_fraction(),
                Err(err) => {
                    warn!(
                        path = %converted_root.display(),
                        error = %err,
                        "Cannot read disk usage; stopping space retention"
                    );
                    break;
                }
            };
            report.free_fraction_before.get_or_insert(free_fraction);
            report.free_fraction_after = Some(free_fraction);

            if free_fraction >= self.config.min_free_fraction {
                break;
            }

            let Some(candidate) = queue.next() else {
                warn!(
                    free_fraction,
                    min_free_fraction = self.config.min_free_fraction,
                    "Free space below threshold but no evictable plates remain"
                );
                report.exhausted = true;
                break;
            };

            info!(
                plate_id = %candidate.plate_id,
                free_fraction,
                min_free_fraction = self.config.min_free_fraction,
                "Evicting oldest plate for space"
            );
            let reason = EvictionReason::LowSpace { free_fraction };
            for tier in [Tier::Converted, Tier::Raw, Tier::Backup] {
                self.evict(&mut report, &candidate.plate_id, tier, reason);
            }
        }

        report
    }

    /// Complete plate directories of the converted root, sorted by id.
    fn scan_candidates(&self, report: &mut RetentionReport) -> Vec<Candidate> {
        let root = self.roots.root(Tier::Converted);
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    path = %root.display(),
                    error = %err,
                    "Cannot list converted root"
                );
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                report.skipped.push(SkippedEntry {
                    path,
                    reason: SkipReason::NotADirectory,
                });
                continue;
            }
            if !self.is_complete(&path) {
                debug!(path = %path.display(), "Plate not complete; skipping");
                report.skipped.push(SkippedEntry {
                    path,
                    reason: SkipReason::Incomplete,
                });
                continue;
            }
            let Some(plate_id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            candidates.push(Candidate { plate_id, path });
        }
        candidates.sort_by(|a, b| a.plate_id.cmp(&b.plate_id));
        report.skipped.sort_by(|a, b| a.path.cmp(&b.path));
        candidates
    }

    fn is_complete(&self, plate_dir: &Path) -> bool {
        self.config
            .completion_markers
            .iter()
            .all(|marker| plate_dir.join(marker).exists())
    }

    /// Delete one tier directory, recording the outcome.
    fn evict(&self, report: &mut RetentionReport, plate_id: &str, tier: Tier, reason: EvictionReason) {
        let path = self.roots.plate_dir(tier, plate_id);
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(plate_id, tier = %tier, "Already evicted");
                return;
            }
            Err(err) => {
                self.record_failure(report, plate_id, tier, path, &err);
                return;
            }
        };

        if !self.dry_run {
            let removed = if metadata.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(err) = removed {
                self.record_failure(report, plate_id, tier, path, &err);
                return;
            }
        }

        info!(
            plate_id,
            tier = %tier,
            path = %path.display(),
            reason = ?reason,
            dry_run = self.dry_run,
            "Evicted tier directory"
        );
        report.evictions.push(Eviction {
            plate_id: plate_id.to_string(),
            tier,
            path,
            reason,
        });
    }

    fn record_failure(
        &self,
        report: &mut RetentionReport,
        plate_id: &str,
        tier: Tier,
        path: PathBuf,
        err: &io::Error,
    ) {
        if err.kind() == io::ErrorKind::PermissionDenied {
            warn!(plate_id, tier = %tier, path = %path.display(), "Permission denied while evicting");
        } else {
            warn!(plate_id, tier = %tier, path = %path.display(), error = %err, "Failed to evict");
        }
        report.failures.push(EvictionFailure {
            plate_id: plate_id.to_string(),
            tier,
            path,
            error: err.to_string(),
        });
    }
}

fn whole_days(age: Duration) -> u64 {
    age.as_secs() / SECS_PER_DAY
}

/// Creation time, falling back to mtime where the filesystem has no birth time.
fn creation_time(path: &Path) -> io::Result<SystemTime> {
    let metadata = fs::metadata(path)?;
    metadata.created().or_else(|_| metadata.modified())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskUsage;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const DAY: Duration = Duration::from_secs(SECS_PER_DAY);
    const HOUR: Duration = Duration::from_secs(3_600);

    struct Tiers {
        _dir: tempfile::TempDir,
        roots: TierRoots,
    }

    fn tiers() -> Tiers {
        let dir = tempfile::tempdir().unwrap();
        let roots = TierRoots::new(
            dir.path().join("watch"),
            dir.path().join("backup"),
            dir.path().join("converted"),
        );
        for tier in Tier::ALL {
            fs::create_dir_all(roots.root(tier)).unwrap();
        }
        Tiers { _dir: dir, roots }
    }

    fn seed_plate(roots: &TierRoots, plate_id: &str, complete: bool) {
        for tier in Tier::ALL {
            let dir = roots.plate_dir(tier, plate_id);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("data.bin"), b"data").unwrap();
        }
        let converted = roots.plate_dir(Tier::Converted, plate_id);
        fs::create_dir_all(converted.join("Logs")).unwrap();
        if complete {
            fs::create_dir_all(converted.join("Reports")).unwrap();
        }
    }

    /// Returns scripted free fractions; the last one repeats.
    struct ScriptedProbe {
        readings: Mutex<VecDeque<f64>>,
        calls: Mutex<usize>,
    }

    impl ScriptedProbe {
        fn new(readings: &[f64]) -> Self {
            Self {
                readings: Mutex::new(readings.iter().copied().collect()),
                calls: Mutex::new(0),
            }
        }
    }

    impl DiskProbe for ScriptedProbe {
        fn usage(&self, _path: &Path) -> io::Result<DiskUsage> {
            *self.calls.lock().unwrap() += 1;
            let mut readings = self.readings.lock().unwrap();
            let fraction = if readings.len() > 1 {
                readings.pop_front().unwrap()
            } else {
                readings.front().copied().unwrap_or(1.0)
            };
            Ok(DiskUsage::new(1_000, (fraction * 1_000.0) as u64))
        }
    }

    #[test]
    fn age_policy_evicts_plates_older_than_threshold() {
        let t = tiers();
        seed_plate(&t.roots, "plate_a", true);
        let engine = RetentionEngine::new(t.roots.clone(), RetentionConfig::default());

        let report = engine.run_age_policy(SystemTime::now() + 22 * DAY + HOUR);

        for tier in Tier::ALL {
            assert!(!t.roots.plate_dir(tier, "plate_a").exists(), "{tier} kept");
            assert!(report.evicted(tier, "plate_a"));
        }
        assert!(report.is_clean());
        let aged = report
            .evictions
            .iter()
            .find(|e| e.tier == Tier::Converted)
            .unwrap();
        assert_eq!(aged.reason, EvictionReason::Aged { age_days: 22 });
    }

    #[test]
    fn age_policy_keeps_young_plates_but_drops_raw() {
        let t = tiers();
        seed_plate(&t.roots, "plate_a", true);
        let engine = RetentionEngine::new(t.roots.clone(), RetentionConfig::default());

        let report = engine.run_age_policy(SystemTime::now() + 20 * DAY + HOUR);

        assert!(!t.roots.plate_dir(Tier::Raw, "plate_a").exists());
        assert!(t.roots.plate_dir(Tier::Backup, "plate_a").exists());
        assert!(t.roots.plate_dir(Tier::Converted, "plate_a").exists());
        assert_eq!(report.evictions.len(), 1);
        assert_eq!(report.evictions[0].reason, EvictionReason::Processed);
    }

    #[test]
    fn age_threshold_is_strict() {
        let t = tiers();
        seed_plate(&t.roots, "plate_a", true);
        let engine = RetentionEngine::new(t.roots.clone(), RetentionConfig::default());

        engine.run_age_policy(SystemTime::now() + 21 * DAY + HOUR);

        assert!(t.roots.plate_dir(Tier::Converted, "plate_a").exists());
    }

    #[test]
    fn incomplete_plates_and_files_are_skipped() {
        let t = tiers();
        seed_plate(&t.roots, "plate_a", false);
        fs::write(t.roots.root(Tier::Converted).join("stray.txt"), b"x").unwrap();
        let engine = RetentionEngine::new(t.roots.clone(), RetentionConfig::default());

        let report = engine.run_age_policy(SystemTime::now() + 100 * DAY);

        assert!(report.evictions.is_empty());
        for tier in Tier::ALL {
            assert!(t.roots.plate_dir(tier, "plate_a").exists());
        }
        let reasons: Vec<_> = report.skipped.iter().map(|s| s.reason).collect();
        assert_eq!(reasons, vec![SkipReason::Incomplete, SkipReason::NotADirectory]);
    }

    #[test]
    fn missing_tiers_count_as_evicted() {
        let t = tiers();
        seed_plate(&t.roots, "plate_a", true);
        fs::remove_dir_all(t.roots.plate_dir(Tier::Raw, "plate_a")).unwrap();
        fs::remove_dir_all(t.roots.plate_dir(Tier::Backup, "plate_a")).unwrap();
        let engine = RetentionEngine::new(t.roots.clone(), RetentionConfig::default());

        let report = engine.run_age_policy(SystemTime::now() + 30 * DAY);

        assert!(report.is_clean());
        assert_eq!(report.evictions.len(), 1);
        assert!(report.evicted(Tier::Converted, "plate_a"));
    }

    #[test]
    fn missing_converted_root_is_a_noop() {
        let t = tiers();
        fs::remove_dir_all(t.roots.root(Tier::Converted)).unwrap();
        let engine = RetentionEngine::new(t.roots.clone(), RetentionConfig::default());
        let report = engine.run();
        assert!(report.evictions.is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn dry_run_reports_without_deleting() {
        let t = tiers();
        seed_plate(&t.roots, "plate_a", true);
        let engine =
            RetentionEngine::new(t.roots.clone(), RetentionConfig::default()).with_dry_run(true);

        let report = engine.run_age_policy(SystemTime::now() + 30 * DAY);

        assert!(report.dry_run);
        assert_eq!(report.evictions.len(), 3);
        for tier in Tier::ALL {
            assert!(t.roots.plate_dir(tier, "plate_a").exists());
        }
    }

    #[test]
    fn space_policy_evicts_oldest_until_satisfied() {
        let t = tiers();
        for plate in ["plate_a", "plate_b", "plate_c"] {
            seed_plate(&t.roots, plate, true);
        }
        let probe = Arc::new(ScriptedProbe::new(&[0.0, 0.4, 0.6]));
        let config = RetentionConfig {
            policy: RetentionPolicy::Space,
            ..RetentionConfig::default()
        };
        let engine = RetentionEngine::new(t.roots.clone(), config).with_probe(probe.clone());

        let report = engine.run();

        assert_eq!(report.evicted_plates(), vec!["plate_a", "plate_b"]);
        for tier in Tier::ALL {
            assert!(!t.roots.plate_dir(tier, "plate_a").exists());
            assert!(!t.roots.plate_dir(tier, "plate_b").exists());
            assert!(t.roots.plate_dir(tier, "plate_c").exists());
        }
        assert_eq!(*probe.calls.lock().unwrap(), 3);
        assert_eq!(report.free_fraction_before, Some(0.0));
        assert_eq!(report.free_fraction_after, Some(0.6));
        assert!(!report.exhausted);
    }

    #[test]
    fn space_policy_stops_when_candidates_run_out() {
        let t = tiers();
        seed_plate(&t.roots, "plate_a", true);
        seed_plate(&t.roots, "plate_b", false);
        let probe = Arc::new(ScriptedProbe::new(&[0.1]));
        let engine = RetentionEngine::new(t.roots.clone(), RetentionConfig::default())
            .with_policy(RetentionPolicy::Space)
            .with_probe(probe);

        let report = engine.run();

        assert_eq!(report.evicted_plates(), vec!["plate_a"]);
        assert!(report.exhausted);
        assert!(t.roots.plate_dir(Tier::Converted, "plate_b").exists());
    }

    #[test]
    fn space_policy_idle_when_disk_has_room() {
        let t = tiers();
        seed_plate(&t.roots, "plate_a", true);
        let engine = RetentionEngine::new(t.roots.clone(), RetentionConfig::default())
            .with_policy(RetentionPolicy::Space)
            .with_probe(Arc::new(ScriptedProbe::new(&[0.9])));

        let report = engine.run();

        assert!(report.evictions.is_empty());
        assert!(t.roots.plate_dir(Tier::Converted, "plate_a").exists());
    }

    #[cfg(unix)]
    #[test]
    fn delete_failure_is_recorded_and_pass_continues() {
        use std::os::unix::fs::PermissionsExt;

        let t = tiers();
        seed_plate(&t.roots, "plate_a", true);
        seed_plate(&t.roots, "plate_b", true);
        let backup_root = t.roots.root(Tier::Backup).to_path_buf();
        fs::set_permissions(&backup_root, fs::Permissions::from_mode(0o500)).unwrap();

        // root ignores permission bits
        let probe_path = backup_root.join("probe");
        if fs::write(&probe_path, b"x").is_ok() {
            fs::remove_file(&probe_path).unwrap();
            fs::set_permissions(&backup_root, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let engine = RetentionEngine::new(t.roots.clone(), RetentionConfig::default());
        let report = engine.run_age_policy(SystemTime::now() + 30 * DAY);
        fs::set_permissions(&backup_root, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.tier == Tier::Backup));
        assert!(report.evicted(Tier::Converted, "plate_a"));
        assert!(report.evicted(Tier::Converted, "plate_b"));
    }

    #[test]
    fn config_validation() {
        assert!(RetentionConfig::default().validate().is_ok());
        let bad = RetentionConfig {
            min_free_fraction: 1.5,
            ..RetentionConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = RetentionConfig {
            completion_markers: vec!["a/b".to_string()],
            ..RetentionConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn policy_parse_and_display() {
        assert_eq!("AGE".parse::<RetentionPolicy>().unwrap(), RetentionPolicy::Age);
        assert_eq!("space".parse::<RetentionPolicy>().unwrap(), RetentionPolicy::Space);
        assert!("size".parse::<RetentionPolicy>().is_err());
        assert_eq!(RetentionPolicy::Space.to_string(), "space");
    }
}
