//! Completion-marker watcher.
//!
//! The sequencer writes `CopyComplete.txt` last into a run folder under the
//! watched root. The watcher subscribes to that root recursively on a
//! dedicated thread, classifies every `Create` event, and enqueues a
//! [`PlateDetected`] per new marker. It never runs a lifecycle itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{PlatewatchConfig, WatchConfig};
use crate::dispatch::{DetectionSender, PlateDetected};
use crate::error::{Error, Result};
use crate::plate::{Tier, TierRoots};

/// Marker file the sequencer writes when a run folder is complete.
pub const DEFAULT_MARKER: &str = "CopyComplete.txt";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Event classification
// =============================================================================

/// Why an event did not become a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Path ends in a separator, so it names a directory.
    TrailingSeparator,
    /// Basename is not the marker file name.
    NotMarker,
    /// Event kind other than create.
    NotCreate,
    /// Same marker path already dispatched within the debounce window.
    Duplicate,
}

/// Result of handling one event path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Ignored(IgnoreReason),
    Processed(PlateDetected),
    Failed(String),
}

impl EventOutcome {
    #[must_use]
    pub const fn is_processed(&self) -> bool {
        matches!(self, Self::Processed(_))
    }

    #[must_use]
    pub const fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }
}

/// Decide whether `path` is a completion marker and, if so, which plate it
/// completes.
///
/// Relative paths are made absolute against the current directory without
/// touching the filesystem.
#[must_use]
pub fn classify_event(path: &Path, marker: &str) -> EventOutcome {
    if has_trailing_separator(path) {
        return EventOutcome::Ignored(IgnoreReason::TrailingSeparator);
    }
    if path.file_name().and_then(|name| name.to_str()) != Some(marker) {
        return EventOutcome::Ignored(IgnoreReason::NotMarker);
    }

    let marker_path = match std::path::absolute(path) {
        Ok(absolute) => absolute,
        Err(err) => {
            return EventOutcome::Failed(format!(
                "cannot resolve {}: {err}",
                path.display()
            ));
        }
    };
    let Some(source_path) = marker_path.parent().map(Path::to_path_buf) else {
        return EventOutcome::Failed(format!("{} has no run folder", marker_path.display()));
    };
    let Some(plate_id) = source_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
    else {
        return EventOutcome::Failed(format!("{} has no run folder", marker_path.display()));
    };

    EventOutcome::Processed(PlateDetected {
        plate_id,
        source_path,
        marker_path,
        detected_at: Utc::now(),
    })
}

fn has_trailing_separator(path: &Path) -> bool {
    path.as_os_str()
        .as_encoded_bytes()
        .last()
        .is_some_and(|&byte| byte == b'/' || char::from(byte) == std::path::MAIN_SEPARATOR)
}

/// [`classify_event`] plus a per-path debounce window.
#[derive(Debug)]
pub struct MarkerFilter {
    marker: String,
    debounce: Duration,
    recent: HashMap<PathBuf, Instant>,
}

impl MarkerFilter {
    #[must_use]
    pub fn new(marker: impl Into<String>, debounce: Duration) -> Self {
        Self {
            marker: marker.into(),
            debounce,
            recent: HashMap::new(),
        }
    }

    #[must_use]
    pub fn from_config(watch: &WatchConfig) -> Self {
        Self::new(
            watch.marker.clone(),
            Duration::from_millis(watch.debounce_ms),
        )
    }

    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Classify `path` as seen at `now`.
    pub fn check(&mut self, path: &Path, now: Instant) -> EventOutcome {
        let outcome = classify_event(path, &self.marker);
        let EventOutcome::Processed(detected) = &outcome else {
            return outcome;
        };

        let debounce = self.debounce;
        self.recent
            .retain(|_, seen| now.saturating_duration_since(*seen) < debounce);
        if self.recent.contains_key(&detected.marker_path) {
            return EventOutcome::Ignored(IgnoreReason::Duplicate);
        }
        self.recent.insert(detected.marker_path.clone(), now);
        outcome
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Watcher counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatcherStats {
    pub events_received: u64,
    pub plates_dispatched: u64,
    pub events_ignored: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct WatcherStatsInner {
    events_received: AtomicU64,
    plates_dispatched: AtomicU64,
    events_ignored: AtomicU64,
    errors: AtomicU64,
}

impl WatcherStatsInner {
    fn mark_event(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    fn add_dispatched(&self) {
        self.plates_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn add_ignored(&self) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
    }

    fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WatcherStats {
        WatcherStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            plates_dispatched: self.plates_dispatched.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Watcher
// =============================================================================

/// Watches the raw tier root for completion markers.
#[derive(Debug)]
pub struct PlateWatcher {
    roots: TierRoots,
    watch: WatchConfig,
    sender: DetectionSender,
    stats: Arc<WatcherStatsInner>,
}

impl PlateWatcher {
    /// Validate `config` and prepare a watcher that feeds `sender`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a root is missing or the backup or
    /// converted root lies inside the watched root.
    pub fn new(config: &PlatewatchConfig, sender: DetectionSender) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            roots: config.roots.clone(),
            watch: config.watch.clone(),
            sender,
            stats: Arc::new(WatcherStatsInner::default()),
        })
    }

    #[must_use]
    pub fn stats(&self) -> WatcherStats {
        self.stats.snapshot()
    }

    /// Subscribe to the watched root and start the event thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the notify backend cannot subscribe or the
    /// thread cannot be spawned.
    pub fn start(self) -> Result<WatchHandle> {
        let watch_root = self.roots.root(Tier::Raw).to_path_buf();

        let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>();
        let mut backend: RecommendedWatcher = notify::recommended_watcher(move |event| {
            // receiver is gone only after shutdown
            let _ = event_tx.send(event);
        })
        .map_err(|err| watcher_error("create watcher", &err))?;
        backend
            .watch(&watch_root, RecursiveMode::Recursive)
            .map_err(|err| watcher_error("watch root", &err))?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stats = Arc::clone(&self.stats);
        let worker = WorkerContext {
            backend,
            events: event_rx,
            filter: MarkerFilter::from_config(&self.watch),
            sender: self.sender,
            stats: Arc::clone(&self.stats),
            stop_flag: Arc::clone(&stop_flag),
            catch_up: self.watch.catch_up_on_start.then(|| self.roots.clone()),
        };

        let worker = thread::Builder::new()
            .name("platewatch-watcher".to_owned())
            .spawn(move || run_worker_loop(worker))
            .map_err(|err| Error::Runtime(format!("failed to spawn watcher thread: {err}")))?;

        info!(
            root = %watch_root.display(),
            marker = %self.watch.marker,
            "Watching for completed plates"
        );

        Ok(WatchHandle {
            stop_flag,
            worker: Some(worker),
            stats,
        })
    }
}

fn watcher_error(action: &str, err: &notify::Error) -> Error {
    Error::Runtime(format!("failed to {action}: {err}"))
}

/// Running watcher. Dropping the handle stops the thread without waiting.
#[derive(Debug)]
pub struct WatchHandle {
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<WatcherStatsInner>,
}

impl WatchHandle {
    #[must_use]
    pub fn stats(&self) -> WatcherStats {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the event thread and wait for it. Releases the detection sender.
    pub fn stop(mut self) -> WatcherStats {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.join() {
                warn!(?err, "Watcher thread panicked during shutdown");
            }
        }
        let stats = self.stats.snapshot();
        info!(
            events_received = stats.events_received,
            plates_dispatched = stats.plates_dispatched,
            events_ignored = stats.events_ignored,
            errors = stats.errors,
            "Watcher stopped"
        );
        stats
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
    }
}

struct WorkerContext {
    // kept alive for the subscription
    backend: RecommendedWatcher,
    events: mpsc::Receiver<notify::Result<Event>>,
    filter: MarkerFilter,
    sender: DetectionSender,
    stats: Arc<WatcherStatsInner>,
    stop_flag: Arc<AtomicBool>,
    catch_up: Option<TierRoots>,
}

fn run_worker_loop(mut context: WorkerContext) {
    if let Some(roots) = context.catch_up.take() {
        for marker_path in catch_up_scan(&roots, context.filter.marker()) {
            let outcome = handle_path(
                &marker_path,
                &mut context.filter,
                &context.sender,
                &context.stats,
            );
            if matches!(outcome, EventOutcome::Processed(_)) {
                debug!(path = %marker_path.display(), "Caught up on marked plate");
            }
        }
    }

    while !context.stop_flag.load(Ordering::Acquire) {
        match context.events.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
                process_notify_result(event, &mut context.filter, &context.sender, &context.stats);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if context.sender.is_closed() {
            warn!("Detection queue closed; watcher exiting");
            break;
        }
    }

    drop(context.backend);
}

fn process_notify_result(
    event: notify::Result<Event>,
    filter: &mut MarkerFilter,
    sender: &DetectionSender,
    stats: &WatcherStatsInner,
) -> Vec<EventOutcome> {
    match event {
        Ok(event) => process_event(&event, filter, sender, stats),
        Err(err) => {
            stats.add_error();
            warn!(error = %err, "Watch backend emitted error");
            Vec::new()
        }
    }
}

/// Handle every path of one notify event.
fn process_event(
    event: &Event,
    filter: &mut MarkerFilter,
    sender: &DetectionSender,
    stats: &WatcherStatsInner,
) -> Vec<EventOutcome> {
    if !matches!(event.kind, EventKind::Create(_)) {
        for _ in &event.paths {
            stats.mark_event();
            stats.add_ignored();
        }
        return vec![EventOutcome::Ignored(IgnoreReason::NotCreate); event.paths.len()];
    }

    event
        .paths
        .iter()
        .map(|path| handle_path(path, filter, sender, stats))
        .collect()
}

fn handle_path(
    path: &Path,
    filter: &mut MarkerFilter,
    sender: &DetectionSender,
    stats: &WatcherStatsInner,
) -> EventOutcome {
    stats.mark_event();
    match filter.check(path, Instant::now()) {
        EventOutcome::Processed(detected) => {
            let plate_id = detected.plate_id.clone();
            // only ever called from the watcher thread, never inside the runtime
            match sender.blocking_send(detected.clone()) {
                Ok(()) => {
                    stats.add_dispatched();
                    info!(
                        plate_id = %plate_id,
                        path = %detected.source_path.display(),
                        "Plate complete; queued"
                    );
                    EventOutcome::Processed(detected)
                }
                Err(_) => {
                    stats.add_error();
                    warn!(plate_id = %plate_id, "Detection queue closed; plate dropped");
                    EventOutcome::Failed(format!("detection queue closed for {plate_id}"))
                }
            }
        }
        EventOutcome::Ignored(reason) => {
            stats.add_ignored();
            debug!(path = %path.display(), ?reason, "Event ignored");
            EventOutcome::Ignored(reason)
        }
        EventOutcome::Failed(reason) => {
            stats.add_error();
            warn!(path = %path.display(), reason = %reason, "Event failed");
            EventOutcome::Failed(reason)
        }
    }
}

/// Marker files of run folders that finished while nobody was watching:
/// the marker exists but the plate has no backup directory yet.
#[must_use]
pub fn catch_up_scan(roots: &TierRoots, marker: &str) -> Vec<PathBuf> {
    let watch_root = roots.root(Tier::Raw);
    let entries = match std::fs::read_dir(watch_root) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(root = %watch_root.display(), error = %err, "Catch-up scan failed");
            return Vec::new();
        }
    };

    let mut markers: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .filter(|entry| {
            let plate_id = entry.file_name().to_string_lossy().into_owned();
            !roots.plate_dir(Tier::Backup, &plate_id).exists()
        })
        .map(|entry| entry.path().join(marker))
        .filter(|marker_path| marker_path.is_file())
        .collect();
    markers.sort();
    markers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::detection_queue;
    use notify::event::{CreateKind, ModifyKind};

    fn processed(outcome: EventOutcome) -> PlateDetected {
        match outcome {
            EventOutcome::Processed(detected) => detected,
            other => panic!("expected Processed, got {other:?}"),
        }
    }

    #[test]
    fn non_marker_name_is_ignored() {
        assert_eq!(
            classify_event(Path::new("./notCopyComplete.txt"), DEFAULT_MARKER),
            EventOutcome::Ignored(IgnoreReason::NotMarker)
        );
    }

    #[test]
    fn trailing_separator_is_ignored() {
        assert_eq!(
            classify_event(Path::new("CopyComplete.txt/"), DEFAULT_MARKER),
            EventOutcome::Ignored(IgnoreReason::TrailingSeparator)
        );
    }

    #[test]
    fn bare_marker_resolves_against_cwd() {
        let detected = processed(classify_event(Path::new("CopyComplete.txt"), DEFAULT_MARKER));
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(detected.source_path, cwd);
        assert_eq!(
            detected.plate_id,
            cwd.file_name().unwrap().to_string_lossy()
        );
    }

    #[test]
    fn absolute_marker_names_parent_folder() {
        let detected = processed(classify_event(
            Path::new("/some/absolute/path/to/CopyComplete.txt"),
            DEFAULT_MARKER,
        ));
        assert_eq!(detected.plate_id, "to");
        assert_eq!(detected.source_path, PathBuf::from("/some/absolute/path/to"));
        assert_eq!(
            detected.marker_path,
            PathBuf::from("/some/absolute/path/to/CopyComplete.txt")
        );
    }

    #[test]
    fn marker_at_filesystem_root_fails() {
        let outcome = classify_event(Path::new("/CopyComplete.txt"), DEFAULT_MARKER);
        assert!(matches!(outcome, EventOutcome::Failed(_)));
    }

    #[test]
    fn custom_marker_name() {
        let outcome = classify_event(Path::new("/runs/p1/RTAComplete.txt"), "RTAComplete.txt");
        assert_eq!(processed(outcome).plate_id, "p1");
        assert!(classify_event(Path::new("/runs/p1/CopyComplete.txt"), "RTAComplete.txt").is_ignored());
    }

    #[test]
    fn repeated_marker_within_window_is_duplicate() {
        let mut filter = MarkerFilter::new(DEFAULT_MARKER, Duration::from_millis(2_000));
        let path = Path::new("/runs/plate/CopyComplete.txt");
        let start = Instant::now();

        assert!(filter.check(path, start).is_processed());
        assert_eq!(
            filter.check(path, start + Duration::from_millis(500)),
            EventOutcome::Ignored(IgnoreReason::Duplicate)
        );
        assert!(filter.check(path, start + Duration::from_millis(2_500)).is_processed());
    }

    #[test]
    fn debounce_is_per_path() {
        let mut filter = MarkerFilter::new(DEFAULT_MARKER, Duration::from_secs(2));
        let now = Instant::now();
        assert!(filter.check(Path::new("/runs/a/CopyComplete.txt"), now).is_processed());
        assert!(filter.check(Path::new("/runs/b/CopyComplete.txt"), now).is_processed());
    }

    #[test]
    fn non_create_events_are_ignored() {
        let (tx, mut rx) = detection_queue(4);
        let stats = WatcherStatsInner::default();
        let mut filter = MarkerFilter::new(DEFAULT_MARKER, Duration::ZERO);
        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/runs/plate/CopyComplete.txt"));

        let outcomes = process_event(&event, &mut filter, &tx, &stats);
        assert_eq!(outcomes, vec![EventOutcome::Ignored(IgnoreReason::NotCreate)]);
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot().events_ignored, 1);
    }

    #[test]
    fn create_event_enqueues_detection() {
        let (tx, mut rx) = detection_queue(4);
        let stats = WatcherStatsInner::default();
        let mut filter = MarkerFilter::new(DEFAULT_MARKER, Duration::ZERO);
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/runs/plate/RunInfo.xml"))
            .add_path(PathBuf::from("/runs/plate/CopyComplete.txt"));

        let outcomes = process_event(&event, &mut filter, &tx, &stats);
        assert!(outcomes[0].is_ignored());
        assert!(outcomes[1].is_processed());
        assert_eq!(rx.try_recv().unwrap().plate_id, "plate");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.events_received, 2);
        assert_eq!(snapshot.plates_dispatched, 1);
        assert_eq!(snapshot.events_ignored, 1);
    }

    #[test]
    fn closed_queue_is_a_failure() {
        let (tx, rx) = detection_queue(1);
        drop(rx);
        let stats = WatcherStatsInner::default();
        let mut filter = MarkerFilter::new(DEFAULT_MARKER, Duration::ZERO);
        let outcome = handle_path(
            Path::new("/runs/plate/CopyComplete.txt"),
            &mut filter,
            &tx,
            &stats,
        );
        assert!(matches!(outcome, EventOutcome::Failed(_)));
        assert_eq!(stats.snapshot().errors, 1);
    }

    fn temp_roots() -> (tempfile::TempDir, TierRoots) {
        let dir = tempfile::tempdir().unwrap();
        let roots = TierRoots::new(
            dir.path().join("incoming"),
            dir.path().join("bcl"),
            dir.path().join("fastq"),
        );
        for tier in Tier::ALL {
            std::fs::create_dir_all(roots.root(tier)).unwrap();
        }
        (dir, roots)
    }

    #[test]
    fn catch_up_skips_backed_up_and_unmarked_plates() {
        let (_dir, roots) = temp_roots();
        for plate in ["done", "pending", "unmarked"] {
            std::fs::create_dir_all(roots.plate_dir(Tier::Raw, plate)).unwrap();
        }
        for plate in ["done", "pending"] {
            std::fs::write(roots.plate_dir(Tier::Raw, plate).join(DEFAULT_MARKER), b"").unwrap();
        }
        std::fs::create_dir_all(roots.plate_dir(Tier::Backup, "done")).unwrap();

        let found = catch_up_scan(&roots, DEFAULT_MARKER);
        assert_eq!(
            found,
            vec![roots.plate_dir(Tier::Raw, "pending").join(DEFAULT_MARKER)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_watcher_reports_new_marker() {
        let (_dir, roots) = temp_roots();
        let mut config = PlatewatchConfig::default();
        config.roots = roots.clone();

        let plate_dir = roots.plate_dir(Tier::Raw, "240101_M01234_0001_000000000-ABCDE");
        std::fs::create_dir_all(&plate_dir).unwrap();

        let (tx, mut rx) = detection_queue(4);
        let handle = PlateWatcher::new(&config, tx).unwrap().start().unwrap();

        std::fs::write(plate_dir.join(DEFAULT_MARKER), b"").unwrap();
        let detected = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("marker event")
            .expect("queue open");
        assert_eq!(detected.plate_id, "240101_M01234_0001_000000000-ABCDE");

        let stats = tokio::task::spawn_blocking(move || handle.stop()).await.unwrap();
        assert!(stats.events_received >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn catch_up_runs_on_start() {
        let (_dir, roots) = temp_roots();
        let mut config = PlatewatchConfig::default();
        config.roots = roots.clone();
        config.watch.catch_up_on_start = true;

        let plate_dir = roots.plate_dir(Tier::Raw, "missed");
        std::fs::create_dir_all(&plate_dir).unwrap();
        std::fs::write(plate_dir.join(DEFAULT_MARKER), b"").unwrap();

        let (tx, mut rx) = detection_queue(4);
        let handle = PlateWatcher::new(&config, tx).unwrap().start().unwrap();
        let detected = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("catch-up detection")
            .expect("queue open");
        assert_eq!(detected.plate_id, "missed");
        tokio::task::spawn_blocking(move || handle.stop()).await.unwrap();
    }

    #[test]
    fn nested_backup_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let watch = dir.path().join("incoming");
        let roots = TierRoots::new(watch.clone(), watch.join("bcl"), dir.path().join("fastq"));
        for tier in Tier::ALL {
            std::fs::create_dir_all(roots.root(tier)).unwrap();
        }
        let mut config = PlatewatchConfig::default();
        config.roots = roots;
        let (tx, _rx) = detection_queue(1);
        let err = PlateWatcher::new(&config, tx).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
