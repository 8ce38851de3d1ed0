//! Bounded worker pool between the watcher and the lifecycle engine.
//!
//! The watcher thread only enqueues [`PlateDetected`] messages; the
//! [`Dispatcher`] drains the queue and runs up to `workers.max_concurrent`
//! lifecycles at once. Two lifecycles for the same `plate_id` never run
//! concurrently ([`PlateLocks`]).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{OwnedMutexGuard, Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::lifecycle::{PlateLifecycle, PlateRecord, PlateState};
use crate::plate::Plate;

/// A completion marker was seen for a run folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlateDetected {
    pub plate_id: String,
    /// Absolute run folder (parent of the marker).
    pub source_path: PathBuf,
    pub marker_path: PathBuf,
    pub detected_at: DateTime<Utc>,
}

/// Sending half of the detection queue.
pub type DetectionSender = mpsc::Sender<PlateDetected>;

/// Receiving half of the detection queue.
pub type DetectionReceiver = mpsc::Receiver<PlateDetected>;

/// Bounded detection queue.
#[must_use]
pub fn detection_queue(capacity: usize) -> (DetectionSender, DetectionReceiver) {
    mpsc::channel(capacity.max(1))
}

// =============================================================================
// Per-plate locks
// =============================================================================

/// Keyed async mutexes, one per plate id.
#[derive(Debug, Default)]
pub struct PlateLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PlateLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `plate_id`.
    pub async fn acquire(&self, plate_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // drop idle entries so the map tracks only plates in flight
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(plate_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Plates with a holder or waiter.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Counts over one dispatcher run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub received: usize,
    pub retired: usize,
    pub errored: usize,
    /// Detections that did not name a usable run folder.
    pub rejected: usize,
}

enum TaskOutcome {
    Finished(PlateState),
    Rejected,
}

/// Drains the detection queue into lifecycle runs.
#[derive(Debug)]
pub struct Dispatcher {
    lifecycle: Arc<PlateLifecycle>,
    max_concurrent: usize,
    locks: Arc<PlateLocks>,
    records: Option<mpsc::UnboundedSender<PlateRecord>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(lifecycle: PlateLifecycle, workers: &WorkerConfig) -> Self {
        Self {
            lifecycle: Arc::new(lifecycle),
            max_concurrent: workers.max_concurrent.max(1),
            locks: Arc::new(PlateLocks::new()),
            records: None,
        }
    }

    /// Receive every finished [`PlateRecord`].
    #[must_use]
    pub fn with_record_sink(mut self, sink: mpsc::UnboundedSender<PlateRecord>) -> Self {
        self.records = Some(sink);
        self
    }

    /// Process detections until every sender is dropped, then wait for
    /// in-flight plates.
    pub async fn run(self, mut queue: DetectionReceiver) -> DispatchSummary {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut summary = DispatchSummary::default();

        info!(max_concurrent = self.max_concurrent, "Dispatcher started");

        while let Some(detected) = queue.recv().await {
            summary.received += 1;
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };

            let lifecycle = Arc::clone(&self.lifecycle);
            let locks = Arc::clone(&self.locks);
            let records = self.records.clone();
            tasks.spawn(async move {
                let _permit = permit;
                process(&lifecycle, &locks, records.as_ref(), detected).await
            });

            while let Some(joined) = tasks.try_join_next() {
                tally(&mut summary, joined);
            }
        }

        debug!(in_flight = tasks.len(), "Detection queue closed; draining");
        while let Some(joined) = tasks.join_next().await {
            tally(&mut summary, joined);
        }

        info!(
            received = summary.received,
            retired = summary.retired,
            errored = summary.errored,
            rejected = summary.rejected,
            "Dispatcher stopped"
        );
        summary
    }
}

async fn process(
    lifecycle: &PlateLifecycle,
    locks: &PlateLocks,
    records: Option<&mpsc::UnboundedSender<PlateRecord>>,
    detected: PlateDetected,
) -> TaskOutcome {
    let plate = match Plate::from_source(&detected.source_path) {
        Ok(plate) => plate,
        Err(err) => {
            warn!(
                plate_id = %detected.plate_id,
                path = %detected.source_path.display(),
                error = %err,
                "Rejected detection"
            );
            return TaskOutcome::Rejected;
        }
    };

    let _guard = locks.acquire(plate.plate_id()).await;
    let record = lifecycle.run(plate).await;
    let state = record.state;
    if let Some(sink) = records {
        // a dropped receiver only means nobody is listening
        let _ = sink.send(record);
    }
    TaskOutcome::Finished(state)
}

fn tally(summary: &mut DispatchSummary, joined: Result<TaskOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(TaskOutcome::Finished(PlateState::Retired)) => summary.retired += 1,
        Ok(TaskOutcome::Finished(_)) => summary.errored += 1,
        Ok(TaskOutcome::Rejected) => summary.rejected += 1,
        Err(err) => {
            error!(error = %err, "Plate task panicked");
            summary.errored += 1;
        }
    }
}
