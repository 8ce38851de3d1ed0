//! Plate lifecycle state machine.
//!
//! Drives one plate through
//! `Detected → BackedUp → Converted → Uploaded → Dispatched → Retired`.
//! The first failing step moves the plate to the absorbing `Errored` state;
//! nothing is retried or rolled back, and the last completed state is kept
//! on the record for diagnosis.
//!
//! A plate holds a read guard on the shared tier lock (and, when configured,
//! the shared [`TierLockFile`]) from the start of backup until its jobs are
//! dispatched. The retire step releases both and runs retention under the
//! write guard, so an eviction pass never sees a plate that is converted but
//! not yet uploaded.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{Instrument, debug, error, info};

use crate::config::PlatewatchConfig;
use crate::disk::log_disk_usage;
use crate::gateway::{SubmittedJob, TierGateway, UploadedGroup};
use crate::plate::Plate;
use crate::retention::{RetentionEngine, RetentionReport};
use crate::tier_lock::{LockMode, TierLockFile, TierLockGuard};
use crate::{Error, Result};

// =============================================================================
// States
// =============================================================================

/// Where a plate is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlateState {
    Detected,
    BackedUp,
    Converted,
    Uploaded,
    Dispatched,
    Retired,
    /// Absorbing failure state.
    Errored,
}

impl fmt::Display for PlateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detected => write!(f, "detected"),
            Self::BackedUp => write!(f, "backed_up"),
            Self::Converted => write!(f, "converted"),
            Self::Uploaded => write!(f, "uploaded"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Retired => write!(f, "retired"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

impl PlateState {
    /// Successor on the happy path.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Detected => Some(Self::BackedUp),
            Self::BackedUp => Some(Self::Converted),
            Self::Converted => Some(Self::Uploaded),
            Self::Uploaded => Some(Self::Dispatched),
            Self::Dispatched => Some(Self::Retired),
            Self::Retired | Self::Errored => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Retired | Self::Errored)
    }

    /// Forward by exactly one step, or into `Errored` from any live state.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == Self::Errored || self.next() == Some(target)
    }

    /// Step that leaves this state.
    #[must_use]
    pub const fn step(self) -> Option<LifecycleStep> {
        match self {
            Self::Detected => Some(LifecycleStep::Backup),
            Self::BackedUp => Some(LifecycleStep::Convert),
            Self::Converted => Some(LifecycleStep::Upload),
            Self::Uploaded => Some(LifecycleStep::Dispatch),
            Self::Dispatched => Some(LifecycleStep::Retire),
            Self::Retired | Self::Errored => None,
        }
    }
}

/// Side-effecting step between two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStep {
    Backup,
    Convert,
    Upload,
    Dispatch,
    Retire,
}

impl LifecycleStep {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Convert => "convert",
            Self::Upload => "upload",
            Self::Dispatch => "dispatch",
            Self::Retire => "retire",
        }
    }
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Record
// =============================================================================

/// Progress of one plate.
#[derive(Debug, Clone, Serialize)]
pub struct PlateRecord {
    pub plate: Plate,
    pub state: PlateState,
    /// Last state reached successfully; stays put once `Errored`.
    pub last_completed: PlateState,
    pub failed_step: Option<LifecycleStep>,
    pub error: Option<String>,
    pub uploads: Vec<UploadedGroup>,
    pub jobs: Vec<SubmittedJob>,
    pub retention: Option<RetentionReport>,
    pub detected_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PlateRecord {
    #[must_use]
    pub fn new(plate: Plate) -> Self {
        Self {
            plate,
            state: PlateState::Detected,
            last_completed: PlateState::Detected,
            failed_step: None,
            error: None,
            uploads: Vec::new(),
            jobs: Vec::new(),
            retention: None,
            detected_at: Utc::now(),
            finished_at: None,
        }
    }

    #[must_use]
    pub fn plate_id(&self) -> &str {
        self.plate.plate_id()
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.state == PlateState::Retired
    }

    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.state == PlateState::Errored
    }

    /// Move to `target`, rejecting anything but the next state.
    pub fn advance(&mut self, target: PlateState) -> Result<()> {
        if target == PlateState::Errored || !self.state.can_transition_to(target) {
            return Err(Error::Runtime(format!(
                "invalid transition {} -> {target} for plate {}",
                self.state,
                self.plate_id()
            )));
        }
        self.state = target;
        self.last_completed = target;
        if target.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    fn fail(&mut self, step: LifecycleStep, err: &Error) {
        self.state = PlateState::Errored;
        self.failed_step = Some(step);
        self.error = Some(err.to_string());
        self.finished_at = Some(Utc::now());
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Runs plates through the gateway and the retention engine.
#[derive(Debug, Clone)]
pub struct PlateLifecycle {
    gateway: TierGateway,
    retention: RetentionEngine,
    tier_lock: Arc<RwLock<()>>,
    lock_file: Option<TierLockFile>,
}

/// Held by one plate from backup through dispatch.
struct PlateTierGuard<'a> {
    // released before the in-process guard
    _file: Option<TierLockGuard>,
    _tier: RwLockReadGuard<'a, ()>,
}

impl PlateLifecycle {
    #[must_use]
    pub fn new(gateway: TierGateway, retention: RetentionEngine) -> Self {
        Self {
            gateway,
            retention,
            tier_lock: Arc::new(RwLock::new(())),
            lock_file: None,
        }
    }

    /// Production lifecycle for a validated config.
    #[must_use]
    pub fn from_config(config: &PlatewatchConfig) -> Self {
        Self::new(
            TierGateway::from_config(config),
            RetentionEngine::new(config.roots.clone(), config.retention.clone()),
        )
        .with_lock_file(TierLockFile::new(&config.roots))
    }

    /// Coordinate with other processes working on the same roots.
    #[must_use]
    pub fn with_lock_file(mut self, lock_file: TierLockFile) -> Self {
        self.lock_file = Some(lock_file);
        self
    }

    /// Share a tier lock with other lifecycles or an on-demand retention run.
    #[must_use]
    pub fn with_tier_lock(mut self, tier_lock: Arc<RwLock<()>>) -> Self {
        self.tier_lock = tier_lock;
        self
    }

    #[must_use]
    pub fn tier_lock(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.tier_lock)
    }

    #[must_use]
    pub fn gateway(&self) -> &TierGateway {
        &self.gateway
    }

    /// Process a freshly detected plate; the outcome is on the record.
    pub async fn run(&self, plate: Plate) -> PlateRecord {
        let mut record = PlateRecord::new(plate);
        let outcome = self.drive(&mut record).await;
        debug!(
            plate_id = %record.plate_id(),
            state = %record.state,
            ok = outcome.is_ok(),
            "Plate run finished"
        );
        record
    }

    /// Advance `record` until it is retired or errored.
    pub async fn drive(&self, record: &mut PlateRecord) -> Result<()> {
        let span = crate::plate_span!("plate", plate_id = %record.plate_id());
        let result = async {
            info!(state = %record.state, "Processing plate");
            let mut tiers = None;
            while let Some(step) = record.state.step() {
                if step == LifecycleStep::Retire {
                    drop(tiers.take());
                } else if tiers.is_none() {
                    tiers = Some(self.hold_tiers().await.map_err(|err| abort(record, step, err))?);
                }
                self.step(record, step)
                    .await
                    .map_err(|err| abort(record, step, err))?;
                info!(step = %step, state = %record.state, "Plate step complete");
            }
            Ok::<(), Error>(())
        }
        .instrument(span)
        .await;

        log_disk_usage(self.retention.probe().as_ref(), self.gateway.roots());
        result
    }

    async fn step(&self, record: &mut PlateRecord, step: LifecycleStep) -> Result<()> {
        match step {
            LifecycleStep::Backup => {
                self.gateway.backup(&record.plate).await?;
                record.advance(PlateState::BackedUp)
            }
            LifecycleStep::Convert => {
                self.gateway.convert(&record.plate).await?;
                record.advance(PlateState::Converted)
            }
            LifecycleStep::Upload => {
                record.uploads = self.gateway.upload(&record.plate).await?;
                record.advance(PlateState::Uploaded)
            }
            LifecycleStep::Dispatch => {
                record.jobs = self.gateway.dispatch(&record.plate, &record.uploads).await?;
                record.advance(PlateState::Dispatched)
            }
            LifecycleStep::Retire => {
                record.retention = Some(self.retire().await?);
                record.advance(PlateState::Retired)
            }
        }
    }

    /// Run retention under the exclusive tier lock.
    pub async fn retire(&self) -> Result<RetentionReport> {
        run_retention(&self.tier_lock, self.lock_file.as_ref(), self.retention.clone()).await
    }

    async fn hold_tiers(&self) -> Result<PlateTierGuard<'_>> {
        let tier = self.tier_lock.read().await;
        let file = match &self.lock_file {
            Some(lock) => Some(lock.acquire(LockMode::Shared).await?),
            None => None,
        };
        Ok(PlateTierGuard {
            _file: file,
            _tier: tier,
        })
    }
}

fn abort(record: &mut PlateRecord, step: LifecycleStep, err: Error) -> Error {
    error!(
        step = %step,
        last_state = %record.last_completed,
        error = %err,
        "Plate processing failed"
    );
    record.fail(step, &err);
    err
}

/// Run `engine` on the blocking pool while holding the write guard and, if
/// given, the exclusive lock file.
pub async fn run_retention(
    tier_lock: &RwLock<()>,
    lock_file: Option<&TierLockFile>,
    engine: RetentionEngine,
) -> Result<RetentionReport> {
    let _guard = tier_lock.write().await;
    let _file = match lock_file {
        Some(lock) => Some(lock.acquire(LockMode::Exclusive).await?),
        None => None,
    };
    tokio::task::spawn_blocking(move || engine.run())
        .await
        .map_err(|e| Error::Runtime(format!("retention task failed: {e}")))
}
