//! platewatch-core: Core library for platewatch
//!
//! This crate provides the intake engine behind `platewatch`, which moves
//! sequencer run folders ("plates") from the instrument share through
//! backup, conversion, upload and pipeline dispatch, then retires old
//! plates from local storage.
//!
//! # Architecture
//!
//! ```text
//! notify → PlateWatcher → detection queue → Dispatcher
//!                                              ↓
//!                       PlateLifecycle (backup → convert → upload → dispatch)
//!                                              ↓
//!                                      RetentionEngine (age | space)
//! ```
//!
//! # Modules
//!
//! - `config`: TOML configuration, defaults and validation
//! - `watcher`: Completion-marker watcher and event classification
//! - `dispatch`: Detection queue, per-plate locks and the worker pool
//! - `lifecycle`: Plate state machine and step driver
//! - `gateway`: Tier copies, project grouping and upload metadata
//! - `external`: Converter, object store and batch submitter seams
//! - `retention`: Age and space eviction policies
//! - `tier_lock`: Cross-process lock file over the tier roots
//! - `disk`: Free-space probing and disk usage logging
//! - `grammar`: Run-name and read-key grammar
//! - `pairing`: Read pairing and batch summaries over storage listings
//! - `plate`: Tier roots and plate identity
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod disk;
pub mod dispatch;
pub mod error;
pub mod external;
pub mod gateway;
pub mod grammar;
pub mod lifecycle;
pub mod logging;
pub mod pairing;
pub mod plate;
pub mod retention;
pub mod tier_lock;
pub mod watcher;

pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
