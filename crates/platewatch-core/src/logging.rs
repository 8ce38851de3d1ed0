//! Structured logging for platewatch
//!
//! One global `tracing` subscriber: an `EnvFilter` followed by a stderr
//! layer in the configured [`LogFormat`], plus the same format mirrored to
//! an append-only file when `[logging] file` is set.
//!
//! Spans and events use these field names:
//! - `plate_id`: run folder name
//! - `tier`: `raw`, `backup` or `converted`
//! - `step`: lifecycle step (`backup`, `convert`, `upload`, `dispatch`, `retire`)
//! - `path`: filesystem path being acted on
//! - `project_code`, `key`: upload context

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// trace, debug, info, warn or error; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
    /// Append-only copy of the log, in addition to stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Accepted `[logging] level` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// `EnvFilter` directive for this level.
    #[must_use]
    pub const fn directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: {s}. Expected one of: trace, debug, info, warn, error"
            )),
        }
    }
}

/// `RUST_LOG` if set and valid, otherwise the configured level.
fn build_filter(level: &str) -> Result<EnvFilter, LogError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = level
        .parse::<LogLevel>()
        .map_err(|_| LogError::InvalidLevel(level.to_string()))?;
    Ok(EnvFilter::new(level.directive()))
}

/// Formatting layer for `format`, writing to `writer`.
fn format_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_timer(SystemTime)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

fn open_log_file(path: &Path) -> Result<std::fs::File, LogError> {
    let open = || -> io::Result<std::fs::File> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new().create(true).append(true).open(path)
    };
    open().map_err(|source| LogError::File {
        path: path.to_path_buf(),
        source,
    })
}

/// Install the global subscriber. A second call returns
/// [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = build_filter(&config.level)?;
    let file = config.file.as_deref().map(open_log_file).transpose()?;

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(format_layer(config.format, io::stderr, true))
        .with(file.map(|file| format_layer(config.format, Mutex::new(file), false)));
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = LOGGING_INITIALIZED.set(());

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

/// Span carrying a plate's correlation fields.
///
/// ```ignore
/// let span = platewatch_core::plate_span!("lifecycle", plate_id = %plate.plate_id());
/// ```
#[macro_export]
macro_rules! plate_span {
    ($name:expr $(, $($field:tt)+)?) => {
        tracing::info_span!($name $(, $($field)+)?)
    };
}
