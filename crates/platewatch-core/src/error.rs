//! Error types for platewatch-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for platewatch-core.
///
/// Everything except `Config` is fatal for a single plate only: the
/// dispatcher logs it and keeps serving the queue.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (fatal before the watcher starts)
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A tier destination or upload key already holds data
    #[error("Refusing to overwrite existing {target}")]
    AlreadyExists { target: String },

    /// The BCL conversion tool exited unsuccessfully
    #[error("bcl conversion failed: {}", describe_exit(.exit_code))]
    Conversion { exit_code: Option<i32> },

    /// Any other external tool (object storage, batch queue) failed
    #[error("{tool} failed ({}): {stderr}", describe_exit(.exit_code))]
    ExternalTool {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// An external tool could not be started at all
    #[error("Failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// Another platewatch process holds the tier lock
    #[error("Tier lock {path} is held by another platewatch process")]
    TierBusy { path: String },

    /// A long-running step exceeded its configured budget
    #[error("{step} timed out after {secs} seconds")]
    Timeout { step: String, secs: u64 },

    /// Plate or read-file naming convention violated
    #[error("Metadata parse error: {0}")]
    MetadataParse(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (channel failures, joined tasks, invalid transitions)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

#[allow(clippy::ref_option)]
fn describe_exit(exit_code: &Option<i32>) -> String {
    exit_code.map_or_else(
        || "terminated by signal".to_string(),
        |code| format!("exit code {code}"),
    )
}

impl Error {
    /// Whether this error belongs to a single plate rather than the process.
    #[must_use]
    pub fn is_plate_scoped(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::TierBusy { .. })
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::AlreadyExists { target } => Some(
                Remediation::new(format!(
                    "Existing data at {target} is never overwritten. Inspect it and remove it manually if it is stale."
                ))
                .command("Inspect", format!("ls -la {target}"))
                .alternative("Re-run the plate only after the stale copy has been moved aside."),
            ),
            Self::Conversion { .. } => Some(
                Remediation::new("bcl-convert failed. Check the sample sheet and the run folder.")
                    .command("Check sample sheet", "head SampleSheet.csv")
                    .command("Tool version", "bcl-convert --version")
                    .alternative("The raw backup is kept; re-run conversion manually once fixed."),
            ),
            Self::ExternalTool { tool, .. } | Self::Spawn { tool, .. } => Some(
                Remediation::new(format!("{tool} could not complete. Verify it is installed and credentials are valid."))
                    .command("Check PATH", format!("command -v {tool}"))
                    .alternative("Re-run the failed step after fixing access."),
            ),
            Self::TierBusy { path } => Some(
                Remediation::new("A watcher is processing plates on these roots. Retry once it is idle or stopped.")
                    .command("Lock holders", format!("fuser -v {path}"))
                    .alternative("Use --dry-run to preview evictions without the lock."),
            ),
            Self::Timeout { step, .. } => Some(
                Remediation::new(format!("{step} exceeded its timeout; the external process was killed."))
                    .command("Show config", "platewatch check-config")
                    .alternative("Raise the matching value in the [timeouts] section."),
            ),
            Self::MetadataParse(_) => Some(
                Remediation::new("Plate or file name does not follow the naming convention; nothing was uploaded.")
                    .command("Check a name", "platewatch pair <keys-file>")
                    .alternative("Rename the run folder to {yymmdd}_{instrument}_{run}_{flowcell}."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Disk usage", "df -h")
                    .alternative("Verify the tier roots exist and are writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json"),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Restart the watcher.")
                    .command("Restart", "platewatch watch")
                    .alternative("If the issue persists, run with --log-level debug."),
            ),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("{tier} root does not exist: {path}")]
    MissingRoot { tier: String, path: String },

    #[error("{tier} root {path} cannot be inside the watched root {watch}")]
    NestedRoot {
        tier: String,
        path: String,
        watch: String,
    },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax and retry.")
                .command("Validate", "platewatch check-config"),
            Self::SerializeFailed(_) => Remediation::new("Config could not be rendered as TOML.")
                .command("Validate", "platewatch check-config --json"),
            Self::MissingRoot { path, .. } => Remediation::new(format!("Create {path} or point the config at an existing directory."))
                .command("Create", format!("mkdir -p \"{path}\"")),
            Self::NestedRoot { .. } => Remediation::new(
                "Backup and converted roots must live outside the watched root, otherwise the watcher sees its own writes.",
            )
            .command("Validate", "platewatch check-config"),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Validate", "platewatch check-config")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_available_for_error_variants() {
        let json_err = serde_json::from_str::<serde_json::Value>("").unwrap_err();
        let errors = vec![
            Error::Config(ConfigError::FileNotFound("platewatch.toml".to_string())),
            Error::Config(ConfigError::MissingRoot {
                tier: "backup".to_string(),
                path: "/nope".to_string(),
            }),
            Error::AlreadyExists {
                target: "/backup/plate".to_string(),
            },
            Error::Conversion { exit_code: Some(2) },
            Error::ExternalTool {
                tool: "aws".to_string(),
                exit_code: Some(1),
                stderr: "denied".to_string(),
            },
            Error::Spawn {
                tool: "bcl-convert".to_string(),
                source: std::io::Error::other("missing"),
            },
            Error::Timeout {
                step: "conversion".to_string(),
                secs: 5,
            },
            Error::TierBusy {
                path: "/b/.platewatch.lock".to_string(),
            },
            Error::MetadataParse("bad".to_string()),
            Error::Io(std::io::Error::other("io")),
            Error::Json(json_err),
            Error::Runtime("runtime".to_string()),
        ];

        for error in errors {
            let remediation = error.remediation().expect("missing remediation");
            assert!(!remediation.summary.is_empty(), "{error:?}");
            assert!(!remediation.commands.is_empty(), "{error:?}");
        }
    }

    #[test]
    fn conversion_error_carries_exit_code() {
        let err = Error::Conversion { exit_code: Some(3) };
        assert!(err.to_string().contains("exit code 3"));

        let err = Error::Conversion { exit_code: None };
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn nested_root_names_the_pair() {
        let err = ConfigError::NestedRoot {
            tier: "backup".to_string(),
            path: "/in/backup".to_string(),
            watch: "/in".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("backup"));
        assert!(msg.contains("/in/backup"));
        assert!(msg.contains("/in"));
    }

    #[test]
    fn only_config_errors_are_process_scoped() {
        assert!(!Error::Config(ConfigError::ValidationError("x".into())).is_plate_scoped());
        assert!(!Error::TierBusy { path: "x".into() }.is_plate_scoped());
        assert!(Error::MetadataParse("x".into()).is_plate_scoped());
        assert!(Error::AlreadyExists { target: "x".into() }.is_plate_scoped());
    }

    #[test]
    fn render_plain_omits_empty_sections() {
        let r = Remediation::new("Fix it");
        let output = r.render_plain();
        assert!(output.contains("To fix:"));
        assert!(!output.contains("Commands:"));
        assert!(!output.contains("Alternatives:"));
    }

    #[test]
    fn format_error_appends_remediation() {
        let err = Error::AlreadyExists {
            target: "/b/p".to_string(),
        };
        let text = format_error_with_remediation(&err);
        assert!(text.starts_with("Error: Refusing to overwrite existing /b/p"));
        assert!(text.contains("To fix:"));
    }
}
