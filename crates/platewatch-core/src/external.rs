//! External collaborators: format conversion, object storage, batch queue.
//!
//! The lifecycle engine only talks to these traits. The production
//! implementations shell out to `bcl-convert` and the `aws` CLI; tests plug
//! in in-memory fakes.
//!
//! Every spawned process is started with `kill_on_drop(true)`, so dropping
//! the future (for example when a `tokio::time::timeout` expires) kills the
//! child instead of leaking it.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Stderr is truncated to this many bytes in error messages.
const STDERR_TAIL_BYTES: usize = 2_048;

// =============================================================================
// Traits
// =============================================================================

/// Raw run folder → per-project FASTQ directories.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `input` into `output`. `output` must not exist yet.
    async fn convert(&self, input: &Path, output: &Path) -> Result<()>;
}

/// Object storage addressed by bucket and key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether any object exists at or below `key`.
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Upload the contents of `local_dir` under `key`.
    ///
    /// Fails with [`Error::AlreadyExists`] if `key` already holds objects.
    async fn sync(&self, local_dir: &Path, bucket: &str, key: &str) -> Result<()>;

    /// Write a single JSON document to `key`.
    async fn put_json(&self, bucket: &str, key: &str, value: &serde_json::Value) -> Result<()>;

    /// All keys below `prefix`.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}

/// Compute resources requested for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub vcpus: u32,
    pub memory_mib: u32,
}

/// One analysis job for the batch queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_name: String,
    pub job_queue: String,
    pub job_definition: String,
    /// `s3://` location of the uploaded reads.
    pub input_uri: String,
    /// `s3://` location the pipeline writes results to.
    pub output_uri: String,
    pub resources: ResourceSpec,
}

impl JobRequest {
    /// Both URIs have to point at object storage.
    pub fn validate(&self) -> Result<()> {
        for (what, uri) in [("input", &self.input_uri), ("output", &self.output_uri)] {
            if !uri.starts_with("s3://") {
                return Err(Error::Runtime(format!(
                    "job {} has invalid {what} uri: {uri}",
                    self.job_name
                )));
            }
        }
        Ok(())
    }
}

/// Fire-and-forget submission to a batch job queue.
#[async_trait]
pub trait BatchSubmitter: Send + Sync {
    /// Submit and return the queue's job id.
    async fn submit(&self, request: &JobRequest) -> Result<String>;
}

// =============================================================================
// Process helper
// =============================================================================

/// Captured output of a finished process.
#[derive(Debug)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run `command` to completion, optionally feeding `stdin`.
///
/// Only spawn failures are errors here; callers decide what a non-zero exit
/// means.
pub async fn run_tool(tool: &str, mut command: Command, stdin: Option<Vec<u8>>) -> Result<ToolOutput> {
    command
        .kill_on_drop(true)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    debug!(tool, command = ?command.as_std(), "Spawning external tool");
    let mut child = command.spawn().map_err(|source| Error::Spawn {
        tool: tool.to_string(),
        source,
    })?;

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(&bytes).await?;
        pipe.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    Ok(ToolOutput {
        exit_code: output.status.code(),
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

fn tool_failure(tool: &str, output: &ToolOutput) -> Error {
    Error::ExternalTool {
        tool: tool.to_string(),
        exit_code: output.exit_code,
        stderr: stderr_tail(&output.stderr),
    }
}

// =============================================================================
// bcl-convert
// =============================================================================

/// Runs the `bcl-convert` binary.
#[derive(Debug, Clone)]
pub struct BclConvert {
    program: PathBuf,
}

impl Default for BclConvert {
    fn default() -> Self {
        Self::new("bcl-convert")
    }
}

impl BclConvert {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments for converting `input` into `output`.
    #[must_use]
    pub fn args(input: &Path, output: &Path) -> Vec<String> {
        vec![
            "--output-directory".to_string(),
            output.display().to_string(),
            "--bcl-input-directory".to_string(),
            input.display().to_string(),
            "--sample-sheet".to_string(),
            input.join("SampleSheet.csv").display().to_string(),
            "--bcl-sampleproject-subdirectories".to_string(),
            "true".to_string(),
            "--no-lane-splitting".to_string(),
            "true".to_string(),
        ]
    }
}

#[async_trait]
impl Converter for BclConvert {
    async fn convert(&self, input: &Path, output: &Path) -> Result<()> {
        let tool = self.program.display().to_string();
        let mut command = Command::new(&self.program);
        command.args(Self::args(input, output));

        let result = run_tool(&tool, command, None).await?;
        if result.success {
            return Ok(());
        }
        warn!(
            tool = %tool,
            exit_code = ?result.exit_code,
            stderr = %stderr_tail(&result.stderr),
            "Conversion failed"
        );
        Err(Error::Conversion {
            exit_code: result.exit_code,
        })
    }
}

// =============================================================================
// aws s3
// =============================================================================

/// Object storage through the `aws s3` CLI.
#[derive(Debug, Clone)]
pub struct AwsCliStore {
    program: PathBuf,
    endpoint_url: Option<String>,
}

impl Default for AwsCliStore {
    fn default() -> Self {
        Self::new("aws", None)
    }
}

impl AwsCliStore {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, endpoint_url: Option<String>) -> Self {
        Self {
            program: program.into(),
            endpoint_url,
        }
    }

    fn tool(&self) -> String {
        self.program.display().to_string()
    }

    fn s3_command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.program);
        if let Some(endpoint) = &self.endpoint_url {
            command.arg("--endpoint-url").arg(endpoint);
        }
        command.arg("s3").args(args);
        command
    }

    async fn ls(&self, bucket: &str, key: &str, recursive: bool) -> Result<ToolOutput> {
        let uri = s3_uri(bucket, key);
        let mut args = vec!["ls".to_string(), uri];
        if recursive {
            args.push("--recursive".to_string());
        }
        run_tool(&self.tool(), self.s3_command(args), None).await
    }
}

/// `s3://{bucket}/{key}`
#[must_use]
pub fn s3_uri(bucket: &str, key: &str) -> String {
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        format!("s3://{bucket}/")
    } else {
        format!("s3://{bucket}/{key}")
    }
}

/// Key column of one `aws s3 ls --recursive` line.
///
/// Lines look like `2022-03-21 10:00:00      12345 path/to/key`; directory
/// lines (`PRE name/`) carry no key.
fn parse_ls_key(line: &str) -> Option<String> {
    let mut rest = line.trim_start();
    for _ in 0..3 {
        let end = rest.find(char::is_whitespace)?;
        rest = rest[end..].trim_start();
    }
    (!rest.is_empty()).then(|| rest.to_string())
}

/// Whether a non-recursive `aws s3 ls` listing holds `key` itself.
///
/// The CLI matches by prefix, so `M01234_0001` also lists `M01234_00010/`;
/// only an entry whose name equals the last key segment counts.
fn listing_names(stdout: &str, key: &str) -> bool {
    let Some(name) = key.trim_end_matches('/').rsplit('/').next() else {
        return false;
    };
    stdout.lines().any(|line| {
        let line = line.trim();
        let entry = match line.strip_prefix("PRE ") {
            Some(prefix) => Some(prefix.trim().trim_end_matches('/').to_string()),
            None => parse_ls_key(line),
        };
        entry.as_deref() == Some(name)
    })
}

#[async_trait]
impl ObjectStore for AwsCliStore {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let output = self.ls(bucket, key, false).await?;
        if output.success {
            return Ok(listing_names(&output.stdout, key));
        }
        // `aws s3 ls` exits 1 with empty stderr when nothing matches
        if output.exit_code == Some(1) && output.stderr.trim().is_empty() {
            return Ok(false);
        }
        Err(tool_failure(&self.tool(), &output))
    }

    async fn sync(&self, local_dir: &Path, bucket: &str, key: &str) -> Result<()> {
        if self.exists(bucket, key).await? {
            return Err(Error::AlreadyExists {
                target: s3_uri(bucket, key),
            });
        }
        let target = format!("{}/", s3_uri(bucket, key).trim_end_matches('/'));
        let args = vec![
            "sync".to_string(),
            local_dir.display().to_string(),
            target,
            "--only-show-errors".to_string(),
        ];
        let output = run_tool(&self.tool(), self.s3_command(args), None).await?;
        if output.success {
            Ok(())
        } else {
            Err(tool_failure(&self.tool(), &output))
        }
    }

    async fn put_json(&self, bucket: &str, key: &str, value: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec_pretty(value)?;
        let args = vec![
            "cp".to_string(),
            "-".to_string(),
            s3_uri(bucket, key),
            "--content-type".to_string(),
            "application/json".to_string(),
        ];
        let output = run_tool(&self.tool(), self.s3_command(args), Some(body)).await?;
        if output.success {
            Ok(())
        } else {
            Err(tool_failure(&self.tool(), &output))
        }
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let output = self.ls(bucket, prefix, true).await?;
        if !output.success {
            if output.exit_code == Some(1) && output.stderr.trim().is_empty() {
                return Ok(Vec::new());
            }
            return Err(tool_failure(&self.tool(), &output));
        }
        Ok(output.stdout.lines().filter_map(parse_ls_key).collect())
    }
}

// =============================================================================
// aws batch
// =============================================================================

/// Batch submission through `aws batch submit-job`.
#[derive(Debug, Clone)]
pub struct AwsBatchSubmitter {
    program: PathBuf,
}

impl Default for AwsBatchSubmitter {
    fn default() -> Self {
        Self::new("aws")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobResponse {
    job_id: String,
}

impl AwsBatchSubmitter {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `--container-overrides` document for a request.
    #[must_use]
    pub fn container_overrides(request: &JobRequest) -> serde_json::Value {
        serde_json::json!({
            "environment": [
                { "name": "READS_URI", "value": request.input_uri },
                { "name": "RESULTS_URI", "value": request.output_uri },
            ],
            "resourceRequirements": [
                { "type": "VCPU", "value": request.resources.vcpus.to_string() },
                { "type": "MEMORY", "value": request.resources.memory_mib.to_string() },
            ],
        })
    }
}

#[async_trait]
impl BatchSubmitter for AwsBatchSubmitter {
    async fn submit(&self, request: &JobRequest) -> Result<String> {
        request.validate()?;
        let tool = self.program.display().to_string();
        let overrides = serde_json::to_string(&Self::container_overrides(request))?;

        let mut command = Command::new(&self.program);
        command
            .args(["batch", "submit-job", "--job-name"])
            .arg(&request.job_name)
            .arg("--job-queue")
            .arg(&request.job_queue)
            .arg("--job-definition")
            .arg(&request.job_definition)
            .arg("--container-overrides")
            .arg(overrides)
            .args(["--output", "json"]);

        let output = run_tool(&tool, command, None).await?;
        if !output.success {
            return Err(tool_failure(&tool, &output));
        }
        let response: SubmitJobResponse = serde_json::from_str(&output.stdout)?;
        Ok(response.job_id)
    }
}
