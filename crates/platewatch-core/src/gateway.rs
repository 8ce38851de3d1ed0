//! Tier gateway: the four side-effecting lifecycle steps.
//!
//! Each step writes one tier (or one storage key) exactly once. An existing
//! target is refused with [`Error::AlreadyExists`] and left untouched.
//! External calls run under the `[timeouts]` budgets; an expired budget
//! drops the future, which kills the child process.

use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{PipelineConfig, PlatewatchConfig, StorageConfig, TimeoutConfig};
use crate::external::{
    AwsBatchSubmitter, AwsCliStore, BatchSubmitter, BclConvert, Converter, JobRequest,
    ObjectStore, ResourceSpec, s3_uri,
};
use crate::grammar::RunName;
use crate::plate::{Plate, Tier, TierRoots};
use crate::{Error, Result};

/// Name of the metadata document written next to each upload.
pub const META_FILE: &str = "meta.json";

/// Longest job name the batch queue accepts.
const MAX_JOB_NAME_LEN: usize = 128;

/// Contents of `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub project_code: String,
    pub instrument_id: String,
    pub run_number: String,
    pub run_id: String,
    pub flowcell_id: String,
    /// `YYYY-MM-DD`
    pub sequence_date: String,
    /// Local wall-clock time of the upload.
    pub upload_time: String,
}

impl MetaRecord {
    #[must_use]
    pub fn new(project_code: &str, run: &RunName, uploaded_at: DateTime<Local>) -> Self {
        Self {
            project_code: project_code.to_string(),
            instrument_id: run.instrument_id.clone(),
            run_number: run.run_number.clone(),
            run_id: run.run_id.clone(),
            flowcell_id: run.flowcell_id.clone(),
            sequence_date: run.sequence_date_iso(),
            upload_time: uploaded_at.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        }
    }
}

/// A project subdirectory of a converted plate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectGroup {
    pub project_code: String,
    pub path: PathBuf,
}

/// One project group that reached object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedGroup {
    pub project_code: String,
    pub local_dir: PathBuf,
    pub bucket: String,
    pub key: String,
}

impl UploadedGroup {
    /// `s3://{bucket}/{key}/`
    #[must_use]
    pub fn uri(&self) -> String {
        format!("{}/", s3_uri(&self.bucket, &self.key).trim_end_matches('/'))
    }
}

/// One analysis job handed to the batch queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub pipeline: String,
    pub project_code: String,
    pub job_name: String,
    pub job_id: String,
    pub output_uri: String,
}

/// Performs backup, conversion, upload and job submission for plates.
#[derive(Clone)]
pub struct TierGateway {
    roots: TierRoots,
    storage: StorageConfig,
    pipelines: Vec<PipelineConfig>,
    timeouts: TimeoutConfig,
    converter: Arc<dyn Converter>,
    store: Arc<dyn ObjectStore>,
    submitter: Arc<dyn BatchSubmitter>,
}

impl std::fmt::Debug for TierGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierGateway")
            .field("roots", &self.roots)
            .field("storage", &self.storage)
            .field("pipelines", &self.pipelines.len())
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl TierGateway {
    #[must_use]
    pub fn new(
        config: &PlatewatchConfig,
        converter: Arc<dyn Converter>,
        store: Arc<dyn ObjectStore>,
        submitter: Arc<dyn BatchSubmitter>,
    ) -> Self {
        Self {
            roots: config.roots.clone(),
            storage: config.storage.clone(),
            pipelines: config.pipelines.clone(),
            timeouts: config.timeouts.clone(),
            converter,
            store,
            submitter,
        }
    }

    /// Gateway backed by `bcl-convert` and the `aws` CLI.
    #[must_use]
    pub fn from_config(config: &PlatewatchConfig) -> Self {
        let store = AwsCliStore::new(
            config.storage.aws_program.clone(),
            config.storage.endpoint_url.clone(),
        );
        Self::new(
            config,
            Arc::new(BclConvert::new(config.conversion.program.clone())),
            Arc::new(store),
            Arc::new(AwsBatchSubmitter::new(config.storage.aws_program.clone())),
        )
    }

    #[must_use]
    pub fn roots(&self) -> &TierRoots {
        &self.roots
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    /// Copy the raw run folder to `{backup_root}/{plate_id}`.
    pub async fn backup(&self, plate: &Plate) -> Result<PathBuf> {
        let source = plate.source_path().to_path_buf();
        let dest = self.roots.plate_dir(Tier::Backup, plate.plate_id());

        let copy_dest = dest.clone();
        tokio::task::spawn_blocking(move || copy_tree_exclusive(&source, &copy_dest))
            .await
            .map_err(|e| Error::Runtime(format!("backup task failed: {e}")))??;

        info!(
            plate_id = %plate.plate_id(),
            tier = %Tier::Backup,
            path = %dest.display(),
            "Backed up raw run folder"
        );
        Ok(dest)
    }

    /// Convert the raw run folder into `{converted_root}/{plate_id}`.
    pub async fn convert(&self, plate: &Plate) -> Result<PathBuf> {
        let output = self.roots.plate_dir(Tier::Converted, plate.plate_id());
        if output.exists() {
            return Err(Error::AlreadyExists {
                target: output.display().to_string(),
            });
        }

        with_timeout(
            "conversion",
            self.timeouts.conversion_secs,
            self.converter.convert(plate.source_path(), &output),
        )
        .await?;

        info!(
            plate_id = %plate.plate_id(),
            tier = %Tier::Converted,
            path = %output.display(),
            "Converted plate"
        );
        Ok(output)
    }

    /// Upload every qualifying project group of the converted plate.
    ///
    /// The run name is parsed before anything is uploaded. Groups are
    /// handled in name order; a failure stops the step, and groups already
    /// uploaded stay in place.
    pub async fn upload(&self, plate: &Plate) -> Result<Vec<UploadedGroup>> {
        let run = plate.require_run()?;
        let converted = self.roots.plate_dir(Tier::Converted, plate.plate_id());
        let groups = project_groups(&converted)?;
        if groups.is_empty() {
            warn!(
                plate_id = %plate.plate_id(),
                path = %converted.display(),
                "No project groups with fastq.gz files to upload"
            );
        }

        let bucket = self.storage.bucket.as_str();
        let mut uploaded = Vec::with_capacity(groups.len());
        for group in groups {
            let key = join_key(&[&self.storage.fastq_key, &group.project_code, &run.run_id]);
            let secs = self.timeouts.upload_secs;

            if with_timeout("upload", secs, self.store.exists(bucket, &key)).await? {
                return Err(Error::AlreadyExists {
                    target: s3_uri(bucket, &key),
                });
            }
            with_timeout("upload", secs, self.store.sync(&group.path, bucket, &key)).await?;

            let meta = MetaRecord::new(&group.project_code, run, Local::now());
            let meta_key = join_key(&[&key, META_FILE]);
            let value = serde_json::to_value(&meta)?;
            with_timeout("upload", secs, self.store.put_json(bucket, &meta_key, &value)).await?;

            info!(
                plate_id = %plate.plate_id(),
                project_code = %group.project_code,
                key = %key,
                "Uploaded project group"
            );
            uploaded.push(UploadedGroup {
                project_code: group.project_code,
                local_dir: group.path,
                bucket: bucket.to_string(),
                key,
            });
        }
        Ok(uploaded)
    }

    /// Submit one job per (uploaded group, matching pipeline).
    pub async fn dispatch(&self, plate: &Plate, uploads: &[UploadedGroup]) -> Result<Vec<SubmittedJob>> {
        let run = plate.require_run()?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let mut jobs = Vec::new();

        for upload in uploads {
            let matching: Vec<&PipelineConfig> = self
                .pipelines
                .iter()
                .filter(|p| p.matches(&upload.project_code))
                .collect();
            if matching.is_empty() {
                info!(
                    plate_id = %plate.plate_id(),
                    project_code = %upload.project_code,
                    "No pipeline configured for project"
                );
                continue;
            }

            for pipeline in matching {
                let request = build_job_request(pipeline, upload, &run.run_id, &timestamp);
                let job_id = with_timeout(
                    "submission",
                    self.timeouts.submit_secs,
                    self.submitter.submit(&request),
                )
                .await?;

                info!(
                    plate_id = %plate.plate_id(),
                    project_code = %upload.project_code,
                    pipeline = %pipeline.name,
                    job_id = %job_id,
                    output_uri = %request.output_uri,
                    "Submitted analysis job"
                );
                jobs.push(SubmittedJob {
                    pipeline: pipeline.name.clone(),
                    project_code: upload.project_code.clone(),
                    job_name: request.job_name,
                    job_id,
                    output_uri: request.output_uri,
                });
            }
        }
        Ok(jobs)
    }
}

fn build_job_request(
    pipeline: &PipelineConfig,
    upload: &UploadedGroup,
    run_id: &str,
    timestamp: &str,
) -> JobRequest {
    let output_key = join_key(&[
        &pipeline.output_prefix,
        &upload.project_code,
        run_id,
        timestamp,
    ]);
    JobRequest {
        job_name: job_name(&[&pipeline.name, &upload.project_code, run_id]),
        job_queue: pipeline.job_queue.clone(),
        job_definition: pipeline.job_definition.clone(),
        input_uri: upload.uri(),
        output_uri: format!("{}/", s3_uri(&pipeline.output_bucket, &output_key)),
        resources: ResourceSpec {
            vcpus: pipeline.vcpus,
            memory_mib: pipeline.memory_mib,
        },
    }
}

async fn with_timeout<T>(step: &str, secs: u64, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(Duration::from_secs(secs), fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(step, secs, "External step timed out");
            Err(Error::Timeout {
                step: step.to_string(),
                secs,
            })
        }
    }
}

/// Join key segments with `/`, skipping empty ones.
#[must_use]
pub fn join_key(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Batch-queue safe job name: ASCII alphanumerics, `-` and `_`.
#[must_use]
pub fn job_name(parts: &[&str]) -> String {
    let joined = parts.join("-");
    joined
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_JOB_NAME_LEN)
        .collect()
}

/// Immediate subdirectories of `converted` holding at least one `*.fastq.gz`.
pub fn project_groups(converted: &Path) -> Result<Vec<ProjectGroup>> {
    let mut groups = Vec::new();
    for entry in fs::read_dir(converted)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(project_code) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
        else {
            continue;
        };
        if has_fastq_gz(&path)? {
            groups.push(ProjectGroup { project_code, path });
        }
    }
    groups.sort_by(|a, b| a.project_code.cmp(&b.project_code));
    Ok(groups)
}

fn has_fastq_gz(dir: &Path) -> io::Result<bool> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(".fastq.gz") && entry.path().is_file() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Recursively copy `source` to `dest`, refusing an existing `dest`.
///
/// `dest` is created with `create_dir`, so two racing copies cannot both
/// succeed.
pub fn copy_tree_exclusive(source: &Path, dest: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("source {} is not a directory", source.display()),
        )));
    }
    match fs::create_dir(dest) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return Err(Error::AlreadyExists {
                target: dest.display().to_string(),
            });
        }
        Err(err) => return Err(err.into()),
    }
    copy_dir_contents(source, dest)?;
    Ok(())
}

fn copy_dir_contents(source: &Path, dest: &Path) -> io::Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            fs::create_dir(&to)?;
            copy_dir_contents(&from, &to)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    let target = fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_key_skips_empty_segments() {
        assert_eq!(join_key(&["", "FZ2000", "M1_0042"]), "FZ2000/M1_0042");
        assert_eq!(join_key(&["fastq/", "/FZ2000", "M1_0042"]), "fastq/FZ2000/M1_0042");
        assert_eq!(join_key(&["a", "meta.json"]), "a/meta.json");
    }

    #[test]
    fn job_names_are_sanitized() {
        assert_eq!(job_name(&["salmonella", "FZ2000", "M1_0042"]), "salmonella-FZ2000-M1_0042");
        assert_eq!(job_name(&["a b", "c.d"]), "a-b-c-d");
        assert_eq!(job_name(&[&"x".repeat(200)]).len(), MAX_JOB_NAME_LEN);
    }

    #[test]
    fn meta_record_fields() {
        let run = RunName::parse("220321_M01234_0042_000000000-ABCDE").unwrap();
        let at = Local::now();
        let meta = MetaRecord::new("FZ2000", &run, at);
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["project_code"], "FZ2000");
        assert_eq!(value["instrument_id"], "M01234");
        assert_eq!(value["run_number"], "0042");
        assert_eq!(value["run_id"], "M01234_0042");
        assert_eq!(value["flowcell_id"], "000000000-ABCDE");
        assert_eq!(value["sequence_date"], "2022-03-21");
        assert!(value["upload_time"].as_str().unwrap().starts_with(&at.format("%Y-%m-%d").to_string()));
        assert_eq!(value.as_object().unwrap().len(), 7);
    }

    #[test]
    fn project_groups_need_fastq_gz() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (project, file) in [
            ("SB4030", "a_S1_R1_001.fastq.gz"),
            ("FZ2000", "b_S1_R1_001.fastq.gz"),
            ("Reports", "index.html"),
        ] {
            fs::create_dir(root.join(project)).unwrap();
            fs::write(root.join(project).join(file), b"x").unwrap();
        }
        fs::create_dir(root.join("Empty")).unwrap();
        fs::write(root.join("Undetermined_S0_R1_001.fastq.gz"), b"x").unwrap();

        let groups = project_groups(root).unwrap();
        let codes: Vec<_> = groups.iter().map(|g| g.project_code.as_str()).collect();
        assert_eq!(codes, vec!["FZ2000", "SB4030"]);
    }

    #[test]
    fn copy_tree_refuses_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("run");
        fs::create_dir_all(source.join("Data/Intensities")).unwrap();
        fs::write(source.join("SampleSheet.csv"), b"sheet").unwrap();
        fs::write(source.join("Data/Intensities/L001.bcl"), b"bcl").unwrap();
        let dest = dir.path().join("backup");

        copy_tree_exclusive(&source, &dest).unwrap();
        assert_eq!(fs::read(dest.join("SampleSheet.csv")).unwrap(), b"sheet");
        assert_eq!(fs::read(dest.join("Data/Intensities/L001.bcl")).unwrap(), b"bcl");

        fs::write(source.join("SampleSheet.csv"), b"changed").unwrap();
        let err = copy_tree_exclusive(&source, &dest).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(fs::read(dest.join("SampleSheet.csv")).unwrap(), b"sheet");
    }

    #[test]
    fn copy_tree_requires_source_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = copy_tree_exclusive(&dir.path().join("missing"), &dir.path().join("dest")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!dir.path().join("dest").exists());
    }

    #[test]
    fn job_request_layout() {
        let pipeline = PipelineConfig {
            name: "salmonella".to_string(),
            project_codes: vec!["FZ2000".to_string()],
            job_queue: "q".to_string(),
            job_definition: "d".to_string(),
            output_bucket: "results".to_string(),
            output_prefix: "salmonella/v1".to_string(),
            ..PipelineConfig::default()
        };
        let upload = UploadedGroup {
            project_code: "FZ2000".to_string(),
            local_dir: PathBuf::from("/fastq/run/FZ2000"),
            bucket: "s3-csu-001".to_string(),
            key: "FZ2000/M1_0042".to_string(),
        };
        let request = build_job_request(&pipeline, &upload, "M1_0042", "20220321120000");
        assert_eq!(request.input_uri, "s3://s3-csu-001/FZ2000/M1_0042/");
        assert_eq!(
            request.output_uri,
            "s3://results/salmonella/v1/FZ2000/M1_0042/20220321120000/"
        );
        assert_eq!(request.job_name, "salmonella-FZ2000-M1_0042");
        assert!(request.validate().is_ok());
    }
}
