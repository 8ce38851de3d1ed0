//! Plate identity and tier layout.
//!
//! A plate is one run folder produced by the sequencer. The three tiers
//! (raw intake, backup, converted) each hold at most one directory per
//! plate, named by `plate_id`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::grammar::RunName;
use crate::{Error, Result};

/// Storage tier holding a copy or derivative of a plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Sequencer output under the watched root.
    Raw,
    /// Untouched copy of the raw run folder.
    Backup,
    /// Converted FASTQ output, one subdirectory per project.
    Converted,
}

impl Tier {
    pub const ALL: [Self; 3] = [Self::Raw, Self::Backup, Self::Converted];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Backup => "backup",
            Self::Converted => "converted",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root directories of the three tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierRoots {
    /// Watched intake directory (raw tier).
    pub watch: PathBuf,
    /// Raw backups, one directory per plate.
    pub backup: PathBuf,
    /// Converted FASTQ output, one directory per plate.
    pub converted: PathBuf,
}

impl Default for TierRoots {
    fn default() -> Self {
        Self {
            watch: PathBuf::from("/Illumina/IncomingRuns"),
            backup: PathBuf::from("/Illumina/OutputFastq/BclRuns"),
            converted: PathBuf::from("/Illumina/OutputFastq/FastqRuns"),
        }
    }
}

impl TierRoots {
    #[must_use]
    pub fn new(
        watch: impl Into<PathBuf>,
        backup: impl Into<PathBuf>,
        converted: impl Into<PathBuf>,
    ) -> Self {
        Self {
            watch: watch.into(),
            backup: backup.into(),
            converted: converted.into(),
        }
    }

    #[must_use]
    pub fn root(&self, tier: Tier) -> &Path {
        match tier {
            Tier::Raw => &self.watch,
            Tier::Backup => &self.backup,
            Tier::Converted => &self.converted,
        }
    }

    /// `{root}/{plate_id}` for the given tier.
    #[must_use]
    pub fn plate_dir(&self, tier: Tier, plate_id: &str) -> PathBuf {
        self.root(tier).join(plate_id)
    }
}

/// One sequencer run folder.
///
/// Immutable once created; tiers refer to it by `plate_id` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plate {
    plate_id: String,
    source_path: PathBuf,
    run: Option<RunName>,
}

impl Plate {
    /// Build a plate from its raw source directory.
    ///
    /// The plate id is the directory basename. The run name is parsed
    /// eagerly but a non-conforming name is only fatal at upload time.
    pub fn from_source(source_path: impl Into<PathBuf>) -> Result<Self> {
        let source_path = source_path.into();
        let plate_id = source_path
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Error::MetadataParse(format!(
                    "cannot derive a plate id from {}",
                    source_path.display()
                ))
            })?
            .to_string();
        let run = RunName::parse(&plate_id).ok();
        Ok(Self {
            plate_id,
            source_path,
            run,
        })
    }

    #[must_use]
    pub fn plate_id(&self) -> &str {
        &self.plate_id
    }

    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Parsed run name, if the plate id follows the naming convention.
    #[must_use]
    pub fn run(&self) -> Option<&RunName> {
        self.run.as_ref()
    }

    /// Parsed run name, or the grammar error for this plate id.
    pub fn require_run(&self) -> Result<&RunName> {
        match &self.run {
            Some(run) => Ok(run),
            None => Err(RunName::parse(&self.plate_id)
                .err()
                .map_or_else(
                    || Error::MetadataParse(format!("unparsable plate id {}", self.plate_id)),
                    Error::from,
                )),
        }
    }
}

impl fmt::Display for Plate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.plate_id)
    }
}
