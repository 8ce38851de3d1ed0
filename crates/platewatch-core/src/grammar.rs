//! Naming-convention grammar for run folders and read-file keys.
//!
//! All filename parsing in platewatch goes through this module so that a
//! change of naming convention only touches one place. Each pattern belongs
//! to a [`GrammarVersion`]; the lifecycle and pairing code never hold their
//! own regexes.
//!
//! # Read-file keys (seven groups)
//!
//! ```text
//! {project_code}/{sequencer}_{run_id}/{sample}[_S{well}][_...]_R{1|2}_{lane}.fastq.gz
//! ```
//!
//! | Group | Field | Optional |
//! |-------|-------|----------|
//! | 1 | project code | no |
//! | 2 | sequencer id | yes |
//! | 3 | run id | no |
//! | 4 | sample name | no |
//! | 5 | well | yes |
//! | 6 | read number | no |
//! | 7 | lane | no |
//!
//! # Run folders (five groups)
//!
//! ```text
//! {yymmdd}_{instrument_id}_{run_number}_{flowcell_id}
//! ```
//!
//! Group 2 is the run id (`{instrument_id}_{run_number}`), groups 3 and 4 its
//! halves, group 5 the flowcell.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sequencer name used when a read-file key carries only a run id.
pub const UNKNOWN_SEQUENCER: &str = "UnknownSequencer";

/// Date layout of the first run-folder field.
pub const SEQUENCE_DATE_FORMAT: &str = "%y%m%d";

/// Versions of the naming convention understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrammarVersion {
    /// Underscore-delimited run folders, `_R{n}_{lane}.fastq.gz` read files.
    V1,
}

/// Grammar used by the lifecycle engine and the pairing code.
pub const CURRENT_GRAMMAR: GrammarVersion = GrammarVersion::V1;

impl GrammarVersion {
    /// Regex source for read-file keys.
    #[must_use]
    pub const fn read_key_pattern(self) -> &'static str {
        match self {
            Self::V1 => r"(.+)/(?:(.+)_)?(\w+)/([^_]+)(?:_S(\d+))?(?:.+)?_R(\d)_(\d+)\.fastq\.gz",
        }
    }

    /// Regex source for run-folder names.
    #[must_use]
    pub const fn run_name_pattern(self) -> &'static str {
        match self {
            Self::V1 => r"(.+)_((.+)_(.+))_(.+)",
        }
    }

    /// Regex source for submission numbers embedded in sample names.
    #[must_use]
    pub const fn submission_pattern(self) -> &'static str {
        match self {
            Self::V1 => r"\d{2}-\d{4,5}-\d{2}",
        }
    }

    fn read_key_regex(self) -> &'static Regex {
        match self {
            Self::V1 => &V1_READ_KEY,
        }
    }

    fn run_name_regex(self) -> &'static Regex {
        match self {
            Self::V1 => &V1_RUN_NAME,
        }
    }

    fn submission_regex(self) -> &'static Regex {
        match self {
            Self::V1 => &V1_SUBMISSION,
        }
    }

    /// Parse a read-file key.
    ///
    /// Returns `None` unless the key matches exactly once.
    #[must_use]
    pub fn parse_read_key(self, key: &str) -> Option<ReadKeyFields> {
        let mut matches = self.read_key_regex().captures_iter(key);
        let caps = matches.next()?;
        if matches.next().is_some() {
            return None;
        }

        let group = |i: usize| caps.get(i).map(|m| m.as_str().to_string());
        Some(ReadKeyFields {
            project_code: group(1)?,
            sequencer: group(2),
            run_id: group(3)?,
            sample_name: group(4)?,
            well: group(5),
            read: group(6)?,
            lane: group(7)?,
        })
    }

    /// Parse a run-folder name such as `220321_M01234_0042_000000000-ABCDE`.
    pub fn parse_run_name(self, name: &str) -> Result<RunName, GrammarError> {
        let caps = self
            .run_name_regex()
            .captures(name)
            .ok_or_else(|| GrammarError::RunName {
                name: name.to_string(),
            })?;

        let field = |i: usize| {
            caps.get(i)
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| GrammarError::RunName {
                    name: name.to_string(),
                })
        };

        let date_field = field(1)?;
        let sequence_date = NaiveDate::parse_from_str(&date_field, SEQUENCE_DATE_FORMAT)
            .map_err(|source| GrammarError::SequenceDate {
                name: name.to_string(),
                value: date_field.clone(),
                source,
            })?;

        Ok(RunName {
            name: name.to_string(),
            sequence_date,
            run_id: field(2)?,
            instrument_id: field(3)?,
            run_number: field(4)?,
            flowcell_id: field(5)?,
        })
    }

    /// Submission number embedded in a sample name, or the name itself.
    #[must_use]
    pub fn extract_submission(self, sample_name: &str) -> String {
        self.submission_regex()
            .find(sample_name)
            .map_or_else(|| sample_name.to_string(), |m| m.as_str().to_string())
    }
}

static V1_READ_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(GrammarVersion::V1.read_key_pattern()).expect("v1 read-key pattern compiles")
});
static V1_RUN_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(GrammarVersion::V1.run_name_pattern()).expect("v1 run-name pattern compiles")
});
static V1_SUBMISSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(GrammarVersion::V1.submission_pattern()).expect("v1 submission pattern compiles")
});

/// Grammar failures.
#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("run folder {name:?} does not match {{yymmdd}}_{{instrument}}_{{run}}_{{flowcell}}")]
    RunName { name: String },

    #[error("run folder {name:?} has invalid sequence date {value:?}: {source}")]
    SequenceDate {
        name: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

impl From<GrammarError> for crate::Error {
    fn from(err: GrammarError) -> Self {
        Self::MetadataParse(err.to_string())
    }
}

/// The seven captured fields of a read-file key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadKeyFields {
    pub project_code: String,
    pub sequencer: Option<String>,
    pub run_id: String,
    pub sample_name: String,
    pub well: Option<String>,
    pub read: String,
    pub lane: String,
}

impl ReadKeyFields {
    /// True when `self` is read 1 and `other` its read 2 mate.
    ///
    /// Every field except the read number has to agree.
    #[must_use]
    pub fn is_mate_of(&self, other: &Self) -> bool {
        self.read == "1"
            && other.read == "2"
            && self.project_code == other.project_code
            && self.sequencer == other.sequencer
            && self.run_id == other.run_id
            && self.sample_name == other.sample_name
            && self.well == other.well
            && self.lane == other.lane
    }

    /// Sequencer id, defaulting to [`UNKNOWN_SEQUENCER`].
    #[must_use]
    pub fn sequencer_or_unknown(&self) -> &str {
        self.sequencer.as_deref().unwrap_or(UNKNOWN_SEQUENCER)
    }
}

/// Parsed run-folder name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunName {
    /// The folder name as given.
    pub name: String,
    pub sequence_date: NaiveDate,
    /// `{instrument_id}_{run_number}`
    pub run_id: String,
    pub instrument_id: String,
    pub run_number: String,
    pub flowcell_id: String,
}

impl RunName {
    /// Parse with the current grammar.
    pub fn parse(name: &str) -> Result<Self, GrammarError> {
        CURRENT_GRAMMAR.parse_run_name(name)
    }

    /// `YYYY-MM-DD`
    #[must_use]
    pub fn sequence_date_iso(&self) -> String {
        self.sequence_date.format("%Y-%m-%d").to_string()
    }
}

/// Parse a read-file key with the current grammar.
#[must_use]
pub fn parse_read_key(key: &str) -> Option<ReadKeyFields> {
    CURRENT_GRAMMAR.parse_read_key(key)
}

/// Extract a submission number with the current grammar.
#[must_use]
pub fn extract_submission(sample_name: &str) -> String {
    CURRENT_GRAMMAR.extract_submission(sample_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_key_seven_groups() {
        let fields = parse_read_key("proj/SEQ_RUN/sample1_S1_R1_001.fastq.gz").unwrap();
        assert_eq!(fields.project_code, "proj");
        assert_eq!(fields.sequencer.as_deref(), Some("SEQ"));
        assert_eq!(fields.run_id, "RUN");
        assert_eq!(fields.sample_name, "sample1");
        assert_eq!(fields.well.as_deref(), Some("1"));
        assert_eq!(fields.read, "1");
        assert_eq!(fields.lane, "001");
    }

    #[test]
    fn read_key_without_sequencer_or_well() {
        let fields = parse_read_key("SB4030/10018/AF-12-03456-19_R2_001.fastq.gz").unwrap();
        assert_eq!(fields.project_code, "SB4030");
        assert_eq!(fields.sequencer, None);
        assert_eq!(fields.sequencer_or_unknown(), UNKNOWN_SEQUENCER);
        assert_eq!(fields.run_id, "10018");
        assert_eq!(fields.sample_name, "AF-12-03456-19");
        assert_eq!(fields.well, None);
        assert_eq!(fields.read, "2");
    }

    #[test]
    fn read_key_with_extra_tokens_before_read() {
        let fields = parse_read_key("p/M1_R7/abc_S12_L001_R1_001.fastq.gz").unwrap();
        assert_eq!(fields.sample_name, "abc");
        assert_eq!(fields.well.as_deref(), Some("12"));
        assert_eq!(fields.read, "1");
        assert_eq!(fields.lane, "001");
    }

    #[test]
    fn nested_project_prefix_is_greedy() {
        let fields = parse_read_key("bucket/SB4020-TB/M1_R9/s_S3_R1_001.fastq.gz").unwrap();
        assert_eq!(fields.project_code, "bucket/SB4020-TB");
        assert_eq!(fields.run_id, "R9");
    }

    #[test]
    fn read_key_rejects_other_files() {
        assert!(parse_read_key("proj/SEQ_RUN/sample1_S1_R1_001.fastq").is_none());
        assert!(parse_read_key("proj/SEQ_RUN/SampleSheet.csv").is_none());
        assert!(parse_read_key("sample1_S1_R1_001.fastq.gz").is_none());
        assert!(parse_read_key("").is_none());
    }

    #[test]
    fn mates_must_agree_on_everything_but_read() {
        let r1 = parse_read_key("p/S_R/x_S1_R1_001.fastq.gz").unwrap();
        let r2 = parse_read_key("p/S_R/x_S1_R2_001.fastq.gz").unwrap();
        let other_well = parse_read_key("p/S_R/x_S2_R2_001.fastq.gz").unwrap();
        assert!(r1.is_mate_of(&r2));
        assert!(!r2.is_mate_of(&r1));
        assert!(!r1.is_mate_of(&other_well));
        assert!(!r1.is_mate_of(&r1));
    }

    #[test]
    fn run_name_five_groups() {
        let run = RunName::parse("220321_M01234_0042_000000000-ABCDE").unwrap();
        assert_eq!(run.sequence_date, NaiveDate::from_ymd_opt(2022, 3, 21).unwrap());
        assert_eq!(run.sequence_date_iso(), "2022-03-21");
        assert_eq!(run.run_id, "M01234_0042");
        assert_eq!(run.instrument_id, "M01234");
        assert_eq!(run.run_number, "0042");
        assert_eq!(run.flowcell_id, "000000000-ABCDE");
    }

    #[test]
    fn run_name_rejects_short_names() {
        assert!(matches!(
            RunName::parse("220321_M01234_0042"),
            Err(GrammarError::RunName { .. })
        ));
        assert!(RunName::parse("plate").is_err());
    }

    #[test]
    fn run_name_rejects_bad_date() {
        let err = RunName::parse("22x321_M01234_0042_FC").unwrap_err();
        assert!(matches!(err, GrammarError::SequenceDate { .. }));
        let err: crate::Error = err.into();
        assert!(matches!(err, crate::Error::MetadataParse(_)));
    }

    #[test]
    fn submission_number_extraction() {
        assert_eq!(extract_submission("AF-12-03456-19"), "12-03456-19");
        assert_eq!(extract_submission("AF-12-3456-19x"), "12-3456-19");
        assert_eq!(extract_submission("sample1"), "sample1");
    }

    #[test]
    fn pattern_sources_are_stable() {
        assert!(CURRENT_GRAMMAR.read_key_pattern().contains(r"_R(\d)_(\d+)\.fastq\.gz"));
        assert_eq!(Regex::new(CURRENT_GRAMMAR.read_key_pattern()).unwrap().captures_len(), 8);
        assert_eq!(Regex::new(CURRENT_GRAMMAR.run_name_pattern()).unwrap().captures_len(), 6);
    }
}
