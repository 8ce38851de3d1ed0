//! Read-file pairing and batch summaries.
//!
//! Groups raw read-file keys into samples (read 1 + read 2) and samples
//! into batches (`{sequencer}_{run_id}`). Every input key ends up in exactly
//! one of `samples` (two keys per sample), `unpaired` or `not_parsed`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::grammar::{self, ReadKeyFields};

/// One paired specimen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub project_code: String,
    pub sequencer: String,
    pub run_id: String,
    pub sample_name: String,
    pub submission: String,
    pub well: Option<String>,
    pub lane: String,
    pub read_1: String,
    pub read_2: String,
    pub batch_id: String,
}

impl Sample {
    fn from_mates(fields: ReadKeyFields, read_1: String, read_2: String) -> Self {
        let sequencer = fields.sequencer_or_unknown().to_string();
        let batch_id = format!("{sequencer}_{}", fields.run_id);
        Self {
            submission: grammar::extract_submission(&fields.sample_name),
            project_code: fields.project_code,
            sequencer,
            run_id: fields.run_id,
            sample_name: fields.sample_name,
            well: fields.well,
            lane: fields.lane,
            read_1,
            read_2,
            batch_id,
        }
    }
}

/// Why a key did not become part of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// Parsed, but no mate was adjacent after sorting.
    Unpaired,
    /// Does not follow the read-file grammar.
    NotParsed,
}

/// A key that could not be parsed or paired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedRecord {
    pub key: String,
    pub reason: UnresolvedReason,
}

/// Result of pairing a list of keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingReport {
    pub samples: Vec<Sample>,
    pub unpaired: Vec<String>,
    pub not_parsed: Vec<String>,
}

impl PairingReport {
    /// Number of input keys accounted for.
    #[must_use]
    pub fn total_keys(&self) -> usize {
        self.samples.len() * 2 + self.unpaired.len() + self.not_parsed.len()
    }

    /// Unpaired keys followed by unparsed keys.
    pub fn unresolved(&self) -> impl Iterator<Item = UnresolvedRecord> + '_ {
        let unpaired = self.unpaired.iter().map(|key| UnresolvedRecord {
            key: key.clone(),
            reason: UnresolvedReason::Unpaired,
        });
        let not_parsed = self.not_parsed.iter().map(|key| UnresolvedRecord {
            key: key.clone(),
            reason: UnresolvedReason::NotParsed,
        });
        unpaired.chain(not_parsed)
    }

    #[must_use]
    pub fn batches(&self) -> Vec<BatchSummary> {
        summarize_batches(&self.samples)
    }
}

/// Pair read-file keys into samples.
///
/// Keys are sorted first, which puts R1/R2 mates next to each other. Two
/// keys are taken from the front at a time: a key that does not parse is
/// set aside and its partner goes back to the front; two parsed keys that
/// are not mates set the first aside as unpaired and push the second back.
pub fn pair_keys<I, S>(keys: I) -> PairingReport
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut sorted: Vec<String> = keys.into_iter().map(Into::into).collect();
    sorted.sort();
    let mut queue: VecDeque<String> = sorted.into();

    let mut report = PairingReport::default();

    while queue.len() >= 2 {
        let (Some(key_1), Some(key_2)) = (queue.pop_front(), queue.pop_front()) else {
            break;
        };

        let Some(fields_1) = grammar::parse_read_key(&key_1) else {
            report.not_parsed.push(key_1);
            queue.push_front(key_2);
            continue;
        };
        let Some(fields_2) = grammar::parse_read_key(&key_2) else {
            report.not_parsed.push(key_2);
            queue.push_front(key_1);
            continue;
        };

        if !fields_1.is_mate_of(&fields_2) {
            report.unpaired.push(key_1);
            queue.push_front(key_2);
            continue;
        }

        report
            .samples
            .push(Sample::from_mates(fields_1, key_1, key_2));
    }

    report.unpaired.extend(queue);
    report
}

/// A batch field that took more than one value within one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConflict {
    pub field: String,
    pub values: Vec<String>,
}

/// Summary of the samples sharing one `{sequencer}_{run_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub sequencer: String,
    pub run_id: String,
    pub project_code: String,
    pub num_samples: usize,
    /// Parent path of the batch's greatest read-1 key, with trailing `/`.
    pub prefix: String,
    /// Fields that disagree across the batch; empty for a consistent batch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<BatchConflict>,
}

impl BatchSummary {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Group samples by batch id, sorted by batch id.
///
/// Where a batch disagrees on sequencer, run id or project code the
/// greatest value is reported and the disagreement is recorded in
/// `conflicts`.
#[must_use]
pub fn summarize_batches(samples: &[Sample]) -> Vec<BatchSummary> {
    let mut groups: BTreeMap<&str, Vec<&Sample>> = BTreeMap::new();
    for sample in samples {
        groups.entry(sample.batch_id.as_str()).or_default().push(sample);
    }

    groups
        .into_iter()
        .map(|(batch_id, members)| {
            let mut conflicts = Vec::new();
            let sequencer = consistent_field(&members, "sequencer", |s| &s.sequencer, &mut conflicts);
            let run_id = consistent_field(&members, "run_id", |s| &s.run_id, &mut conflicts);
            let project_code =
                consistent_field(&members, "project_code", |s| &s.project_code, &mut conflicts);

            let max_read_1 = members
                .iter()
                .map(|s| s.read_1.as_str())
                .max()
                .unwrap_or_default();
            let parent = max_read_1.rsplit_once('/').map_or("", |(parent, _)| parent);

            if !conflicts.is_empty() {
                warn!(
                    batch_id,
                    conflicts = ?conflicts,
                    "Batch has inconsistent sample metadata"
                );
            }

            BatchSummary {
                batch_id: batch_id.to_string(),
                sequencer,
                run_id,
                project_code,
                num_samples: members.len(),
                prefix: format!("{parent}/"),
                conflicts,
            }
        })
        .collect()
}

fn consistent_field<'a>(
    members: &[&'a Sample],
    field: &str,
    get: impl Fn(&'a Sample) -> &'a String,
    conflicts: &mut Vec<BatchConflict>,
) -> String {
    let values: BTreeSet<&String> = members.iter().map(|&s| get(s)).collect();
    if values.len() > 1 {
        conflicts.push(BatchConflict {
            field: field.to_string(),
            values: values.iter().map(|v| (*v).clone()).collect(),
        });
    }
    values.last().map(|v| (*v).clone()).unwrap_or_default()
}

/// Pairing report for the keys of one bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSummary {
    pub bucket: String,
    pub report: PairingReport,
    pub batches: Vec<BatchSummary>,
}

impl BucketSummary {
    #[must_use]
    pub fn from_keys(bucket: impl Into<String>, keys: Vec<String>) -> Self {
        let report = pair_keys(keys);
        let batches = report.batches();
        Self {
            bucket: bucket.into(),
            report,
            batches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const R1: &str = "proj/SEQ_RUN/sample1_S1_R1_001.fastq.gz";
    const R2: &str = "proj/SEQ_RUN/sample1_S1_R2_001.fastq.gz";

    #[test]
    fn pairs_adjacent_mates() {
        let report = pair_keys([R2, R1]);
        assert_eq!(report.samples.len(), 1);
        let sample = &report.samples[0];
        assert_eq!(sample.read_1, R1);
        assert_eq!(sample.read_2, R2);
        assert_eq!(sample.project_code, "proj");
        assert_eq!(sample.sequencer, "SEQ");
        assert_eq!(sample.run_id, "RUN");
        assert_eq!(sample.sample_name, "sample1");
        assert_eq!(sample.well.as_deref(), Some("1"));
        assert_eq!(sample.lane, "001");
        assert_eq!(sample.batch_id, "SEQ_RUN");
        assert!(report.unpaired.is_empty());
        assert!(report.not_parsed.is_empty());
    }

    #[test]
    fn different_wells_are_both_unpaired() {
        let report = pair_keys([
            "proj/SEQ_RUN/sample1_S1_R1_001.fastq.gz",
            "proj/SEQ_RUN/sample1_S2_R2_001.fastq.gz",
        ]);
        assert!(report.samples.is_empty());
        assert_eq!(report.unpaired.len(), 2);
        assert_eq!(report.total_keys(), 2);
    }

    #[test]
    fn unparsable_key_does_not_break_following_pair() {
        let report = pair_keys(["proj/SEQ_RUN/README.txt", R1, R2]);
        assert_eq!(report.samples.len(), 1);
        assert_eq!(report.not_parsed, vec!["proj/SEQ_RUN/README.txt".to_string()]);
        assert!(report.unpaired.is_empty());
    }

    #[test]
    fn second_key_unparsable_keeps_first() {
        // sorts between R1 and R2
        let report = pair_keys([R1, R2, "proj/SEQ_RUN/sample1_S1_R1_001.txt"]);
        assert_eq!(report.samples.len(), 1);
        assert_eq!(report.not_parsed.len(), 1);
        assert_eq!(report.total_keys(), 3);
    }

    #[test]
    fn odd_leftover_is_unpaired() {
        let report = pair_keys([R1, R2, "proj/SEQ_RUN/sample2_S2_R1_001.fastq.gz"]);
        assert_eq!(report.samples.len(), 1);
        assert_eq!(
            report.unpaired,
            vec!["proj/SEQ_RUN/sample2_S2_R1_001.fastq.gz".to_string()]
        );
    }

    #[test]
    fn unresolved_records_cover_both_lists() {
        let report = pair_keys(["x", "proj/SEQ_RUN/sample2_S2_R1_001.fastq.gz"]);
        let records: Vec<_> = report.unresolved().collect();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.reason == UnresolvedReason::NotParsed && r.key == "x"));
        assert!(records.iter().any(|r| r.reason == UnresolvedReason::Unpaired));
    }

    #[test]
    fn missing_sequencer_defaults() {
        let report = pair_keys([
            "SB4030/10018/AF-12-03456-19_R1_001.fastq.gz",
            "SB4030/10018/AF-12-03456-19_R2_001.fastq.gz",
        ]);
        let sample = &report.samples[0];
        assert_eq!(sample.sequencer, grammar::UNKNOWN_SEQUENCER);
        assert_eq!(sample.batch_id, "UnknownSequencer_10018");
        assert_eq!(sample.submission, "12-03456-19");
        assert_eq!(sample.well, None);
    }

    #[test]
    fn batch_summary_groups_and_prefixes() {
        let report = pair_keys([
            R1,
            R2,
            "proj/SEQ_RUN/sample2_S2_R1_001.fastq.gz",
            "proj/SEQ_RUN/sample2_S2_R2_001.fastq.gz",
            "other/M9_R5/s_S1_R1_001.fastq.gz",
            "other/M9_R5/s_S1_R2_001.fastq.gz",
        ]);
        let batches = report.batches();
        assert_eq!(batches.len(), 2);

        assert_eq!(batches[0].batch_id, "M9_R5");
        assert_eq!(batches[0].num_samples, 1);
        assert_eq!(batches[0].prefix, "other/M9_R5/");

        assert_eq!(batches[1].batch_id, "SEQ_RUN");
        assert_eq!(batches[1].num_samples, 2);
        assert_eq!(batches[1].project_code, "proj");
        assert_eq!(batches[1].prefix, "proj/SEQ_RUN/");
        assert!(batches[1].is_consistent());
    }

    #[test]
    fn batch_summary_flags_mixed_projects() {
        let report = pair_keys([
            "projA/SEQ_RUN/a_S1_R1_001.fastq.gz",
            "projA/SEQ_RUN/a_S1_R2_001.fastq.gz",
            "projB/SEQ_RUN/b_S2_R1_001.fastq.gz",
            "projB/SEQ_RUN/b_S2_R2_001.fastq.gz",
        ]);
        let batches = report.batches();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert!(!batch.is_consistent());
        assert_eq!(batch.conflicts[0].field, "project_code");
        assert_eq!(batch.conflicts[0].values, vec!["projA", "projB"]);
        assert_eq!(batch.project_code, "projB");
    }

    #[test]
    fn bucket_summary_tags_bucket() {
        let summary = BucketSummary::from_keys("s3-bucket", vec![R1.to_string(), R2.to_string()]);
        assert_eq!(summary.bucket, "s3-bucket");
        assert_eq!(summary.batches.len(), 1);
        assert_eq!(summary.report.samples.len(), 1);
    }
}
