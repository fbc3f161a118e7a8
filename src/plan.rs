//! Execution plan construction.
//!
//! The plan builder classifies a selection of records and groups them into
//! phase buckets, ordered by phase rather than by input order, so that each
//! phase operation runs once per bucket and no record skips a phase.

use crate::phase::{Operation, Phase, PhaseStep, classify};
use crate::record::{Record, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Records sharing a phase, processed together by one phase operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseBucket {
    /// Current phase of every record in the bucket.
    pub phase: Phase,
    pub record_ids: Vec<RecordId>,
}

impl PhaseBucket {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            record_ids: Vec::new(),
        }
    }

    /// The transition this bucket performs. Buckets are never built for the
    /// terminal phase.
    pub fn step(&self) -> Option<&'static PhaseStep> {
        self.phase.step()
    }

    pub fn operation(&self) -> Option<Operation> {
        self.step().map(|s| s.operation)
    }

    pub fn requires_human_input(&self) -> bool {
        self.phase.is_gated()
    }

    pub fn len(&self) -> usize {
        self.record_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_ids.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.record_ids.contains(id)
    }
}

/// Why a record was left out of every bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Already approved.
    Complete,
    /// At or beyond the requested target phase.
    ReachedTarget,
    /// Carries an error marker.
    Errored(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub id: RecordId,
    pub phase: Phase,
    pub reason: SkipReason,
}

/// An ordered list of phase buckets plus the records that need no work.
///
/// Every distinct input id appears in exactly one bucket or in `skipped`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub buckets: Vec<PhaseBucket>,
    pub skipped: Vec<SkippedRecord>,
    /// Records stop advancing once they reach this phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Phase>,
}

impl ExecutionPlan {
    /// True when there is no work to do.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    /// The phase records stop at: the target if given, otherwise approval.
    pub fn stop_phase(&self) -> Phase {
        self.target.unwrap_or(Phase::Approved)
    }

    /// Number of records covered by the plan, scheduled or skipped.
    pub fn total(&self) -> usize {
        self.scheduled() + self.skipped.len()
    }

    /// Number of records placed in a bucket.
    pub fn scheduled(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// All scheduled ids in bucket order.
    pub fn record_ids(&self) -> impl Iterator<Item = &RecordId> {
        self.buckets.iter().flat_map(|b| b.record_ids.iter())
    }

    pub fn bucket_for(&self, phase: Phase) -> Option<&PhaseBucket> {
        self.buckets.iter().find(|b| b.phase == phase)
    }

    pub fn is_skipped(&self, id: &RecordId) -> bool {
        self.skipped.iter().any(|s| &s.id == id)
    }

    /// Records in buckets whose operation runs unattended.
    pub fn auto_processable(&self) -> usize {
        self.buckets
            .iter()
            .filter(|b| !b.requires_human_input())
            .map(|b| b.len())
            .sum()
    }

    /// Records in buckets that wait for a human.
    pub fn manual_required(&self) -> usize {
        self.buckets
            .iter()
            .filter(|b| b.requires_human_input())
            .map(|b| b.len())
            .sum()
    }
}

/// Build an execution plan over `records`.
///
/// Records at or beyond `Approved` (or `target`, when given) and records with
/// an error marker go to `skipped`. The rest are bucketed by phase, earliest
/// phase first; input order is kept within a bucket. Duplicate ids collapse
/// to their first occurrence.
pub fn build_plan(records: &[Record], target: Option<Phase>) -> ExecutionPlan {
    let stop = target.unwrap_or(Phase::Approved);
    let mut seen: HashSet<&RecordId> = HashSet::new();
    let mut grouped: BTreeMap<Phase, Vec<RecordId>> = BTreeMap::new();
    let mut skipped = Vec::new();

    for record in records {
        if !seen.insert(&record.id) {
            continue;
        }

        let phase = classify(record);

        if record.is_errored() {
            skipped.push(SkippedRecord {
                id: record.id.clone(),
                phase,
                reason: SkipReason::Errored(record.error.clone().unwrap_or_default()),
            });
        } else if phase.is_terminal() {
            skipped.push(SkippedRecord {
                id: record.id.clone(),
                phase,
                reason: SkipReason::Complete,
            });
        } else if phase >= stop {
            skipped.push(SkippedRecord {
                id: record.id.clone(),
                phase,
                reason: SkipReason::ReachedTarget,
            });
        } else {
            grouped.entry(phase).or_default().push(record.id.clone());
        }
    }

    let buckets = grouped
        .into_iter()
        .map(|(phase, record_ids)| PhaseBucket { phase, record_ids })
        .collect();

    ExecutionPlan {
        buckets,
        skipped,
        target,
    }
}
