//! Phase definitions and the phase classifier.
//!
//! This module provides:
//! - `Phase`, the totally ordered enrichment stages a record moves through
//! - `PHASE_TABLE`, one `PhaseStep` per transition with its operation and gate flag
//! - `classify`/`inspect`, the pure record → phase derivation
//! - `summarize`, per-phase counts over a selection
//!
//! Phase is never stored. It is recomputed from a record's marker fields
//! every time it is needed.

use crate::record::{Marker, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stage of a record in its enrichment lifecycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Scraped,
    Translated,
    Searching,
    CandidateSelected,
    DetailsFetched,
    Audited,
    Approved,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Scraped,
        Phase::Translated,
        Phase::Searching,
        Phase::CandidateSelected,
        Phase::DetailsFetched,
        Phase::Audited,
        Phase::Approved,
    ];

    /// Position in the pipeline, 0-based.
    pub fn number(&self) -> usize {
        *self as usize
    }

    pub fn label(&self) -> &'static str {
        match self {
            Phase::Scraped => "Scraped",
            Phase::Translated => "Translated",
            Phase::Searching => "Searching",
            Phase::CandidateSelected => "Candidate selected",
            Phase::DetailsFetched => "Details fetched",
            Phase::Audited => "Audited",
            Phase::Approved => "Approved",
        }
    }

    pub fn next(&self) -> Option<Phase> {
        Phase::ALL.get(self.number() + 1).copied()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Approved)
    }

    /// The transition leaving this phase, if any.
    pub fn step(&self) -> Option<&'static PhaseStep> {
        PHASE_TABLE.iter().find(|s| s.from == *self)
    }

    /// Whether leaving this phase needs a human decision.
    pub fn is_gated(&self) -> bool {
        self.step().is_some_and(|s| s.requires_human_input)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Scraped => "scraped",
            Phase::Translated => "translated",
            Phase::Searching => "searching",
            Phase::CandidateSelected => "candidate_selected",
            Phase::DetailsFetched => "details_fetched",
            Phase::Audited => "audited",
            Phase::Approved => "approved",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        Phase::ALL
            .into_iter()
            .find(|p| p.to_string() == normalized)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid phase '{}'. Valid values: scraped, translated, searching, candidate_selected, details_fetched, audited, approved",
                    s
                )
            })
    }
}

/// Identifier of the external operation that performs a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Translate,
    SearchComparables,
    SelectCandidate,
    FetchDetails,
    Audit,
    Approve,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Translate => "translate",
            Operation::SearchComparables => "search_comparables",
            Operation::SelectCandidate => "select_candidate",
            Operation::FetchDetails => "fetch_details",
            Operation::Audit => "audit",
            Operation::Approve => "approve",
        };
        f.write_str(name)
    }
}

/// One entry of the phase table: how a record leaves `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseStep {
    pub from: Phase,
    pub to: Phase,
    pub operation: Operation,
    /// The decision is external; the pipeline halts here.
    pub requires_human_input: bool,
    /// Markers that must be true for the transition to count as done.
    pub completes: &'static [Marker],
}

impl PhaseStep {
    pub fn is_complete(&self, record: &Record) -> bool {
        self.completes.iter().all(|m| record.markers.is_set(*m))
    }
}

pub const PHASE_TABLE: [PhaseStep; 6] = [
    PhaseStep {
        from: Phase::Scraped,
        to: Phase::Translated,
        operation: Operation::Translate,
        requires_human_input: false,
        completes: &[Marker::Translation],
    },
    PhaseStep {
        from: Phase::Translated,
        to: Phase::Searching,
        operation: Operation::SearchComparables,
        requires_human_input: false,
        completes: &[Marker::SearchResult],
    },
    PhaseStep {
        from: Phase::Searching,
        to: Phase::CandidateSelected,
        operation: Operation::SelectCandidate,
        requires_human_input: true,
        completes: &[Marker::ChosenCandidate],
    },
    PhaseStep {
        from: Phase::CandidateSelected,
        to: Phase::DetailsFetched,
        operation: Operation::FetchDetails,
        requires_human_input: false,
        completes: &[Marker::EnrichedDetails],
    },
    PhaseStep {
        from: Phase::DetailsFetched,
        to: Phase::Audited,
        operation: Operation::Audit,
        requires_human_input: false,
        completes: &[Marker::Audit],
    },
    PhaseStep {
        from: Phase::Audited,
        to: Phase::Approved,
        operation: Operation::Approve,
        requires_human_input: true,
        completes: &[Marker::Approval],
    },
];

/// Derive a record's phase from its markers.
///
/// Walks the table in order and stops at the first incomplete step, so a
/// marker set out of order never lets a record skip a phase.
pub fn classify(record: &Record) -> Phase {
    let mut phase = Phase::Scraped;
    for step in &PHASE_TABLE {
        if !step.is_complete(record) {
            break;
        }
        phase = step.to;
    }
    phase
}

/// What a record needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "operation", rename_all = "snake_case")]
pub enum NextAction {
    /// The pipeline can run this unattended.
    Auto(Operation),
    /// A human has to decide.
    Manual(Operation),
    /// Nothing left to do.
    Done,
}

/// Detailed classification of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub phase: Phase,
    /// Markers still missing, in pipeline order.
    pub missing: Vec<Marker>,
    /// Some marker past `phase` is already set.
    pub out_of_order: bool,
    pub errored: bool,
    pub next_action: NextAction,
}

pub fn inspect(record: &Record) -> Classification {
    let phase = classify(record);
    let missing: Vec<Marker> = Marker::ALL
        .into_iter()
        .filter(|m| !record.markers.is_set(*m))
        .collect();
    let out_of_order = PHASE_TABLE
        .iter()
        .filter(|s| s.from > phase)
        .any(|s| s.completes.iter().any(|m| record.markers.is_set(*m)));
    let next_action = match phase.step() {
        Some(step) if step.requires_human_input => NextAction::Manual(step.operation),
        Some(step) => NextAction::Auto(step.operation),
        None => NextAction::Done,
    };

    Classification {
        phase,
        missing,
        out_of_order,
        errored: record.is_errored(),
        next_action,
    }
}

/// Count of records per phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseSummary {
    pub counts: BTreeMap<Phase, usize>,
    pub errored: usize,
    pub total: usize,
}

impl PhaseSummary {
    pub fn count(&self, phase: Phase) -> usize {
        self.counts.get(&phase).copied().unwrap_or(0)
    }

    /// Records the pipeline could advance without a human.
    pub fn auto_processable(&self) -> usize {
        self.counts
            .iter()
            .filter(|(phase, _)| phase.step().is_some_and(|s| !s.requires_human_input))
            .map(|(_, n)| n)
            .sum()
    }

    /// Records parked at a gate.
    pub fn manual_required(&self) -> usize {
        self.counts
            .iter()
            .filter(|(phase, _)| phase.is_gated())
            .map(|(_, n)| n)
            .sum()
    }
}

pub fn summarize<'a>(records: impl IntoIterator<Item = &'a Record>) -> PhaseSummary {
    let mut summary = PhaseSummary::default();
    for record in records {
        summary.total += 1;
        if record.is_errored() {
            summary.errored += 1;
        }
        *summary.counts.entry(classify(record)).or_insert(0) += 1;
    }
    summary
}
