//! Run state tracking for the batch runner.
//!
//! This module provides the per-record outcome map, the run-level state
//! machine, and the final `RunReport` handed back to callers.

use crate::gates::GateRequest;
use crate::phase::Phase;
use crate::plan::{PhaseBucket, SkippedRecord};
use crate::progress::{ProgressSnapshot, RecordStatus};
use crate::record::RecordId;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Overall state of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    /// Plan received, nothing dispatched yet
    #[default]
    Idle,
    /// Executing the bucket at `bucket_index`
    Running { bucket_index: usize },
    /// Halted at a human-gated phase
    AwaitingInput {
        phase: Phase,
        record_ids: Vec<RecordId>,
    },
    /// Every bucket ran
    Completed,
    /// A run-level fault stopped the run
    Aborted { reason: String },
    /// Cancelled between buckets
    Cancelled,
}

impl RunStatus {
    /// True once the run will make no further progress on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Aborted { .. } | Self::Cancelled
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn is_awaiting_input(&self) -> bool {
        matches!(self, Self::AwaitingInput { .. })
    }

    /// True when the run has stopped, either finished or parked at a gate.
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || self.is_awaiting_input()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running { bucket_index } => write!(f, "running bucket {}", bucket_index + 1),
            Self::AwaitingInput { phase, record_ids } => write!(
                f,
                "awaiting input at {} ({} records)",
                phase,
                record_ids.len()
            ),
            Self::Completed => write!(f, "completed"),
            Self::Aborted { reason } => write!(f, "aborted: {}", reason),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one record within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    #[default]
    Pending,
    Succeeded,
    Failed {
        reason: String,
    },
    AwaitingInput,
}

impl RecordOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::AwaitingInput => "awaiting input",
        }
    }
}

/// Mutable state of a single run. Owned by its runner; others only see
/// snapshots.
#[derive(Debug, Clone)]
pub struct RunState {
    run_id: Uuid,
    status: RunStatus,
    outcomes: BTreeMap<RecordId, RecordOutcome>,
    phases: BTreeMap<RecordId, Phase>,
    current_phase: Option<Phase>,
    halted_at: Option<Phase>,
    skipped: usize,
}

impl RunState {
    /// Start tracking every record in `buckets` as pending.
    pub fn new(run_id: Uuid, buckets: &[PhaseBucket], skipped: usize) -> Self {
        let mut state = Self {
            run_id,
            status: RunStatus::Idle,
            outcomes: BTreeMap::new(),
            phases: BTreeMap::new(),
            current_phase: None,
            halted_at: None,
            skipped,
        };
        for bucket in buckets {
            for id in &bucket.record_ids {
                state.track(id.clone(), bucket.phase, RecordOutcome::Pending);
            }
        }
        state
    }

    pub(crate) fn track(&mut self, id: RecordId, phase: Phase, outcome: RecordOutcome) {
        self.phases.insert(id.clone(), phase);
        self.outcomes.insert(id, outcome);
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn halted_at(&self) -> Option<Phase> {
        self.halted_at
    }

    pub fn outcome(&self, id: &RecordId) -> Option<&RecordOutcome> {
        self.outcomes.get(id)
    }

    pub fn phase_of(&self, id: &RecordId) -> Option<Phase> {
        self.phases.get(id).copied()
    }

    pub fn outcomes(&self) -> &BTreeMap<RecordId, RecordOutcome> {
        &self.outcomes
    }

    pub(crate) fn set_status(&mut self, status: RunStatus) {
        self.status = status;
    }

    pub(crate) fn enter_bucket(&mut self, index: usize, phase: Phase) {
        self.status = RunStatus::Running {
            bucket_index: index,
        };
        self.current_phase = Some(phase);
    }

    pub(crate) fn succeed(&mut self, id: &RecordId, phase: Phase) {
        self.track(id.clone(), phase, RecordOutcome::Succeeded);
    }

    pub(crate) fn fail(&mut self, id: &RecordId, reason: impl Into<String>) {
        self.outcomes.insert(
            id.clone(),
            RecordOutcome::Failed {
                reason: reason.into(),
            },
        );
    }

    /// Park the gate's records and stop.
    pub(crate) fn halt(&mut self, phase: Phase, record_ids: &[RecordId]) {
        for id in record_ids {
            self.track(id.clone(), phase, RecordOutcome::AwaitingInput);
        }
        self.halted_at = Some(phase);
        self.current_phase = Some(phase);
        self.status = RunStatus::AwaitingInput {
            phase,
            record_ids: record_ids.to_vec(),
        };
    }

    fn count(&self, pred: impl Fn(&RecordOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| pred(o)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(RecordOutcome::is_failed)
    }

    pub fn awaiting_input(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::AwaitingInput))
    }

    pub fn pending(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Pending))
    }

    /// A settled, read-only view of this state.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let records = self
            .outcomes
            .iter()
            .map(|(id, outcome)| RecordStatus {
                id: id.clone(),
                phase: self.phases.get(id).copied().unwrap_or_default(),
                outcome: outcome.clone(),
            })
            .collect();

        ProgressSnapshot {
            run_id: Some(self.run_id),
            state: self.status.clone(),
            total_selected: self.outcomes.len() + self.skipped,
            succeeded: self.succeeded(),
            failed: self.failed(),
            awaiting_input: self.awaiting_input(),
            pending: self.pending(),
            skipped: self.skipped,
            current_phase_label: self.current_phase.map(|p| p.label().to_string()),
            records,
            updated_at: Utc::now(),
        }
    }
}

/// Result of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub outcomes: BTreeMap<RecordId, RecordOutcome>,
    pub skipped: Vec<SkippedRecord>,
    /// Set when the run halted at a human-gated phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateRequest>,
    pub snapshot: ProgressSnapshot,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl RunReport {
    pub fn outcome(&self, id: &RecordId) -> Option<&RecordOutcome> {
        self.outcomes.get(id)
    }

    fn ids_where(&self, pred: impl Fn(&RecordOutcome) -> bool) -> Vec<RecordId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| pred(o))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<RecordId> {
        self.ids_where(|o| matches!(o, RecordOutcome::Succeeded))
    }

    /// Failed records with their reasons.
    pub fn failed(&self) -> Vec<(RecordId, String)> {
        self.outcomes
            .iter()
            .filter_map(|(id, o)| match o {
                RecordOutcome::Failed { reason } => Some((id.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn awaiting_input(&self) -> Vec<RecordId> {
        self.ids_where(|o| matches!(o, RecordOutcome::AwaitingInput))
    }

    pub fn pending(&self) -> Vec<RecordId> {
        self.ids_where(|o| matches!(o, RecordOutcome::Pending))
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(phase: Phase, ids: &[&str]) -> PhaseBucket {
        PhaseBucket {
            phase,
            record_ids: ids.iter().map(|id| RecordId::from(*id)).collect(),
        }
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Idle.is_terminal());
        assert!(!RunStatus::Running { bucket_index: 0 }.is_terminal());
        assert!(
            !RunStatus::AwaitingInput {
                phase: Phase::Searching,
                record_ids: vec![]
            }
            .is_terminal()
        );
        assert!(RunStatus::Completed.is_terminal());
        assert!(
            RunStatus::Aborted {
                reason: "x".into()
            }
            .is_terminal()
        );
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_new_state_tracks_every_scheduled_record_as_pending() {
        let buckets = vec![
            bucket(Phase::Scraped, &["a", "b"]),
            bucket(Phase::Translated, &["c"]),
        ];
        let state = RunState::new(Uuid::new_v4(), &buckets, 2);

        assert_eq!(state.pending(), 3);
        assert_eq!(state.phase_of(&RecordId::from("c")), Some(Phase::Translated));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.total_selected, 5);
        assert_eq!(snapshot.skipped, 2);
        assert_eq!(snapshot.state, RunStatus::Idle);
    }

    #[test]
    fn test_outcome_transitions_and_counts() {
        let buckets = vec![bucket(Phase::Scraped, &["a", "b", "c"])];
        let mut state = RunState::new(Uuid::new_v4(), &buckets, 0);

        state.enter_bucket(0, Phase::Scraped);
        state.succeed(&RecordId::from("a"), Phase::Translated);
        state.fail(&RecordId::from("b"), "quota exceeded");

        assert_eq!(state.succeeded(), 1);
        assert_eq!(state.failed(), 1);
        assert_eq!(state.pending(), 1);
        assert_eq!(state.phase_of(&RecordId::from("a")), Some(Phase::Translated));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.current_phase_label.as_deref(), Some("Scraped"));
        assert!(snapshot.state.is_running());
    }

    #[test]
    fn test_halt_marks_gate_records_awaiting_input() {
        let buckets = vec![
            bucket(Phase::Searching, &["a", "b"]),
            bucket(Phase::Audited, &["c"]),
        ];
        let mut state = RunState::new(Uuid::new_v4(), &buckets, 0);
        let gate_ids = buckets[0].record_ids.clone();

        state.halt(Phase::Searching, &gate_ids);

        assert_eq!(state.awaiting_input(), 2);
        assert_eq!(state.pending(), 1);
        assert_eq!(state.halted_at(), Some(Phase::Searching));
        assert!(state.status().is_awaiting_input());
        assert!(state.status().is_settled());
    }

    #[test]
    fn test_report_accessors() {
        let buckets = vec![bucket(Phase::Scraped, &["a", "b"])];
        let mut state = RunState::new(Uuid::new_v4(), &buckets, 0);
        state.succeed(&RecordId::from("a"), Phase::Translated);
        state.fail(&RecordId::from("b"), "timed out");
        state.set_status(RunStatus::Completed);

        let report = RunReport {
            run_id: state.run_id(),
            status: state.status().clone(),
            outcomes: state.outcomes().clone(),
            skipped: vec![],
            gate: None,
            snapshot: state.snapshot(),
            duration: Duration::from_millis(12),
        };

        assert!(report.is_completed());
        assert_eq!(report.succeeded(), vec![RecordId::from("a")]);
        assert_eq!(
            report.failed(),
            vec![(RecordId::from("b"), "timed out".to_string())]
        );

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"]["state"], "completed");
        assert_eq!(json["duration"], 12);
        assert_eq!(json["outcomes"]["b"]["status"], "failed");
    }
}
