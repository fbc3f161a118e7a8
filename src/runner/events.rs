//! Events emitted while a run executes.

use crate::gates::GateRequest;
use crate::phase::{Operation, Phase};
use crate::progress::ProgressSnapshot;
use crate::record::RecordId;
use crate::runner::state::{RecordOutcome, RunStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run has started.
    RunStarted {
        run_id: Uuid,
        buckets: usize,
        records: usize,
    },
    /// A bucket's operation has been dispatched.
    BucketStarted {
        index: usize,
        phase: Phase,
        operation: Operation,
        record_ids: Vec<RecordId>,
    },
    /// A record's operation call settled and its new phase was read back.
    RecordSettled {
        record_id: RecordId,
        phase: Phase,
        outcome: RecordOutcome,
    },
    /// Every call in a bucket has settled.
    BucketCompleted {
        index: usize,
        phase: Phase,
        succeeded: usize,
        failed: usize,
    },
    /// The run stopped at a human-gated phase.
    Halted { gate: GateRequest },
    /// The run stopped for good.
    RunFinished {
        status: RunStatus,
        snapshot: Box<ProgressSnapshot>,
    },
}

impl RunEvent {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::BucketStarted { .. } => "bucket_started",
            Self::RecordSettled { .. } => "record_settled",
            Self::BucketCompleted { .. } => "bucket_completed",
            Self::Halted { .. } => "halted",
            Self::RunFinished { .. } => "run_finished",
        }
    }
}
