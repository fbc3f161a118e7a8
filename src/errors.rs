//! Typed error hierarchy for the listing pipeline.
//!
//! Four enums cover the seams of the subsystem:
//! - `OperationError`: a single phase-operation call (per-record vs run-level)
//! - `StoreError`: the external record store
//! - `GateError`: applying a human decision at a gate
//! - `PipelineError`: the `Pipeline` facade (run exclusivity, loading)

use crate::phase::{Operation, Phase};
use crate::record::RecordId;
use thiserror::Error;

/// Errors reported by a phase operation for one record.
///
/// `Failed` is isolated to the record; `Unavailable` means the operation
/// itself could not be reached and aborts the whole run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("{reason}")]
    Failed { reason: String },

    #[error("Operation {operation} unavailable: {reason}")]
    Unavailable { operation: Operation, reason: String },
}

impl OperationError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn unavailable(operation: Operation, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            operation,
            reason: reason.into(),
        }
    }

    /// True when the fault is not attributable to a single record.
    pub fn is_run_level(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Errors from the external record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record {0} not found")]
    NotFound(RecordId),

    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from resolving a gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Record {id} is not waiting at the {phase} gate")]
    NotInGate { id: RecordId, phase: Phase },

    #[error("Failed to apply decision: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] Box<PipelineError>),
}

/// Errors from the pipeline facade.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Records already held by an active run: {}", join_ids(.ids))]
    RecordsHeld { ids: Vec<RecordId> },

    #[error("Failed to load records: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn join_ids(ids: &[RecordId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
