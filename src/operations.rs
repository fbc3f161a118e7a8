//! The phase-operation seam.
//!
//! Each unattended pipeline step (translate, comparable search, detail
//! enrichment, audit) is an external asynchronous operation. The runner calls
//! it once per record and decides the next transition from the outcome.

use crate::errors::OperationError;
use crate::phase::{Operation, PHASE_TABLE};
use crate::record::RecordId;
use crate::store::MemoryStore;
use async_trait::async_trait;
use std::sync::Arc;

/// Abstraction over the vendor integrations behind each phase.
///
/// Implementations must tolerate being called again for a record that never
/// advanced.
#[async_trait]
pub trait PhaseOperations: Send + Sync {
    async fn execute(&self, operation: Operation, record: &RecordId) -> Result<(), OperationError>;
}

/// Offline operations that mark a step as done in a `MemoryStore`.
///
/// Used by the command-line host to walk a records file through the
/// pipeline without any vendor access. Already-set markers are left alone.
pub struct LocalOperations {
    store: Arc<MemoryStore>,
}

impl LocalOperations {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PhaseOperations for LocalOperations {
    async fn execute(&self, operation: Operation, record: &RecordId) -> Result<(), OperationError> {
        let step = PHASE_TABLE
            .iter()
            .find(|s| s.operation == operation)
            .ok_or_else(|| OperationError::unavailable(operation, "no such step"))?;

        if step.requires_human_input {
            return Err(OperationError::failed(format!(
                "{} needs a human decision",
                operation
            )));
        }

        for marker in step.completes {
            self.store
                .set_marker(record, *marker)
                .await
                .map_err(|e| OperationError::failed(e.to_string()))?;
        }
        Ok(())
    }
}
