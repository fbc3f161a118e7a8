//! Progress reporting.
//!
//! The runner publishes a `ProgressSnapshot` at every settle point: run
//! start, after each bucket, at a gate, and at the end. Observers hold a
//! `ProgressWatcher` and only ever see whole snapshots, never a bucket in
//! flight.

use crate::phase::Phase;
use crate::record::RecordId;
use crate::runner::{RecordOutcome, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Where one record stands in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStatus {
    pub id: RecordId,
    pub phase: Phase,
    pub outcome: RecordOutcome,
}

/// Aggregate view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub state: RunStatus,
    /// Scheduled plus skipped records.
    pub total_selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub awaiting_input: usize,
    pub pending: usize,
    pub skipped: usize,
    #[serde(default)]
    pub current_phase_label: Option<String>,
    #[serde(default)]
    pub records: Vec<RecordStatus>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            run_id: None,
            state: RunStatus::Idle,
            total_selected: 0,
            succeeded: 0,
            failed: 0,
            awaiting_input: 0,
            pending: 0,
            skipped: 0,
            current_phase_label: None,
            records: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

impl ProgressSnapshot {
    /// Records the run took on (not skipped).
    pub fn scheduled(&self) -> usize {
        self.total_selected.saturating_sub(self.skipped)
    }

    /// Scheduled records no longer pending.
    pub fn settled(&self) -> usize {
        self.scheduled().saturating_sub(self.pending)
    }

    /// Get completion percentage.
    pub fn completion_percentage(&self) -> f64 {
        if self.scheduled() == 0 {
            return 100.0;
        }
        (self.settled() as f64 / self.scheduled() as f64) * 100.0
    }

    pub fn record(&self, id: &RecordId) -> Option<&RecordStatus> {
        self.records.iter().find(|r| &r.id == id)
    }

    /// One-line summary for logs and terminals.
    pub fn summary_line(&self) -> String {
        format!(
            "{} selected: {} succeeded, {} failed, {} awaiting input, {} pending, {} skipped",
            self.total_selected,
            self.succeeded,
            self.failed,
            self.awaiting_input,
            self.pending,
            self.skipped
        )
    }
}

/// Publishing side. Cheap to clone; all clones feed the same watchers.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<ProgressSnapshot>>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Replace the current snapshot. Succeeds with or without watchers.
    pub fn publish(&self, snapshot: ProgressSnapshot) {
        self.tx.send_replace(snapshot);
    }

    pub fn current(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> ProgressWatcher {
        ProgressWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of the progress channel.
#[derive(Debug, Clone)]
pub struct ProgressWatcher {
    rx: watch::Receiver<ProgressSnapshot>,
}

impl ProgressWatcher {
    pub fn current(&self) -> ProgressSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next published snapshot. `None` once every reporter is
    /// gone.
    pub async fn changed(&mut self) -> Option<ProgressSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until a run finishes or halts at a gate.
    pub async fn wait_until_settled(&mut self) -> Option<ProgressSnapshot> {
        self.rx
            .wait_for(|s| s.state.is_settled())
            .await
            .ok()
            .map(|s| s.clone())
    }
}
