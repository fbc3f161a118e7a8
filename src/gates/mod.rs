//! Human gates and the auto-resume controller.
//!
//! A run that reaches a gated phase stops with a `GateRequest`. The caller
//! collects a decision (interactively through `TerminalGate`, or any other
//! surface) and hands both to `GateResolver::resolve`, which applies the
//! decision, re-classifies the affected records and starts a fresh, narrow
//! run for exactly the records that advanced, together with the records the
//! halted run never reached.

mod prompt;

pub use prompt::{TerminalGate, candidates};

use crate::config::RunnerConfig;
use crate::errors::GateError;
use crate::operations::PhaseOperations;
use crate::phase::{Operation, Phase, classify};
use crate::plan::{PhaseBucket, build_plan};
use crate::progress::{ProgressReporter, ProgressSnapshot};
use crate::record::{Decision, RecordId};
use crate::runner::{BatchRunner, RecordOutcome, RunEvent, RunReport, RunState, RunStatus};
use crate::store::{RecordStore, RecordUpdate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Records waiting for a human decision at one phase.
///
/// Passed by value to `resolve`, so each request is consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRequest {
    /// Run that halted.
    pub run_id: Uuid,
    /// Phase the records are sitting at.
    pub phase: Phase,
    /// The decision being asked for.
    pub operation: Operation,
    pub record_ids: Vec<RecordId>,
    /// Target carried over to the resumed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Phase>,
    /// Later buckets of the halted run that never ran. Resumed with the
    /// first resolution of this gate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deferred: Vec<PhaseBucket>,
}

impl GateRequest {
    pub fn contains(&self, id: &RecordId) -> bool {
        self.record_ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.record_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_ids.is_empty()
    }

    /// Ids of the deferred buckets, in bucket order.
    pub fn deferred_ids(&self) -> Vec<RecordId> {
        self.deferred
            .iter()
            .flat_map(|b| b.record_ids.iter().cloned())
            .collect()
    }

    /// Every id this gate keeps out of other runs: the waiting records and
    /// the deferred ones.
    pub fn held_ids(&self) -> Vec<RecordId> {
        let mut ids = self.record_ids.clone();
        ids.extend(self.deferred_ids());
        ids
    }
}

/// What the gate surface returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Decisions for some or all of the gate's records. Records left out
    /// keep waiting.
    Resolve(BTreeMap<RecordId, Decision>),
    /// Drop the gate without applying anything.
    Cancel,
}

impl GateDecision {
    /// The same decision for every record in `gate`.
    pub fn all(gate: &GateRequest, decision: Decision) -> Self {
        Self::Resolve(
            gate.record_ids
                .iter()
                .map(|id| (id.clone(), decision.clone()))
                .collect(),
        )
    }
}

/// Result of resolving a gate.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Records that moved past the gate.
    pub advanced: Vec<RecordId>,
    /// Records whose decision did not move them past the gate, with why.
    pub not_advanced: Vec<(RecordId, String)>,
    /// Deferred records of the gate, resumed alongside the advanced ones.
    pub deferred: Vec<RecordId>,
    /// The run started for the advanced and deferred records.
    pub resumed: Option<RunReport>,
    /// Gate records the decision did not cover.
    pub remaining: Option<GateRequest>,
    pub cancelled: bool,
    /// Combined view over every record of the gate.
    pub snapshot: ProgressSnapshot,
}

impl Resolution {
    /// Gates still open after this resolution: the uncovered remainder of
    /// this gate, then any gate the resumed run halted at.
    pub fn open_gates(&self) -> Vec<&GateRequest> {
        self.remaining
            .iter()
            .chain(self.resumed.as_ref().and_then(|r| r.gate.as_ref()))
            .collect()
    }
}

/// Applies human decisions and resumes the pipeline for the affected records.
pub struct GateResolver {
    store: Arc<dyn RecordStore>,
    operations: Arc<dyn PhaseOperations>,
    config: RunnerConfig,
    reporter: Option<ProgressReporter>,
    event_tx: Option<mpsc::Sender<RunEvent>>,
    cancel: CancellationToken,
}

impl GateResolver {
    pub fn new(
        store: Arc<dyn RecordStore>,
        operations: Arc<dyn PhaseOperations>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            operations,
            config,
            reporter: None,
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Token handed to the resumed run.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Apply `decision` to the records of `gate` and resume the ones that
    /// advanced.
    ///
    /// Fails before touching the store if the decision names a record that
    /// is not part of the gate.
    pub async fn resolve(
        &self,
        gate: GateRequest,
        decision: GateDecision,
    ) -> Result<Resolution, GateError> {
        let decisions = match decision {
            GateDecision::Cancel => {
                info!(run_id = %gate.run_id, phase = %gate.phase, "Gate cancelled");
                let mut state = RunState::new(gate.run_id, &[], 0);
                for id in &gate.record_ids {
                    state.track(id.clone(), gate.phase, RecordOutcome::Pending);
                }
                for bucket in &gate.deferred {
                    for id in &bucket.record_ids {
                        state.track(id.clone(), bucket.phase, RecordOutcome::Pending);
                    }
                }
                state.set_status(RunStatus::Cancelled);
                let snapshot = self.publish(state.snapshot());
                return Ok(Resolution {
                    advanced: Vec::new(),
                    not_advanced: Vec::new(),
                    deferred: Vec::new(),
                    resumed: None,
                    remaining: None,
                    cancelled: true,
                    snapshot,
                });
            }
            GateDecision::Resolve(decisions) => decisions,
        };

        if let Some(id) = decisions.keys().find(|id| !gate.contains(id)) {
            return Err(GateError::NotInGate {
                id: id.clone(),
                phase: gate.phase,
            });
        }

        let mut rejected = BTreeMap::new();
        let updates: Vec<RecordUpdate> = gate
            .record_ids
            .iter()
            .filter_map(|id| decisions.get(id).map(|d| (id, d)))
            .map(|(id, decision)| {
                if let Decision::Rejected { reason } = decision {
                    rejected.insert(id.clone(), reason.clone());
                }
                RecordUpdate {
                    id: id.clone(),
                    decision: decision.clone(),
                }
            })
            .collect();

        info!(
            run_id = %gate.run_id,
            phase = %gate.phase,
            decided = updates.len(),
            waiting = gate.len(),
            "Applying gate decisions"
        );

        let decided: Vec<RecordId> = updates.iter().map(|u| u.id.clone()).collect();
        if !updates.is_empty() {
            self.store.apply(&updates).await?;
        }
        let reloaded = if decided.is_empty() {
            Vec::new()
        } else {
            self.store.load(&decided).await?
        };

        let mut advanced = Vec::new();
        let mut advanced_records = Vec::new();
        let mut not_advanced = Vec::new();
        let mut seen = HashSet::new();
        for record in reloaded {
            seen.insert(record.id.clone());
            if record.is_errored() {
                let reason = record.error.clone().unwrap_or_default();
                not_advanced.push((record.id.clone(), reason));
                continue;
            }
            if classify(&record) <= gate.phase {
                let reason = match rejected.get(&record.id) {
                    Some(reason) => format!("rejected: {}", reason),
                    None => format!("did not advance past {}", gate.phase),
                };
                warn!(record_id = %record.id, phase = %gate.phase, %reason, "Decision did not advance record");
                not_advanced.push((record.id.clone(), reason));
                continue;
            }
            advanced.push(record.id.clone());
            advanced_records.push(record);
        }
        for id in decided.iter().filter(|id| !seen.contains(*id)) {
            not_advanced.push((id.clone(), "missing from record store".to_string()));
        }

        let remaining_ids: Vec<RecordId> = gate
            .record_ids
            .iter()
            .filter(|id| !decisions.contains_key(*id))
            .cloned()
            .collect();
        let remaining = (!remaining_ids.is_empty()).then(|| GateRequest {
            record_ids: remaining_ids,
            deferred: Vec::new(),
            ..gate.clone()
        });

        let deferred = gate.deferred_ids();
        let mut resume_records = advanced_records;
        if !deferred.is_empty() {
            resume_records.extend(self.store.load(&deferred).await?);
        }

        let resumed = if resume_records.is_empty() {
            None
        } else {
            let plan = build_plan(&resume_records, gate.target);
            let mut runner =
                BatchRunner::new(self.store.clone(), self.operations.clone(), self.config)
                    .with_cancellation(self.cancel.clone());
            if let Some(reporter) = &self.reporter {
                runner = runner.with_progress(reporter.clone());
            }
            if let Some(tx) = &self.event_tx {
                runner = runner.with_event_channel(tx.clone());
            }
            info!(
                run_id = %runner.run_id(),
                resumed_from = %gate.run_id,
                records = advanced.len(),
                deferred = deferred.len(),
                "Resuming after gate"
            );
            Some(runner.run(plan).await)
        };

        let snapshot = self.publish(combined_snapshot(
            &gate,
            &not_advanced,
            remaining.as_ref(),
            resumed.as_ref(),
        ));

        Ok(Resolution {
            advanced,
            not_advanced,
            deferred,
            resumed,
            remaining,
            cancelled: false,
            snapshot,
        })
    }

    fn publish(&self, snapshot: ProgressSnapshot) -> ProgressSnapshot {
        if let Some(reporter) = &self.reporter {
            reporter.publish(snapshot.clone());
        }
        snapshot
    }
}

/// One snapshot over the whole gate: the resumed run's records (advanced and
/// deferred) plus the ones that failed at the gate or are still waiting.
fn combined_snapshot(
    gate: &GateRequest,
    not_advanced: &[(RecordId, String)],
    remaining: Option<&GateRequest>,
    resumed: Option<&RunReport>,
) -> ProgressSnapshot {
    let run_id = resumed.map(|r| r.run_id).unwrap_or(gate.run_id);
    let skipped = resumed.map(|r| r.skipped.len()).unwrap_or(0);
    let mut state = RunState::new(run_id, &[], skipped);

    if let Some(report) = resumed {
        for record in &report.snapshot.records {
            state.track(record.id.clone(), record.phase, record.outcome.clone());
        }
    }
    for (id, reason) in not_advanced {
        state.track(
            id.clone(),
            gate.phase,
            RecordOutcome::Failed {
                reason: reason.clone(),
            },
        );
    }
    if let Some(rest) = remaining {
        for id in &rest.record_ids {
            state.track(id.clone(), gate.phase, RecordOutcome::AwaitingInput);
        }
    }

    let status = match (resumed, remaining) {
        // a resumed run that did not complete outranks the remainder
        (Some(report), _) if report.status != RunStatus::Completed => report.status.clone(),
        (_, Some(rest)) => RunStatus::AwaitingInput {
            phase: rest.phase,
            record_ids: rest.record_ids.clone(),
        },
        (Some(report), None) => report.status.clone(),
        (None, None) => RunStatus::Completed,
    };
    state.set_status(status);
    state.snapshot()
}
