//! The pipeline facade.
//!
//! `Pipeline` wires the plan builder, batch runner, gate resolver and
//! progress reporter over one record store and one set of phase operations,
//! and keeps two runs from working on the same records at once. Records
//! waiting at an open gate, and the ones deferred behind it, stay held until
//! that gate is resolved or cancelled.

use crate::config::RunnerConfig;
use crate::errors::{GateError, PipelineError};
use crate::gates::{GateDecision, GateRequest, GateResolver, Resolution};
use crate::operations::PhaseOperations;
use crate::phase::{Phase, PhaseSummary, summarize};
use crate::plan::{ExecutionPlan, build_plan};
use crate::progress::{ProgressReporter, ProgressWatcher};
use crate::record::RecordId;
use crate::runner::{BatchRunner, RunEvent, RunReport};
use crate::store::RecordStore;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// What keeps a record id out of new runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    /// A run or a gate resolution in progress.
    Active,
    /// An open gate of the given run, until it is resolved or cancelled.
    Gate(Uuid),
}

/// Ids currently inside an active run or parked at an open gate.
#[derive(Debug, Clone, Default)]
struct HeldRecords {
    inner: Arc<Mutex<HashMap<RecordId, Holder>>>,
}

impl HeldRecords {
    fn lock(&self) -> MutexGuard<'_, HashMap<RecordId, Holder>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hold every id in `ids`, or none of them if any is already held.
    fn hold(&self, ids: &[RecordId]) -> Result<HoldGuard, PipelineError> {
        self.acquire(ids, |_| false)
    }

    /// Take over the ids parked at `gate`. Ids held by an active run or
    /// parked at another gate conflict.
    fn claim(&self, gate: &GateRequest) -> Result<HoldGuard, PipelineError> {
        let parked = Holder::Gate(gate.run_id);
        self.acquire(&dedupe(&gate.held_ids()), |holder| holder == parked)
    }

    fn acquire(
        &self,
        ids: &[RecordId],
        reclaimable: impl Fn(Holder) -> bool,
    ) -> Result<HoldGuard, PipelineError> {
        let mut held = self.lock();
        let conflicts: BTreeSet<RecordId> = ids
            .iter()
            .filter(|id| held.get(*id).is_some_and(|h| !reclaimable(*h)))
            .cloned()
            .collect();
        if !conflicts.is_empty() {
            return Err(PipelineError::RecordsHeld {
                ids: conflicts.into_iter().collect(),
            });
        }

        for id in ids {
            held.insert(id.clone(), Holder::Active);
        }
        Ok(HoldGuard {
            registry: self.clone(),
            ids: ids.to_vec(),
        })
    }

    fn is_held(&self, id: &RecordId) -> bool {
        self.lock().contains_key(id)
    }
}

/// Releases its ids when dropped, except the ones parked at a gate.
struct HoldGuard {
    registry: HeldRecords,
    ids: Vec<RecordId>,
}

impl HoldGuard {
    /// Keep the ids of `gate` held past this guard until the gate is
    /// claimed again.
    fn park(&mut self, gate: &GateRequest) {
        let parked: HashSet<RecordId> = gate.held_ids().into_iter().collect();
        let mut held = self.registry.lock();
        for id in self.ids.iter().filter(|id| parked.contains(*id)) {
            held.insert(id.clone(), Holder::Gate(gate.run_id));
        }
        self.ids.retain(|id| !parked.contains(id));
    }
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        let mut held = self.registry.lock();
        for id in &self.ids {
            held.remove(id);
        }
    }
}

/// Entry point for hosts driving the listing pipeline.
pub struct Pipeline {
    store: Arc<dyn RecordStore>,
    operations: Arc<dyn PhaseOperations>,
    config: RunnerConfig,
    reporter: ProgressReporter,
    event_tx: Option<mpsc::Sender<RunEvent>>,
    held: HeldRecords,
    cancel: Mutex<CancellationToken>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        operations: Arc<dyn PhaseOperations>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            operations,
            config,
            reporter: ProgressReporter::new(),
            event_tx: None,
            held: HeldRecords::default(),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Forward run events from every run to `tx`.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Watch settled progress snapshots of every run started here.
    pub fn subscribe(&self) -> ProgressWatcher {
        self.reporter.subscribe()
    }

    /// Token observed by runs started from now until the next `cancel`.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel_slot().clone()
    }

    /// Cancel every active run at its next bucket boundary. Later runs are
    /// unaffected.
    pub fn cancel(&self) {
        let mut slot = self.cancel_slot();
        slot.cancel();
        *slot = CancellationToken::new();
    }

    fn cancel_slot(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_held(&self, id: &RecordId) -> bool {
        self.held.is_held(id)
    }

    /// Per-phase counts over `ids`.
    pub async fn summarize(&self, ids: &[RecordId]) -> Result<PhaseSummary, PipelineError> {
        let records = self.store.load(&dedupe(ids)).await?;
        Ok(summarize(&records))
    }

    /// Build the plan `start` would execute, without running it.
    pub async fn plan(
        &self,
        ids: &[RecordId],
        target: Option<Phase>,
    ) -> Result<ExecutionPlan, PipelineError> {
        let records = self.store.load(&dedupe(ids)).await?;
        Ok(build_plan(&records, target))
    }

    /// Plan and run `ids` until they complete, halt at a gate, abort or are
    /// cancelled.
    ///
    /// Fails with `RecordsHeld` if any id is inside another active run or
    /// waiting at an open gate. When the run halts, the gate's records stay
    /// held until the gate is passed to `resolve`.
    pub async fn start(
        &self,
        ids: &[RecordId],
        target: Option<Phase>,
    ) -> Result<RunReport, PipelineError> {
        let ids = dedupe(ids);
        let mut guard = self.held.hold(&ids)?;

        let records = self.store.load(&ids).await?;
        let plan = build_plan(&records, target);
        debug!(
            scheduled = plan.scheduled(),
            skipped = plan.skipped.len(),
            buckets = plan.buckets.len(),
            "Plan built"
        );

        let report = self.runner().run(plan).await;
        if let Some(gate) = &report.gate {
            guard.park(gate);
        }
        Ok(report)
    }

    /// Apply a gate decision and resume the records that advanced.
    ///
    /// Releases the decided and cancelled records; gates left open by the
    /// resolution keep theirs. On error the gate stays open.
    pub async fn resolve(
        &self,
        gate: GateRequest,
        decision: GateDecision,
    ) -> Result<Resolution, GateError> {
        let mut guard = self.held.claim(&gate).map_err(Box::new)?;
        let reopen = gate.clone();

        let mut resolver = GateResolver::new(
            self.store.clone(),
            self.operations.clone(),
            self.config,
        )
        .with_progress(self.reporter.clone())
        .with_cancellation(self.cancellation());
        if let Some(tx) = &self.event_tx {
            resolver = resolver.with_event_channel(tx.clone());
        }

        match resolver.resolve(gate, decision).await {
            Ok(resolution) => {
                for open in resolution.open_gates() {
                    guard.park(open);
                }
                Ok(resolution)
            }
            Err(err) => {
                guard.park(&reopen);
                Err(err)
            }
        }
    }

    fn runner(&self) -> BatchRunner {
        let runner = BatchRunner::new(
            self.store.clone(),
            self.operations.clone(),
            self.config,
        )
        .with_progress(self.reporter.clone())
        .with_cancellation(self.cancellation());
        match &self.event_tx {
            Some(tx) => runner.with_event_channel(tx.clone()),
            None => runner,
        }
    }
}

/// Distinct ids, first occurrence first.
fn dedupe(ids: &[RecordId]) -> Vec<RecordId> {
    let mut seen = HashSet::new();
    ids.iter().filter(|id| seen.insert(*id)).cloned().collect()
}
