//! Batch runner: executes an execution plan bucket by bucket.
//!
//! Buckets run strictly in phase order. Within a bucket every record gets its
//! own operation call; calls fan out up to `max_concurrency` and the runner
//! waits for all of them before deciding the next transition. Records that
//! advance are re-read from the store and carried into the bucket for their
//! new phase, so a single run walks a record as far as it can go without a
//! human.

use crate::config::RunnerConfig;
use crate::errors::OperationError;
use crate::gates::GateRequest;
use crate::operations::PhaseOperations;
use crate::phase::{Operation, Phase, classify};
use crate::plan::{ExecutionPlan, PhaseBucket};
use crate::progress::ProgressReporter;
use crate::record::RecordId;
use crate::runner::events::RunEvent;
use crate::runner::state::{ExecutionTimer, RecordOutcome, RunReport, RunState, RunStatus};
use crate::store::RecordStore;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Executes one plan. Consumed by `run`; a resume gets a new runner.
pub struct BatchRunner {
    store: Arc<dyn RecordStore>,
    operations: Arc<dyn PhaseOperations>,
    config: RunnerConfig,
    run_id: Uuid,
    reporter: Option<ProgressReporter>,
    event_tx: Option<mpsc::Sender<RunEvent>>,
    cancel: CancellationToken,
}

/// Per-bucket tallies, for the completion event.
#[derive(Default)]
struct BucketTally {
    succeeded: usize,
    failed: usize,
}

impl BatchRunner {
    pub fn new(
        store: Arc<dyn RecordStore>,
        operations: Arc<dyn PhaseOperations>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            operations,
            config,
            run_id: Uuid::new_v4(),
            reporter: None,
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Publish settled snapshots to `reporter`.
    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Cancel the run between buckets when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Execute the plan until it completes, halts at a gate, aborts or is
    /// cancelled.
    pub async fn run(self, plan: ExecutionPlan) -> RunReport {
        let timer = ExecutionTimer::start();
        let stop = plan.stop_phase();
        let ExecutionPlan {
            buckets,
            skipped,
            target,
        } = plan;
        let mut buckets: Vec<PhaseBucket> = buckets.into_iter().filter(|b| !b.is_empty()).collect();

        let mut state = RunState::new(self.run_id, &buckets, skipped.len());
        let records = state.outcomes().len();

        info!(
            run_id = %self.run_id,
            buckets = buckets.len(),
            records,
            skipped = skipped.len(),
            "Run started"
        );
        self.emit(RunEvent::RunStarted {
            run_id: self.run_id,
            buckets: buckets.len(),
            records,
        })
        .await;
        self.publish(&state);

        let mut gate = None;
        let mut index = 0;

        let status = loop {
            if index >= buckets.len() {
                break RunStatus::Completed;
            }
            if self.cancel.is_cancelled() {
                info!(run_id = %self.run_id, bucket = index, "Run cancelled between buckets");
                break RunStatus::Cancelled;
            }

            let bucket = buckets[index].clone();
            let Some(step) = bucket.step() else {
                index += 1;
                continue;
            };

            if step.requires_human_input {
                let request = GateRequest {
                    run_id: self.run_id,
                    phase: bucket.phase,
                    operation: step.operation,
                    record_ids: bucket.record_ids.clone(),
                    target,
                    deferred: buckets[index + 1..]
                        .iter()
                        .filter(|b| !b.is_empty())
                        .cloned()
                        .collect(),
                };
                info!(
                    run_id = %self.run_id,
                    phase = %bucket.phase,
                    records = bucket.len(),
                    deferred = request.deferred.len(),
                    "Halting for human input"
                );
                state.halt(bucket.phase, &bucket.record_ids);
                self.emit(RunEvent::Halted {
                    gate: request.clone(),
                })
                .await;
                gate = Some(request);
                break state.status().clone();
            }

            state.enter_bucket(index, bucket.phase);
            info!(
                run_id = %self.run_id,
                phase = %bucket.phase,
                operation = %step.operation,
                records = bucket.len(),
                "Bucket started"
            );
            self.emit(RunEvent::BucketStarted {
                index,
                phase: bucket.phase,
                operation: step.operation,
                record_ids: bucket.record_ids.clone(),
            })
            .await;

            let results = self.dispatch(step.operation, &bucket.record_ids).await;
            let (tally, abort_reason) = self
                .settle(&mut state, &mut buckets, index, &bucket, stop, results)
                .await;

            self.emit(RunEvent::BucketCompleted {
                index,
                phase: bucket.phase,
                succeeded: tally.succeeded,
                failed: tally.failed,
            })
            .await;
            self.publish(&state);

            if let Some(reason) = abort_reason {
                warn!(run_id = %self.run_id, phase = %bucket.phase, %reason, "Run aborted");
                break RunStatus::Aborted { reason };
            }

            index += 1;
        };

        state.set_status(status.clone());
        let snapshot = state.snapshot();
        if let Some(reporter) = &self.reporter {
            reporter.publish(snapshot.clone());
        }

        info!(
            run_id = %self.run_id,
            status = %status,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            awaiting_input = snapshot.awaiting_input,
            "Run finished"
        );
        self.emit(RunEvent::RunFinished {
            status: status.clone(),
            snapshot: Box::new(snapshot.clone()),
        })
        .await;

        RunReport {
            run_id: self.run_id,
            status,
            outcomes: state.outcomes().clone(),
            skipped,
            gate,
            snapshot,
            duration: timer.elapsed(),
        }
    }

    /// Issue one operation call per record and wait for all of them.
    ///
    /// A call that exceeds the timeout is a failure of that record only.
    /// Results come back in bucket order.
    async fn dispatch(
        &self,
        operation: Operation,
        ids: &[RecordId],
    ) -> Vec<(RecordId, Result<(), OperationError>)> {
        let timeout = self.config.operation_timeout;
        let operations = &self.operations;

        let mut results: Vec<(usize, RecordId, Result<(), OperationError>)> =
            stream::iter(ids.iter().cloned().enumerate())
                .map(|(position, id)| async move {
                    debug!(record_id = %id, %operation, "Dispatching");
                    let result =
                        match tokio::time::timeout(timeout, operations.execute(operation, &id))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(OperationError::failed(format!(
                                "{} timed out after {}ms",
                                operation,
                                timeout.as_millis()
                            ))),
                        };
                    (position, id, result)
                })
                .buffer_unordered(self.config.max_concurrency.max(1))
                .collect()
                .await;

        results.sort_by_key(|(position, _, _)| *position);
        results
            .into_iter()
            .map(|(_, id, result)| (id, result))
            .collect()
    }

    /// Fold a bucket's results into the run state.
    ///
    /// Returns the bucket tally and, for a run-level fault, the abort reason.
    async fn settle(
        &self,
        state: &mut RunState,
        buckets: &mut Vec<PhaseBucket>,
        index: usize,
        bucket: &PhaseBucket,
        stop: Phase,
        results: Vec<(RecordId, Result<(), OperationError>)>,
    ) -> (BucketTally, Option<String>) {
        let mut tally = BucketTally::default();
        let mut abort_reason = None;
        let mut reported_ok = Vec::new();

        for (id, result) in results {
            match result {
                Ok(()) => reported_ok.push(id),
                Err(err) if err.is_run_level() => {
                    warn!(record_id = %id, error = %err, "Operation unavailable");
                    abort_reason.get_or_insert_with(|| err.to_string());
                }
                Err(err) => {
                    warn!(record_id = %id, phase = %bucket.phase, error = %err, "Record failed");
                    self.record_failed(state, &mut tally, &id, bucket.phase, err.to_string())
                        .await;
                }
            }
        }

        if reported_ok.is_empty() {
            return (tally, abort_reason);
        }

        let records = match self.store.load(&reported_ok).await {
            Ok(records) => records,
            Err(err) => {
                warn!(run_id = %self.run_id, error = %err, "Failed to re-read records");
                abort_reason.get_or_insert_with(|| format!("failed to re-read records: {}", err));
                return (tally, abort_reason);
            }
        };

        let mut seen = HashSet::new();
        for record in records {
            seen.insert(record.id.clone());
            if record.is_errored() {
                let reason = record.error.clone().unwrap_or_default();
                self.record_failed(state, &mut tally, &record.id, bucket.phase, reason)
                    .await;
                continue;
            }

            let phase = classify(&record);
            if phase <= bucket.phase {
                let reason = format!("did not advance past {}", bucket.phase);
                self.record_failed(state, &mut tally, &record.id, bucket.phase, reason)
                    .await;
                continue;
            }

            debug!(record_id = %record.id, from = %bucket.phase, to = %phase, "Record advanced");
            state.succeed(&record.id, phase);
            tally.succeeded += 1;
            if phase < stop {
                carry_forward(buckets, index, phase, record.id.clone());
            }
            self.emit(RunEvent::RecordSettled {
                record_id: record.id,
                phase,
                outcome: RecordOutcome::Succeeded,
            })
            .await;
        }

        for id in reported_ok.iter().filter(|id| !seen.contains(*id)) {
            self.record_failed(
                state,
                &mut tally,
                id,
                bucket.phase,
                "missing from record store".to_string(),
            )
            .await;
        }

        (tally, abort_reason)
    }

    async fn record_failed(
        &self,
        state: &mut RunState,
        tally: &mut BucketTally,
        id: &RecordId,
        phase: Phase,
        reason: String,
    ) {
        state.fail(id, reason.clone());
        tally.failed += 1;
        self.emit(RunEvent::RecordSettled {
            record_id: id.clone(),
            phase,
            outcome: RecordOutcome::Failed { reason },
        })
        .await;
    }

    fn publish(&self, state: &RunState) {
        if let Some(reporter) = &self.reporter {
            reporter.publish(state.snapshot());
        }
    }

    /// Emit an event to the event channel if configured.
    async fn emit(&self, event: RunEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

/// Queue `id` in the bucket for `phase`, after bucket `index`.
///
/// Later buckets are kept in phase order; a bucket is created if none exists
/// for `phase` yet.
fn carry_forward(buckets: &mut Vec<PhaseBucket>, index: usize, phase: Phase, id: RecordId) {
    let later = index + 1;
    match buckets[later..].iter().position(|b| b.phase >= phase) {
        Some(offset) if buckets[later + offset].phase == phase => {
            buckets[later + offset].record_ids.push(id);
        }
        Some(offset) => {
            let mut bucket = PhaseBucket::new(phase);
            bucket.record_ids.push(id);
            buckets.insert(later + offset, bucket);
        }
        None => {
            let mut bucket = PhaseBucket::new(phase);
            bucket.record_ids.push(id);
            buckets.push(bucket);
        }
    }
}
