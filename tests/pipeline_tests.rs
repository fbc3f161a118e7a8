//! Integration tests for the listing pipeline.
//!
//! These drive the plan builder, runner, gate resolver and facade together
//! over a `MemoryStore`, with scripted phase operations standing in for the
//! vendor integrations.

use async_trait::async_trait;
use listing_pipeline::config::RunnerConfig;
use listing_pipeline::errors::{GateError, OperationError, PipelineError};
use listing_pipeline::gates::{GateDecision, GateRequest};
use listing_pipeline::operations::PhaseOperations;
use listing_pipeline::phase::{Operation, PHASE_TABLE, Phase, classify};
use listing_pipeline::pipeline::Pipeline;
use listing_pipeline::plan::{ExecutionPlan, SkipReason, build_plan};
use listing_pipeline::record::{Decision, Marker, Markers, Record, RecordId};
use listing_pipeline::runner::{BatchRunner, RecordOutcome, RunEvent, RunStatus};
use listing_pipeline::store::MemoryStore;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Helpers
// =============================================================================

fn id(s: &str) -> RecordId {
    RecordId::from(s)
}

fn ids(names: &[&str]) -> Vec<RecordId> {
    names.iter().map(|n| id(n)).collect()
}

fn scraped(name: &str) -> Record {
    Record::new(name)
}

fn through(name: &str, marker: Marker) -> Record {
    Record::new(name).with_markers(Markers::through(marker))
}

async fn phase_of(store: &MemoryStore, name: &str) -> Phase {
    classify(&store.get(&id(name)).await.unwrap())
}

/// Phase operations with scripted faults. Successful calls set the step's
/// markers in the store, like a real vendor call writing its result back.
struct Scripted {
    store: Arc<MemoryStore>,
    fail: HashSet<(Operation, RecordId)>,
    hang: HashSet<RecordId>,
    unavailable: HashSet<Operation>,
    cancel_on: Option<(Operation, CancellationToken)>,
    calls: Mutex<Vec<(Operation, RecordId)>>,
}

impl Scripted {
    fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            fail: HashSet::new(),
            hang: HashSet::new(),
            unavailable: HashSet::new(),
            cancel_on: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, operation: Operation, names: &[&str]) -> Self {
        for name in names {
            self.fail.insert((operation, id(name)));
        }
        self
    }

    fn hanging(mut self, name: &str) -> Self {
        self.hang.insert(id(name));
        self
    }

    fn unavailable(mut self, operation: Operation) -> Self {
        self.unavailable.insert(operation);
        self
    }

    fn cancelling_after(mut self, operation: Operation, token: CancellationToken) -> Self {
        self.cancel_on = Some((operation, token));
        self
    }

    fn calls(&self) -> Vec<(Operation, RecordId)> {
        self.calls.lock().unwrap().clone()
    }

    fn called(&self, operation: Operation, name: &str) -> bool {
        self.calls().contains(&(operation, id(name)))
    }
}

#[async_trait]
impl PhaseOperations for Scripted {
    async fn execute(&self, operation: Operation, record: &RecordId) -> Result<(), OperationError> {
        self.calls.lock().unwrap().push((operation, record.clone()));

        if let Some((op, token)) = &self.cancel_on {
            if *op == operation {
                token.cancel();
            }
        }
        if self.unavailable.contains(&operation) {
            return Err(OperationError::unavailable(operation, "vendor returned 503"));
        }
        if self.hang.contains(record) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.fail.contains(&(operation, record.clone())) {
            return Err(OperationError::failed(format!("{} rejected {}", operation, record)));
        }

        let step = PHASE_TABLE
            .iter()
            .find(|s| s.operation == operation)
            .expect("every operation has a step");
        for marker in step.completes {
            self.store
                .set_marker(record, *marker)
                .await
                .map_err(|e| OperationError::failed(e.to_string()))?;
        }
        Ok(())
    }
}

fn runner(store: &Arc<MemoryStore>, ops: &Arc<Scripted>) -> BatchRunner {
    BatchRunner::new(store.clone(), ops.clone(), RunnerConfig::default())
}

async fn plan(store: &MemoryStore, target: Option<Phase>) -> ExecutionPlan {
    build_plan(&store.snapshot().await, target)
}

fn choose_all(gate: &GateRequest) -> GateDecision {
    GateDecision::all(
        gate,
        Decision::CandidateChosen {
            candidate_id: "cand-1".into(),
        },
    )
}

// =============================================================================
// Batch runner
// =============================================================================

mod runner_behaviour {
    use super::*;

    #[tokio::test]
    async fn test_partial_failure_isolates_failed_records() {
        let names = ["r1", "r2", "r3", "r4", "r5"];
        let store = Arc::new(MemoryStore::with_records(names.iter().map(|n| scraped(n))));
        let ops = Arc::new(
            Scripted::new(store.clone()).failing(Operation::Translate, &["r2", "r4"]),
        );

        let report = runner(&store, &ops).run(plan(&store, None).await).await;

        let failed: Vec<RecordId> = report.failed().into_iter().map(|(id, _)| id).collect();
        assert_eq!(failed, ids(&["r2", "r4"]));

        // the other three advanced through the next bucket and reached the gate
        let gate = report.gate.expect("survivors halt at the candidate gate");
        assert_eq!(gate.record_ids, ids(&["r1", "r3", "r5"]));
        for name in ["r2", "r4"] {
            assert!(!ops.called(Operation::SearchComparables, name));
            assert_eq!(phase_of(&store, name).await, Phase::Scraped);
        }
        assert!(report.status.is_awaiting_input());
    }

    #[tokio::test]
    async fn test_mixed_batch_scenario() {
        let store = Arc::new(MemoryStore::with_records(vec![
            scraped("A"),
            through("B", Marker::Translation),
            through("C", Marker::Approval),
        ]));
        let ops = Arc::new(Scripted::new(store.clone()));

        let plan = plan(&store, None).await;
        assert_eq!(plan.buckets.len(), 2);
        assert_eq!(plan.buckets[0].operation(), Some(Operation::Translate));
        assert_eq!(plan.buckets[0].record_ids, ids(&["A"]));
        assert_eq!(plan.buckets[1].operation(), Some(Operation::SearchComparables));
        assert_eq!(plan.buckets[1].record_ids, ids(&["B"]));
        assert_eq!(plan.skipped[0].id, id("C"));
        assert_eq!(plan.skipped[0].reason, SkipReason::Complete);

        let report = runner(&store, &ops).run(plan).await;

        assert_eq!(phase_of(&store, "A").await, Phase::Searching);
        assert_eq!(phase_of(&store, "B").await, Phase::Searching);
        assert_eq!(report.outcome(&id("A")), Some(&RecordOutcome::AwaitingInput));
        assert!(report.outcome(&id("C")).is_none());
        assert!(!ops.called(Operation::Translate, "C"));
    }

    #[tokio::test]
    async fn test_timeout_is_a_record_failure() {
        let names: Vec<String> = (0..10).map(|i| format!("sku-{i}")).collect();
        let store = Arc::new(MemoryStore::with_records(
            names.iter().map(|n| scraped(n)),
        ));
        let ops = Arc::new(Scripted::new(store.clone()).hanging("sku-7"));
        let config = RunnerConfig::default().with_operation_timeout(Duration::from_millis(100));

        let report = BatchRunner::new(store.clone(), ops.clone(), config)
            .run(plan(&store, Some(Phase::Translated)).await)
            .await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.succeeded().len(), 9);
        let failed = report.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, id("sku-7"));
        assert!(failed[0].1.contains("timed out"));
    }

    #[tokio::test]
    async fn test_unavailable_operation_aborts_without_rollback() {
        let store = Arc::new(MemoryStore::with_records(vec![
            scraped("A"),
            through("B", Marker::Translation),
        ]));
        let ops = Arc::new(Scripted::new(store.clone()).unavailable(Operation::SearchComparables));

        let report = runner(&store, &ops).run(plan(&store, None).await).await;

        match &report.status {
            RunStatus::Aborted { reason } => assert!(reason.contains("503")),
            other => panic!("Expected Aborted, got {:?}", other),
        }
        // A's translation from the first bucket is kept
        assert_eq!(report.outcome(&id("A")), Some(&RecordOutcome::Succeeded));
        assert_eq!(phase_of(&store, "A").await, Phase::Translated);
        assert_eq!(report.outcome(&id("B")), Some(&RecordOutcome::Pending));
        assert!(report.failed().is_empty());
        assert!(report.gate.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_waits_for_bucket_in_flight() {
        let store = Arc::new(MemoryStore::with_records(vec![
            scraped("A"),
            through("B", Marker::Translation),
        ]));
        let token = CancellationToken::new();
        let ops = Arc::new(
            Scripted::new(store.clone()).cancelling_after(Operation::Translate, token.clone()),
        );

        let report = runner(&store, &ops)
            .with_cancellation(token)
            .run(plan(&store, None).await)
            .await;

        assert_eq!(report.status, RunStatus::Cancelled);
        // the translate bucket finished and its outcome was recorded
        assert_eq!(report.outcome(&id("A")), Some(&RecordOutcome::Succeeded));
        assert_eq!(phase_of(&store, "A").await, Phase::Translated);
        // the search bucket never started
        assert_eq!(report.outcome(&id("B")), Some(&RecordOutcome::Pending));
        assert!(!ops.called(Operation::SearchComparables, "B"));
    }

    #[tokio::test]
    async fn test_events_report_halt_and_finish() {
        let store = Arc::new(MemoryStore::with_records(vec![through("A", Marker::Translation)]));
        let ops = Arc::new(Scripted::new(store.clone()));
        let (tx, mut rx) = mpsc::channel(64);

        runner(&store, &ops)
            .with_event_channel(tx)
            .run(plan(&store, None).await)
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let halted = events
            .iter()
            .find_map(|e| match e {
                RunEvent::Halted { gate } => Some(gate.clone()),
                _ => None,
            })
            .expect("halted event");
        assert_eq!(halted.record_ids, ids(&["A"]));
        assert!(matches!(
            events.last(),
            Some(RunEvent::RunFinished {
                status: RunStatus::AwaitingInput { .. },
                ..
            })
        ));
    }
}

// =============================================================================
// Gates and resume
// =============================================================================

mod gate_resume {
    use super::*;

    fn pipeline(store: &Arc<MemoryStore>, ops: &Arc<Scripted>) -> Pipeline {
        Pipeline::new(store.clone(), ops.clone(), RunnerConfig::default())
    }

    #[tokio::test]
    async fn test_subset_decision_resumes_only_that_subset() {
        let store = Arc::new(MemoryStore::with_records(vec![
            through("X", Marker::Translation),
            through("Y", Marker::SearchResult),
            through("Z", Marker::SearchResult),
        ]));
        let ops = Arc::new(Scripted::new(store.clone()));
        let pipeline = pipeline(&store, &ops);

        let report = pipeline.start(&ids(&["X", "Y", "Z"]), None).await.unwrap();
        let gate = report.gate.expect("halts at the candidate gate");
        assert_eq!(gate.phase, Phase::Searching);
        assert_eq!(gate.record_ids, ids(&["Y", "Z", "X"]));

        let mut decisions = BTreeMap::new();
        for name in ["X", "Y"] {
            decisions.insert(
                id(name),
                Decision::CandidateChosen {
                    candidate_id: format!("{name}-cand"),
                },
            );
        }
        let resolution = pipeline
            .resolve(gate, GateDecision::Resolve(decisions))
            .await
            .unwrap();

        assert_eq!(resolution.advanced, ids(&["Y", "X"]));
        let resumed = resolution.resumed.as_ref().expect("resumed run");
        assert!(resumed.outcome(&id("Z")).is_none());
        assert!(ops.called(Operation::FetchDetails, "X"));
        assert!(!ops.called(Operation::FetchDetails, "Z"));

        let remaining = resolution.remaining.as_ref().expect("Z still waits");
        assert_eq!(remaining.record_ids, ids(&["Z"]));
        assert_eq!(phase_of(&store, "Z").await, Phase::Searching);

        // X and Y went on to the approval gate
        let next = resumed.gate.as_ref().expect("approval gate");
        assert_eq!(next.phase, Phase::Audited);
        assert_eq!(resolution.snapshot.awaiting_input, 3);
    }

    #[tokio::test]
    async fn test_invalid_decision_reports_not_advanced() {
        let store = Arc::new(MemoryStore::with_records(vec![through("A", Marker::SearchResult)]));
        let ops = Arc::new(Scripted::new(store.clone()));
        let pipeline = pipeline(&store, &ops);

        let gate = pipeline
            .start(&ids(&["A"]), None)
            .await
            .unwrap()
            .gate
            .unwrap();
        let decision = GateDecision::all(&gate, Decision::Approved);
        let resolution = pipeline.resolve(gate, decision).await.unwrap();

        assert!(resolution.resumed.is_none());
        assert_eq!(resolution.not_advanced.len(), 1);
        assert!(resolution.not_advanced[0].1.contains("did not advance"));
        assert_eq!(resolution.snapshot.failed, 1);
        assert_eq!(phase_of(&store, "A").await, Phase::Searching);
    }

    #[tokio::test]
    async fn test_decision_outside_gate_is_rejected() {
        let store = Arc::new(MemoryStore::with_records(vec![
            through("A", Marker::SearchResult),
            through("B", Marker::SearchResult),
        ]));
        let ops = Arc::new(Scripted::new(store.clone()));
        let pipeline = pipeline(&store, &ops);

        let gate = pipeline
            .start(&ids(&["A"]), None)
            .await
            .unwrap()
            .gate
            .unwrap();
        let mut decisions = BTreeMap::new();
        decisions.insert(id("B"), Decision::Approved);

        let err = pipeline
            .resolve(gate, GateDecision::Resolve(decisions))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::NotInGate { ref id, phase: Phase::Searching } if id.as_str() == "B"));
    }

    #[tokio::test]
    async fn test_rerun_after_completion_is_empty() {
        let store = Arc::new(MemoryStore::with_records(vec![
            scraped("A"),
            through("B", Marker::SearchResult),
            through("C", Marker::Audit),
        ]));
        let ops = Arc::new(Scripted::new(store.clone()));
        let pipeline = pipeline(&store, &ops);
        let selection = ids(&["A", "B", "C"]);

        // C sits behind the first gate and resumes with it
        for _ in 0..3 {
            if pipeline.plan(&selection, None).await.unwrap().is_empty() {
                break;
            }
            let report = pipeline.start(&selection, None).await.unwrap();
            let mut gates: Vec<GateRequest> = report.gate.into_iter().collect();
            while let Some(gate) = gates.pop() {
                let decision = match gate.operation {
                    Operation::SelectCandidate => choose_all(&gate),
                    _ => GateDecision::all(&gate, Decision::Approved),
                };
                let resolution = pipeline.resolve(gate, decision).await.unwrap();
                assert!(resolution.not_advanced.is_empty());
                if let Some(resumed) = resolution.resumed {
                    gates.extend(resumed.gate);
                }
            }
        }

        for name in ["A", "B", "C"] {
            assert_eq!(phase_of(&store, name).await, Phase::Approved);
        }

        let again = pipeline.plan(&selection, None).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(again.skipped.len(), 3);

        // no operation ran twice for the same record
        let calls = ops.calls();
        let unique: HashSet<_> = calls.iter().cloned().collect();
        assert_eq!(unique.len(), calls.len());
    }

    #[tokio::test]
    async fn test_records_behind_gate_resume_with_it() {
        let store = Arc::new(MemoryStore::with_records(vec![
            scraped("A"),
            through("D", Marker::ChosenCandidate),
        ]));
        let ops = Arc::new(Scripted::new(store.clone()));
        let pipeline = pipeline(&store, &ops);

        let report = pipeline.start(&ids(&["A", "D"]), None).await.unwrap();
        let gate = report.gate.clone().expect("A halts at the candidate gate");
        assert_eq!(gate.record_ids, ids(&["A"]));
        assert_eq!(gate.deferred_ids(), ids(&["D"]));
        assert_eq!(report.outcome(&id("D")), Some(&RecordOutcome::Pending));
        assert!(!ops.called(Operation::FetchDetails, "D"));

        let resolution = pipeline.resolve(gate.clone(), choose_all(&gate)).await.unwrap();

        assert_eq!(resolution.deferred, ids(&["D"]));
        assert!(ops.called(Operation::FetchDetails, "D"));
        assert_eq!(phase_of(&store, "D").await, Phase::Audited);
        let approval = resolution.resumed.as_ref().unwrap().gate.as_ref().unwrap();
        assert_eq!(approval.record_ids, ids(&["A", "D"]));
        let d = resolution.snapshot.record(&id("D")).expect("D keeps a status");
        assert_eq!(d.outcome, RecordOutcome::AwaitingInput);
    }

    #[tokio::test]
    async fn test_gated_records_cannot_start_again() {
        let store = Arc::new(MemoryStore::with_records(vec![
            through("A", Marker::SearchResult),
            through("D", Marker::ChosenCandidate),
        ]));
        let ops = Arc::new(Scripted::new(store.clone()));
        let pipeline = pipeline(&store, &ops);

        let gate = pipeline
            .start(&ids(&["A", "D"]), None)
            .await
            .unwrap()
            .gate
            .unwrap();

        for selection in [ids(&["A"]), ids(&["D"])] {
            let err = pipeline.start(&selection, None).await.unwrap_err();
            assert!(matches!(err, PipelineError::RecordsHeld { ids: held } if held == selection));
        }

        pipeline.resolve(gate, GateDecision::Cancel).await.unwrap();
        assert!(pipeline.start(&ids(&["A"]), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_record_is_retried_only_on_explicit_rerun() {
        let store = Arc::new(MemoryStore::with_records(vec![scraped("A")]));
        let ops = Arc::new(Scripted::new(store.clone()).failing(Operation::Translate, &["A"]));
        let pipeline = pipeline(&store, &ops);

        let first = pipeline.start(&ids(&["A"]), None).await.unwrap();
        assert_eq!(first.failed().len(), 1);
        assert_eq!(ops.calls().len(), 1);

        let second = pipeline.start(&ids(&["A"]), None).await.unwrap();
        assert_eq!(second.failed().len(), 1);
        assert_eq!(ops.calls().len(), 2);
    }
}

// =============================================================================
// Pipeline facade
// =============================================================================

mod facade {
    use super::*;

    /// Blocks translation of `slow` until released.
    struct Gatekeeper {
        store: Arc<MemoryStore>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PhaseOperations for Gatekeeper {
        async fn execute(
            &self,
            operation: Operation,
            record: &RecordId,
        ) -> Result<(), OperationError> {
            if record.as_str() == "slow" {
                self.entered.notify_one();
                self.release.notified().await;
            }
            let step = PHASE_TABLE
                .iter()
                .find(|s| s.operation == operation)
                .unwrap();
            for marker in step.completes {
                self.store.set_marker(record, *marker).await.unwrap();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overlapping_run_is_refused() {
        let store = Arc::new(MemoryStore::with_records(vec![scraped("slow"), scraped("other")]));
        let ops = Arc::new(Gatekeeper {
            store: store.clone(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            ops.clone(),
            RunnerConfig::default(),
        ));

        let first = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .start(&ids(&["slow"]), Some(Phase::Translated))
                    .await
            })
        };
        ops.entered.notified().await;
        assert!(pipeline.is_held(&id("slow")));

        let err = pipeline
            .start(&ids(&["other", "slow"]), Some(Phase::Translated))
            .await
            .unwrap_err();
        match err {
            PipelineError::RecordsHeld { ids: held } => assert_eq!(held, ids(&["slow"])),
            other => panic!("Expected RecordsHeld, got {:?}", other),
        }

        let disjoint = pipeline
            .start(&ids(&["other"]), Some(Phase::Translated))
            .await
            .unwrap();
        assert!(disjoint.is_completed());

        ops.release.notify_one();
        let report = first.await.unwrap().unwrap();
        assert!(report.is_completed());
        assert!(!pipeline.is_held(&id("slow")));
    }

    #[tokio::test]
    async fn test_watcher_sees_settled_snapshot() {
        let store = Arc::new(MemoryStore::with_records(vec![scraped("A"), scraped("B")]));
        let ops = Arc::new(Scripted::new(store.clone()).failing(Operation::Translate, &["B"]));
        let pipeline = Pipeline::new(store.clone(), ops, RunnerConfig::default());
        let watcher = pipeline.subscribe();

        let report = pipeline
            .start(&ids(&["A", "B"]), Some(Phase::Translated))
            .await
            .unwrap();

        let snapshot = watcher.current();
        assert_eq!(snapshot.run_id, Some(report.run_id));
        assert_eq!(snapshot.total_selected, 2);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.state, RunStatus::Completed);
    }
}
