pub mod config;
pub mod errors;
pub mod gates;
pub mod operations;
pub mod phase;
pub mod pipeline;
pub mod plan;
pub mod progress;
pub mod record;
pub mod runner;
pub mod store;
pub mod ui;

pub use errors::{GateError, OperationError, PipelineError, StoreError};
pub use gates::{GateDecision, GateRequest, GateResolver, Resolution};
pub use phase::{Phase, classify};
pub use pipeline::Pipeline;
pub use plan::{ExecutionPlan, build_plan};
pub use record::{Decision, Record, RecordId};
pub use runner::{BatchRunner, RunReport, RunStatus};
