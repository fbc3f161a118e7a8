//! Batch runner for the listing pipeline.
//!
//! The runner takes exclusive ownership of an `ExecutionPlan` and drives it
//! through the phase table:
//!
//! ```text
//! Idle ──start──▶ Running(i) ──bucket settles──▶ Running(i+1) ──▶ Completed
//!                     │                                 │
//!                     │ gated bucket reached            │ operation unavailable
//!                     ▼                                 ▼
//!              AwaitingInput(phase, ids)            Aborted
//! ```
//!
//! Cancellation is observed only between buckets and ends in `Cancelled`.

mod events;
mod executor;
mod state;

pub use events::RunEvent;
pub use executor::BatchRunner;
pub use state::{ExecutionTimer, RecordOutcome, RunReport, RunState, RunStatus};
