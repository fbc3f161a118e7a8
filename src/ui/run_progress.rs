//! Run progress UI.
//!
//! Renders `RunEvent`s in one of three output modes:
//! - `full`: progress bars per bucket with colored status lines
//! - `minimal`: one plain line per bucket and per finished run
//! - `json`: one serialized event per line

use crate::progress::ProgressSnapshot;
use crate::runner::{RecordOutcome, RunEvent, RunStatus};
use crate::ui::icons::{CHECK, CLOCK, CROSS, GATE, RUNNING, SPARKLE, STOP};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

/// Output mode for the run UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Rich terminal UI with progress bars
    #[default]
    Full,
    /// Single-line status updates
    Minimal,
    /// JSON-formatted events
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// Terminal renderer for a sequence of runs.
pub struct RunUI {
    mode: UiMode,
    multi: MultiProgress,
    /// Bar of the bucket currently in flight
    bucket_bar: Mutex<Option<ProgressBar>>,
    verbose: bool,
    term: Term,
}

impl RunUI {
    pub fn new(mode: UiMode, verbose: bool) -> Self {
        Self {
            mode,
            multi: MultiProgress::new(),
            bucket_bar: Mutex::new(None),
            verbose,
            term: Term::stdout(),
        }
    }

    pub fn mode(&self) -> UiMode {
        self.mode
    }

    /// Print a line above the bars, falling back to stderr.
    pub fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Handle a RunEvent and update the UI accordingly.
    pub fn handle_event(&self, event: &RunEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &RunEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &RunEvent) {
        match event {
            RunEvent::BucketStarted {
                phase,
                operation,
                record_ids,
                ..
            } => {
                let _ = writeln!(
                    &self.term,
                    "{} {} record(s) at {}",
                    operation,
                    record_ids.len(),
                    phase
                );
            }
            RunEvent::BucketCompleted {
                succeeded, failed, ..
            } => {
                let _ = writeln!(&self.term, "  {} ok, {} failed", succeeded, failed);
            }
            RunEvent::Halted { gate } => {
                let _ = writeln!(
                    &self.term,
                    "Waiting at {}: {} record(s)",
                    gate.phase,
                    gate.len()
                );
            }
            RunEvent::RunFinished { status, snapshot } => {
                let _ = writeln!(&self.term, "Run {}: {}", status, snapshot.summary_line());
            }
            _ => {}
        }
    }

    fn handle_full(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted {
                buckets, records, ..
            } => {
                self.print_line(format!(
                    "{} Run started: {} record(s) in {} bucket(s)",
                    RUNNING,
                    style(records).cyan().bold(),
                    buckets
                ));
            }
            RunEvent::BucketStarted {
                phase,
                operation,
                record_ids,
                ..
            } => self.on_bucket_started(phase.label(), &operation.to_string(), record_ids.len()),
            RunEvent::RecordSettled {
                record_id, outcome, ..
            } => {
                self.with_bucket_bar(|bar| bar.inc(1));
                match outcome {
                    RecordOutcome::Failed { reason } => self.print_line(format!(
                        "    {} {} {}",
                        CROSS,
                        style(record_id).red(),
                        style(reason).dim()
                    )),
                    _ if self.verbose => self.print_line(format!(
                        "    {} {}",
                        style("→").dim(),
                        style(record_id).dim()
                    )),
                    _ => {}
                }
            }
            RunEvent::BucketCompleted {
                phase,
                succeeded,
                failed,
                ..
            } => self.on_bucket_completed(phase.label(), *succeeded, *failed),
            RunEvent::Halted { gate } => {
                self.print_line(format!(
                    "{} {} record(s) waiting at {} for {}",
                    GATE,
                    style(gate.len()).yellow().bold(),
                    style(gate.phase.label()).yellow(),
                    gate.operation
                ));
            }
            RunEvent::RunFinished { status, snapshot } => self.on_run_finished(status, snapshot),
        }
    }

    fn with_bucket_bar(&self, f: impl FnOnce(&ProgressBar)) {
        let guard = self.bucket_bar.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bar) = guard.as_ref() {
            f(bar);
        }
    }

    fn on_bucket_started(&self, phase: &str, operation: &str, len: usize) {
        let bar_style = ProgressStyle::default_bar()
            .template("  {prefix:.bold} [{bar:30.green/white}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓░");

        let bar = self.multi.add(ProgressBar::new(len as u64));
        bar.set_style(bar_style);
        bar.set_prefix(format!("[{}]", phase));
        bar.set_message(operation.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));

        let mut slot = self.bucket_bar.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(bar) {
            previous.finish_and_clear();
        }
    }

    fn on_bucket_completed(&self, phase: &str, succeeded: usize, failed: usize) {
        let bar = self
            .bucket_bar
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        let icon = if failed == 0 { CHECK } else { CROSS };
        self.print_line(format!(
            "  {} {}: {} advanced, {} failed",
            icon,
            style(phase).bold(),
            style(succeeded).green(),
            if failed > 0 {
                style(failed).red().bold()
            } else {
                style(failed).dim()
            }
        ));
    }

    fn on_run_finished(&self, status: &RunStatus, snapshot: &ProgressSnapshot) {
        let headline = match status {
            RunStatus::Completed => format!("{} Run {}", SPARKLE, style("COMPLETE").green().bold()),
            RunStatus::AwaitingInput { .. } => {
                format!("{} Run {}", GATE, style("WAITING FOR INPUT").yellow().bold())
            }
            RunStatus::Aborted { reason } => format!(
                "{} Run {}: {}",
                CROSS,
                style("ABORTED").red().bold(),
                reason
            ),
            RunStatus::Cancelled => format!("{} Run {}", STOP, style("CANCELLED").yellow().bold()),
            other => format!("{} Run {}", CLOCK, other),
        };
        self.print_line(headline);
        self.print_line(format!("   {}", style(snapshot.summary_line()).dim()));
    }
}

/// Format a duration for display.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}
