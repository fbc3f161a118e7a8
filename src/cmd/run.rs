//! `run`: drive the pipeline over a records file, prompting at gates.

use anyhow::{Context, Result};
use console::style;
use listing_pipeline::gates::{GateDecision, GateRequest, TerminalGate};
use listing_pipeline::operations::LocalOperations;
use listing_pipeline::phase::{Phase, summarize};
use listing_pipeline::pipeline::Pipeline;
use listing_pipeline::runner::RunEvent;
use listing_pipeline::store::{MemoryStore, RecordStore};
use listing_pipeline::ui::{RunUI, UiMode, format_duration};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::super::Cli;
use super::{load_config, load_records, parse_target, save_records, select_ids};

/// Command-line overrides for `[runner]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOverrides {
    pub max_concurrency: Option<usize>,
    pub timeout_secs: Option<u64>,
}

pub async fn cmd_run(
    cli: &Cli,
    target: Option<&str>,
    ids: &[String],
    overrides: RunOverrides,
    ui_mode: &str,
) -> Result<()> {
    let mut toml = load_config(cli)?;
    if let Some(n) = overrides.max_concurrency {
        toml.runner.max_concurrency = n;
    }
    if let Some(secs) = overrides.timeout_secs {
        toml.runner.operation_timeout_secs = secs;
    }
    let target = parse_target(target)?.or(toml.plan.target);

    let records = load_records(&cli.records)?;
    let selected = select_ids(&records, ids)?;

    let store = Arc::new(MemoryStore::with_records(records));
    let operations = Arc::new(LocalOperations::new(store.clone()));
    let (tx, mut rx) = mpsc::channel::<RunEvent>(256);
    let pipeline = Pipeline::new(store.clone(), operations, toml.runner_config())
        .with_event_channel(tx);

    let ui = Arc::new(RunUI::new(UiMode::parse(ui_mode), cli.verbose));
    let ui_task = {
        let ui = ui.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                ui.handle_event(&event);
            }
        })
    };

    let cancel = pipeline.cancellation();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let report = pipeline.start(&selected, target).await?;
    let mut elapsed = report.duration;
    let mut gates: VecDeque<GateRequest> = report.gate.into_iter().collect();
    let mut surface = TerminalGate::new(cli.yes);

    while let Some(gate) = gates.pop_front() {
        if cancel.is_cancelled() {
            break;
        }

        let gate_records = store
            .load(&gate.record_ids)
            .await
            .context("Failed to load gate records")?;
        let decision = surface.decide(&gate, &gate_records)?;

        // an empty decision still resumes the records deferred behind the gate
        let nothing_decided = matches!(&decision, GateDecision::Resolve(d) if d.is_empty());
        if nothing_decided && gate.deferred.is_empty() {
            ui.print_line(format!(
                "  {} record(s) left waiting at {}",
                gate.len(),
                gate.phase.label()
            ));
            continue;
        }

        let resolution = pipeline.resolve(gate, decision).await?;
        for (id, reason) in &resolution.not_advanced {
            ui.print_line(format!(
                "  {} {} {}",
                style("not advanced:").red(),
                id,
                style(reason).dim()
            ));
        }
        if let Some(rest) = &resolution.remaining {
            ui.print_line(format!(
                "  {} record(s) still waiting at {}",
                rest.len(),
                rest.phase.label()
            ));
        }
        if let Some(resumed) = resolution.resumed {
            elapsed += resumed.duration;
            gates.extend(resumed.gate);
        }
    }

    drop(pipeline);
    ui_task.await.ok();

    let final_records = store.snapshot().await;
    save_records(&cli.records, &final_records)?;

    if ui.mode() != UiMode::Json {
        let summary = summarize(&final_records);
        println!();
        println!(
            "Saved {} record(s) to {} in {}: {} approved, {} waiting for a decision, {} errored",
            summary.total,
            cli.records.display(),
            format_duration(elapsed),
            summary.count(Phase::Approved),
            summary.manual_required(),
            summary.errored
        );
    }

    Ok(())
}
