//! Read-only commands: `plan` and `status`.

use anyhow::Result;
use console::style;
use listing_pipeline::phase::{NextAction, Phase, inspect, summarize};
use listing_pipeline::plan::{SkipReason, build_plan};
use listing_pipeline::record::RecordId;

use super::super::Cli;
use super::{load_records, parse_target, select_ids};

pub fn cmd_plan(cli: &Cli, target: Option<&str>, ids: &[String], json: bool) -> Result<()> {
    let records = load_records(&cli.records)?;
    let selected = select_ids(&records, ids)?;
    let target = match parse_target(target)? {
        Some(target) => Some(target),
        None => super::load_config(cli)?.plan.target,
    };

    let chosen: Vec<_> = selected
        .iter()
        .filter_map(|id| records.iter().find(|r| &r.id == id).cloned())
        .collect();
    let plan = build_plan(&chosen, target);

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!();
    if plan.is_empty() {
        println!("Nothing to do: every selected record is complete, at target, or errored.");
    } else {
        println!(
            "{:<4} {:<20} {:<20} {:<7} Records",
            "#", "Phase", "Operation", "Gate"
        );
        println!(
            "{:<4} {:<20} {:<20} {:<7} -------",
            "--", "-----", "---------", "----"
        );
        for (i, bucket) in plan.buckets.iter().enumerate() {
            let operation = bucket
                .operation()
                .map(|o| o.to_string())
                .unwrap_or_default();
            println!(
                "{:<4} {:<20} {:<20} {:<7} {}",
                i + 1,
                bucket.phase.label(),
                operation,
                if bucket.requires_human_input() {
                    "yes"
                } else {
                    ""
                },
                join(&bucket.record_ids)
            );
        }
    }

    if !plan.skipped.is_empty() {
        println!();
        println!("Skipped:");
        for skipped in &plan.skipped {
            let reason = match &skipped.reason {
                SkipReason::Complete => "complete".to_string(),
                SkipReason::ReachedTarget => "at target".to_string(),
                SkipReason::Errored(error) => format!("errored: {}", error),
            };
            println!(
                "  {} ({}) {}",
                skipped.id,
                skipped.phase.label(),
                style(reason).dim()
            );
        }
    }

    println!();
    println!(
        "{} scheduled ({} unattended, {} need a decision), {} skipped, target {}",
        plan.scheduled(),
        plan.auto_processable(),
        plan.manual_required(),
        plan.skipped.len(),
        plan.stop_phase()
    );
    println!();
    Ok(())
}

pub fn cmd_status(cli: &Cli, ids: &[String], json: bool) -> Result<()> {
    let records = load_records(&cli.records)?;
    let selected = select_ids(&records, ids)?;
    let chosen: Vec<_> = records
        .iter()
        .filter(|r| selected.contains(&r.id))
        .collect();

    if json {
        let rows: Vec<_> = chosen
            .iter()
            .map(|r| serde_json::json!({ "id": r.id, "classification": inspect(r) }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!();
    println!("{:<16} {:<20} Next", "Record", "Phase");
    println!("{:<16} {:<20} ----", "------", "-----");
    for record in &chosen {
        let info = inspect(record);
        let next = match info.next_action {
            NextAction::Auto(op) => op.to_string(),
            NextAction::Manual(op) => format!("{} (needs decision)", op),
            NextAction::Done => "done".to_string(),
        };
        let mut notes = Vec::new();
        if info.errored {
            notes.push(format!(
                "error: {}",
                record.error.as_deref().unwrap_or_default()
            ));
        }
        if info.out_of_order {
            notes.push("markers out of order".to_string());
        }
        println!(
            "{:<16} {:<20} {} {}",
            record.id,
            info.phase.label(),
            next,
            style(notes.join("; ")).red()
        );
    }

    let summary = summarize(chosen.iter().copied());
    println!();
    for phase in Phase::ALL {
        let count = summary.count(phase);
        if count > 0 {
            println!("  {:<20} {}", phase.label(), count);
        }
    }
    println!();
    println!(
        "{} record(s): {} can run unattended, {} need a decision, {} errored",
        summary.total,
        summary.auto_processable(),
        summary.manual_required(),
        summary.errored
    );
    println!();
    Ok(())
}

fn join(ids: &[RecordId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
