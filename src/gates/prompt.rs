//! Terminal surface for gate decisions.
//!
//! Candidate gates offer the candidates listed in a record's payload; approval
//! gates ask approve / reject / skip. With `--yes` every gate is decided
//! without prompting, and records with nothing to choose from keep waiting.

use crate::gates::{GateDecision, GateRequest};
use crate::phase::Operation;
use crate::record::{Decision, Record, RecordId};
use anyhow::Result;
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use std::collections::BTreeMap;

/// Prompts for gate decisions with dialoguer.
pub struct TerminalGate {
    /// Decide every gate without prompting.
    pub auto_approve: bool,
}

impl TerminalGate {
    pub fn new(auto_approve: bool) -> Self {
        Self { auto_approve }
    }

    /// Ask for a decision on `gate`. `records` are the gate's records, used
    /// to offer candidates.
    pub fn decide(&mut self, gate: &GateRequest, records: &[Record]) -> Result<GateDecision> {
        println!();
        println!(
            "{} {} record(s) waiting at {} for {}",
            style("Gate:").yellow().bold(),
            gate.len(),
            style(gate.phase.label()).cyan(),
            gate.operation
        );

        if self.auto_approve {
            println!("  {} (--yes flag)", style("Auto-decided").dim());
            return Ok(auto_decision(gate, records));
        }

        let options = &[
            "Decide each record",
            "Accept the default for all (and for remaining gates)",
            "Leave these records waiting",
            "Cancel this gate",
        ];

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("How do you want to proceed?")
            .items(options)
            .default(0)
            .interact()?;

        match selection {
            0 => self.prompt_each(gate, records),
            1 => {
                self.auto_approve = true;
                Ok(auto_decision(gate, records))
            }
            2 => Ok(GateDecision::Resolve(BTreeMap::new())),
            3 => Ok(GateDecision::Cancel),
            _ => unreachable!(),
        }
    }

    fn prompt_each(&self, gate: &GateRequest, records: &[Record]) -> Result<GateDecision> {
        let mut decisions = BTreeMap::new();

        for id in &gate.record_ids {
            let record = records.iter().find(|r| &r.id == id);
            let title = record
                .and_then(|r| r.payload.get("title"))
                .and_then(|t| t.as_str())
                .unwrap_or("");
            let prompt = format!("{} {}", style(id).bold(), style(title).dim());

            let decision = match gate.operation {
                Operation::SelectCandidate => {
                    let offered = record.map(candidates).unwrap_or_default();
                    prompt_candidate(&prompt, &offered)?
                }
                _ => prompt_approval(&prompt)?,
            };
            if let Some(decision) = decision {
                decisions.insert(id.clone(), decision);
            }
        }

        Ok(GateDecision::Resolve(decisions))
    }
}

/// Candidate ids offered in a record's payload under `candidates`, as plain
/// strings or objects with an `id`.
pub fn candidates(record: &Record) -> Vec<String> {
    record
        .payload
        .get("candidates")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    serde_json::Value::String(s) => Some(s.clone()),
                    other => other.get("id").and_then(|id| id.as_str()).map(String::from),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// The first offered candidate for a candidate gate, approval for an approval
/// gate. Records offering no candidate get no decision and keep waiting.
fn auto_decision(gate: &GateRequest, records: &[Record]) -> GateDecision {
    let decisions = gate
        .record_ids
        .iter()
        .filter_map(|id| {
            let decision = match gate.operation {
                Operation::SelectCandidate => Decision::CandidateChosen {
                    candidate_id: first_candidate(id, records)?,
                },
                _ => Decision::Approved,
            };
            Some((id.clone(), decision))
        })
        .collect();
    GateDecision::Resolve(decisions)
}

fn first_candidate(id: &RecordId, records: &[Record]) -> Option<String> {
    records
        .iter()
        .find(|r| &r.id == id)
        .and_then(|r| candidates(r).into_iter().next())
}

fn prompt_candidate(prompt: &str, offered: &[String]) -> Result<Option<Decision>> {
    let mut items: Vec<String> = offered.to_vec();
    items.push("Enter a candidate id".to_string());
    items.push("Reject".to_string());
    items.push("Skip for now".to_string());

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    let decision = match selection {
        i if i < offered.len() => Some(Decision::CandidateChosen {
            candidate_id: offered[i].clone(),
        }),
        i if i == offered.len() => {
            let candidate_id: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("Candidate id")
                .interact_text()?;
            Some(Decision::CandidateChosen { candidate_id })
        }
        i if i == offered.len() + 1 => Some(Decision::Rejected {
            reason: prompt_reason()?,
        }),
        _ => None,
    };
    Ok(decision)
}

fn prompt_approval(prompt: &str) -> Result<Option<Decision>> {
    let options = &["Approve", "Reject", "Skip for now"];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(options)
        .default(0)
        .interact()?;

    match selection {
        0 => Ok(Some(Decision::Approved)),
        1 => Ok(Some(Decision::Rejected {
            reason: prompt_reason()?,
        })),
        _ => Ok(None),
    }
}

fn prompt_reason() -> Result<String> {
    let reason: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Reason")
        .allow_empty(true)
        .interact_text()?;
    Ok(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use serde_json::json;
    use uuid::Uuid;

    fn gate(operation: Operation, ids: &[&str]) -> GateRequest {
        GateRequest {
            run_id: Uuid::new_v4(),
            phase: Phase::Searching,
            operation,
            record_ids: ids.iter().map(|id| RecordId::from(*id)).collect(),
            target: None,
            deferred: Vec::new(),
        }
    }

    #[test]
    fn test_candidates_from_payload() {
        let record = Record::new("a").with_payload(json!({
            "candidates": ["ebay-1", {"id": "ebay-2", "price": 12.5}, 7]
        }));
        assert_eq!(candidates(&record), vec!["ebay-1", "ebay-2"]);
        assert!(candidates(&Record::new("b")).is_empty());
    }

    #[test]
    fn test_auto_approve_picks_first_candidate() {
        let records = vec![
            Record::new("a").with_payload(json!({"candidates": ["ebay-9"]})),
            Record::new("b"),
        ];
        let request = gate(Operation::SelectCandidate, &["a", "b"]);

        let decision = TerminalGate::new(true).decide(&request, &records).unwrap();

        let GateDecision::Resolve(decisions) = decision else {
            panic!("Expected Resolve");
        };
        assert_eq!(
            decisions[&RecordId::from("a")],
            Decision::CandidateChosen {
                candidate_id: "ebay-9".into()
            }
        );
        // nothing offered for b, so it keeps waiting
        assert!(!decisions.contains_key(&RecordId::from("b")));
    }

    #[test]
    fn test_auto_approve_at_approval_gate() {
        let request = gate(Operation::Approve, &["a"]);
        let decision = TerminalGate::new(true).decide(&request, &[]).unwrap();
        assert_eq!(
            decision,
            GateDecision::Resolve(BTreeMap::from([(RecordId::from("a"), Decision::Approved)]))
        );
    }
}
