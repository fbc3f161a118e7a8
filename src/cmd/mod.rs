//! CLI command implementations.
//!
//! | Module    | Commands handled   |
//! |-----------|--------------------|
//! | `plan`    | `Plan`, `Status`   |
//! | `run`     | `Run`              |
//! | `config`  | `Config`           |
//!
//! Every command works on a JSON records file loaded into a `MemoryStore`.

pub mod config;
pub mod plan;
pub mod run;

pub use config::cmd_config;
pub use plan::{cmd_plan, cmd_status};
pub use run::{RunOverrides, cmd_run};

use anyhow::{Context, Result, bail};
use listing_pipeline::config::PipelineToml;
use listing_pipeline::phase::Phase;
use listing_pipeline::record::{Record, RecordId};
use std::path::Path;

use super::Cli;

/// Read the records file.
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read records file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse records file: {}", path.display()))
}

/// Write the records file back, pretty-printed.
pub fn save_records(path: &Path, records: &[Record]) -> Result<()> {
    let content = serde_json::to_string_pretty(records).context("Failed to serialize records")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write records file: {}", path.display()))
}

/// Ids named on the command line, or every record when none are.
pub fn select_ids(records: &[Record], requested: &[String]) -> Result<Vec<RecordId>> {
    if requested.is_empty() {
        return Ok(records.iter().map(|r| r.id.clone()).collect());
    }

    let unknown: Vec<&str> = requested
        .iter()
        .map(|s| s.trim())
        .filter(|id| !records.iter().any(|r| r.id.as_str() == *id))
        .collect();
    if !unknown.is_empty() {
        bail!("Unknown record id(s): {}", unknown.join(", "));
    }

    Ok(requested.iter().map(|s| RecordId::from(s.trim())).collect())
}

pub fn parse_target(target: Option<&str>) -> Result<Option<Phase>> {
    target.map(str::parse).transpose()
}

/// `--config` if given, otherwise `listing-pipeline.toml` in the current
/// directory (or defaults), with environment overrides applied.
pub fn load_config(cli: &Cli) -> Result<PipelineToml> {
    let toml = match &cli.config {
        Some(path) => PipelineToml::load(path)?,
        None => {
            let dir = std::env::current_dir().context("Failed to get current directory")?;
            PipelineToml::load_or_default(&dir)?
        }
    };
    for warning in toml.validate() {
        tracing::warn!("{}", warning);
    }
    Ok(toml.with_env_overrides())
}
