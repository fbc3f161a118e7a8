//! Pipeline configuration.
//!
//! Settings are read from `listing-pipeline.toml` and layered
//! (file → environment → CLI):
//!
//! ```toml
//! [runner]
//! max_concurrency = 5
//! operation_timeout_secs = 30
//!
//! [plan]
//! target = "approved"
//! ```
//!
//! Environment overrides: `LISTING_PIPELINE_MAX_CONCURRENCY`,
//! `LISTING_PIPELINE_TIMEOUT_SECS`.

use crate::phase::Phase;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "listing-pipeline.toml";
pub const ENV_MAX_CONCURRENCY: &str = "LISTING_PIPELINE_MAX_CONCURRENCY";
pub const ENV_TIMEOUT_SECS: &str = "LISTING_PIPELINE_TIMEOUT_SECS";

/// `[runner]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSection {
    /// Per-record calls in flight at once within a bucket
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Timeout for a single per-record operation call
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_operation_timeout_secs() -> u64 {
    30
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

/// `[plan]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanSection {
    /// Stop advancing records once they reach this phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Phase>,
}

/// The complete `listing-pipeline.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineToml {
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub plan: PlanSection,
}

impl PipelineToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse listing-pipeline.toml")
    }

    /// Load from `dir/listing-pipeline.toml`, or defaults if the file is absent.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize listing-pipeline.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment variable overrides. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<usize>(ENV_MAX_CONCURRENCY) {
            self.runner.max_concurrency = n;
        }
        if let Some(secs) = env_parse::<u64>(ENV_TIMEOUT_SECS) {
            self.runner.operation_timeout_secs = secs;
        }
        self
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.runner.max_concurrency == 0 {
            warnings.push("max_concurrency is 0: treated as 1".to_string());
        }
        if self.runner.operation_timeout_secs == 0 {
            warnings.push(
                "operation_timeout_secs is 0: every operation call will time out".to_string(),
            );
        }
        if self.plan.target == Some(Phase::Scraped) {
            warnings.push("target 'scraped' skips every record".to_string());
        }

        warnings
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            max_concurrency: self.runner.max_concurrency.max(1),
            operation_timeout: Duration::from_secs(self.runner.operation_timeout_secs),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Resolved settings the runner needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub max_concurrency: usize,
    pub operation_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        PipelineToml::default().runner_config()
    }
}

impl RunnerConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}
