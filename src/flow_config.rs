//! The `loanflow.toml` pipeline definition.
//!
//! ```toml
//! output_dir = "runs"
//! max_retries = 2
//!
//! [retry]
//! backoff_base_secs = 1.0
//! stage_timeout_secs = 300
//!
//! [[stages]]
//! name = "extraction"
//! command = "./stages/extract.sh"
//! args = ["{subject_id}", "--mode", "{mode}"]
//!
//! [[stages]]
//! name = "mapping"
//! command = "python3"
//! args = ["stages/map.py"]
//! max_retries = 4
//! timeout_secs = 120
//! ```
//!
//! Every section is optional; a missing file means an empty pipeline with
//! default settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::RetryPolicy;
use crate::stage::{CommandStage, Pipeline, PipelineStage};

/// Retry timing shared by all stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    /// Delay before the first retry in seconds; doubles on each later retry
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: f64,
    /// Per-attempt timeout for stages that do not set their own
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,
}

fn default_backoff_base_secs() -> f64 {
    1.0
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            backoff_base_secs: default_backoff_base_secs(),
            stage_timeout_secs: None,
        }
    }
}

/// One `[[stages]]` entry: an external command run as a pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,
    pub command: String,
    /// Arguments; `{subject_id}`, `{run_id}` and `{mode}` are substituted
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides the run's retry count for this stage
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Overrides `[retry].stage_timeout_secs` for this stage
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Root of `loanflow.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowToml {
    /// Directory holding `{run_id}_results.json` files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Default retries per stage after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub stages: Vec<StageDef>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_max_retries() -> u32 {
    2
}

impl Default for FlowToml {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            max_retries: default_max_retries(),
            retry: RetrySection::default(),
            stages: Vec::new(),
        }
    }
}

impl FlowToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse loanflow.toml")
    }

    /// Load `path` if it exists, otherwise return the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize loanflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let backoff_base = Duration::try_from_secs_f64(self.retry.backoff_base_secs)
            .with_context(|| {
                format!(
                    "Invalid retry.backoff_base_secs {}",
                    self.retry.backoff_base_secs
                )
            })?;
        Ok(RetryPolicy {
            backoff_base,
            stage_timeout: self.retry.stage_timeout_secs.map(Duration::from_secs),
        })
    }

    /// Build the pipeline described by `[[stages]]`, in file order.
    pub fn pipeline(&self) -> Pipeline {
        self.stages.iter().fold(Pipeline::new(), |pipeline, def| {
            let mut stage =
                PipelineStage::new(CommandStage::new(&def.name, &def.command, def.args.clone()));
            if let Some(retries) = def.max_retries {
                stage = stage.with_max_retries(retries);
            }
            if let Some(secs) = def.timeout_secs {
                stage = stage.with_timeout(Duration::from_secs(secs));
            }
            pipeline.push(stage)
        })
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.stages.is_empty() {
            warnings.push("No stages defined: add at least one [[stages]] entry".to_string());
        }

        let mut seen = HashSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                warnings.push(format!("Stage #{} has an empty name", i + 1));
            } else if !seen.insert(stage.name.as_str()) {
                warnings.push(format!("Duplicate stage name '{}'", stage.name));
            }
            if stage.command.trim().is_empty() {
                warnings.push(format!("Stage '{}' has an empty command", stage.name));
            }
            if stage.timeout_secs == Some(0) {
                warnings.push(format!(
                    "Stage '{}' has timeout_secs = 0: every attempt would time out",
                    stage.name
                ));
            }
        }

        if self.retry.stage_timeout_secs == Some(0) {
            warnings.push(
                "retry.stage_timeout_secs = 0: every attempt would time out".to_string(),
            );
        }
        if !self.retry.backoff_base_secs.is_finite() || self.retry.backoff_base_secs < 0.0 {
            warnings.push(format!(
                "Invalid retry.backoff_base_secs {}: must be a non-negative number",
                self.retry.backoff_base_secs
            ));
        }

        warnings
    }
}
