//! Stage definitions and the ordered pipeline they form.
//!
//! This module provides:
//! - `Stage`, the async unit of work the orchestrator drives
//! - `StageContext`, everything a stage body may depend on
//! - `FnStage`, a closure adapter for in-process stages
//! - `CommandStage`, an adapter running an external program per stage
//! - `Pipeline`, the validated, ordered list of stages for a run

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::process::Command;

use crate::errors::OrchestratorError;
use crate::status::RunMode;

/// Inputs handed to a stage body.
///
/// The run mode is passed explicitly so a stage never has to consult
/// process-wide state to decide whether it may write to the loan system.
#[derive(Debug, Clone, PartialEq)]
pub struct StageContext {
    pub run_id: String,
    pub subject_id: String,
    pub mode: RunMode,
    /// Opaque run parameters (the run config's flattened extras)
    pub params: Map<String, Value>,
    /// Outputs of stages that already succeeded in this run
    pub previous_outputs: BTreeMap<String, Value>,
}

impl StageContext {
    pub fn is_simulate(&self) -> bool {
        self.mode == RunMode::Simulate
    }
}

/// One named unit of work in the pipeline.
///
/// Returning `Err` marks the attempt as failed and makes it eligible for a
/// retry. Any `Ok` value, however disappointing its content, is a success.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &StageContext) -> Result<Value>;
}

/// A stage backed by an async closure.
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    pub fn new(name: &str, f: F) -> Self {
        Self {
            name: name.to_string(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> Stage for FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> Result<Value> {
        (self.f)(ctx.clone()).await
    }
}

/// A stage that runs an external program.
///
/// Arguments may contain `{subject_id}`, `{run_id}` and `{mode}`
/// placeholders. The program also receives `LOANFLOW_RUN_ID`,
/// `LOANFLOW_SUBJECT_ID`, `LOANFLOW_MODE`, `LOANFLOW_PARAMS` and
/// `LOANFLOW_PREVIOUS_OUTPUTS` (both JSON) in its environment. Its stdout is
/// parsed as JSON when possible and wrapped as `{"stdout": ...}` otherwise.
/// A non-zero exit status is a failed attempt.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    command: String,
    args: Vec<String>,
}

impl CommandStage {
    pub fn new(name: &str, command: &str, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args,
        }
    }

    fn expand_arg(arg: &str, ctx: &StageContext) -> String {
        arg.replace("{subject_id}", &ctx.subject_id)
            .replace("{run_id}", &ctx.run_id)
            .replace("{mode}", &ctx.mode.to_string())
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> Result<Value> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| Self::expand_arg(a, ctx))
            .collect();
        let params = serde_json::to_string(&ctx.params).context("Failed to encode params")?;
        let previous = serde_json::to_string(&ctx.previous_outputs)
            .context("Failed to encode previous outputs")?;

        let output = Command::new(&self.command)
            .args(&args)
            .env("LOANFLOW_RUN_ID", &ctx.run_id)
            .env("LOANFLOW_SUBJECT_ID", &ctx.subject_id)
            .env("LOANFLOW_MODE", ctx.mode.to_string())
            .env("LOANFLOW_PARAMS", params)
            .env("LOANFLOW_PREVIOUS_OUTPUTS", previous)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn '{}'", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.trim().lines().collect();
            let tail = lines[lines.len().saturating_sub(5)..].join("\n");
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            anyhow::bail!("'{}' exited with {}: {}", self.command, code, tail);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| json!({ "stdout": trimmed })))
    }
}

/// A stage plus its per-stage execution settings.
#[derive(Clone)]
pub struct PipelineStage {
    pub stage: Arc<dyn Stage>,
    /// Overrides the run's `max_retries` for this stage
    pub max_retries: Option<u32>,
    /// Overrides the runner's default per-attempt timeout
    pub timeout: Option<Duration>,
}

impl PipelineStage {
    pub fn new(stage: impl Stage + 'static) -> Self {
        Self {
            stage: Arc::new(stage),
            max_retries: None,
            timeout: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }
}

impl std::fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStage")
            .field("name", &self.name())
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// The fixed, ordered stage sequence of a run.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage with default settings.
    pub fn stage(self, stage: impl Stage + 'static) -> Self {
        self.push(PipelineStage::new(stage))
    }

    pub fn push(mut self, stage: PipelineStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Reject empty pipelines and blank or duplicate stage names.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.stages.is_empty() {
            return Err(OrchestratorError::InvalidPipeline(
                "pipeline has no stages".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            let name = stage.name();
            if name.trim().is_empty() {
                return Err(OrchestratorError::InvalidPipeline(
                    "stage names must not be empty".to_string(),
                ));
            }
            if !seen.insert(name) {
                return Err(OrchestratorError::InvalidPipeline(format!(
                    "duplicate stage name '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.name() == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PipelineStage> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
