use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

use crate::flow_config::FlowToml;
use crate::orchestrator::{Orchestrator, StageRunner};
use crate::status::{RunConfig, StatusStore};

/// Looked up in the working directory when `--config` is not given.
pub const CONFIG_FILE_NAME: &str = "loanflow.toml";
pub const ENV_OUTPUT_DIR: &str = "LOANFLOW_OUTPUT_DIR";
pub const ENV_MAX_RETRIES: &str = "LOANFLOW_MAX_RETRIES";

/// Runtime configuration for loanflow.
///
/// Settings are layered file → environment → CLI: `loanflow.toml` provides
/// the pipeline and defaults, `LOANFLOW_OUTPUT_DIR` / `LOANFLOW_MAX_RETRIES`
/// override them, and explicit command-line flags win over both.
#[derive(Debug, Clone)]
pub struct Config {
    /// The file the configuration was read from, if any
    pub config_file: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub max_retries: u32,
    pub verbose: bool,
    flow: FlowToml,
}

impl Config {
    pub fn load(
        config_file: Option<PathBuf>,
        output_dir: Option<PathBuf>,
        verbose: bool,
    ) -> Result<Self> {
        Self::resolve(config_file, output_dir, verbose, |key| std::env::var(key).ok())
    }

    fn resolve<E>(
        config_file: Option<PathBuf>,
        output_dir_override: Option<PathBuf>,
        verbose: bool,
        env: E,
    ) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
    {
        let config_file = match config_file {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                Some(path)
            }
            None => {
                let default = PathBuf::from(CONFIG_FILE_NAME);
                default.exists().then_some(default)
            }
        };

        let flow = match &config_file {
            Some(path) => FlowToml::load(path)?,
            None => FlowToml::default(),
        };

        // A relative output_dir in the file is relative to the file itself
        let mut output_dir = match &config_file {
            Some(path) if flow.output_dir.is_relative() => path
                .parent()
                .map(|dir| dir.join(&flow.output_dir))
                .unwrap_or_else(|| flow.output_dir.clone()),
            _ => flow.output_dir.clone(),
        };
        let mut max_retries = flow.max_retries;

        if let Some(dir) = env(ENV_OUTPUT_DIR).filter(|v| !v.trim().is_empty()) {
            output_dir = PathBuf::from(dir);
        }
        if let Some(raw) = env(ENV_MAX_RETRIES) {
            max_retries = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid {} value '{}'", ENV_MAX_RETRIES, raw))?;
        }

        if let Some(dir) = output_dir_override {
            output_dir = dir;
        }

        Ok(Self {
            config_file,
            output_dir,
            max_retries,
            verbose,
            flow,
        })
    }

    /// The parsed pipeline definition.
    pub fn flow(&self) -> &FlowToml {
        &self.flow
    }

    pub fn store(&self) -> StatusStore {
        StatusStore::new(&self.output_dir)
    }

    /// Build an orchestrator for the configured pipeline.
    pub fn orchestrator(&self) -> Result<Orchestrator> {
        let runner = StageRunner::new(self.flow.retry_policy()?);
        let orchestrator = Orchestrator::new(self.flow.pipeline(), self.store(), runner)
            .with_context(|| match &self.config_file {
                Some(path) => format!("Invalid pipeline in {}", path.display()),
                None => format!(
                    "No pipeline configured: create {} or pass --config",
                    CONFIG_FILE_NAME
                ),
            })?;
        Ok(orchestrator)
    }

    /// Base run config, with an optional CLI retry override.
    pub fn run_config(&self, max_retries: Option<u32>) -> RunConfig {
        RunConfig {
            max_retries: max_retries.unwrap_or(self.max_retries),
            ..RunConfig::default()
        }
    }

    /// Global flags that make a worker process see this same configuration.
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.config_file {
            args.push("--config".to_string());
            args.push(absolute(path).display().to_string());
        }
        args.push("--output-dir".to_string());
        args.push(absolute(&self.output_dir).display().to_string());
        if self.verbose {
            args.push("--verbose".to_string());
        }
        args
    }

    pub fn ensure_output_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!(
                "Failed to create output directory {}",
                self.output_dir.display()
            )
        })
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
