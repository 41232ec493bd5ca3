//! Fire-and-forget run submission.
//!
//! [`RunDispatcher::dispatch`] persists the run synchronously so the caller
//! can poll it right away, then hands execution to a [`Launcher`]: either a
//! task on the current tokio runtime or a separate worker process.

use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::errors::{DispatchError, PersistenceError};
use crate::orchestrator::{Orchestrator, fail_run};
use crate::status::{RunConfig, RunMode};

/// Starts executing an already-created run in the background.
pub trait Launcher: Send + Sync {
    fn launch(&self, run_id: &str) -> Result<(), DispatchError>;
}

/// Runs the pipeline as a task on the current tokio runtime.
pub struct TaskLauncher {
    orchestrator: Arc<Orchestrator>,
}

impl TaskLauncher {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

impl Launcher for TaskLauncher {
    fn launch(&self, run_id: &str) -> Result<(), DispatchError> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let orchestrator = Arc::clone(&self.orchestrator);
        let run_id = run_id.to_string();
        handle.spawn(async move {
            if let Err(e) = orchestrator.execute_existing(&run_id).await {
                tracing::error!(run_id = %run_id, error = %e, "Background run failed");
            }
        });
        Ok(())
    }
}

/// Runs the pipeline in a child process: `<program> [args] worker --run-id <id>`.
///
/// The child's stdout and stderr go to `{log_dir}/{run_id}.log`. A detached
/// thread waits on the child so it never lingers as a zombie while the
/// parent is alive.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    log_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            log_dir: log_dir.into(),
        }
    }

    /// Launch workers with the currently running executable.
    pub fn current_exe(log_dir: impl Into<PathBuf>) -> Result<Self, DispatchError> {
        let program = std::env::current_exe().map_err(|source| DispatchError::Spawn {
            program: "<current executable>".to_string(),
            source,
        })?;
        Ok(Self::new(program, log_dir))
    }

    /// Extra arguments placed before the `worker` subcommand.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn log_path(&self, run_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", run_id))
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, run_id: &str) -> Result<(), DispatchError> {
        let program = self.program.display().to_string();
        let spawn_err = |source: std::io::Error| DispatchError::Spawn {
            program: program.clone(),
            source,
        };

        let stdout = File::create(self.log_path(run_id)).map_err(spawn_err)?;
        let stderr = stdout.try_clone().map_err(spawn_err)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("worker")
            .arg("--run-id")
            .arg(run_id)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(spawn_err)?;

        tracing::info!(run_id, pid = child.id(), program = %program, "Launched worker process");
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }
}

/// Creates runs and starts them in the background.
pub struct RunDispatcher {
    orchestrator: Arc<Orchestrator>,
    launcher: Box<dyn Launcher>,
}

impl RunDispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, launcher: impl Launcher + 'static) -> Self {
        Self {
            orchestrator,
            launcher: Box::new(launcher),
        }
    }

    /// Dispatcher that executes runs as tasks on the current runtime.
    pub fn in_process(orchestrator: Arc<Orchestrator>) -> Self {
        let launcher = TaskLauncher::new(Arc::clone(&orchestrator));
        Self::new(orchestrator, launcher)
    }

    /// Create the run and start it; returns as soon as the run file exists.
    ///
    /// If the worker cannot be started the run is failed on the spot and the
    /// launch error is returned, so no record is left waiting forever.
    pub fn dispatch(
        &self,
        subject_id: &str,
        mode: RunMode,
        config: RunConfig,
    ) -> Result<String, DispatchError> {
        let run_id = self.orchestrator.create_run(subject_id, mode, config)?;
        if let Err(e) = self.launcher.launch(&run_id) {
            tracing::error!(run_id = %run_id, error = %e, "Failed to launch run");
            if let Err(mark_err) = self.fail_unlaunched(&run_id, &e) {
                tracing::error!(run_id = %run_id, error = %mark_err, "Cannot record launch failure");
            }
            return Err(e);
        }
        tracing::info!(run_id = %run_id, subject_id, "Dispatched run");
        Ok(run_id)
    }

    fn fail_unlaunched(&self, run_id: &str, error: &DispatchError) -> Result<(), PersistenceError> {
        let message = format!("Failed to launch run: {}", error);
        fail_run(self.orchestrator.store(), run_id, &message, "launch_failed")?;
        Ok(())
    }
}
