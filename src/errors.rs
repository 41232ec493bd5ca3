//! Typed error hierarchy for the loanflow engine.
//!
//! Four enums cover the four failure domains:
//! - `StageError`: a stage body failed, timed out or panicked (retryable)
//! - `PersistenceError`: the status store could not read or write a run file
//! - `DispatchError`: a background worker could not be launched
//! - `OrchestratorError`: failures of the control loop itself

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of a single stage attempt.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{message}")]
    Failed { message: String },

    #[error("stage timed out after {}s", after.as_secs_f64())]
    TimedOut { after: Duration },

    #[error("stage panicked: {message}")]
    Panicked { message: String },
}

impl StageError {
    /// Wrap an error returned by a stage body, keeping its full context chain.
    pub fn from_body(err: anyhow::Error) -> Self {
        StageError::Failed {
            message: format!("{:#}", err),
        }
    }
}

/// Errors from the file-backed status store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Run {run_id} not found")]
    NotFound { run_id: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize run {run_id}: {source}")]
    Encode {
        run_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Malformed run file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Run {run_id} has no stage named '{stage}'")]
    UnknownStage { run_id: String, stage: String },
}

/// Errors raised while launching a run in the background.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No async runtime available to launch the run")]
    NoRuntime,

    #[error("Failed to spawn worker process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Run rejected: {0}")]
    Rejected(#[from] OrchestratorError),
}

/// Errors from the orchestrator control loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Unknown stage '{stage}' in {field}")]
    UnknownStage { field: &'static str, stage: String },

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Run {run_id} is still running and cannot be resumed")]
    RunActive { run_id: String },

    #[error("Cannot continue run {run_id}: {reason}")]
    InvalidResume { run_id: String, reason: String },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Internal orchestrator error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_from_body_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("Encompass read failed");
        let stage_err = StageError::from_body(err);
        let msg = stage_err.to_string();
        assert!(msg.contains("Encompass read failed"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn stage_error_timeout_reports_seconds() {
        let err = StageError::TimedOut {
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "stage timed out after 1.5s");
    }

    #[test]
    fn persistence_error_io_carries_path() {
        let path = PathBuf::from("/runs/L1_1_results.json");
        let err = PersistenceError::Io {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        match &err {
            PersistenceError::Io { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Io variant"),
        }
        assert!(err.to_string().contains("L1_1_results.json"));
    }

    #[test]
    fn dispatch_error_converts_from_persistence_error() {
        let inner = PersistenceError::NotFound {
            run_id: "L1_1".to_string(),
        };
        let err: DispatchError = inner.into();
        assert!(matches!(
            err,
            DispatchError::Persistence(PersistenceError::NotFound { .. })
        ));
    }

    #[test]
    fn orchestrator_error_unknown_stage_names_field() {
        let err = OrchestratorError::UnknownStage {
            field: "resume_from",
            stage: "nope".to_string(),
        };
        assert!(err.to_string().contains("resume_from"));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StageError::Failed {
            message: "x".into(),
        });
        assert_std_error(&PersistenceError::NotFound { run_id: "x".into() });
        assert_std_error(&DispatchError::NoRuntime);
        assert_std_error(&OrchestratorError::Internal("x".into()));
    }
}
