//! Run lifecycle events and the observers that consume them.
//!
//! The orchestrator pushes a [`RunEvent`] to every registered observer after
//! each transition. Observers run synchronously on the worker; an observer
//! error is logged and recorded in the run log but never stops the run.

use anyhow::Result;
use tokio::sync::mpsc;

use super::runner::StageOutcome;
use crate::status::{LogEntry, OverallStatus, StatusStore};

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        subject_id: String,
        resumed_from: Option<String>,
    },
    StageStarted {
        run_id: String,
        stage: String,
    },
    StageSkipped {
        run_id: String,
        stage: String,
    },
    StageFinished {
        run_id: String,
        stage: String,
        outcome: StageOutcome,
    },
    RunPaused {
        run_id: String,
        stage: String,
    },
    RunFinished {
        run_id: String,
        overall_status: OverallStatus,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StageStarted { run_id, .. }
            | RunEvent::StageSkipped { run_id, .. }
            | RunEvent::StageFinished { run_id, .. }
            | RunEvent::RunPaused { run_id, .. }
            | RunEvent::RunFinished { run_id, .. } => run_id,
        }
    }

    pub fn stage(&self) -> Option<&str> {
        match self {
            RunEvent::StageStarted { stage, .. }
            | RunEvent::StageSkipped { stage, .. }
            | RunEvent::StageFinished { stage, .. }
            | RunEvent::RunPaused { stage, .. } => Some(stage),
            RunEvent::RunStarted { .. } | RunEvent::RunFinished { .. } => None,
        }
    }
}

/// Receives run lifecycle events.
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent) -> Result<()>;
}

impl<F> RunObserver for F
where
    F: Fn(&RunEvent) -> Result<()> + Send + Sync,
{
    fn on_event(&self, event: &RunEvent) -> Result<()> {
        self(event)
    }
}

/// Writes every event into the run's own structured log.
#[derive(Debug, Clone)]
pub struct LogObserver {
    store: StatusStore,
}

impl LogObserver {
    pub fn new(store: StatusStore) -> Self {
        Self { store }
    }

    fn entry_for(event: &RunEvent) -> LogEntry {
        match event {
            RunEvent::RunStarted {
                subject_id,
                resumed_from,
                ..
            } => {
                let entry = match resumed_from {
                    Some(stage) => LogEntry::info(format!("Run resumed at stage {}", stage))
                        .detail("resumed_from", stage.as_str()),
                    None => LogEntry::info("Run started"),
                };
                entry
                    .event("run_started")
                    .detail("subject_id", subject_id.as_str())
            }
            RunEvent::StageStarted { stage, .. } => LogEntry::info(format!("Stage {} started", stage))
                .stage(stage)
                .event("stage_started"),
            RunEvent::StageSkipped { stage, .. } => LogEntry::info(format!("Stage {} skipped", stage))
                .stage(stage)
                .event("stage_skipped"),
            RunEvent::StageFinished { stage, outcome, .. } => match outcome {
                StageOutcome::Success {
                    attempts,
                    elapsed_seconds,
                    ..
                } => LogEntry::info(format!(
                    "Stage {} completed in {:.2}s ({} attempt{})",
                    stage,
                    elapsed_seconds,
                    attempts,
                    if *attempts == 1 { "" } else { "s" }
                ))
                .stage(stage)
                .event("stage_completed")
                .detail("attempts", *attempts)
                .detail("elapsed_seconds", *elapsed_seconds),
                StageOutcome::Failed {
                    attempts,
                    elapsed_seconds,
                    error,
                } => LogEntry::error(format!(
                    "Stage {} failed after {} attempt{}: {}",
                    stage,
                    attempts,
                    if *attempts == 1 { "" } else { "s" },
                    error
                ))
                .stage(stage)
                .event("stage_failed")
                .detail("attempts", *attempts)
                .detail("elapsed_seconds", *elapsed_seconds)
                .detail("error", error.as_str()),
            },
            RunEvent::RunPaused { stage, .. } => {
                LogEntry::info(format!("Paused for review after stage {}", stage))
                    .stage(stage)
                    .event("run_paused")
            }
            RunEvent::RunFinished { overall_status, .. } => {
                let message = format!("Run finished: {}", overall_status);
                let entry = if *overall_status == OverallStatus::Failed {
                    LogEntry::error(message)
                } else {
                    LogEntry::info(message)
                };
                entry
                    .event("run_finished")
                    .detail("overall_status", overall_status.to_string())
            }
        }
    }
}

impl RunObserver for LogObserver {
    fn on_event(&self, event: &RunEvent) -> Result<()> {
        self.store
            .append_log(event.run_id(), Self::entry_for(event))?;
        Ok(())
    }
}

/// Forwards events into an unbounded channel, e.g. for a live UI feed.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self { tx }
    }

    /// Create an observer together with the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl RunObserver for ChannelObserver {
    fn on_event(&self, event: &RunEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("run event receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{LogLevel, RunConfig, RunMode};
    use serde_json::json;
    use tempfile::tempdir;

    fn finished(outcome: StageOutcome) -> RunEvent {
        RunEvent::StageFinished {
            run_id: "L1_1".into(),
            stage: "mapping".into(),
            outcome,
        }
    }

    #[test]
    fn test_event_accessors() {
        let event = RunEvent::RunPaused {
            run_id: "L1_1".into(),
            stage: "mapping".into(),
        };
        assert_eq!(event.run_id(), "L1_1");
        assert_eq!(event.stage(), Some("mapping"));
        let event = RunEvent::RunFinished {
            run_id: "L1_1".into(),
            overall_status: OverallStatus::Success,
        };
        assert_eq!(event.stage(), None);
    }

    #[test]
    fn test_log_entry_for_failed_stage() {
        let entry = LogObserver::entry_for(&finished(StageOutcome::Failed {
            attempts: 3,
            elapsed_seconds: 1.5,
            error: "503 from field service".into(),
        }));
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.event_type.as_deref(), Some("stage_failed"));
        assert_eq!(entry.stage.as_deref(), Some("mapping"));
        assert!(entry.message.contains("after 3 attempts"));
        assert_eq!(entry.details["error"], json!("503 from field service"));
    }

    #[test]
    fn test_log_entry_for_single_attempt_success() {
        let entry = LogObserver::entry_for(&finished(StageOutcome::Success {
            attempts: 1,
            elapsed_seconds: 0.25,
            output: json!({}),
        }));
        assert_eq!(entry.level, LogLevel::Info);
        assert!(entry.message.ends_with("(1 attempt)"), "got: {}", entry.message);
        assert_eq!(entry.details["attempts"], json!(1));
    }

    #[test]
    fn test_log_observer_appends_to_run_log() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path());
        let run_id = store
            .create(
                "L1",
                RunMode::Simulate,
                RunConfig::default(),
                &["mapping".to_string()],
            )
            .unwrap();
        let observer = LogObserver::new(store.clone());
        observer
            .on_event(&RunEvent::StageStarted {
                run_id: run_id.clone(),
                stage: "mapping".into(),
            })
            .unwrap();

        let run = store.get(&run_id).unwrap();
        assert_eq!(run.logs.len(), 1);
        assert_eq!(run.logs[0].event_type.as_deref(), Some("stage_started"));
    }

    #[test]
    fn test_log_observer_errors_for_missing_run() {
        let dir = tempdir().unwrap();
        let observer = LogObserver::new(StatusStore::new(dir.path()));
        let result = observer.on_event(&RunEvent::StageStarted {
            run_id: "ghost_1".into(),
            stage: "x".into(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_closure_observer() {
        let seen = std::sync::Mutex::new(Vec::new());
        let observer = |event: &RunEvent| -> Result<()> {
            seen.lock().unwrap().push(event.run_id().to_string());
            Ok(())
        };
        observer
            .on_event(&RunEvent::RunFinished {
                run_id: "L7_1".into(),
                overall_status: OverallStatus::Failed,
            })
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["L7_1".to_string()]);
    }

    #[test]
    fn test_channel_observer_delivers_and_reports_closed() {
        let (observer, mut rx) = ChannelObserver::channel();
        let event = RunEvent::StageSkipped {
            run_id: "L1_1".into(),
            stage: "email".into(),
        };
        observer.on_event(&event).unwrap();
        assert_eq!(rx.try_recv().unwrap(), event);

        drop(rx);
        assert!(observer.on_event(&event).is_err());
    }
}
