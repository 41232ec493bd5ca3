use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde_json::Value;

use super::observer::{LogObserver, RunEvent, RunObserver};
use super::runner::{StageOutcome, StageRunner};
use super::summary;
use crate::errors::{OrchestratorError, PersistenceError};
use crate::stage::{Pipeline, StageContext};
use crate::status::{
    LogEntry, OverallStatus, Run, RunConfig, RunMode, StageStatus, StageUpdate, StatusStore,
};

/// Where a resumed run picks up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub run_id: String,
    pub stage: String,
}

impl ResumePoint {
    pub fn new(run_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage: stage.into(),
        }
    }
}

/// Per-invocation controls for [`Orchestrator::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub resume_from: Option<ResumePoint>,
    pub skip_stages: Vec<String>,
    pub stop_after: Option<String>,
}

/// Drives a run through the configured pipeline, one stage at a time.
///
/// Every transition is persisted through the [`StatusStore`] before
/// observers hear about it, so a poller never sees an event the file does not
/// reflect yet.
pub struct Orchestrator {
    pipeline: Pipeline,
    store: StatusStore,
    runner: StageRunner,
    observers: Vec<Arc<dyn RunObserver>>,
}

impl Orchestrator {
    /// Create an orchestrator. The run log observer is always installed.
    pub fn new(
        pipeline: Pipeline,
        store: StatusStore,
        runner: StageRunner,
    ) -> Result<Self, OrchestratorError> {
        pipeline.validate()?;
        let log_observer: Arc<dyn RunObserver> = Arc::new(LogObserver::new(store.clone()));
        Ok(Self {
            pipeline,
            store,
            runner,
            observers: vec![log_observer],
        })
    }

    pub fn with_observer(mut self, observer: impl RunObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Validate `config` against the pipeline and persist a fresh run for it.
    pub fn create_run(
        &self,
        subject_id: &str,
        mode: RunMode,
        config: RunConfig,
    ) -> Result<String, OrchestratorError> {
        self.check_stage_names("skip_stages", &config.skip_stages)?;
        if let Some(stop) = &config.stop_after {
            self.check_stage_names("stop_after", std::slice::from_ref(stop))?;
        }
        if self
            .pipeline
            .iter()
            .all(|s| config.skip_stages.iter().any(|k| k == s.name()))
        {
            return Err(OrchestratorError::InvalidPipeline(
                "every stage is skipped, nothing would run".to_string(),
            ));
        }
        let run_id = self
            .store
            .create(subject_id, mode, config, &self.pipeline.names())?;
        Ok(run_id)
    }

    /// Run the pipeline for `subject_id` and return the finalized run.
    ///
    /// With `options.resume_from`, the existing run is continued instead:
    /// earlier stages keep their results and `subject_id` must match.
    pub async fn execute(
        &self,
        subject_id: &str,
        mode: RunMode,
        mut config: RunConfig,
        options: ExecuteOptions,
    ) -> Result<Run, OrchestratorError> {
        self.check_stage_names("skip_stages", &options.skip_stages)?;
        if let Some(stop) = &options.stop_after {
            self.check_stage_names("stop_after", std::slice::from_ref(stop))?;
        }

        if let Some(resume) = &options.resume_from {
            return self.resume(subject_id, resume, &options).await;
        }

        for stage in options.skip_stages {
            if !config.skip_stages.contains(&stage) {
                config.skip_stages.push(stage);
            }
        }
        if options.stop_after.is_some() {
            config.stop_after = options.stop_after;
        }
        let run_id = self.create_run(subject_id, mode, config)?;
        self.execute_existing(&run_id).await
    }

    /// Execute a run that was created earlier (e.g. by the dispatcher) and
    /// has not started yet. Skip and stop settings come from its stored
    /// config.
    ///
    /// A finished run is refused untouched. Any other error once the record
    /// is loaded fails the run, so a dispatched record never stays in flight.
    pub async fn execute_existing(&self, run_id: &str) -> Result<Run, OrchestratorError> {
        let run = self.store.load(run_id)?;
        if run.overall_status() != OverallStatus::Running {
            return Err(OrchestratorError::InvalidResume {
                run_id: run_id.to_string(),
                reason: format!("it already finished with status {}", run.overall_status()),
            });
        }
        let start = match self.check_run_matches_pipeline(&run).and_then(|()| {
            run.stages
                .iter()
                .position(|s| s.status == StageStatus::Running)
                .ok_or_else(|| OrchestratorError::InvalidResume {
                    run_id: run_id.to_string(),
                    reason: "no stage is waiting to run".to_string(),
                })
        }) {
            Ok(start) => start,
            Err(e) => {
                tracing::error!(run_id, error = %e, "Cannot start run, failing it");
                self.fail_in_flight(run_id, &e);
                return Err(e);
            }
        };

        self.notify(&RunEvent::RunStarted {
            run_id: run_id.to_string(),
            subject_id: run.subject_id.clone(),
            resumed_from: None,
        });
        let skip = run.config.skip_stages.clone();
        let stop_after = run.config.stop_after.clone();
        self.drive_guarded(run_id, start, &skip, stop_after.as_deref())
            .await
    }

    async fn resume(
        &self,
        subject_id: &str,
        resume: &ResumePoint,
        options: &ExecuteOptions,
    ) -> Result<Run, OrchestratorError> {
        let start = self
            .pipeline
            .index_of(&resume.stage)
            .ok_or_else(|| OrchestratorError::UnknownStage {
                field: "resume_from",
                stage: resume.stage.clone(),
            })?;
        let run = self.store.load(&resume.run_id)?;
        self.check_run_matches_pipeline(&run)?;
        if run.subject_id != subject_id {
            return Err(OrchestratorError::InvalidResume {
                run_id: run.run_id,
                reason: format!(
                    "it belongs to subject {}, not {}",
                    run.subject_id, subject_id
                ),
            });
        }
        if run.overall_status() == OverallStatus::Running {
            return Err(OrchestratorError::RunActive { run_id: run.run_id });
        }

        let mut skip = run.config.skip_stages.clone();
        for stage in &options.skip_stages {
            if !skip.contains(stage) {
                skip.push(stage.clone());
            }
        }

        // Every earlier stage must have produced its result or been skipped
        let earlier = &run.stages[..start];
        if let Some(gap) = earlier.iter().find(|s| {
            !s.skipped
                && !skip.contains(&s.name)
                && !matches!(s.status, StageStatus::Success | StageStatus::PendingReview)
        }) {
            return Err(OrchestratorError::InvalidResume {
                run_id: run.run_id.clone(),
                reason: format!(
                    "earlier stage '{}' is {}, resume from it instead",
                    gap.name, gap.status
                ),
            });
        }
        let unmarked: Vec<String> = earlier
            .iter()
            .filter(|s| !s.skipped && s.status == StageStatus::Pending)
            .map(|s| s.name.clone())
            .collect();
        for name in &unmarked {
            self.store.mark_skipped(&run.run_id, name)?;
        }

        let run = self.store.reopen(&resume.run_id, &resume.stage)?;
        tracing::info!(run_id = %run.run_id, stage = %resume.stage, "Resuming run");
        self.notify(&RunEvent::RunStarted {
            run_id: run.run_id.clone(),
            subject_id: run.subject_id.clone(),
            resumed_from: Some(resume.stage.clone()),
        });
        for name in unmarked {
            self.notify(&RunEvent::StageSkipped {
                run_id: run.run_id.clone(),
                stage: name,
            });
        }

        let stop_after = options
            .stop_after
            .clone()
            .or_else(|| run.config.stop_after.clone());
        self.drive_guarded(&run.run_id, start, &skip, stop_after.as_deref())
            .await
    }

    /// Run the control loop; on an unexpected error, fail the running stage
    /// and finalize so the run never stays stuck in flight.
    async fn drive_guarded(
        &self,
        run_id: &str,
        start: usize,
        skip: &[String],
        stop_after: Option<&str>,
    ) -> Result<Run, OrchestratorError> {
        match self.drive(run_id, start, skip, stop_after).await {
            Ok(run) => Ok(run),
            Err(e) => {
                tracing::error!(run_id, error = %e, "Orchestrator failed, failing run");
                self.fail_in_flight(run_id, &e);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        run_id: &str,
        start: usize,
        skip: &[String],
        stop_after: Option<&str>,
    ) -> Result<Run, OrchestratorError> {
        let mut run = self.store.load(run_id)?;
        let mut previous_outputs: BTreeMap<String, Value> = run.stages[..start]
            .iter()
            .filter(|s| s.status.carries_output())
            .filter_map(|s| s.output.clone().map(|o| (s.name.clone(), o)))
            .collect();

        let stages: Vec<_> = self.pipeline.iter().collect();
        for (idx, pipeline_stage) in stages.iter().enumerate().skip(start) {
            let name = pipeline_stage.name();

            if skip.iter().any(|s| s == name) {
                run = self.store.mark_skipped(run_id, name)?;
                self.notify(&RunEvent::StageSkipped {
                    run_id: run_id.to_string(),
                    stage: name.to_string(),
                });
                continue;
            }

            let state = run
                .stages
                .get(idx)
                .filter(|s| s.name == name)
                .ok_or_else(|| {
                    OrchestratorError::Internal(format!(
                        "run {} no longer has stage '{}' at position {}",
                        run_id,
                        name,
                        idx + 1
                    ))
                })?;
            let prior_attempts = state.attempts;
            if state.status != StageStatus::Running {
                run = self
                    .store
                    .update_stage(run_id, name, StageUpdate::new(StageStatus::Running))?;
            }
            self.notify(&RunEvent::StageStarted {
                run_id: run_id.to_string(),
                stage: name.to_string(),
            });

            let ctx = StageContext {
                run_id: run_id.to_string(),
                subject_id: run.subject_id.clone(),
                mode: run.mode,
                params: run.config.params.clone(),
                previous_outputs: previous_outputs.clone(),
            };
            let max_retries = pipeline_stage.max_retries.unwrap_or(run.config.max_retries);
            let outcome = self
                .runner
                .run(
                    pipeline_stage.stage.as_ref(),
                    &ctx,
                    max_retries,
                    pipeline_stage.timeout,
                )
                .await;
            let attempts = prior_attempts.saturating_add(outcome.attempts());

            let paused = match &outcome {
                StageOutcome::Success {
                    elapsed_seconds,
                    output,
                    ..
                } if stop_after == Some(name) => {
                    run = self.store.mark_pending_review(
                        run_id,
                        name,
                        attempts,
                        *elapsed_seconds,
                        output.clone(),
                    )?;
                    true
                }
                StageOutcome::Success {
                    elapsed_seconds,
                    output,
                    ..
                } => {
                    let advance = stages
                        .get(idx + 1)
                        .is_some_and(|next| !skip.iter().any(|s| s == next.name()));
                    run = self.store.update_stage(
                        run_id,
                        name,
                        StageUpdate::new(StageStatus::Success)
                            .attempts(attempts)
                            .elapsed(*elapsed_seconds)
                            .output(output.clone())
                            .advance_next(advance),
                    )?;
                    previous_outputs.insert(name.to_string(), output.clone());
                    false
                }
                StageOutcome::Failed {
                    elapsed_seconds,
                    error,
                    ..
                } => {
                    run = self.store.update_stage(
                        run_id,
                        name,
                        StageUpdate::new(StageStatus::Failed)
                            .attempts(attempts)
                            .elapsed(*elapsed_seconds)
                            .error(error.as_str()),
                    )?;
                    false
                }
            };

            let failed = !outcome.is_success();
            self.notify(&RunEvent::StageFinished {
                run_id: run_id.to_string(),
                stage: name.to_string(),
                outcome,
            });

            if paused {
                tracing::info!(run_id, stage = name, "Run paused for review");
                self.notify(&RunEvent::RunPaused {
                    run_id: run_id.to_string(),
                    stage: name.to_string(),
                });
                break;
            }
            if failed {
                break;
            }
        }

        let run = self.finalize(run_id)?;
        tracing::info!(
            run_id,
            overall_status = %run.overall_status(),
            "Run finished"
        );
        self.notify(&RunEvent::RunFinished {
            run_id: run_id.to_string(),
            overall_status: run.overall_status(),
        });
        Ok(run)
    }

    /// Attach summary, text report and aggregated output to the run.
    pub(crate) fn finalize(&self, run_id: &str) -> Result<Run, OrchestratorError> {
        let run = self.store.load(run_id)?;
        Ok(self
            .store
            .finalize(run_id, summary::finalization_for(&run))?)
    }

    /// Best effort version of [`fail_run`] for the orchestrator's own errors.
    pub(crate) fn fail_in_flight(&self, run_id: &str, error: &dyn std::fmt::Display) {
        if let Err(e) = fail_run(&self.store, run_id, &error.to_string(), "run_error") {
            tracing::error!(run_id, error = %e, "Cannot record run failure");
        }
    }

    /// Deliver an event to every observer. Observer failures, panics
    /// included, are logged and recorded but never interrupt the run.
    fn notify(&self, event: &RunEvent) {
        for observer in &self.observers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(event)));
            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => "observer panicked".to_string(),
            };
            tracing::warn!(run_id = event.run_id(), error = %error, "Run observer failed");
            let mut entry = LogEntry::warning(format!("Observer failed: {}", error))
                .event("observer_error");
            if let Some(stage) = event.stage() {
                entry = entry.stage(stage);
            }
            if let Err(e) = self.store.append_log(event.run_id(), entry) {
                tracing::warn!(run_id = event.run_id(), error = %e, "Cannot record observer failure");
            }
        }
    }

    fn check_stage_names(
        &self,
        field: &'static str,
        names: &[String],
    ) -> Result<(), OrchestratorError> {
        match names.iter().find(|n| self.pipeline.get(n).is_none()) {
            Some(unknown) => Err(OrchestratorError::UnknownStage {
                field,
                stage: unknown.clone(),
            }),
            None => Ok(()),
        }
    }

    fn check_run_matches_pipeline(&self, run: &Run) -> Result<(), OrchestratorError> {
        let stored: Vec<&str> = run.stages.iter().map(|s| s.name.as_str()).collect();
        let configured: Vec<&str> = self.pipeline.iter().map(|s| s.name()).collect();
        if stored != configured {
            return Err(OrchestratorError::InvalidResume {
                run_id: run.run_id.clone(),
                reason: format!(
                    "its stages [{}] differ from the configured pipeline [{}]",
                    stored.join(", "),
                    configured.join(", ")
                ),
            });
        }
        Ok(())
    }
}

/// Fail a run that is still in flight: record `message` on the stage it
/// was working on, log it under `event` and finalize.
///
/// With no stage running, the first stage still waiting takes the failure,
/// so an unfinished run always ends `failed`. A finished run only gets the
/// log entry and a fresh finalization.
pub fn fail_run(
    store: &StatusStore,
    run_id: &str,
    message: &str,
    event: &str,
) -> Result<Run, PersistenceError> {
    let run = store.load(run_id)?;
    let target = match run.running_stage() {
        Some(stage) => Some(stage),
        None if run.overall_status() == OverallStatus::Running => run
            .stages
            .iter()
            .find(|s| s.status == StageStatus::Pending && !s.skipped),
        None => None,
    };
    if let Some(stage) = target {
        store.update_stage(
            run_id,
            &stage.name,
            StageUpdate::new(StageStatus::Failed).error(message),
        )?;
    }
    store.append_log(run_id, LogEntry::error(message).event(event))?;
    let run = store.load(run_id)?;
    store.finalize(run_id, summary::finalization_for(&run))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::observer::ChannelObserver;
    use crate::status::LogLevel;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    use crate::orchestrator::runner::RetryPolicy;
    use crate::stage::{FnStage, PipelineStage};

    fn fast_runner() -> StageRunner {
        StageRunner::new(RetryPolicy {
            backoff_base: Duration::from_millis(10),
            stage_timeout: None,
        })
    }

    /// Succeeds after `failures` failed calls; returns the call counter.
    fn counted(name: &str, failures: u32) -> (PipelineStage, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let stage_name = name.to_string();
        let stage = FnStage::new(name, move |ctx: StageContext| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let stage_name = stage_name.clone();
            async move {
                if n < failures {
                    anyhow::bail!("{} unavailable (call {})", stage_name, n + 1);
                }
                Ok(json!({
                    "stage": stage_name,
                    "saw": ctx.previous_outputs.keys().cloned().collect::<Vec<_>>(),
                }))
            }
        });
        (PipelineStage::new(stage), calls)
    }

    struct Fixture {
        _dir: TempDir,
        store: StatusStore,
        calls: Vec<Arc<AtomicU32>>,
        orchestrator: Orchestrator,
    }

    /// Pipeline a, b, c where each stage fails the given number of times.
    fn fixture(failures: [u32; 3]) -> Fixture {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path());
        let mut pipeline = Pipeline::new();
        let mut calls = Vec::new();
        for (name, n) in ["a", "b", "c"].iter().zip(failures) {
            let (stage, counter) = counted(name, n);
            pipeline = pipeline.push(stage);
            calls.push(counter);
        }
        let orchestrator = Orchestrator::new(pipeline, store.clone(), fast_runner()).unwrap();
        Fixture {
            _dir: dir,
            store,
            calls,
            orchestrator,
        }
    }

    impl Fixture {
        fn calls(&self) -> Vec<u32> {
            self.calls
                .iter()
                .map(|c| c.load(Ordering::SeqCst))
                .collect()
        }

        async fn run(&self, options: ExecuteOptions) -> Result<Run, OrchestratorError> {
            self.orchestrator
                .execute("L100", RunMode::Simulate, RunConfig::default(), options)
                .await
        }
    }

    fn statuses(run: &Run) -> Vec<StageStatus> {
        run.stages.iter().map(|s| s.status).collect()
    }

    fn events(run: &Run) -> Vec<&str> {
        run.logs
            .iter()
            .filter_map(|l| l.event_type.as_deref())
            .collect()
    }

    #[tokio::test]
    async fn test_all_stages_succeed_after_retry() {
        let fx = fixture([0, 2, 0]);
        let run = fx.run(ExecuteOptions::default()).await.unwrap();

        assert_eq!(run.overall_status(), OverallStatus::Success);
        assert_eq!(run.overall_status, Some(OverallStatus::Success));
        assert_eq!(
            statuses(&run),
            vec![StageStatus::Success, StageStatus::Success, StageStatus::Success]
        );
        assert_eq!(run.stages[1].attempts, 3);
        assert!(run.completed_at.is_some());
        assert_eq!(fx.calls(), vec![1, 3, 1]);

        let aggregated = run.aggregated_output.as_ref().unwrap();
        assert_eq!(aggregated.as_object().unwrap().len(), 3);
        assert_eq!(aggregated["c"]["saw"], json!(["a", "b"]));
        assert!(run.summary_text.as_deref().unwrap().contains("SUCCESS"));

        // The persisted file agrees with the returned run
        assert_eq!(fx.store.load(&run.run_id).unwrap(), run);
    }

    #[tokio::test]
    async fn test_exhausted_stage_fails_run_and_stops() {
        let fx = fixture([0, 9, 0]);
        let run = fx.run(ExecuteOptions::default()).await.unwrap();

        assert_eq!(run.overall_status(), OverallStatus::Failed);
        assert_eq!(
            statuses(&run),
            vec![StageStatus::Success, StageStatus::Failed, StageStatus::Pending]
        );
        assert_eq!(run.stages[1].attempts, 3);
        assert_eq!(run.stages[1].error.as_deref(), Some("b unavailable (call 3)"));
        assert_eq!(fx.calls(), vec![1, 3, 0]);
        assert!(run.completed_at.is_some());

        let aggregated = run.aggregated_output.as_ref().unwrap();
        assert!(aggregated.get("b").is_none());
        assert!(run.logs.iter().any(|l| l.level == LogLevel::Error
            && l.event_type.as_deref() == Some("stage_failed")));
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_logged_in_order() {
        let fx = fixture([0, 0, 0]);
        let run = fx.run(ExecuteOptions::default()).await.unwrap();
        assert_eq!(
            events(&run),
            vec![
                "run_started",
                "stage_started",
                "stage_completed",
                "stage_started",
                "stage_completed",
                "stage_started",
                "stage_completed",
                "run_finished",
            ]
        );
    }

    #[tokio::test]
    async fn test_skipped_stage_stays_pending_and_run_succeeds() {
        let fx = fixture([0, 0, 0]);
        let run = fx
            .run(ExecuteOptions {
                skip_stages: vec!["b".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(fx.calls(), vec![1, 0, 1]);
        assert_eq!(run.stages[1].status, StageStatus::Pending);
        assert!(run.stages[1].skipped);
        assert_eq!(run.overall_status(), OverallStatus::Success);
        assert_eq!(run.config.skip_stages, vec!["b".to_string()]);
        let aggregated = run.aggregated_output.as_ref().unwrap();
        assert!(aggregated.get("b").is_none());
        assert_eq!(aggregated["c"]["saw"], json!(["a"]));
    }

    #[tokio::test]
    async fn test_skipping_first_stage() {
        let fx = fixture([0, 0, 0]);
        let run = fx
            .run(ExecuteOptions {
                skip_stages: vec!["a".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(fx.calls(), vec![0, 1, 1]);
        assert!(run.stages[0].skipped);
        assert_eq!(run.stages[0].started_at, None);
        assert_eq!(run.overall_status(), OverallStatus::Success);
    }

    #[tokio::test]
    async fn test_stop_after_pauses_for_review() {
        let fx = fixture([0, 0, 0]);
        let run = fx
            .run(ExecuteOptions {
                stop_after: Some("a".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            statuses(&run),
            vec![
                StageStatus::PendingReview,
                StageStatus::Pending,
                StageStatus::Pending
            ]
        );
        assert_eq!(run.overall_status(), OverallStatus::PendingReview);
        assert!(run.completed_at.is_some());
        assert!(run.stages[0].output.is_some());
        assert_eq!(fx.calls(), vec![1, 0, 0]);
        assert!(events(&run).contains(&"run_paused"));
    }

    #[tokio::test]
    async fn test_resume_after_review_keeps_earlier_results() {
        let fx = fixture([1, 0, 0]);
        let paused = fx
            .run(ExecuteOptions {
                stop_after: Some("a".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let before = paused.stages[0].clone();
        assert_eq!(before.attempts, 2);

        let resumed = fx
            .run(ExecuteOptions {
                resume_from: Some(ResumePoint::new(&paused.run_id, "b")),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(resumed.run_id, paused.run_id);
        assert_eq!(resumed.overall_status(), OverallStatus::Success);
        assert_eq!(resumed.stages[0].status, StageStatus::Success);
        assert_eq!(resumed.stages[0].attempts, before.attempts);
        assert_eq!(resumed.stages[0].output, before.output);
        assert_eq!(resumed.stages[0].elapsed_seconds, before.elapsed_seconds);
        assert_eq!(fx.calls(), vec![2, 1, 1]);
        // b received a's output even though a ran in an earlier invocation
        assert_eq!(resumed.stages[1].output.as_ref().unwrap()["saw"], json!(["a"]));
        // Only one run file exists
        assert_eq!(fx.store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_failed_stage_accumulates_attempts() {
        let fx = fixture([0, 3, 0]);
        let failed = fx.run(ExecuteOptions::default()).await.unwrap();
        assert_eq!(failed.stages[1].attempts, 3);
        assert_eq!(failed.overall_status(), OverallStatus::Failed);

        let resumed = fx
            .run(ExecuteOptions {
                resume_from: Some(ResumePoint::new(&failed.run_id, "b")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resumed.overall_status(), OverallStatus::Success);
        assert_eq!(resumed.stages[1].attempts, 4);
        assert_eq!(resumed.stages[1].error, None);
        assert!(resumed.stages.iter().all(|s| s.status == StageStatus::Success));
    }

    #[tokio::test]
    async fn test_unknown_stage_names_rejected_before_any_work() {
        let fx = fixture([0, 0, 0]);
        let err = fx
            .run(ExecuteOptions {
                skip_stages: vec!["nope".into()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::UnknownStage { field: "skip_stages", ref stage } if stage == "nope"
        ));

        let err = fx
            .run(ExecuteOptions {
                stop_after: Some("zzz".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownStage { field: "stop_after", .. }));
        assert!(fx.store.list().unwrap().is_empty());
        assert_eq!(fx.calls(), vec![0, 0, 0]);
    }

    /// Collects the message of every tracing event.
    #[derive(Clone, Default)]
    struct Messages(Arc<Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Messages {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            struct Visitor(Option<String>);
            impl tracing::field::Visit for Visitor {
                fn record_debug(
                    &mut self,
                    field: &tracing::field::Field,
                    value: &dyn std::fmt::Debug,
                ) {
                    if field.name() == "message" {
                        self.0 = Some(format!("{:?}", value));
                    }
                }
            }
            let mut visitor = Visitor(None);
            event.record(&mut visitor);
            if let Some(message) = visitor.0 {
                self.0.lock().unwrap().push(message);
            }
        }
    }

    #[test]
    fn test_create_run_logs_creation_once() {
        use tracing_subscriber::layer::SubscriberExt;

        let fx = fixture([0, 0, 0]);
        let messages = Messages::default();
        let subscriber = tracing_subscriber::registry().with(messages.clone());
        tracing::subscriber::with_default(subscriber, || {
            fx.orchestrator
                .create_run("L100", RunMode::Simulate, RunConfig::default())
                .unwrap();
        });

        let created = messages
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.contains("Created run"))
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_skipping_every_stage_is_rejected() {
        let fx = fixture([0, 0, 0]);
        let err = fx
            .run(ExecuteOptions {
                skip_stages: vec!["a".into(), "b".into(), "c".into()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidPipeline(_)));
        assert_eq!(fx.calls(), vec![0, 0, 0]);
        assert!(fx.store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_from_unknown_stage_leaves_run_untouched() {
        let fx = fixture([0, 9, 0]);
        let failed = fx.run(ExecuteOptions::default()).await.unwrap();
        let before = std::fs::read_to_string(fx.store.path_for(&failed.run_id)).unwrap();

        let err = fx
            .run(ExecuteOptions {
                resume_from: Some(ResumePoint::new(&failed.run_id, "underwriting")),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownStage { field: "resume_from", .. }));
        let after = std::fs::read_to_string(fx.store.path_for(&failed.run_id)).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_resume_missing_run() {
        let fx = fixture([0, 0, 0]);
        let err = fx
            .run(ExecuteOptions {
                resume_from: Some(ResumePoint::new("L100_1", "b")),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Persistence(PersistenceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_resume_refuses_active_run() {
        let fx = fixture([0, 0, 0]);
        let run_id = fx
            .orchestrator
            .create_run("L100", RunMode::Simulate, RunConfig::default())
            .unwrap();
        let err = fx
            .run(ExecuteOptions {
                resume_from: Some(ResumePoint::new(&run_id, "a")),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RunActive { .. }));
    }

    #[tokio::test]
    async fn test_resume_refuses_other_subject() {
        let fx = fixture([0, 9, 0]);
        let failed = fx.run(ExecuteOptions::default()).await.unwrap();
        let err = fx
            .orchestrator
            .execute(
                "L999",
                RunMode::Simulate,
                RunConfig::default(),
                ExecuteOptions {
                    resume_from: Some(ResumePoint::new(&failed.run_id, "b")),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidResume { .. }));
    }

    #[tokio::test]
    async fn test_execute_existing_runs_created_run() {
        let fx = fixture([0, 0, 0]);
        let config = RunConfig {
            skip_stages: vec!["c".into()],
            ..Default::default()
        };
        let run_id = fx
            .orchestrator
            .create_run("L100", RunMode::Live, config)
            .unwrap();
        let run = fx.orchestrator.execute_existing(&run_id).await.unwrap();
        assert_eq!(run.mode, RunMode::Live);
        assert_eq!(fx.calls(), vec![1, 1, 0]);
        assert_eq!(run.overall_status(), OverallStatus::Success);

        // A finished run cannot be started again, and is left as it was
        let before = std::fs::read_to_string(fx.store.path_for(&run_id)).unwrap();
        let err = fx.orchestrator.execute_existing(&run_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidResume { .. }));
        let after = std::fs::read_to_string(fx.store.path_for(&run_id)).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_execute_existing_with_other_pipeline_fails_run() {
        let fx = fixture([0, 0, 0]);
        let run_id = fx
            .orchestrator
            .create_run("L100", RunMode::Simulate, RunConfig::default())
            .unwrap();

        // The worker was configured with a different pipeline
        let (a, a_calls) = counted("a", 0);
        let (d, d_calls) = counted("d", 0);
        let worker =
            Orchestrator::new(Pipeline::new().push(a).push(d), fx.store.clone(), fast_runner())
                .unwrap();
        let err = worker.execute_existing(&run_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidResume { .. }));

        let run = fx.store.load(&run_id).unwrap();
        assert_eq!(run.overall_status(), OverallStatus::Failed);
        assert_eq!(run.overall_status, Some(OverallStatus::Failed));
        assert!(run.completed_at.is_some());
        assert!(run.running_stage().is_none());
        assert_eq!(run.stages[0].status, StageStatus::Failed);
        assert!(run.stages[0].error.as_deref().unwrap().contains("differ"));
        assert!(events(&run).contains(&"run_error"));
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(d_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_existing_without_waiting_stage_fails_run() {
        let fx = fixture([0, 0, 0]);
        let run_id = fx
            .orchestrator
            .create_run("L100", RunMode::Simulate, RunConfig::default())
            .unwrap();
        // Unfinished, but nothing is marked running
        fx.store.mark_skipped(&run_id, "a").unwrap();

        let err = fx.orchestrator.execute_existing(&run_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidResume { .. }));

        let run = fx.store.load(&run_id).unwrap();
        assert_eq!(run.overall_status(), OverallStatus::Failed);
        assert!(run.completed_at.is_some());
        assert_eq!(run.stages[1].status, StageStatus::Failed);
        assert_eq!(run.stages[2].status, StageStatus::Pending);
        assert_eq!(fx.calls(), vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn test_resume_cannot_jump_past_stage_that_never_ran() {
        let fx = fixture([0, 0, 0]);
        let paused = fx
            .run(ExecuteOptions {
                stop_after: Some("a".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let before = std::fs::read_to_string(fx.store.path_for(&paused.run_id)).unwrap();

        let err = fx
            .run(ExecuteOptions {
                resume_from: Some(ResumePoint::new(&paused.run_id, "c")),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidResume { ref reason, .. } if reason.contains("'b'")
        ));
        let after = std::fs::read_to_string(fx.store.path_for(&paused.run_id)).unwrap();
        assert_eq!(before, after);
        assert_eq!(fx.calls(), vec![1, 0, 0]);

        // Resuming at the next stage still works
        let resumed = fx
            .run(ExecuteOptions {
                resume_from: Some(ResumePoint::new(&paused.run_id, "b")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resumed.overall_status(), OverallStatus::Success);
    }

    #[tokio::test]
    async fn test_resume_cannot_jump_past_failed_stage() {
        let fx = fixture([0, 9, 0]);
        let failed = fx.run(ExecuteOptions::default()).await.unwrap();
        assert_eq!(failed.stages[1].status, StageStatus::Failed);

        let err = fx
            .run(ExecuteOptions {
                resume_from: Some(ResumePoint::new(&failed.run_id, "c")),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidResume { .. }));
        let run = fx.store.load(&failed.run_id).unwrap();
        assert_eq!(run.overall_status(), OverallStatus::Failed);
        assert_eq!(run.stages[2].status, StageStatus::Pending);
        assert_eq!(fx.calls(), vec![1, 3, 0]);
    }

    #[tokio::test]
    async fn test_resume_past_skipped_stage() {
        let fx = fixture([0, 0, 0]);
        let paused = fx
            .run(ExecuteOptions {
                skip_stages: vec!["b".into()],
                stop_after: Some("a".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        // The run paused before reaching b
        assert!(!paused.stages[1].skipped);

        let resumed = fx
            .run(ExecuteOptions {
                resume_from: Some(ResumePoint::new(&paused.run_id, "c")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resumed.overall_status(), OverallStatus::Success);
        assert!(resumed.stages[1].skipped);
        assert_eq!(resumed.stages[1].status, StageStatus::Pending);
        assert!(events(&resumed).contains(&"stage_skipped"));
        assert_eq!(fx.calls(), vec![1, 0, 1]);
    }

    #[tokio::test]
    async fn test_stage_retry_override_beats_run_config() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path());
        let (stage, calls) = counted("flaky", 4);
        let pipeline = Pipeline::new().push(stage.with_max_retries(5));
        let orchestrator = Orchestrator::new(pipeline, store, fast_runner()).unwrap();
        let run = orchestrator
            .execute(
                "L5",
                RunMode::Simulate,
                RunConfig::default(),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(run.overall_status(), OverallStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_params_reach_stages() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path());
        let stage = FnStage::new("echo", |ctx: StageContext| async move {
            Ok(json!({ "lender": ctx.params.get("lender").cloned() }))
        });
        let orchestrator =
            Orchestrator::new(Pipeline::new().stage(stage), store, fast_runner()).unwrap();
        let mut config = RunConfig::default();
        config.params.insert("lender".into(), json!("acme"));
        let run = orchestrator
            .execute("L5", RunMode::Simulate, config, ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(run.stages[0].output, Some(json!({ "lender": "acme" })));
    }

    #[tokio::test]
    async fn test_failing_observer_does_not_abort_run() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path());
        let (a, _) = counted("a", 0);
        let (b, _) = counted("b", 0);
        let orchestrator = Orchestrator::new(Pipeline::new().push(a).push(b), store, fast_runner())
            .unwrap()
            .with_observer(|_event: &RunEvent| -> anyhow::Result<()> {
                anyhow::bail!("dashboard unreachable")
            })
            .with_observer(|event: &RunEvent| -> anyhow::Result<()> {
                if matches!(event, RunEvent::StageStarted { .. }) {
                    panic!("observer bug");
                }
                Ok(())
            });

        let run = orchestrator
            .execute(
                "L1",
                RunMode::Simulate,
                RunConfig::default(),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(run.overall_status(), OverallStatus::Success);
        let warnings: Vec<_> = run
            .logs
            .iter()
            .filter(|l| l.level == LogLevel::Warning)
            .collect();
        assert!(warnings.iter().any(|l| l.message.contains("dashboard unreachable")));
        assert!(warnings.iter().any(|l| l.message.contains("observer panicked")));
    }

    #[tokio::test]
    async fn test_channel_observer_sees_every_transition() {
        let fx = fixture([0, 9, 0]);
        let (observer, mut rx) = ChannelObserver::channel();
        let orchestrator = fx.orchestrator.with_observer(observer);
        let run = orchestrator
            .execute(
                "L100",
                RunMode::Simulate,
                RunConfig::default(),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 6);
        assert!(matches!(received[0], RunEvent::RunStarted { .. }));
        assert!(matches!(
            &received[4],
            RunEvent::StageFinished { stage, outcome: StageOutcome::Failed { .. }, .. } if stage == "b"
        ));
        assert_eq!(
            received[5],
            RunEvent::RunFinished {
                run_id: run.run_id.clone(),
                overall_status: OverallStatus::Failed,
            }
        );
    }

    #[tokio::test]
    async fn test_at_most_one_stage_running_at_every_transition() {
        let fx = fixture([0, 1, 0]);
        let store = fx.store.clone();
        let violations = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&violations);
        let orchestrator = fx.orchestrator.with_observer(move |event: &RunEvent| -> anyhow::Result<()> {
            let run = store.load(event.run_id())?;
            let running = run
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::Running)
                .count();
            if running > 1 {
                seen.store(true, Ordering::SeqCst);
            }
            Ok(())
        });
        orchestrator
            .execute(
                "L100",
                RunMode::Simulate,
                RunConfig::default(),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert!(!violations.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_internal_error_fails_running_stage() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path());
        let corrupting_store = store.clone();
        // Renames stage "b" in the run file while "a" runs, so the control
        // loop trips over its own bookkeeping.
        let a = FnStage::new("a", move |ctx: StageContext| {
            let path = corrupting_store.path_for(&ctx.run_id);
            async move {
                let content = std::fs::read_to_string(&path)?;
                std::fs::write(&path, content.replace("\"b\": {", "\"x\": {"))?;
                Ok::<_, anyhow::Error>(json!({}))
            }
        });
        let (b, b_calls) = counted("b", 0);
        let orchestrator =
            Orchestrator::new(Pipeline::new().stage(a).push(b), store.clone(), fast_runner())
                .unwrap();

        let err = orchestrator
            .execute(
                "L1",
                RunMode::Simulate,
                RunConfig::default(),
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Internal(_)));
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);

        let runs = store.list().unwrap();
        let run = store.load(&runs[0].run_id).unwrap();
        assert!(run.running_stage().is_none());
        assert_eq!(run.overall_status(), OverallStatus::Failed);
        assert!(run.completed_at.is_some());
        assert!(events(&run).contains(&"run_error"));
    }

    #[tokio::test]
    async fn test_progress_visible_to_concurrent_reader() {
        let fx = fixture([0, 0, 0]);
        let store = fx.store.clone();
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&snapshots);
        let orchestrator = fx.orchestrator.with_observer(move |event: &RunEvent| -> anyhow::Result<()> {
            if let RunEvent::StageFinished { .. } = event {
                let run = store.load(event.run_id())?;
                sink.lock().unwrap().push(statuses(&run));
            }
            Ok(())
        });
        orchestrator
            .execute(
                "L100",
                RunMode::Simulate,
                RunConfig::default(),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        let snapshots = snapshots.lock().unwrap();
        assert_eq!(
            snapshots[0],
            vec![StageStatus::Success, StageStatus::Running, StageStatus::Pending]
        );
        assert_eq!(
            snapshots[2],
            vec![StageStatus::Success, StageStatus::Success, StageStatus::Success]
        );
    }

    #[test]
    fn test_new_rejects_invalid_pipeline() {
        let dir = tempdir().unwrap();
        let result = Orchestrator::new(Pipeline::new(), StatusStore::new(dir.path()), fast_runner());
        assert!(matches!(result, Err(OrchestratorError::InvalidPipeline(_))));
    }
}
