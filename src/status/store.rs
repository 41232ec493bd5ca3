use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;

use super::{
    Finalization, LogEntry, Run, RunConfig, RunMode, RunSummary, StageStatus, StageUpdate,
    derive_overall_status,
};
use crate::errors::PersistenceError;

const RESULTS_SUFFIX: &str = "_results.json";

/// File-backed store holding one JSON document per run.
///
/// Every mutation reads the whole document, applies the change, writes the
/// result to a hidden sibling temp file and renames it over the canonical
/// path. Readers therefore only ever observe complete snapshots. There is no
/// locking: a run file is written only by the worker that owns the run.
#[derive(Debug, Clone)]
pub struct StatusStore {
    output_dir: PathBuf,
}

impl StatusStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Canonical location of a run's record.
    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.output_dir.join(format!("{}{}", run_id, RESULTS_SUFFIX))
    }

    fn temp_path_for(&self, run_id: &str) -> PathBuf {
        self.output_dir
            .join(format!(".{}{}.tmp", run_id, RESULTS_SUFFIX))
    }

    /// Create and persist a new run, returning its id.
    pub fn create(
        &self,
        subject_id: &str,
        mode: RunMode,
        config: RunConfig,
        stage_names: &[String],
    ) -> Result<String, PersistenceError> {
        fs::create_dir_all(&self.output_dir).map_err(|source| PersistenceError::Io {
            path: self.output_dir.clone(),
            source,
        })?;

        let prefix = sanitize_id_component(subject_id);
        let mut timestamp = Utc::now().timestamp();
        let run_id = loop {
            let run_id = format!("{}_{}", prefix, timestamp);
            if self.reserve(&run_id)? {
                break run_id;
            }
            timestamp += 1;
        };

        let run = Run::new(run_id.clone(), subject_id, mode, config, stage_names);
        if let Err(e) = self.write_atomic(&run) {
            let _ = fs::remove_file(self.path_for(&run_id));
            return Err(e);
        }
        tracing::info!(run_id = %run_id, subject_id, %mode, "Created run");
        Ok(run_id)
    }

    /// Claim `run_id` by creating its (empty) file. Returns false when another
    /// writer already holds the id.
    fn reserve(&self, run_id: &str) -> Result<bool, PersistenceError> {
        let path = self.path_for(run_id);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(PersistenceError::Io { path, source }),
        }
    }

    /// Read the current snapshot of a run.
    ///
    /// Missing and malformed records both yield `None` so pollers never
    /// crash on a bad file.
    pub fn get(&self, run_id: &str) -> Option<Run> {
        match self.load(run_id) {
            Ok(run) => Some(run),
            Err(PersistenceError::NotFound { .. }) => None,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "Unreadable run record");
                None
            }
        }
    }

    /// Strict read used by mutations: malformed files are errors.
    pub fn load(&self, run_id: &str) -> Result<Run, PersistenceError> {
        let path = self.path_for(run_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::NotFound {
                    run_id: run_id.to_string(),
                });
            }
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        serde_json::from_str(&content).map_err(|source| PersistenceError::Decode { path, source })
    }

    /// Apply one stage transition.
    ///
    /// `attempts` never decreases. `output` is kept only for success and
    /// pending review, `error` only for failures. With `advance_next` on a
    /// success, the next waiting (non-skipped) stage starts running.
    pub fn update_stage(
        &self,
        run_id: &str,
        stage_name: &str,
        update: StageUpdate,
    ) -> Result<Run, PersistenceError> {
        self.mutate(run_id, |run| {
            let idx = stage_index(run, stage_name)?;
            let now = Utc::now();
            let stage = &mut run.stages[idx];

            stage.status = update.status;
            if let Some(attempts) = update.attempts {
                stage.attempts = stage.attempts.max(attempts);
            }
            if let Some(elapsed) = update.elapsed_seconds {
                stage.elapsed_seconds = elapsed.max(0.0);
            }
            if update.status.carries_output() {
                if let Some(output) = update.output {
                    stage.output = Some(output);
                }
            } else {
                stage.output = None;
            }
            stage.error = if update.status == StageStatus::Failed {
                update.error
            } else {
                None
            };
            match update.status {
                StageStatus::Running => {
                    stage.skipped = false;
                    stage.started_at = Some(now);
                    stage.finished_at = None;
                }
                StageStatus::Pending => {
                    stage.finished_at = None;
                }
                StageStatus::Success | StageStatus::Failed | StageStatus::PendingReview => {
                    stage.finished_at = Some(now);
                }
            }

            if update.status == StageStatus::Success && update.advance_next {
                if let Some(next) = run.stages[idx + 1..]
                    .iter_mut()
                    .find(|s| s.status == StageStatus::Pending && !s.skipped)
                {
                    next.status = StageStatus::Running;
                    next.started_at = Some(now);
                }
            }
            Ok(())
        })
    }

    /// Suspend a stage for human review instead of marking it successful.
    pub fn mark_pending_review(
        &self,
        run_id: &str,
        stage_name: &str,
        attempts: u32,
        elapsed_seconds: f64,
        output: Value,
    ) -> Result<Run, PersistenceError> {
        self.update_stage(
            run_id,
            stage_name,
            StageUpdate::new(StageStatus::PendingReview)
                .attempts(attempts)
                .elapsed(elapsed_seconds)
                .output(output),
        )
    }

    /// Leave a stage pending on purpose.
    pub fn mark_skipped(&self, run_id: &str, stage_name: &str) -> Result<Run, PersistenceError> {
        self.mutate(run_id, |run| {
            let idx = stage_index(run, stage_name)?;
            let stage = &mut run.stages[idx];
            stage.status = StageStatus::Pending;
            stage.skipped = true;
            stage.output = None;
            stage.error = None;
            stage.started_at = None;
            stage.finished_at = None;
            Ok(())
        })
    }

    pub fn append_log(&self, run_id: &str, entry: LogEntry) -> Result<(), PersistenceError> {
        self.mutate(run_id, |run| {
            run.logs.push(entry);
            Ok(())
        })
        .map(|_| ())
    }

    /// Attach final results and stamp the completion time.
    pub fn finalize(
        &self,
        run_id: &str,
        finalization: Finalization,
    ) -> Result<Run, PersistenceError> {
        self.mutate(run_id, |run| {
            run.completed_at = Some(Utc::now());
            run.overall_status = Some(derive_overall_status(&run.stages));
            run.total_duration_seconds =
                Some(run.stages.iter().map(|s| s.elapsed_seconds).sum::<f64>());
            run.summary = Some(finalization.summary);
            run.summary_text = Some(finalization.summary_text);
            run.aggregated_output = Some(finalization.aggregated_output);
            Ok(())
        })
    }

    /// Put a finished run back into flight so it can continue at `resume_from`.
    ///
    /// Stages before `resume_from` that await review are approved (their
    /// output and attempts are kept); `resume_from` and every later stage go
    /// back to pending. Attempt counts are never reset.
    pub fn reopen(&self, run_id: &str, resume_from: &str) -> Result<Run, PersistenceError> {
        self.mutate(run_id, |run| {
            let idx = stage_index(run, resume_from)?;
            for stage in &mut run.stages[..idx] {
                if stage.status == StageStatus::PendingReview {
                    stage.status = StageStatus::Success;
                }
            }
            for stage in &mut run.stages[idx..] {
                stage.status = StageStatus::Pending;
                stage.skipped = false;
                stage.output = None;
                stage.error = None;
                stage.finished_at = None;
            }
            run.completed_at = None;
            run.overall_status = None;
            run.summary = None;
            run.summary_text = None;
            run.aggregated_output = None;
            run.total_duration_seconds = None;
            Ok(())
        })
    }

    /// Summaries of every readable run in the output directory, newest first.
    pub fn list(&self) -> Result<Vec<RunSummary>, PersistenceError> {
        let entries = match fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.output_dir.clone(),
                    source,
                });
            }
        };

        let mut summaries: Vec<RunSummary> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .filter_map(|name| name.strip_suffix(RESULTS_SUFFIX).map(str::to_string))
            .filter_map(|run_id| self.get(&run_id))
            .map(|run| RunSummary::from(&run))
            .collect();

        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(summaries)
    }

    fn mutate<F>(&self, run_id: &str, f: F) -> Result<Run, PersistenceError>
    where
        F: FnOnce(&mut Run) -> Result<(), PersistenceError>,
    {
        let mut run = self.load(run_id)?;
        f(&mut run)?;
        self.write_atomic(&run)?;
        Ok(run)
    }

    fn write_atomic(&self, run: &Run) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(run).map_err(|source| PersistenceError::Encode {
            run_id: run.run_id.clone(),
            source,
        })?;

        let tmp_path = self.temp_path_for(&run.run_id);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| PersistenceError::Io { path, source }
        };

        let mut file = fs::File::create(&tmp_path).map_err(io_err(&tmp_path))?;
        file.write_all(json.as_bytes())
            .map_err(io_err(&tmp_path))?;
        file.sync_all().map_err(io_err(&tmp_path))?;
        drop(file);

        let path = self.path_for(&run.run_id);
        fs::rename(&tmp_path, &path).map_err(io_err(&path))?;
        Ok(())
    }
}

fn stage_index(run: &Run, stage_name: &str) -> Result<usize, PersistenceError> {
    run.stage_index(stage_name)
        .ok_or_else(|| PersistenceError::UnknownStage {
            run_id: run.run_id.clone(),
            stage: stage_name.to_string(),
        })
}

/// Keep run ids usable as file names.
fn sanitize_id_component(subject_id: &str) -> String {
    let cleaned: String = subject_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}
