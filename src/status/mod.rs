//! Run status model and its file-backed store.
//!
//! A [`Run`] is one pipeline execution for one subject (a loan). It is
//! persisted as a single pretty-printed JSON document which front ends poll
//! while the owning worker mutates it through [`StatusStore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod store;
pub use store::StatusStore;

/// Whether stage side effects on the loan system are suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Stages compute their results but must not write to the external system
    #[default]
    Simulate,
    /// Stages apply their side effects
    Live,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Simulate => write!(f, "simulate"),
            RunMode::Live => write!(f, "live"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simulate" | "dry-run" | "dry_run" => Ok(RunMode::Simulate),
            "live" => Ok(RunMode::Live),
            _ => anyhow::bail!("Invalid run mode '{}'. Valid values: simulate, live", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    PendingReview,
}

impl StageStatus {
    /// Statuses that may carry an `output` payload.
    pub fn carries_output(self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::PendingReview)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Success => "success",
            StageStatus::Failed => "failed",
            StageStatus::PendingReview => "pending_review",
        };
        f.write_str(s)
    }
}

/// Status of a whole run, always derivable from its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Running,
    Success,
    Failed,
    PendingReview,
}

impl OverallStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OverallStatus::Running)
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OverallStatus::Running => "running",
            OverallStatus::Success => "success",
            OverallStatus::Failed => "failed",
            OverallStatus::PendingReview => "pending_review",
        };
        f.write_str(s)
    }
}

/// Derive a run's overall status from its stages.
///
/// Precedence: any failed stage fails the run; otherwise a stage awaiting
/// review suspends it; otherwise a running stage keeps it running; otherwise
/// the run succeeded when every stage that was not deliberately skipped
/// succeeded. Anything else (e.g. pending stages with nothing running) is
/// still in flight.
pub fn derive_overall_status(stages: &[StageState]) -> OverallStatus {
    if stages.iter().any(|s| s.status == StageStatus::Failed) {
        return OverallStatus::Failed;
    }
    if stages.iter().any(|s| s.status == StageStatus::PendingReview) {
        return OverallStatus::PendingReview;
    }
    if stages.iter().any(|s| s.status == StageStatus::Running) {
        return OverallStatus::Running;
    }
    let mut executed = stages.iter().filter(|s| !s.skipped).peekable();
    if executed.peek().is_some() && executed.all(|s| s.status == StageStatus::Success) {
        return OverallStatus::Success;
    }
    OverallStatus::Running
}

/// Persisted status of one stage within a run.
///
/// The stage name is the key of the `stages` object in the run file, so it
/// is not repeated inside the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    #[serde(skip)]
    pub name: String,
    pub status: StageStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Left pending on purpose because the run's skip list named it
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageState {
    pub fn new(name: &str, status: StageStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            attempts: 0,
            elapsed_seconds: 0.0,
            output: None,
            error: None,
            skipped: false,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Serialize the ordered stage list as a JSON object keyed by stage name.
///
/// Entries are written and read back in pipeline order.
mod stages_by_name {
    use super::StageState;
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(stages: &[StageState], ser: S) -> Result<S::Ok, S::Error> {
        let mut map = ser.serialize_map(Some(stages.len()))?;
        for stage in stages {
            map.serialize_entry(&stage.name, stage)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<StageState>, D::Error> {
        struct StagesVisitor;

        impl<'de> Visitor<'de> for StagesVisitor {
            type Value = Vec<StageState>;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an object of stage states keyed by stage name")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut stages = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, mut state)) = access.next_entry::<String, StageState>()? {
                    state.name = name;
                    stages.push(state);
                }
                Ok(stages)
            }
        }

        de.deserialize_map(StagesVisitor)
    }
}

fn default_max_retries() -> u32 {
    2
}

/// Parameters a run was created with. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Retries per stage after the first attempt (overridable per stage)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Stages left pending and excluded from the aggregate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_stages: Vec<String>,
    /// Stage after which the run suspends for human review
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_after: Option<String>,
    /// Opaque stage parameters forwarded to every stage
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            skip_stages: Vec::new(),
            stop_after: None,
            params: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One immutable entry of a run's structured log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            stage: None,
            event_type: None,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_string());
        self
    }

    pub fn event(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// One pipeline execution for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub subject_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub mode: RunMode,
    pub config: RunConfig,
    #[serde(with = "stages_by_name")]
    pub stages: Vec<StageState>,
    /// Snapshot stored at finalize; readers should call [`Run::overall_status`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_status: Option<OverallStatus>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_seconds: Option<f64>,
}

impl Run {
    /// Build a fresh run: the first stage starts running, the rest wait.
    pub fn new(
        run_id: String,
        subject_id: &str,
        mode: RunMode,
        config: RunConfig,
        stage_names: &[String],
    ) -> Self {
        let now = Utc::now();
        let stages = stage_names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                if i == 0 {
                    let mut s = StageState::new(name, StageStatus::Running);
                    s.started_at = Some(now);
                    s
                } else {
                    StageState::new(name, StageStatus::Pending)
                }
            })
            .collect();

        Self {
            run_id,
            subject_id: subject_id.to_string(),
            created_at: now,
            completed_at: None,
            mode,
            config,
            stages,
            overall_status: None,
            logs: Vec::new(),
            summary: None,
            summary_text: None,
            aggregated_output: None,
            total_duration_seconds: None,
        }
    }

    /// Overall status, re-derived from the stages.
    pub fn overall_status(&self) -> OverallStatus {
        derive_overall_status(&self.stages)
    }

    pub fn stage(&self, name: &str) -> Option<&StageState> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// The stage currently executing, if any.
    pub fn running_stage(&self) -> Option<&StageState> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Running)
    }

    /// The stage a poller should show as "current".
    pub fn current_stage(&self) -> Option<&StageState> {
        self.stages.iter().find(|s| {
            matches!(
                s.status,
                StageStatus::Running | StageStatus::PendingReview | StageStatus::Failed
            )
        })
    }
}

/// Compact listing row for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub subject_id: String,
    pub mode: RunMode,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub overall_status: OverallStatus,
    pub current_stage: Option<String>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id.clone(),
            subject_id: run.subject_id.clone(),
            mode: run.mode,
            created_at: run.created_at,
            completed_at: run.completed_at,
            overall_status: run.overall_status(),
            current_stage: run.current_stage().map(|s| s.name.clone()),
        }
    }
}

/// A single stage transition applied by [`StatusStore::update_stage`].
#[derive(Debug, Clone, PartialEq)]
pub struct StageUpdate {
    pub status: StageStatus,
    pub attempts: Option<u32>,
    pub elapsed_seconds: Option<f64>,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// On success, flip the next waiting stage to running
    pub advance_next: bool,
}

impl StageUpdate {
    pub fn new(status: StageStatus) -> Self {
        Self {
            status,
            attempts: None,
            elapsed_seconds: None,
            output: None,
            error: None,
            advance_next: false,
        }
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn elapsed(mut self, seconds: f64) -> Self {
        self.elapsed_seconds = Some(seconds);
        self
    }

    pub fn output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn advance_next(mut self, advance: bool) -> Self {
        self.advance_next = advance;
        self
    }
}

/// Results attached to a run when it reaches a terminal state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Finalization {
    pub summary: Value,
    pub summary_text: String,
    pub aggregated_output: Value,
}
