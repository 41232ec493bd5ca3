use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;

use crate::errors::StageError;
use crate::stage::{Stage, StageContext};
use crate::status::StageStatus;

/// Result of running one stage through all of its allowed attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Success {
        attempts: u32,
        elapsed_seconds: f64,
        output: Value,
    },
    Failed {
        attempts: u32,
        elapsed_seconds: f64,
        error: String,
    },
}

impl StageOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            StageOutcome::Success { attempts, .. } | StageOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        match self {
            StageOutcome::Success {
                elapsed_seconds, ..
            }
            | StageOutcome::Failed {
                elapsed_seconds, ..
            } => *elapsed_seconds,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success { .. })
    }

    pub fn status(&self) -> StageStatus {
        match self {
            StageOutcome::Success { .. } => StageStatus::Success,
            StageOutcome::Failed { .. } => StageStatus::Failed,
        }
    }
}

/// Backoff and timeout settings shared by every stage of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubles for each later retry
    pub backoff_base: Duration,
    /// Per-attempt limit, unless the stage sets its own
    pub stage_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            stage_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Delay after the zero-indexed `attempt` failed: base × 2^attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Runs a single stage with timing, retries and exponential backoff.
///
/// Only errors are retried. A stage that returns successfully is reported as
/// a success whatever its payload says; judging the payload is the caller's
/// business.
#[derive(Debug, Clone, Default)]
pub struct StageRunner {
    policy: RetryPolicy,
}

impl StageRunner {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `stage` up to `max_retries + 1` times.
    ///
    /// `elapsed_seconds` sums the time spent inside attempts; backoff sleeps
    /// are not counted.
    pub async fn run(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext,
        max_retries: u32,
        timeout: Option<Duration>,
    ) -> StageOutcome {
        let timeout = timeout.or(self.policy.stage_timeout);
        let max_attempts = max_retries.saturating_add(1);
        let mut elapsed = Duration::ZERO;
        let mut attempt = 0u32;

        loop {
            let started = Instant::now();
            let result = self.attempt(stage, ctx, timeout).await;
            elapsed += started.elapsed();
            attempt += 1;

            match result {
                Ok(output) => {
                    tracing::debug!(
                        run_id = %ctx.run_id,
                        stage = stage.name(),
                        attempt,
                        "Stage succeeded"
                    );
                    return StageOutcome::Success {
                        attempts: attempt,
                        elapsed_seconds: elapsed.as_secs_f64(),
                        output,
                    };
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.policy.backoff_for(attempt - 1);
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        stage = stage.name(),
                        attempt,
                        max_attempts,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "Stage attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        stage = stage.name(),
                        attempt,
                        error = %e,
                        "Stage failed, retries exhausted"
                    );
                    return StageOutcome::Failed {
                        attempts: attempt,
                        elapsed_seconds: elapsed.as_secs_f64(),
                        error: e.to_string(),
                    };
                }
            }
        }
    }

    async fn attempt(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext,
        timeout: Option<Duration>,
    ) -> Result<Value, StageError> {
        let call = AssertUnwindSafe(stage.run(ctx)).catch_unwind();
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => return Err(StageError::TimedOut { after: limit }),
            },
            None => call.await,
        };

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(StageError::from_body(e)),
            Err(panic) => Err(StageError::Panicked {
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
