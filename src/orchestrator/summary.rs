//! Final results attached to a run: structured summary, text report and the
//! aggregate of stage outputs.

use serde_json::{Map, Value, json};

use crate::status::{Finalization, Run, StageStatus};

pub fn finalization_for(run: &Run) -> Finalization {
    Finalization {
        summary: summary(run),
        summary_text: summary_text(run),
        aggregated_output: aggregate_outputs(run),
    }
}

/// Structured per-stage summary.
pub fn summary(run: &Run) -> Value {
    let stages: Map<String, Value> = run
        .stages
        .iter()
        .map(|s| {
            let mut entry = json!({
                "status": s.status,
                "attempts": s.attempts,
                "elapsed_seconds": s.elapsed_seconds,
            });
            if let Some(error) = &s.error {
                entry["error"] = json!(error);
            }
            if s.skipped {
                entry["skipped"] = json!(true);
            }
            (s.name.clone(), entry)
        })
        .collect();

    json!({
        "run_id": run.run_id,
        "subject_id": run.subject_id,
        "mode": run.mode,
        "overall_status": run.overall_status(),
        "stages_completed": run.stages.iter().filter(|s| s.status == StageStatus::Success).count(),
        "stages_total": run.stages.len(),
        "total_duration_seconds": run.stages.iter().map(|s| s.elapsed_seconds).sum::<f64>(),
        "stages": stages,
    })
}

/// Human-readable report, one line per stage.
pub fn summary_text(run: &Run) -> String {
    let width = run
        .stages
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(0)
        .max(5);

    let mut out = format!(
        "Run {} for {} ({}): {}\n",
        run.run_id,
        run.subject_id,
        run.mode,
        run.overall_status().to_string().to_uppercase()
    );
    for stage in &run.stages {
        let status = if stage.skipped {
            "skipped".to_string()
        } else {
            stage.status.to_string()
        };
        let mut line = format!(
            "  {:<width$}  {:<14}  {:>2} attempt{:<1}  {:>7.2}s",
            stage.name,
            status,
            stage.attempts,
            if stage.attempts == 1 { "" } else { "s" },
            stage.elapsed_seconds,
            width = width
        );
        if let Some(error) = &stage.error {
            line.push_str("  error: ");
            line.push_str(error);
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Outputs of the stages that produced one, keyed by stage name.
/// Skipped and unfinished stages are left out.
pub fn aggregate_outputs(run: &Run) -> Value {
    let outputs: Map<String, Value> = run
        .stages
        .iter()
        .filter(|s| !s.skipped && s.status.carries_output())
        .filter_map(|s| s.output.clone().map(|o| (s.name.clone(), o)))
        .collect();
    Value::Object(outputs)
}
