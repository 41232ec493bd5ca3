//! Pipeline execution: `loanflow run`, `loanflow dispatch` and the hidden
//! `loanflow worker`.

use anyhow::{Result, bail};
use std::sync::Arc;

use loanflow::config::Config;
use loanflow::orchestrator::{Orchestrator, fail_run};
use loanflow::status::{OverallStatus, Run, RunConfig, RunMode};

use super::super::RunArgs;
use super::status::styled_status;

fn run_mode(args: &RunArgs) -> RunMode {
    if args.live {
        RunMode::Live
    } else {
        RunMode::Simulate
    }
}

/// Turn `--only` into the equivalent skip list.
fn skip_list(orchestrator: &Orchestrator, args: &RunArgs) -> Result<Vec<String>> {
    if args.only.is_empty() {
        return Ok(args.skip.clone());
    }
    let names = orchestrator.pipeline().names();
    if let Some(unknown) = args.only.iter().find(|s| !names.contains(*s)) {
        bail!(
            "Unknown stage '{}' in --only. Configured stages: {}",
            unknown,
            names.join(", ")
        );
    }
    Ok(names
        .into_iter()
        .filter(|name| !args.only.contains(name))
        .collect())
}

fn build_run_config(
    config: &Config,
    orchestrator: &Orchestrator,
    args: &RunArgs,
) -> Result<RunConfig> {
    let mut run_config = config.run_config(args.max_retries);
    run_config.skip_stages = skip_list(orchestrator, args)?;
    run_config.stop_after = args.stop_after.clone();
    for (key, value) in &args.params {
        run_config.params.insert(key.clone(), value.clone());
    }
    Ok(run_config)
}

fn print_result(run: &Run) {
    println!("Run ID: {}", run.run_id);
    if let Some(text) = &run.summary_text {
        print!("{}", text);
    }
    println!("Status: {}", styled_status(run.overall_status()));
    if let Some(secs) = run.total_duration_seconds {
        println!("Duration: {:.2}s", secs);
    }
}

pub async fn cmd_run(
    config: &Config,
    args: &RunArgs,
    resume_from: Option<&str>,
    run_id: Option<&str>,
) -> Result<()> {
    use loanflow::orchestrator::{ExecuteOptions, ResumePoint};

    config.ensure_output_dir()?;
    let orchestrator = config.orchestrator()?;
    let run_config = build_run_config(config, &orchestrator, args)?;

    let options = match (resume_from, run_id) {
        (Some(stage), Some(id)) => ExecuteOptions {
            resume_from: Some(ResumePoint::new(id, stage)),
            skip_stages: run_config.skip_stages.clone(),
            stop_after: run_config.stop_after.clone(),
        },
        _ => ExecuteOptions::default(),
    };

    let run = orchestrator
        .execute(&args.subject_id, run_mode(args), run_config, options)
        .await?;
    print_result(&run);
    Ok(())
}

pub fn cmd_dispatch(config: &Config, args: &RunArgs) -> Result<()> {
    use loanflow::dispatch::{ProcessLauncher, RunDispatcher};

    config.ensure_output_dir()?;
    let orchestrator = config.orchestrator()?;
    let run_config = build_run_config(config, &orchestrator, args)?;

    let launcher = config
        .worker_args()
        .into_iter()
        .fold(ProcessLauncher::current_exe(&config.output_dir)?, |launcher, arg| {
            launcher.arg(arg)
        });
    let dispatcher = RunDispatcher::new(Arc::new(orchestrator), launcher);
    let run_id = dispatcher.dispatch(&args.subject_id, run_mode(args), run_config)?;

    println!("{}", run_id);
    Ok(())
}

pub async fn cmd_worker(config: &Config, run_id: &str) -> Result<()> {
    let orchestrator = match config.orchestrator() {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            fail_unstarted(config, run_id, &e);
            return Err(e);
        }
    };
    let run = orchestrator.execute_existing(run_id).await?;
    print_result(&run);
    Ok(())
}

/// The worker cannot build its pipeline: fail the dispatched run so pollers
/// see a final status instead of a stage stuck in `running`.
fn fail_unstarted(config: &Config, run_id: &str, error: &anyhow::Error) {
    let store = config.store();
    if !store
        .get(run_id)
        .is_some_and(|run| run.overall_status() == OverallStatus::Running)
    {
        return;
    }
    let message = format!("Worker could not start: {:#}", error);
    if let Err(e) = fail_run(&store, run_id, &message, "run_error") {
        tracing::error!(run_id, error = %e, "Cannot record worker failure");
    }
}
