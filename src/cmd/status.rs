//! Run inspection: `loanflow status` and `loanflow list`.

use anyhow::{Context, Result};

use loanflow::config::Config;
use loanflow::status::{LogLevel, OverallStatus, Run, StageState, StageStatus};

const RECENT_LOG_LINES: usize = 10;

pub fn styled_status(status: OverallStatus) -> String {
    let text = status.to_string();
    match status {
        OverallStatus::Success => console::style(text).green().bold().to_string(),
        OverallStatus::Failed => console::style(text).red().bold().to_string(),
        OverallStatus::PendingReview => console::style(text).yellow().bold().to_string(),
        OverallStatus::Running => console::style(text).cyan().to_string(),
    }
}

fn styled_stage(stage: &StageState) -> String {
    if stage.skipped {
        return console::style("skipped").dim().to_string();
    }
    let text = format!("{:<14}", stage.status);
    match stage.status {
        StageStatus::Success => console::style(text).green().to_string(),
        StageStatus::Failed => console::style(text).red().to_string(),
        StageStatus::PendingReview => console::style(text).yellow().to_string(),
        StageStatus::Running => console::style(text).cyan().to_string(),
        StageStatus::Pending => console::style(text).dim().to_string(),
    }
}

pub fn cmd_status(config: &Config, run_id: &str, json: bool) -> Result<()> {
    let store = config.store();
    let run = store.get(run_id).with_context(|| {
        format!(
            "Run {} not found in {}",
            run_id,
            config.output_dir.display()
        )
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }
    print_run(&run);
    Ok(())
}

fn print_run(run: &Run) {
    println!();
    println!("Run {}", run.run_id);
    println!("  Subject:  {}", run.subject_id);
    println!("  Mode:     {}", run.mode);
    println!("  Status:   {}", styled_status(run.overall_status()));
    println!(
        "  Created:  {}",
        run.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(done) = run.completed_at {
        println!("  Finished: {}", done.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();
    println!(
        "{:<20} {:<14} {:>8} {:>9}  Error",
        "Stage", "Status", "Attempts", "Elapsed"
    );
    println!(
        "{:<20} {:<14} {:>8} {:>9}  -----",
        "--------------------", "--------------", "--------", "---------"
    );
    for stage in &run.stages {
        println!(
            "{:<20} {} {:>8} {:>8.2}s  {}",
            stage.name,
            styled_stage(stage),
            stage.attempts,
            stage.elapsed_seconds,
            stage.error.as_deref().unwrap_or("")
        );
    }

    if !run.logs.is_empty() {
        println!();
        println!("Recent log:");
        let skip = run.logs.len().saturating_sub(RECENT_LOG_LINES);
        for entry in &run.logs[skip..] {
            let level = match entry.level {
                LogLevel::Info => console::style("INFO ").dim(),
                LogLevel::Warning => console::style("WARN ").yellow(),
                LogLevel::Error => console::style("ERROR").red(),
            };
            println!(
                "  {} {} {}",
                entry.timestamp.format("%H:%M:%S"),
                level,
                entry.message
            );
        }
    }
    println!();
}

pub fn cmd_list(config: &Config, json: bool) -> Result<()> {
    let runs = config.store().list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("No runs found in {}", config.output_dir.display());
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<28} {:<12} {:<9} {:<16} {:<16} Created",
        "Run ID", "Subject", "Mode", "Status", "Current stage"
    );
    println!(
        "{:<28} {:<12} {:<9} {:<16} {:<16} -------",
        "----------------------------",
        "------------",
        "---------",
        "----------------",
        "----------------"
    );
    for run in &runs {
        println!(
            "{:<28} {:<12} {:<9} {:<16} {:<16} {}",
            run.run_id,
            run.subject_id,
            run.mode,
            run.overall_status,
            run.current_stage.as_deref().unwrap_or("-"),
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    println!("{} run(s)", runs.len());
    println!();
    Ok(())
}
