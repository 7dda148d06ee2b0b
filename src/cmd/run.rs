//! Commands that move a job between states: `run`, `resume`, `pause`,
//! `rollback` and `recover`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::time::Duration;

use draftsmith::orchestrator::RunOutcome;
use draftsmith::store::PauseOutcome;

use super::super::Cli;
use super::job::print_report;
use super::{open_project, resolve_job_id};

pub async fn cmd_run(cli: &Cli, project_dir: &Path, job_id: &str) -> Result<()> {
    let (_, orchestrator) = open_project(cli, project_dir)?;
    let job_id = resolve_job_id(&orchestrator, job_id).await?;
    println!("{}", style(format!("Running job {}", job_id)).bold().cyan());
    let outcome = orchestrator.start(&job_id).await?;
    print_outcome(&job_id, outcome);
    Ok(())
}

pub async fn cmd_resume(cli: &Cli, project_dir: &Path, job_id: &str) -> Result<()> {
    let (_, orchestrator) = open_project(cli, project_dir)?;
    let job_id = resolve_job_id(&orchestrator, job_id).await?;
    println!("{}", style(format!("Resuming job {}", job_id)).bold().cyan());
    let outcome = orchestrator.resume(&job_id).await?;
    print_outcome(&job_id, outcome);
    Ok(())
}

fn print_outcome(job_id: &str, outcome: RunOutcome) {
    match outcome {
        RunOutcome::Completed(report) => {
            println!();
            print_report(&report);
        }
        RunOutcome::Paused { current_pass_index } => {
            println!(
                "{} after {} pass(es). Continue with `draftsmith resume {}`.",
                style("Paused").yellow().bold(),
                current_pass_index,
                job_id
            );
        }
    }
}

pub async fn cmd_pause(cli: &Cli, project_dir: &Path, job_id: &str) -> Result<()> {
    let (_, orchestrator) = open_project(cli, project_dir)?;
    let job_id = resolve_job_id(&orchestrator, job_id).await?;
    match orchestrator.pause(&job_id).await? {
        PauseOutcome::Paused => println!("Job {} paused.", job_id),
        PauseOutcome::Requested => println!(
            "Pause requested. Job {} stops before its next pass.",
            job_id
        ),
        other => anyhow::bail!("Unexpected pause outcome for job {}: {:?}", job_id, other),
    }
    Ok(())
}

pub async fn cmd_rollback(
    cli: &Cli,
    project_dir: &Path,
    job_id: &str,
    pass: u32,
    section: Option<&str>,
) -> Result<()> {
    let (_, orchestrator) = open_project(cli, project_dir)?;
    let job_id = resolve_job_id(&orchestrator, job_id).await?;
    let document = orchestrator.rollback(&job_id, pass, section).await?;

    match section {
        Some(key) => println!(
            "Restored section '{}' of job {} to its state after pass {}.",
            key, job_id, pass
        ),
        None => println!(
            "Restored job {} to its state after pass {} ({} section(s)).",
            job_id,
            pass,
            document.sections.len()
        ),
    }
    println!(
        "{}",
        style("Pass progress is unchanged; earlier versions remain available.").dim()
    );
    Ok(())
}

pub async fn cmd_recover(cli: &Cli, project_dir: &Path, stale_secs: u64) -> Result<()> {
    let (_, orchestrator) = open_project(cli, project_dir)?;
    let recovered = orchestrator
        .recover_interrupted(Duration::from_secs(stale_secs))
        .await?;
    if recovered.is_empty() {
        println!("No interrupted jobs idle for {}s or longer.", stale_secs);
        return Ok(());
    }
    println!(
        "{} {} interrupted job(s):",
        style("Paused").yellow().bold(),
        recovered.len()
    );
    for job_id in recovered {
        println!("  {}  (continue with `draftsmith resume {}`)", job_id, job_id);
    }
    Ok(())
}
