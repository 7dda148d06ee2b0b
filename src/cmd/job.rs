//! Job inspection commands: `job create|list`, `status`, `report`, `versions`, `export`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use draftsmith::orchestrator::QualityReport;
use draftsmith::snapshot::score;

use super::super::Cli;
use super::{open_project, resolve_job_id};

pub async fn cmd_job_create(
    cli: &Cli,
    project_dir: &Path,
    document: &Path,
    name: Option<&str>,
) -> Result<()> {
    use draftsmith::document::Document;

    let (config, orchestrator) = open_project(cli, project_dir)?;
    let markdown = std::fs::read_to_string(document)
        .with_context(|| format!("Failed to read document: {}", document.display()))?;
    let document_ref = match name {
        Some(name) => name.to_string(),
        None => document
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| document.display().to_string()),
    };

    let job = orchestrator
        .create_job(&document_ref, config.passes()?, Document::parse(&markdown))
        .await?;

    println!("{} {}", style("Created job").green().bold(), job.id);
    println!("  document: {}", job.document_ref);
    println!("  sections: {}", job.document.sections.len());
    println!("  passes:   {}", job.total_passes());
    Ok(())
}

pub async fn cmd_job_list(cli: &Cli, project_dir: &Path) -> Result<()> {
    let (_, orchestrator) = open_project(cli, project_dir)?;
    let jobs = orchestrator.list_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:>7}  {}",
        "ID", "STATUS", "PASSES", "DOCUMENT"
    );
    for job in jobs {
        println!(
            "{:<36}  {:<10}  {:>7}  {}",
            job.id,
            job.status.as_str(),
            format!("{}/{}", job.current_pass_index, job.total_passes()),
            job.document_ref
        );
    }
    Ok(())
}

pub async fn cmd_status(cli: &Cli, project_dir: &Path, job_id: &str, json: bool) -> Result<()> {
    let (_, orchestrator) = open_project(cli, project_dir)?;
    let job_id = resolve_job_id(&orchestrator, job_id).await?;
    let progress = orchestrator.progress(&job_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }

    println!("{}", style(format!("Job {}", progress.job_id)).bold().cyan());
    println!("  document: {}", progress.document_ref);
    println!("  status:   {}", progress.status);
    println!(
        "  progress: {}/{} passes",
        progress.current_pass_index, progress.total_passes
    );
    if progress.pause_requested {
        println!("  {}", style("pause requested").yellow());
    }
    if let Some(delta) = &progress.last_delta {
        let outcome = if delta.auto_reverted {
            style("reverted").yellow()
        } else {
            style("applied").green()
        };
        println!(
            "  last:     pass {} ({}) {}  +{} -{}  {:.1}% → {:.1}%",
            delta.pass_number,
            delta.pass_name,
            outcome,
            delta.rules_fixed.len(),
            delta.rules_regressed.len(),
            delta.score_before,
            delta.score_after
        );
    }
    if let Some(error) = &progress.error {
        println!("  {} {}", style("Error:").red().bold(), error);
    }
    println!("  updated:  {}", progress.updated_at);
    Ok(())
}

pub async fn cmd_report(cli: &Cli, project_dir: &Path, job_id: &str, json: bool) -> Result<()> {
    let (_, orchestrator) = open_project(cli, project_dir)?;
    let job_id = resolve_job_id(&orchestrator, job_id).await?;
    let report = orchestrator.report(&job_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

pub fn print_report(report: &QualityReport) {
    println!(
        "{}",
        style(format!("Quality report for job {}", report.job_id))
            .bold()
            .cyan()
    );
    if !report.is_complete() {
        println!(
            "  {}",
            style(format!(
                "partial: {}/{} passes run",
                report.passes_run, report.total_passes
            ))
            .yellow()
        );
    }
    println!();

    for pass in &report.passes {
        let marker = if pass.auto_reverted {
            style("↺").yellow()
        } else {
            style("✓").green()
        };
        println!(
            "  {} Pass {:>2} {:<18} +{:<3} -{:<3} {:>5.1}% → {:>5.1}%",
            marker,
            pass.pass_number,
            pass.pass_name,
            pass.rules_fixed.len(),
            pass.rules_regressed.len(),
            pass.score_before,
            pass.score_after
        );
        if let Some(reason) = &pass.revert_reason {
            println!("      {}", style(reason).dim());
        }
    }

    println!();
    println!(
        "  passes: {} applied, {} reverted",
        report.passes_applied, report.passes_reverted
    );
    println!(
        "  rules:  {} fixed, {} regressed",
        report.total_rules_fixed, report.total_rules_regressed
    );
    if let (Some(initial), Some(last)) = (report.initial_score, report.final_score) {
        println!("  score:  {:.1}% → {:.1}%", initial, last);
    }
}

pub async fn cmd_versions(
    cli: &Cli,
    project_dir: &Path,
    job_id: &str,
    section: &str,
) -> Result<()> {
    let (_, orchestrator) = open_project(cli, project_dir)?;
    let job_id = resolve_job_id(&orchestrator, job_id).await?;
    let versions = orchestrator.versions_of(&job_id, section).await?;
    if versions.is_empty() {
        println!("No versions recorded for section '{}'.", section);
        return Ok(());
    }

    println!("{:>4}  {:>4}  {:<12}  {:>6}  PREVIEW", "PASS", "BEST", "HASH", "SCORE");
    for version in versions {
        let best = if version.is_best { "*" } else { "" };
        let section_score = version
            .rule_snapshot
            .as_ref()
            .map(|rules| format!("{:.1}%", score(rules)))
            .unwrap_or_else(|| "-".to_string());
        let preview: String = version
            .content
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .chars()
            .take(48)
            .collect();
        println!(
            "{:>4}  {:>4}  {:<12}  {:>6}  {}",
            version.pass_number,
            best,
            &version.content_hash[..version.content_hash.len().min(12)],
            section_score,
            preview
        );
    }
    Ok(())
}

pub async fn cmd_export(
    cli: &Cli,
    project_dir: &Path,
    job_id: &str,
    output: Option<&Path>,
) -> Result<()> {
    let (_, orchestrator) = open_project(cli, project_dir)?;
    let job_id = resolve_job_id(&orchestrator, job_id).await?;
    let job = orchestrator.get_job(&job_id).await?;
    let markdown = job.document.render();

    match output {
        Some(path) => {
            std::fs::write(path, &markdown)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {} section(s) to {}", job.document.sections.len(), path.display());
        }
        None => println!("{}", markdown),
    }
    Ok(())
}
