//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                        |
//! |-----------------|---------------------------------------------------------|
//! | `project`       | `Init`                                                  |
//! | `job`           | `Job`, `Status`, `Report`, `Versions`, `Export`         |
//! | `run`           | `Run`, `Resume`, `Pause`, `Rollback`, `Recover`         |
//! | `config`        | `Config`                                                |

pub mod config;
pub mod job;
pub mod project;
pub mod run;

pub use config::cmd_config;
pub use job::{cmd_export, cmd_job_create, cmd_job_list, cmd_report, cmd_status, cmd_versions};
pub use project::cmd_init;
pub use run::{cmd_pause, cmd_recover, cmd_resume, cmd_rollback, cmd_run};

use anyhow::Result;
use std::path::Path;

use draftsmith::config::Config;
use draftsmith::orchestrator::JobOrchestrator;

use super::Cli;

/// Load config and open the job store, failing if `init` has not been run.
pub fn open_project(cli: &Cli, project_dir: &Path) -> Result<(Config, JobOrchestrator)> {
    let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    if !config.is_initialized() {
        anyhow::bail!("Project not initialized. Run 'draftsmith init' first.");
    }
    let orchestrator = config.orchestrator()?;
    Ok((config, orchestrator))
}

/// Resolve a full job id from an id or an unambiguous prefix of one.
pub async fn resolve_job_id(orchestrator: &JobOrchestrator, input: &str) -> Result<String> {
    let jobs = orchestrator.list_jobs().await?;
    if jobs.iter().any(|j| j.id == input) {
        return Ok(input.to_string());
    }
    let matches: Vec<&str> = jobs
        .iter()
        .filter(|j| j.id.starts_with(input))
        .map(|j| j.id.as_str())
        .collect();
    match matches.as_slice() {
        [id] => Ok(id.to_string()),
        [] => anyhow::bail!("Job {} not found", input),
        _ => anyhow::bail!(
            "Job id '{}' is ambiguous ({} matches); use more characters",
            input,
            matches.len()
        ),
    }
}
