use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "draftsmith")]
#[command(version, about = "Multi-pass content pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit console logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a draftsmith project (.draftsmith/ with passes.json and pipeline.toml)
    Init,
    /// Create or list jobs
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Run a pending or paused job to completion
    Run { job_id: String },
    /// Continue a paused job from its checkpoint
    Resume { job_id: String },
    /// Pause a job; a running job stops before its next pass
    Pause { job_id: String },
    /// Show job progress
    Status {
        job_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Show the quality report (partial unless the job completed)
    Report {
        job_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Restore the document, or one section, to its state after a pass
    Rollback {
        job_id: String,
        /// Pass number to restore (0 is the original document)
        #[arg(long)]
        pass: u32,
        /// Only restore this section
        #[arg(long)]
        section: Option<String>,
    },
    /// List every recorded version of a section
    Versions { job_id: String, section: String },
    /// Write the job's current document as markdown
    Export {
        job_id: String,
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Pause jobs left running by a process that exited mid-run
    Recover {
        /// Only recover jobs with no heartbeat for this many seconds
        #[arg(long, default_value_t = draftsmith::orchestrator::DEFAULT_STALE_AFTER.as_secs())]
        stale_secs: u64,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum JobCommands {
    /// Create a pending job for a markdown document
    Create {
        /// Markdown file holding the starting document (may be empty)
        #[arg(short, long)]
        document: PathBuf,
        /// Reference stored with the job (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List all jobs
    List,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let state_dir = draftsmith::config::state_dir(&project_dir);
    let log_dir = state_dir.join("logs");
    let _log_guard = draftsmith::logging::init(
        cli.verbose,
        cli.log_json,
        state_dir.exists().then_some(log_dir.as_path()),
    )?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Job { command } => match command {
            JobCommands::Create { document, name } => {
                cmd::cmd_job_create(&cli, &project_dir, document, name.as_deref()).await?
            }
            JobCommands::List => cmd::cmd_job_list(&cli, &project_dir).await?,
        },
        Commands::Run { job_id } => cmd::cmd_run(&cli, &project_dir, job_id).await?,
        Commands::Resume { job_id } => cmd::cmd_resume(&cli, &project_dir, job_id).await?,
        Commands::Pause { job_id } => cmd::cmd_pause(&cli, &project_dir, job_id).await?,
        Commands::Status { job_id, json } => {
            cmd::cmd_status(&cli, &project_dir, job_id, *json).await?
        }
        Commands::Report { job_id, json } => {
            cmd::cmd_report(&cli, &project_dir, job_id, *json).await?
        }
        Commands::Rollback {
            job_id,
            pass,
            section,
        } => cmd::cmd_rollback(&cli, &project_dir, job_id, *pass, section.as_deref()).await?,
        Commands::Versions { job_id, section } => {
            cmd::cmd_versions(&cli, &project_dir, job_id, section).await?
        }
        Commands::Export { job_id, output } => {
            cmd::cmd_export(&cli, &project_dir, job_id, output.as_deref()).await?
        }
        Commands::Recover { stale_secs } => {
            cmd::cmd_recover(&cli, &project_dir, *stale_secs).await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
