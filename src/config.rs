use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::capability::command::{CommandEvaluator, CommandTransformer};
use crate::capability::{Evaluator, Transformer};
use crate::orchestrator::JobOrchestrator;
use crate::pass::{PassDefinition, PassesFile, default_passes, load_passes_or_default};
use crate::pipeline_config::{CONFIG_FILE_NAME, PipelineToml};
use crate::store::{DbHandle, PipelineDb};

pub const STATE_DIR_NAME: &str = ".draftsmith";

/// State directory for a project.
pub fn state_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(STATE_DIR_NAME)
}

#[derive(Debug)]
pub struct InitResult {
    pub state_dir: PathBuf,
    /// False when the state directory already existed
    pub created: bool,
    pub files_written: Vec<PathBuf>,
}

/// Create `.draftsmith/` with a default `passes.json` and `pipeline.toml`.
/// Existing files are never overwritten.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let state_dir = state_dir(project_dir);
    let created = !state_dir.exists();
    std::fs::create_dir_all(state_dir.join("logs"))
        .with_context(|| format!("Failed to create {}", state_dir.display()))?;

    let mut files_written = Vec::new();

    let passes_file = state_dir.join("passes.json");
    if !passes_file.exists() {
        PassesFile::new(default_passes()).save(&passes_file)?;
        files_written.push(passes_file);
    }

    let pipeline_file = state_dir.join(CONFIG_FILE_NAME);
    if !pipeline_file.exists() {
        let mut toml = PipelineToml::default();
        toml.transform.command = Some("claude".to_string());
        toml.evaluate.command = Some("draftsmith-audit".to_string());
        toml.save(&pipeline_file)?;
        files_written.push(pipeline_file);
    }

    Ok(InitResult {
        state_dir,
        created,
        files_written,
    })
}

/// Runtime configuration for draftsmith.
///
/// Resolves every path under the project's `.draftsmith/` directory and
/// builds the capabilities and orchestrator from `pipeline.toml`.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub passes_file: PathBuf,
    pub pipeline_file: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub toml: PipelineToml,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = state_dir(&project_dir);
        let toml = PipelineToml::load_or_default(&state_dir)?;

        Ok(Self {
            db_path: state_dir.join("jobs.db"),
            passes_file: state_dir.join("passes.json"),
            pipeline_file: state_dir.join(CONFIG_FILE_NAME),
            log_dir: state_dir.join("logs"),
            state_dir,
            project_dir,
            verbose,
            toml,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state_dir.exists()
    }

    /// Pass list for new jobs, with `pipeline.toml` overrides applied.
    pub fn passes(&self) -> Result<Vec<PassDefinition>> {
        let passes = load_passes_or_default(&self.passes_file)?;
        Ok(self.toml.apply_overrides(passes))
    }

    pub fn open_db(&self) -> Result<DbHandle> {
        self.ensure_directories()?;
        let db = PipelineDb::new(&self.db_path)?;
        Ok(DbHandle::new(db))
    }

    pub fn transformer(&self) -> Arc<dyn Transformer> {
        Arc::new(CommandTransformer::new(
            &self.toml.transform_cmd(),
            self.toml.transform.args.clone(),
            self.project_dir.clone(),
            Duration::from_secs(self.toml.transform.timeout_secs),
        ))
    }

    pub fn evaluator(&self) -> Arc<dyn Evaluator> {
        Arc::new(CommandEvaluator::new(
            &self.toml.evaluate_cmd(),
            self.toml.evaluate.args.clone(),
            self.project_dir.clone(),
            Duration::from_secs(self.toml.evaluate.timeout_secs),
        ))
    }

    pub fn orchestrator(&self) -> Result<JobOrchestrator> {
        Ok(JobOrchestrator::new(
            self.open_db()?,
            self.transformer(),
            self.evaluator(),
            self.toml.executor_settings(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_project_writes_defaults_once() {
        let dir = tempdir().unwrap();
        let first = init_project(dir.path()).unwrap();
        assert!(first.created);
        assert_eq!(first.files_written.len(), 2);
        assert!(first.state_dir.join("logs").is_dir());

        let passes = PassesFile::load(&first.state_dir.join("passes.json")).unwrap();
        assert_eq!(passes.passes.len(), 10);
        let toml = PipelineToml::load(&first.state_dir.join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(toml.transform.command.as_deref(), Some("claude"));

        std::fs::write(first.state_dir.join(CONFIG_FILE_NAME), "").unwrap();
        let second = init_project(dir.path()).unwrap();
        assert!(!second.created);
        assert!(second.files_written.is_empty());
        let kept = std::fs::read_to_string(first.state_dir.join(CONFIG_FILE_NAME)).unwrap();
        assert!(kept.is_empty());
    }

    #[test]
    fn test_config_paths() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        let root = dir.path().canonicalize().unwrap();

        assert_eq!(config.state_dir, root.join(".draftsmith"));
        assert_eq!(config.db_path, root.join(".draftsmith/jobs.db"));
        assert_eq!(config.passes_file, root.join(".draftsmith/passes.json"));
        assert_eq!(config.pipeline_file, root.join(".draftsmith/pipeline.toml"));
        assert!(!config.is_initialized());
    }

    #[test]
    fn test_config_missing_project_dir() {
        let dir = tempdir().unwrap();
        assert!(Config::new(dir.path().join("missing"), false).is_err());
    }

    #[test]
    fn test_open_db_creates_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        let db = config.open_db().unwrap();

        assert!(config.db_path.exists());
        assert!(config.log_dir.exists());
        assert!(db.lock_sync().unwrap().list_jobs().unwrap().is_empty());
    }

    #[test]
    fn test_passes_apply_overrides() {
        let dir = tempdir().unwrap();
        let state = dir.path().join(STATE_DIR_NAME);
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(
            state.join(CONFIG_FILE_NAME),
            "[passes.overrides.\"polish\"]\nauto_revert = false\n",
        )
        .unwrap();
        PassesFile::new(vec![
            PassDefinition::new(1, "Draft", "write"),
            PassDefinition::new(2, "Polish", "fix"),
        ])
        .save(&state.join("passes.json"))
        .unwrap();

        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        let passes = config.passes().unwrap();
        assert_eq!(passes.len(), 2);
        assert!(passes[0].auto_revert);
        assert!(!passes[1].auto_revert);
    }

    #[test]
    fn test_passes_default_without_file() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        assert_eq!(config.passes().unwrap().len(), 10);
    }

    #[test]
    fn test_invalid_pipeline_toml_is_error() {
        let dir = tempdir().unwrap();
        let state = dir.path().join(STATE_DIR_NAME);
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join(CONFIG_FILE_NAME), "[transform\n").unwrap();
        assert!(Config::new(dir.path().to_path_buf(), false).is_err());
    }
}
