//! Configuration view and validation commands: `draftsmith config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use draftsmith::config::state_dir;
    use draftsmith::pass::load_passes_or_default;
    use draftsmith::pipeline_config::{CONFIG_FILE_NAME, PipelineToml};

    let state_dir = state_dir(project_dir);
    let config_path = state_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Draftsmith Configuration");
            println!("========================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                PipelineToml::load(&config_path)?
            } else {
                println!("No pipeline.toml found at {}", config_path.display());
                println!("Using default configuration:");
                PipelineToml::default()
            };
            println!();

            println!("[transform]");
            if let Some(cmd) = &toml.transform.command {
                println!("  command = \"{}\"", cmd);
            }
            println!("  args = {:?}", toml.transform.args);
            println!("  timeout_secs = {}", toml.transform.timeout_secs);
            println!("  max_attempts = {}", toml.transform.max_attempts);
            println!("  backoff_ms = {}", toml.transform.backoff_ms);
            println!();

            println!("[evaluate]");
            if let Some(cmd) = &toml.evaluate.command {
                println!("  command = \"{}\"", cmd);
            }
            println!("  args = {:?}", toml.evaluate.args);
            println!("  timeout_secs = {}", toml.evaluate.timeout_secs);
            println!();

            println!("[revert]");
            println!("  tie_policy = \"{}\"", toml.revert.tie_policy);
            println!("  score_sections = {}", toml.revert.score_sections);
            println!();

            if !toml.passes.overrides.is_empty() {
                println!("[passes.overrides]");
                for (pattern, override_cfg) in &toml.passes.overrides {
                    println!("  \"{}\":", pattern);
                    if let Some(auto_revert) = override_cfg.auto_revert {
                        println!("    auto_revert = {}", auto_revert);
                    }
                    if let Some(persist) = override_cfg.persist_version {
                        println!("    persist_version = {}", persist);
                    }
                    if let Some(instructions) = &override_cfg.instructions {
                        println!("    instructions = {:?}", instructions);
                    }
                }
                println!();
            }

            println!("Effective values (with env overrides):");
            println!("  transform command = \"{}\"", toml.transform_cmd());
            println!("  evaluate command = \"{}\"", toml.evaluate_cmd());
            println!();

            if !config_path.exists() {
                println!("Run 'draftsmith init' to create a pipeline.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let passes = load_passes_or_default(&state_dir.join("passes.json"))?;
            if !config_path.exists() {
                println!("No pipeline.toml found. Using defaults (valid).");
                println!("{} pass(es) defined.", passes.len());
                return Ok(());
            }

            let toml = PipelineToml::load(&config_path)?;
            let warnings = toml.validate(&passes);

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!("{} pass(es) defined.", passes.len());
            println!();
        }
    }

    Ok(())
}
