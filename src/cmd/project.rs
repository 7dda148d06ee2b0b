//! Project initialization: `draftsmith init`.

use anyhow::Result;

pub fn cmd_init(project_dir: &std::path::Path) -> Result<()> {
    use draftsmith::config::init_project;

    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized draftsmith project at {}",
            result.state_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .draftsmith/");
        println!("  ├── passes.json     # Pass definitions, in execution order");
        println!("  ├── pipeline.toml   # Transformer, evaluator and revert settings");
        println!("  └── logs/           # Daily log files");
        println!();
        println!("Next steps:");
        println!("  1. Point [transform] and [evaluate] in pipeline.toml at your commands");
        println!("  2. Run `draftsmith job create --document draft.md`");
        println!("  3. Run `draftsmith run <job-id>`");
    } else {
        println!(
            "Draftsmith project already initialized at {}",
            result.state_dir.display()
        );
        for path in &result.files_written {
            println!("  restored {}", path.display());
        }
    }

    Ok(())
}
