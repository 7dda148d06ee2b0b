//! Pipeline configuration read from `.draftsmith/pipeline.toml`.
//!
//! Every field has a default, so a missing file is a valid configuration.
//! Values are layered file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [transform]
//! command = "claude"
//! args = ["--print"]
//! timeout_secs = 300
//! max_attempts = 3
//! backoff_ms = 2000
//!
//! [evaluate]
//! command = "draftsmith-audit"
//! args = []
//! timeout_secs = 120
//!
//! [revert]
//! tie_policy = "accept"
//! score_sections = true
//!
//! [passes.overrides."schema*"]
//! auto_revert = false
//! instructions = "Emit JSON-LD only."
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::delta::{RevertPolicy, TiePolicy};
use crate::orchestrator::ExecutorSettings;
use crate::pass::PassDefinition;

pub const CONFIG_FILE_NAME: &str = "pipeline.toml";

/// How the transformation command is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSection {
    /// Command reading the prompt on stdin (default: "claude")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default = "default_transform_args")]
    pub args: Vec<String>,
    #[serde(default = "default_transform_timeout")]
    pub timeout_secs: u64,
    /// Attempts per pass, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, doubled after each failure
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_transform_args() -> Vec<String> {
    vec!["--print".to_string()]
}

fn default_transform_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    2000
}

impl Default for TransformSection {
    fn default() -> Self {
        Self {
            command: None,
            args: default_transform_args(),
            timeout_secs: default_transform_timeout(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// How the rule engine is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateSection {
    /// Command reading content on stdin and printing rule JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_evaluate_timeout")]
    pub timeout_secs: u64,
}

fn default_evaluate_timeout() -> u64 {
    120
}

impl Default for EvaluateSection {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: default_evaluate_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertSection {
    /// What to do when a pass fixes exactly as many rules as it regresses
    #[serde(default)]
    pub tie_policy: TiePolicy,
    /// Score changed sections on their own when choosing best versions
    #[serde(default = "default_score_sections")]
    pub score_sections: bool,
}

fn default_score_sections() -> bool {
    true
}

impl Default for RevertSection {
    fn default() -> Self {
        Self {
            tie_policy: TiePolicy::default(),
            score_sections: default_score_sections(),
        }
    }
}

/// Settings applied to every pass whose name matches the pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_revert: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_version: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassesConfig {
    /// Glob pattern on pass name → override
    #[serde(default)]
    pub overrides: BTreeMap<String, PassOverride>,
}

/// The complete pipeline.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineToml {
    #[serde(default)]
    pub transform: TransformSection,
    #[serde(default)]
    pub evaluate: EvaluateSection,
    #[serde(default)]
    pub revert: RevertSection,
    #[serde(default)]
    pub passes: PassesConfig,
}

impl PipelineToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipeline.toml")
    }

    /// Load `<state_dir>/pipeline.toml`, or defaults if it does not exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize pipeline.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Transformation command (env → file → default).
    pub fn transform_cmd(&self) -> String {
        std::env::var("DRAFTSMITH_TRANSFORM_CMD")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.transform.command.clone())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Rule engine command (env → file → default).
    pub fn evaluate_cmd(&self) -> String {
        std::env::var("DRAFTSMITH_EVALUATE_CMD")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.evaluate.command.clone())
            .unwrap_or_else(|| "draftsmith-audit".to_string())
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            max_attempts: self.transform.max_attempts,
            backoff: Duration::from_millis(self.transform.backoff_ms),
            // The command transformer enforces its own timeout.
            call_timeout: None,
            revert_policy: RevertPolicy::new(self.revert.tie_policy),
            score_sections: self.revert.score_sections,
        }
    }

    /// Apply matching overrides to each pass. Later patterns (in key order) win.
    pub fn apply_overrides(&self, passes: Vec<PassDefinition>) -> Vec<PassDefinition> {
        passes
            .into_iter()
            .map(|mut pass| {
                for (pattern, cfg) in &self.passes.overrides {
                    if !pattern_matches(pattern, &pass.name) {
                        continue;
                    }
                    if let Some(auto_revert) = cfg.auto_revert {
                        pass.auto_revert = auto_revert;
                    }
                    if let Some(persist) = cfg.persist_version {
                        pass.persist_version = persist;
                    }
                    if let Some(ref instructions) = cfg.instructions {
                        pass.instructions = instructions.clone();
                    }
                }
                pass
            })
            .collect()
    }

    /// Validate the configuration against the pass list and return any warnings.
    pub fn validate(&self, passes: &[PassDefinition]) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.transform.max_attempts == 0 {
            warnings.push("transform.max_attempts is 0; every pass gets a single attempt".into());
        }
        if self.transform.timeout_secs == 0 {
            warnings.push("transform.timeout_secs is 0; every transformation will time out".into());
        }
        if self.evaluate.timeout_secs == 0 {
            warnings.push("evaluate.timeout_secs is 0; every evaluation will time out".into());
        }
        if let Some(cmd) = &self.transform.command
            && cmd.trim().is_empty()
        {
            warnings.push("transform.command is empty".into());
        }
        if let Some(cmd) = &self.evaluate.command
            && cmd.trim().is_empty()
        {
            warnings.push("evaluate.command is empty".into());
        }

        for pattern in self.passes.overrides.keys() {
            if !passes.iter().any(|p| pattern_matches(pattern, &p.name)) {
                warnings.push(format!(
                    "Override pattern '{}' matches no pass",
                    pattern
                ));
            }
        }

        warnings
    }
}

/// Case-insensitive glob match of a pass name.
/// `*` matches any sequence of characters, `?` any single character.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();
    glob_match(&pattern, &name)
}

fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|skip| glob_match(rest, &text[skip..])),
        Some(('?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::default_passes;

    #[test]
    fn test_pattern_matches_exact() {
        assert!(pattern_matches("schema", "schema"));
        assert!(!pattern_matches("schema", "schemas"));
    }

    #[test]
    fn test_pattern_matches_wildcards() {
        assert!(pattern_matches("micro*", "Micro Semantics"));
        assert!(pattern_matches("*semantics", "Visual Semantics"));
        assert!(pattern_matches("l?sts", "Lists"));
        assert!(pattern_matches("*", "Anything"));
        assert!(!pattern_matches("?", ""));
    }

    #[test]
    fn test_pattern_matches_non_ascii() {
        assert!(pattern_matches("résumé*", "Résumé Pass"));
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = PipelineToml::parse("").unwrap();
        assert_eq!(config.transform.args, vec!["--print"]);
        assert_eq!(config.transform.timeout_secs, 300);
        assert_eq!(config.transform.max_attempts, 3);
        assert_eq!(config.evaluate.timeout_secs, 120);
        assert_eq!(config.revert.tie_policy, TiePolicy::Accept);
        assert!(config.revert.score_sections);
        assert!(config.passes.overrides.is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let config = PipelineToml::parse(
            r#"
            [transform]
            command = "my-llm"
            args = []
            max_attempts = 5
            backoff_ms = 10

            [revert]
            tie_policy = "revert"
            score_sections = false

            [passes.overrides."schema*"]
            auto_revert = false

            [passes.overrides."*"]
            persist_version = false
            "#,
        )
        .unwrap();
        assert_eq!(config.transform.command.as_deref(), Some("my-llm"));
        assert!(config.transform.args.is_empty());

        let settings = config.executor_settings();
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.backoff, Duration::from_millis(10));
        assert_eq!(settings.revert_policy.tie_policy, TiePolicy::Revert);
        assert!(!settings.score_sections);
    }

    #[test]
    fn test_parse_rejects_unknown_tie_policy() {
        assert!(PipelineToml::parse("[revert]\ntie_policy = \"coin-flip\"").is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let config = PipelineToml::parse(
            r#"
            [passes.overrides."headers"]
            auto_revert = false
            instructions = "Short headings only."

            [passes.overrides."*semantics"]
            persist_version = false
            "#,
        )
        .unwrap();
        let passes = config.apply_overrides(default_passes());

        let headers = passes.iter().find(|p| p.name == "Headers").unwrap();
        assert!(!headers.auto_revert);
        assert_eq!(headers.instructions, "Short headings only.");

        let micro = passes.iter().find(|p| p.name == "Micro Semantics").unwrap();
        assert!(!micro.persist_version);
        assert!(micro.auto_revert);

        let lists = passes.iter().find(|p| p.name == "Lists").unwrap();
        assert!(lists.persist_version);
    }

    #[test]
    fn test_validate_warnings() {
        let config = PipelineToml::parse(
            r#"
            [transform]
            max_attempts = 0
            timeout_secs = 0

            [passes.overrides."nonexistent*"]
            auto_revert = false
            "#,
        )
        .unwrap();
        let warnings = config.validate(&default_passes());
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("nonexistent*")));
        assert!(PipelineToml::default().validate(&default_passes()).is_empty());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineToml::default();
        config.transform.command = Some("claude".into());
        config.passes.overrides.insert(
            "draft".into(),
            PassOverride {
                auto_revert: Some(false),
                ..PassOverride::default()
            },
        );
        config.save(&dir.path().join(CONFIG_FILE_NAME)).unwrap();

        let loaded = PipelineToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.transform.command.as_deref(), Some("claude"));
        assert_eq!(loaded.passes.overrides["draft"].auto_revert, Some(false));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config.transform.max_attempts, 3);
    }
}
