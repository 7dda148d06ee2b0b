//! Pass definitions and JSON loading for the pipeline.
//!
//! This module provides:
//! - `PassDefinition` describing a single transformation step
//! - `PassesFile` representing the `passes.json` format
//! - The built-in ten-pass content pipeline as a fallback

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Static configuration for one step of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassDefinition {
    /// Pass number (1..N), fixes the execution order
    pub number: u32,
    /// Human-readable name of the pass
    pub name: String,
    /// Pass-specific instructions handed to the transformer
    #[serde(default)]
    pub instructions: String,
    /// Whether the pass output is recorded as section versions
    #[serde(default = "default_true")]
    pub persist_version: bool,
    /// Whether a net regression discards the pass output
    #[serde(default = "default_true")]
    pub auto_revert: bool,
}

fn default_true() -> bool {
    true
}

impl PassDefinition {
    pub fn new(number: u32, name: &str, instructions: &str) -> Self {
        Self {
            number,
            name: name.to_string(),
            instructions: instructions.to_string(),
            persist_version: true,
            auto_revert: true,
        }
    }

    pub fn without_auto_revert(mut self) -> Self {
        self.auto_revert = false;
        self
    }

    pub fn without_versions(mut self) -> Self {
        self.persist_version = false;
        self
    }

    /// Display label, e.g. "Pass 3: Lists".
    pub fn label(&self) -> String {
        format!("Pass {}: {}", self.number, self.name)
    }
}

/// Represents the full passes.json file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassesFile {
    /// Timestamp when the file was written
    pub generated_at: String,
    pub passes: Vec<PassDefinition>,
}

impl PassesFile {
    pub fn new(passes: Vec<PassDefinition>) -> Self {
        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            passes,
        }
    }

    /// Load passes from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read passes file: {}", path.display()))?;

        let file: PassesFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse passes JSON: {}", path.display()))?;

        validate_order(&file.passes)
            .with_context(|| format!("Invalid pass ordering in {}", path.display()))?;
        Ok(file)
    }

    /// Save passes to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize passes to JSON")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write passes file: {}", path.display()))?;

        Ok(())
    }

    pub fn get_pass(&self, number: u32) -> Option<&PassDefinition> {
        self.passes.iter().find(|p| p.number == number)
    }
}

/// Passes must be numbered 1..N with no gaps, in order.
pub fn validate_order(passes: &[PassDefinition]) -> Result<()> {
    if passes.is_empty() {
        anyhow::bail!("pipeline has no passes");
    }
    for (index, pass) in passes.iter().enumerate() {
        let expected = index as u32 + 1;
        if pass.number != expected {
            anyhow::bail!(
                "pass '{}' has number {} but position {} requires {}",
                pass.name,
                pass.number,
                index,
                expected
            );
        }
    }
    Ok(())
}

/// Load passes from `path` if it exists, otherwise the built-in pipeline.
pub fn load_passes_or_default(path: &Path) -> Result<Vec<PassDefinition>> {
    if path.exists() {
        Ok(PassesFile::load(path)?.passes)
    } else {
        Ok(default_passes())
    }
}

/// The built-in ten-pass content pipeline.
pub fn default_passes() -> Vec<PassDefinition> {
    vec![
        PassDefinition::new(
            1,
            "Draft",
            "Write the full article from the brief. Produce an introduction followed by one `## ` section per outline item.",
        )
        .without_auto_revert(),
        PassDefinition::new(
            2,
            "Headers",
            "Tighten every `## ` heading: keep it under ten words and lead with the section's central entity.",
        ),
        PassDefinition::new(
            3,
            "Lists",
            "Convert enumerations buried in prose into bullet or numbered lists where they aid scanning.",
        ),
        PassDefinition::new(
            4,
            "Discourse",
            "Improve transitions so each section opens by connecting to the previous one.",
        ),
        PassDefinition::new(
            5,
            "Micro Semantics",
            "Sharpen sentence-level wording: concrete subjects, active voice, one claim per sentence.",
        ),
        PassDefinition::new(
            6,
            "Visual Semantics",
            "Add table, image or callout placeholders where a visual would carry the point better than text.",
        ),
        PassDefinition::new(
            7,
            "Introduction",
            "Rewrite the introduction to answer the main query in its first two sentences.",
        ),
        PassDefinition::new(
            8,
            "Polish",
            "Fix grammar, remove filler, keep terminology consistent across sections.",
        ),
        PassDefinition::new(
            9,
            "Audit",
            "Resolve any remaining compliance issues without changing the structure.",
        ),
        PassDefinition::new(
            10,
            "Schema",
            "Append the structured-data block describing the article as its final section.",
        )
        .without_auto_revert(),
    ]
}
