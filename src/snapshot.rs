//! Rule snapshots: point-in-time compliance state of a document.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::Evaluator;
use crate::document::{Document, content_hash};
use crate::errors::PassError;

/// Outcome of one rule check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub passed: bool,
    /// Measured value behind the verdict (word count, ratio, ...)
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub message: String,
}

impl RuleResult {
    pub fn pass(message: &str) -> Self {
        Self {
            passed: true,
            value: serde_json::Value::Null,
            message: message.to_string(),
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            passed: false,
            value: serde_json::Value::Null,
            message: message.to_string(),
        }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = value;
        self
    }
}

/// Rule id → result, ordered by rule id.
pub type RuleResults = BTreeMap<String, RuleResult>;

/// Number of passing rules.
pub fn passed_count(rules: &RuleResults) -> usize {
    rules.values().filter(|r| r.passed).count()
}

/// Share of passing rules in percent. An empty rule set scores 100.
pub fn score(rules: &RuleResults) -> f64 {
    if rules.is_empty() {
        return 100.0;
    }
    passed_count(rules) as f64 / rules.len() as f64 * 100.0
}

/// Whether a snapshot was taken before or after the pass transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Before,
    After,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            _ => Err(format!("Invalid snapshot kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub job_id: String,
    pub pass_number: u32,
    pub kind: SnapshotKind,
    pub rules: RuleResults,
    /// SHA-256 of the normalized document the rules were evaluated on
    pub content_hash: String,
    pub taken_at: DateTime<Utc>,
}

impl RuleSnapshot {
    pub fn passed_count(&self) -> usize {
        passed_count(&self.rules)
    }

    pub fn score(&self) -> f64 {
        score(&self.rules)
    }

    /// True when `document` is the exact content this snapshot was taken from.
    pub fn matches(&self, document: &Document) -> bool {
        self.content_hash == document.content_hash()
    }
}

/// Evaluate `document` and capture the result as an immutable snapshot.
///
/// The rendered text that is hashed is the same text handed to the evaluator,
/// so the hash always describes what was actually evaluated. An evaluator
/// failure yields no snapshot at all.
pub async fn take_snapshot(
    evaluator: &dyn Evaluator,
    job_id: &str,
    pass_number: u32,
    kind: SnapshotKind,
    document: &Document,
) -> Result<RuleSnapshot, PassError> {
    let content = document.render();
    let rules = evaluator
        .evaluate(&content)
        .await
        .map_err(|e| PassError::Evaluation {
            pass: pass_number,
            stage: kind.to_string(),
            message: format!("{:#}", e),
        })?;

    tracing::debug!(
        job_id,
        pass = pass_number,
        kind = %kind,
        rules = rules.len(),
        passed = passed_count(&rules),
        "rule snapshot taken"
    );

    Ok(RuleSnapshot {
        job_id: job_id.to_string(),
        pass_number,
        kind,
        content_hash: content_hash(&content),
        rules,
        taken_at: Utc::now(),
    })
}
