//! Quality report aggregated from persisted pass deltas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delta::PassDelta;

/// One line of the report per executed pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassSummary {
    pub pass_number: u32,
    pub pass_name: String,
    pub rules_fixed: Vec<String>,
    pub rules_regressed: Vec<String>,
    pub score_before: f64,
    pub score_after: f64,
    pub auto_reverted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
}

impl From<&PassDelta> for PassSummary {
    fn from(delta: &PassDelta) -> Self {
        Self {
            pass_number: delta.pass_number,
            pass_name: delta.pass_name.clone(),
            rules_fixed: delta.rules_fixed.iter().cloned().collect(),
            rules_regressed: delta.rules_regressed.iter().cloned().collect(),
            score_before: delta.score_before,
            score_after: delta.score_after,
            auto_reverted: delta.auto_reverted,
            revert_reason: delta.revert_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub job_id: String,
    pub total_passes: usize,
    pub passes_run: usize,
    pub passes_applied: usize,
    pub passes_reverted: usize,
    /// Fixes kept in the document; reverted passes contribute nothing
    pub total_rules_fixed: usize,
    /// Regressions kept in the document; reverted passes contribute nothing
    pub total_rules_regressed: usize,
    /// Score of the document before the first pass
    pub initial_score: Option<f64>,
    /// Score of the document the last pass kept
    pub final_score: Option<f64>,
    pub passes: Vec<PassSummary>,
    pub generated_at: DateTime<Utc>,
}

impl QualityReport {
    /// Aggregate `deltas` (ordered by pass number) for a job of `total_passes`.
    pub fn from_deltas(job_id: &str, total_passes: usize, deltas: &[PassDelta]) -> Self {
        let kept = deltas.iter().filter(|d| !d.auto_reverted);
        let (fixed, regressed) = kept.fold((0, 0), |(f, r), d| {
            (f + d.rules_fixed.len(), r + d.rules_regressed.len())
        });
        let passes_reverted = deltas.iter().filter(|d| d.auto_reverted).count();

        Self {
            job_id: job_id.to_string(),
            total_passes,
            passes_run: deltas.len(),
            passes_applied: deltas.len() - passes_reverted,
            passes_reverted,
            total_rules_fixed: fixed,
            total_rules_regressed: regressed,
            initial_score: deltas.first().map(|d| d.score_before),
            final_score: deltas.last().map(PassDelta::effective_score),
            passes: deltas.iter().map(PassSummary::from).collect(),
            generated_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.passes_run == self.total_passes
    }

    pub fn reverted_passes(&self) -> impl Iterator<Item = &PassSummary> {
        self.passes.iter().filter(|p| p.auto_reverted)
    }

    /// Change from the initial to the final score, in percentage points.
    pub fn score_change(&self) -> Option<f64> {
        Some(self.final_score? - self.initial_score?)
    }
}
