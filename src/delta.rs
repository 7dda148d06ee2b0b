//! Delta calculation between a pass's before and after snapshots.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::snapshot::RuleSnapshot;

/// Classification of every rule id seen across one pass.
///
/// `rules_fixed`, `rules_regressed` and `rules_unchanged` partition the union
/// of rule ids present in the two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassDelta {
    pub job_id: String,
    pub pass_number: u32,
    #[serde(default)]
    pub pass_name: String,
    pub rules_fixed: BTreeSet<String>,
    pub rules_regressed: BTreeSet<String>,
    pub rules_unchanged: BTreeSet<String>,
    /// Compliance score (percent) of the before snapshot
    pub score_before: f64,
    /// Compliance score (percent) of the after snapshot
    pub score_after: f64,
    pub auto_reverted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
    /// Section keys of the document kept after this pass, in order
    #[serde(default)]
    pub section_order: Vec<String>,
}

impl PassDelta {
    /// Fixed minus regressed.
    pub fn net_change(&self) -> i64 {
        self.rules_fixed.len() as i64 - self.rules_regressed.len() as i64
    }

    /// Score of the content the pipeline actually kept.
    pub fn effective_score(&self) -> f64 {
        if self.auto_reverted {
            self.score_before
        } else {
            self.score_after
        }
    }

    pub fn total_rules(&self) -> usize {
        self.rules_fixed.len() + self.rules_regressed.len() + self.rules_unchanged.len()
    }
}

/// Compare two snapshots of the same pass.
///
/// - `false → true` is fixed, `true → false` is regressed, same verdict is unchanged.
/// - A rule only in `after` has no baseline: fixed if passing, regressed if failing.
/// - A rule only in `before` is a check that disappeared; it is unchanged.
pub fn compute_delta(before: &RuleSnapshot, after: &RuleSnapshot) -> PassDelta {
    let mut rules_fixed = BTreeSet::new();
    let mut rules_regressed = BTreeSet::new();
    let mut rules_unchanged = BTreeSet::new();

    let ids: BTreeSet<&String> = before.rules.keys().chain(after.rules.keys()).collect();
    for id in ids {
        let was = before.rules.get(id).map(|r| r.passed);
        let now = after.rules.get(id).map(|r| r.passed);
        let bucket = match (was, now) {
            (Some(false), Some(true)) | (None, Some(true)) => &mut rules_fixed,
            (Some(true), Some(false)) | (None, Some(false)) => &mut rules_regressed,
            _ => &mut rules_unchanged,
        };
        bucket.insert(id.clone());
    }

    PassDelta {
        job_id: after.job_id.clone(),
        pass_number: after.pass_number,
        pass_name: String::new(),
        rules_fixed,
        rules_regressed,
        rules_unchanged,
        score_before: before.score(),
        score_after: after.score(),
        auto_reverted: false,
        revert_reason: None,
        section_order: Vec::new(),
    }
}

/// What to do when a pass fixes exactly as many rules as it regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TiePolicy {
    /// Keep net-neutral output and move on (default)
    #[default]
    Accept,
    /// Treat net-neutral output as a regression
    Revert,
}

impl std::fmt::Display for TiePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TiePolicy::Accept => write!(f, "accept"),
            TiePolicy::Revert => write!(f, "revert"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertPolicy {
    #[serde(default)]
    pub tie_policy: TiePolicy,
}

/// Decision returned to the executor; the calculator never touches content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertDecision {
    Keep,
    Revert { reason: String },
}

impl RevertDecision {
    pub fn is_revert(&self) -> bool {
        matches!(self, Self::Revert { .. })
    }
}

impl RevertPolicy {
    pub fn new(tie_policy: TiePolicy) -> Self {
        Self { tie_policy }
    }

    /// Decide whether a pass with this delta should be reverted.
    pub fn decide(&self, delta: &PassDelta, revert_eligible: bool) -> RevertDecision {
        if !revert_eligible || delta.rules_regressed.is_empty() {
            return RevertDecision::Keep;
        }
        let fixed = delta.rules_fixed.len();
        let regressed = delta.rules_regressed.len();
        let revert = match self.tie_policy {
            TiePolicy::Accept => regressed > fixed,
            TiePolicy::Revert => regressed >= fixed,
        };
        if !revert {
            return RevertDecision::Keep;
        }
        let rules = delta
            .rules_regressed
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        RevertDecision::Revert {
            reason: format!(
                "Pass {} regressed {} rule(s) while fixing {}: {}",
                delta.pass_number, regressed, fixed, rules
            ),
        }
    }
}
