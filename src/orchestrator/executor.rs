//! Runs a single pass: snapshot, transform, snapshot, delta, revert decision.
//!
//! The executor never writes job state. It hands a `PassOutcome` back to the
//! orchestrator, which commits the pass atomically.

use std::sync::Arc;
use std::time::Duration;

use crate::capability::{Evaluator, TransformRequest, Transformer};
use crate::delta::{PassDelta, RevertDecision, RevertPolicy, compute_delta};
use crate::document::Document;
use crate::errors::{PassError, TransformError};
use crate::pass::PassDefinition;
use crate::snapshot::{SnapshotKind, score, take_snapshot};
use crate::store::{NewSectionVersion, PassCommit};
use crate::versions::SectionVersionStore;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Transformation attempts per pass, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubled after every failed attempt
    pub backoff: Duration,
    /// Upper bound on a single transformation call
    pub call_timeout: Option<Duration>,
    pub revert_policy: RevertPolicy,
    /// Evaluate changed sections on their own to decide best-version marking
    pub score_sections: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
            call_timeout: None,
            revert_policy: RevertPolicy::default(),
            score_sections: true,
        }
    }
}

#[derive(Debug)]
pub enum PassOutcome {
    /// Transformed document kept
    Applied(PassCommit),
    /// Transformed document discarded; the commit carries the pre-pass document
    Reverted(PassCommit),
    Failed(PassError),
}

impl PassOutcome {
    pub fn delta(&self) -> Option<&PassDelta> {
        match self {
            Self::Applied(commit) | Self::Reverted(commit) => Some(&commit.delta),
            Self::Failed(_) => None,
        }
    }

    pub fn is_reverted(&self) -> bool {
        matches!(self, Self::Reverted(_))
    }
}

#[derive(Clone)]
pub struct PassExecutor {
    transformer: Arc<dyn Transformer>,
    evaluator: Arc<dyn Evaluator>,
    versions: SectionVersionStore,
    settings: ExecutorSettings,
}

impl PassExecutor {
    pub fn new(
        transformer: Arc<dyn Transformer>,
        evaluator: Arc<dyn Evaluator>,
        versions: SectionVersionStore,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            transformer,
            evaluator,
            versions,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator.as_ref()
    }

    pub async fn run_pass(
        &self,
        job_id: &str,
        pass: &PassDefinition,
        document: &Document,
    ) -> PassOutcome {
        match self.execute(job_id, pass, document).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(job_id, pass = pass.number, error = %err, "pass failed");
                PassOutcome::Failed(err)
            }
        }
    }

    async fn execute(
        &self,
        job_id: &str,
        pass: &PassDefinition,
        document: &Document,
    ) -> Result<PassOutcome, PassError> {
        let evaluator = self.evaluator.as_ref();
        let before =
            take_snapshot(evaluator, job_id, pass.number, SnapshotKind::Before, document).await?;

        let request = TransformRequest::new(job_id, pass, document);
        let output = self.transform_with_retry(&request).await?;
        let transformed = Document::from_transform_output(&output);

        let after =
            take_snapshot(evaluator, job_id, pass.number, SnapshotKind::After, &transformed)
                .await?;

        let mut delta = compute_delta(&before, &after);
        delta.pass_name = pass.name.clone();

        let decision = self.settings.revert_policy.decide(&delta, pass.auto_revert);
        if let RevertDecision::Revert { reason } = decision {
            // Reverts only follow a net regression or a tie.
            debug_assert!(before.passed_count() >= after.passed_count());
            tracing::warn!(
                job_id,
                pass = pass.number,
                fixed = delta.rules_fixed.len(),
                regressed = delta.rules_regressed.len(),
                %reason,
                "pass auto-reverted"
            );
            // A rollback may have left the kept document ahead of its history.
            let versions = if pass.persist_version {
                self.changed_versions(job_id, pass.number, document).await?
            } else {
                Vec::new()
            };
            delta.auto_reverted = true;
            delta.revert_reason = Some(reason);
            delta.section_order = document.keys();
            return Ok(PassOutcome::Reverted(PassCommit {
                before,
                after,
                delta,
                versions,
                document: document.clone(),
            }));
        }

        let versions = if pass.persist_version {
            self.changed_versions(job_id, pass.number, &transformed).await?
        } else {
            Vec::new()
        };

        tracing::info!(
            job_id,
            pass = pass.number,
            fixed = delta.rules_fixed.len(),
            regressed = delta.rules_regressed.len(),
            score_before = delta.score_before,
            score_after = delta.score_after,
            versions = versions.len(),
            "pass applied"
        );
        delta.section_order = transformed.keys();
        Ok(PassOutcome::Applied(PassCommit {
            before,
            after,
            delta,
            versions,
            document: transformed,
        }))
    }

    /// Call the transformer until it succeeds, fails fatally, or attempts run out.
    async fn transform_with_retry(&self, request: &TransformRequest) -> Result<String, PassError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut backoff = self.settings.backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match self.settings.call_timeout {
                Some(limit) => tokio::time::timeout(limit, self.transformer.transform(request))
                    .await
                    .unwrap_or_else(|_| Err(TransformError::Timeout(limit))),
                None => self.transformer.transform(request).await,
            };

            match result {
                Ok(output) => return Ok(output),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        job_id = %request.job_id,
                        pass = request.pass_number,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transformation failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => {
                    return Err(PassError::Transformation {
                        pass: request.pass_number,
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    /// Versions for every section of `current` that is new or differs from
    /// the latest version recorded for its key.
    /// After a rollback the job document and its history differ; the next
    /// pass records every section the rollback restored.
    async fn changed_versions(
        &self,
        job_id: &str,
        pass_number: u32,
        current: &Document,
    ) -> Result<Vec<NewSectionVersion>, PassError> {
        let recorded = self
            .versions
            .recorded_before(job_id, pass_number)
            .await
            .map_err(|e| PassError::Persistence {
                pass: pass_number,
                source: e.into(),
            })?;
        let mut versions = Vec::new();
        for (position, section) in current.changed_sections(&recorded) {
            let content = section.text();
            let (rule_snapshot, mark_best) = if self.settings.score_sections {
                let rules = self.evaluator.evaluate(&content).await.map_err(|e| {
                    PassError::Evaluation {
                        pass: pass_number,
                        stage: format!("section '{}'", section.key),
                        message: format!("{:#}", e),
                    }
                })?;
                let best = self
                    .versions
                    .get_best(job_id, &section.key)
                    .await
                    .map_err(|e| PassError::Persistence {
                        pass: pass_number,
                        source: e.into(),
                    })?;
                let not_worse = best
                    .and_then(|b| b.rule_snapshot)
                    .is_none_or(|previous| score(&rules) >= score(&previous));
                (Some(rules), not_worse)
            } else {
                (None, true)
            };

            versions.push(NewSectionVersion {
                section_key: section.key.clone(),
                position,
                content,
                rule_snapshot,
                mark_best,
            });
        }
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::TiePolicy;
    use crate::orchestrator::stubs::{Edit, MarkerEvaluator, ScriptedTransformer};
    use crate::pass::default_passes;
    use crate::store::{DbHandle, PipelineDb};
    use std::collections::BTreeSet;

    const INITIAL: &str = "Trail guide [D]\n\n## Gear\n\nboots [B] [C]\n\n## Trails\n\nridge walk";

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn fast_settings() -> ExecutorSettings {
        ExecutorSettings {
            backoff: Duration::from_millis(1),
            ..ExecutorSettings::default()
        }
    }

    fn executor(
        transformer: Arc<ScriptedTransformer>,
        evaluator: Arc<MarkerEvaluator>,
        settings: ExecutorSettings,
    ) -> PassExecutor {
        let db = PipelineDb::new_in_memory().unwrap();
        db.create_job("job-1", "guide", &default_passes(), &Document::parse(INITIAL))
            .unwrap();
        let versions = SectionVersionStore::new(DbHandle::new(db));
        PassExecutor::new(transformer, evaluator, versions, settings)
    }

    fn pass(number: u32) -> PassDefinition {
        PassDefinition::new(number, &format!("Pass {number}"), "improve")
    }

    fn rules() -> Arc<MarkerEvaluator> {
        Arc::new(MarkerEvaluator::new(&["A", "B", "C", "D"]))
    }

    #[tokio::test]
    async fn test_tie_is_accepted_by_default() {
        let transformer = Arc::new(
            ScriptedTransformer::new().with_edit(2, Edit::on("gear").add(&["A"]).remove(&["C"])),
        );
        let exec = executor(transformer, rules(), fast_settings());
        let doc = Document::parse("Trail guide\n\n## Gear\n\nboots [C]");

        let outcome = exec.run_pass("job-1", &pass(2), &doc).await;
        let PassOutcome::Applied(commit) = outcome else {
            panic!("Expected Applied, got {outcome:?}");
        };
        assert_eq!(commit.delta.rules_fixed, set(&["A"]));
        assert_eq!(commit.delta.rules_regressed, set(&["C"]));
        assert!(!commit.delta.auto_reverted);
    }

    #[tokio::test]
    async fn test_two_fixed_one_regressed_keeps_output() {
        let transformer = Arc::new(
            ScriptedTransformer::new()
                .with_edit(2, Edit::on("gear").add(&["A", "B"]).remove(&["C"])),
        );
        let exec = executor(transformer, rules(), fast_settings());
        let doc = Document::parse("Trail guide [D]\n\n## Gear\n\nboots [C]");

        let outcome = exec.run_pass("job-1", &pass(2), &doc).await;
        let PassOutcome::Applied(commit) = outcome else {
            panic!("Expected Applied, got {outcome:?}");
        };
        assert_eq!(commit.delta.rules_fixed, set(&["A", "B"]));
        assert_eq!(commit.delta.rules_regressed, set(&["C"]));
        assert_eq!(commit.delta.rules_unchanged, set(&["D"]));
        assert!(commit.document.render().contains("[A] [B]"));
        assert_eq!(commit.versions.len(), 1);
        assert_eq!(commit.versions[0].section_key, "gear");
        assert_eq!(commit.delta.section_order, vec!["introduction", "gear"]);
    }

    #[tokio::test]
    async fn test_net_regression_is_reverted() {
        let transformer = Arc::new(
            ScriptedTransformer::new().with_edit(2, Edit::on("gear").add(&["A"]).remove(&["B", "C"])),
        );
        let evaluator = rules();
        let exec = executor(transformer, evaluator.clone(), fast_settings());
        let doc = Document::parse(INITIAL);

        let outcome = exec.run_pass("job-1", &pass(2), &doc).await;
        let PassOutcome::Reverted(commit) = outcome else {
            panic!("Expected Reverted, got {outcome:?}");
        };
        assert_eq!(commit.document, doc);
        assert!(commit.delta.auto_reverted);
        let reason = commit.delta.revert_reason.as_deref().unwrap();
        assert!(reason.contains("B, C"), "reason was {reason}");
        assert!(commit.versions.is_empty());

        // Re-evaluating the kept document never scores below the discarded output.
        let kept = evaluator.evaluate(&commit.document.render()).await.unwrap();
        assert!(crate::snapshot::passed_count(&kept) >= commit.after.passed_count());
    }

    #[tokio::test]
    async fn test_revert_ineligible_pass_keeps_regression() {
        let transformer = Arc::new(
            ScriptedTransformer::new().with_edit(1, Edit::on("gear").remove(&["B", "C"])),
        );
        let exec = executor(transformer, rules(), fast_settings());
        let draft = pass(1).without_auto_revert();

        let outcome = exec.run_pass("job-1", &draft, &Document::parse(INITIAL)).await;
        assert!(matches!(outcome, PassOutcome::Applied(_)));
        assert_eq!(outcome.delta().unwrap().rules_regressed, set(&["B", "C"]));
    }

    #[tokio::test]
    async fn test_tie_reverts_under_revert_policy() {
        let transformer = Arc::new(
            ScriptedTransformer::new().with_edit(2, Edit::on("gear").add(&["A"]).remove(&["C"])),
        );
        let settings = ExecutorSettings {
            revert_policy: RevertPolicy::new(TiePolicy::Revert),
            ..fast_settings()
        };
        let exec = executor(transformer, rules(), settings);
        let outcome = exec.run_pass("job-1", &pass(2), &Document::parse(INITIAL)).await;
        assert!(outcome.is_reverted());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let transformer = Arc::new(ScriptedTransformer::new().with_failures(vec![
            TransformError::Transient("429".into()),
            TransformError::Timeout(Duration::from_secs(1)),
        ]));
        let exec = executor(transformer.clone(), rules(), fast_settings());

        let outcome = exec.run_pass("job-1", &pass(3), &Document::parse(INITIAL)).await;
        assert!(matches!(outcome, PassOutcome::Applied(_)));
        assert_eq!(transformer.calls(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let transformer = Arc::new(ScriptedTransformer::new().with_failures(vec![
            TransformError::Transient("503".into()),
            TransformError::Transient("503".into()),
            TransformError::Transient("503 again".into()),
            TransformError::Transient("never reached".into()),
        ]));
        let exec = executor(transformer.clone(), rules(), fast_settings());

        let outcome = exec.run_pass("job-1", &pass(3), &Document::parse(INITIAL)).await;
        match outcome {
            PassOutcome::Failed(PassError::Transformation {
                attempts, message, ..
            }) => {
                assert_eq!(attempts, 3);
                assert!(message.contains("503 again"));
            }
            other => panic!("Expected transformation failure, got {other:?}"),
        }
        assert_eq!(transformer.calls(), 3);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let transformer = Arc::new(
            ScriptedTransformer::new()
                .with_failures(vec![TransformError::Fatal("prompt rejected".into())]),
        );
        let exec = executor(transformer.clone(), rules(), fast_settings());

        let outcome = exec.run_pass("job-1", &pass(3), &Document::parse(INITIAL)).await;
        assert!(matches!(
            outcome,
            PassOutcome::Failed(PassError::Transformation { attempts: 1, .. })
        ));
        assert_eq!(transformer.calls(), 1);
    }

    #[tokio::test]
    async fn test_after_snapshot_failure_fails_pass() {
        let transformer = Arc::new(
            ScriptedTransformer::new().with_edit(1, Edit::on("gear").append(" BOOM")),
        );
        let evaluator = Arc::new(MarkerEvaluator::new(&["A"]).failing_on("BOOM"));
        let exec = executor(transformer, evaluator, fast_settings());

        let outcome = exec.run_pass("job-1", &pass(1), &Document::parse(INITIAL)).await;
        match outcome {
            PassOutcome::Failed(PassError::Evaluation { stage, .. }) => assert_eq!(stage, "after"),
            other => panic!("Expected evaluation failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unchanged_sections_get_no_version() {
        let transformer = Arc::new(
            ScriptedTransformer::new().with_edit(4, Edit::on("trails").append(" at dawn")),
        );
        let exec = executor(transformer, rules(), fast_settings());

        let PassOutcome::Applied(commit) =
            exec.run_pass("job-1", &pass(4), &Document::parse(INITIAL)).await
        else {
            panic!("Expected Applied");
        };
        let keys: Vec<_> = commit.versions.iter().map(|v| v.section_key.as_str()).collect();
        assert_eq!(keys, vec!["trails"]);
        assert_eq!(commit.versions[0].position, 2);
        // Baseline has no section score, so the first scored version becomes best.
        assert!(commit.versions[0].mark_best);
        assert!(commit.versions[0].rule_snapshot.is_some());
    }

    #[tokio::test]
    async fn test_sections_diverging_from_history_get_versions() {
        // Job document was rolled forward past the recorded gear section.
        let restored = "Trail guide [D]\n\n## Gear\n\nboots [A] [B] [C]\n\n## Trails\n\nridge walk";
        let transformer = Arc::new(
            ScriptedTransformer::new()
                .with_edit(2, Edit::on("trails").append(" at dawn"))
                .with_edit(3, Edit::on("gear").remove(&["A", "B"])),
        );
        let exec = executor(transformer, rules(), fast_settings());

        let PassOutcome::Applied(commit) =
            exec.run_pass("job-1", &pass(2), &Document::parse(restored)).await
        else {
            panic!("Expected Applied");
        };
        let keys: Vec<_> = commit.versions.iter().map(|v| v.section_key.as_str()).collect();
        assert_eq!(keys, vec!["gear", "trails"]);

        let outcome = exec.run_pass("job-1", &pass(3), &Document::parse(restored)).await;
        let PassOutcome::Reverted(commit) = outcome else {
            panic!("Expected Reverted, got {outcome:?}");
        };
        let keys: Vec<_> = commit.versions.iter().map(|v| v.section_key.as_str()).collect();
        assert_eq!(keys, vec!["gear"]);
        assert_eq!(commit.versions[0].content, "## Gear\n\nboots [A] [B] [C]");
    }

    #[tokio::test]
    async fn test_versions_skipped_when_pass_does_not_persist() {
        let transformer = Arc::new(
            ScriptedTransformer::new().with_edit(4, Edit::on("trails").append(" at dawn")),
        );
        let exec = executor(transformer, rules(), fast_settings());
        let outcome = exec
            .run_pass("job-1", &pass(4).without_versions(), &Document::parse(INITIAL))
            .await;
        let PassOutcome::Applied(commit) = outcome else {
            panic!("Expected Applied");
        };
        assert!(commit.versions.is_empty());
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_attempt() {
        struct Stuck;

        #[async_trait::async_trait]
        impl Transformer for Stuck {
            async fn transform(&self, _: &TransformRequest) -> Result<String, TransformError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(String::new())
            }
        }

        let db = PipelineDb::new_in_memory().unwrap();
        let exec = PassExecutor::new(
            Arc::new(Stuck),
            rules(),
            SectionVersionStore::new(DbHandle::new(db)),
            ExecutorSettings {
                max_attempts: 2,
                call_timeout: Some(Duration::from_millis(20)),
                ..fast_settings()
            },
        );
        let outcome = exec.run_pass("job-1", &pass(1), &Document::parse(INITIAL)).await;
        match outcome {
            PassOutcome::Failed(PassError::Transformation {
                attempts, message, ..
            }) => {
                assert_eq!(attempts, 2);
                assert!(message.contains("timed out"));
            }
            other => panic!("Expected timeout failure, got {other:?}"),
        }
    }
}
