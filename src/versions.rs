//! Append-only section history with a movable "best" pointer.
//!
//! Every version ever recorded stays queryable. Rollback reads older rows and
//! returns their content; it never deletes newer ones, so a rollback can itself
//! be undone by rolling forward again.

use crate::document::{Document, Section};
use crate::errors::OrchestratorError;
use crate::store::{DbHandle, NewSectionVersion, SectionVersion};

#[derive(Clone)]
pub struct SectionVersionStore {
    db: DbHandle,
}

impl SectionVersionStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Append a version of `section_key` for `pass_number`.
    pub async fn record_version(
        &self,
        job_id: &str,
        pass_number: u32,
        version: NewSectionVersion,
    ) -> Result<SectionVersion, OrchestratorError> {
        let job_id = job_id.to_string();
        let recorded = self
            .db
            .call(move |db| db.insert_version(&job_id, pass_number, &version))
            .await?;
        Ok(recorded)
    }

    /// Move the best flag for (job, section) onto the version from `pass_number`.
    pub async fn mark_best(
        &self,
        job_id: &str,
        section_key: &str,
        pass_number: u32,
    ) -> Result<(), OrchestratorError> {
        let (job, key) = (job_id.to_string(), section_key.to_string());
        let found = self
            .db
            .call(move |db| db.mark_best(&job, &key, pass_number))
            .await?;
        if !found {
            return Err(OrchestratorError::VersionNotFound {
                job_id: job_id.to_string(),
                section_key: section_key.to_string(),
                pass_number,
            });
        }
        Ok(())
    }

    /// The best-flagged version, falling back to the latest one.
    pub async fn get_best(
        &self,
        job_id: &str,
        section_key: &str,
    ) -> Result<Option<SectionVersion>, OrchestratorError> {
        let (job, key) = (job_id.to_string(), section_key.to_string());
        Ok(self
            .db
            .call(move |db| db.best_or_latest_version(&job, &key))
            .await?)
    }

    /// Content of the section as it stood after `target_pass`.
    ///
    /// A section untouched by `target_pass` resolves to its most recent
    /// earlier version.
    pub async fn rollback_section(
        &self,
        job_id: &str,
        section_key: &str,
        target_pass: u32,
    ) -> Result<SectionVersion, OrchestratorError> {
        let (job, key) = (job_id.to_string(), section_key.to_string());
        self.db
            .call(move |db| db.version_at_or_before(&job, &key, target_pass))
            .await?
            .ok_or_else(|| OrchestratorError::VersionNotFound {
                job_id: job_id.to_string(),
                section_key: section_key.to_string(),
                pass_number: target_pass,
            })
    }

    /// Whole document as it existed after `target_pass` (0 = initial document).
    pub async fn rollback_job(
        &self,
        job_id: &str,
        target_pass: u32,
    ) -> Result<Document, OrchestratorError> {
        let job = job_id.to_string();
        let keys = self
            .db
            .call(move |db| {
                if target_pass == 0 {
                    return db.section_keys_at_pass(&job, 0).map(Some);
                }
                Ok(db.get_delta(&job, target_pass)?.map(|d| d.section_order))
            })
            .await?
            .ok_or_else(|| OrchestratorError::PassNotCompleted {
                job_id: job_id.to_string(),
                pass_number: target_pass,
            })?;

        let mut sections = Vec::with_capacity(keys.len());
        for key in keys {
            let version = self.rollback_section(job_id, &key, target_pass).await?;
            sections.push(Section::from_text(&key, &version.content));
        }
        tracing::debug!(
            job_id,
            target_pass,
            sections = sections.len(),
            "rebuilt document from section history"
        );
        Ok(Document::new(sections))
    }

    /// Document made of the latest version of each section recorded before
    /// `pass_number`, including sections the job no longer holds.
    pub async fn recorded_before(
        &self,
        job_id: &str,
        pass_number: u32,
    ) -> Result<Document, OrchestratorError> {
        let job = job_id.to_string();
        let latest = self
            .db
            .call(move |db| db.latest_versions_before(&job, pass_number))
            .await?;
        Ok(Document::new(
            latest
                .iter()
                .map(|v| Section::from_text(&v.section_key, &v.content))
                .collect(),
        ))
    }

    /// Every version of a section, oldest first.
    pub async fn history(
        &self,
        job_id: &str,
        section_key: &str,
    ) -> Result<Vec<SectionVersion>, OrchestratorError> {
        let (job, key) = (job_id.to_string(), section_key.to_string());
        Ok(self
            .db
            .call(move |db| db.list_versions(&job, &key))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::default_passes;
    use crate::store::PipelineDb;

    fn version(key: &str, position: usize, content: &str, best: bool) -> NewSectionVersion {
        NewSectionVersion {
            section_key: key.into(),
            position,
            content: content.into(),
            rule_snapshot: None,
            mark_best: best,
        }
    }

    fn setup() -> SectionVersionStore {
        let db = PipelineDb::new_in_memory().unwrap();
        db.create_job(
            "job-1",
            "doc",
            &default_passes(),
            &Document::parse("Intro\n\n## Gear\n\nboots"),
        )
        .unwrap();
        SectionVersionStore::new(DbHandle::new(db))
    }

    #[tokio::test]
    async fn test_recorded_versions_never_change() {
        let store = setup();
        let first = store
            .record_version("job-1", 1, version("gear", 1, "## Gear\n\nboots v1", false))
            .await
            .unwrap();
        store
            .record_version("job-1", 2, version("gear", 1, "## Gear\n\nboots v2", true))
            .await
            .unwrap();
        store.mark_best("job-1", "gear", 1).await.unwrap();
        store.rollback_section("job-1", "gear", 0).await.unwrap();

        let history = store.history("job-1", "gear").await.unwrap();
        let reread = history.iter().find(|v| v.pass_number == 1).unwrap();
        assert_eq!(reread.content, first.content);
        assert_eq!(reread.content_hash, first.content_hash);
    }

    #[tokio::test]
    async fn test_at_most_one_best_version() {
        let store = setup();
        for pass in 1..=4 {
            store
                .record_version(
                    "job-1",
                    pass,
                    version("gear", 1, &format!("v{pass}"), pass % 2 == 0),
                )
                .await
                .unwrap();
            let best = store
                .history("job-1", "gear")
                .await
                .unwrap()
                .into_iter()
                .filter(|v| v.is_best)
                .count();
            assert!(best <= 1);
        }
        store.mark_best("job-1", "gear", 3).await.unwrap();
        let best = store.get_best("job-1", "gear").await.unwrap().unwrap();
        assert_eq!(best.pass_number, 3);
    }

    #[tokio::test]
    async fn test_mark_best_missing_version() {
        let store = setup();
        let err = store.mark_best("job-1", "gear", 9).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::VersionNotFound { pass_number: 9, .. }));
    }

    #[tokio::test]
    async fn test_rollback_section_keeps_newer_versions() {
        let store = setup();
        store
            .record_version("job-1", 2, version("gear", 1, "## Gear\n\nnew boots", true))
            .await
            .unwrap();

        let rolled = store.rollback_section("job-1", "gear", 1).await.unwrap();
        assert_eq!(rolled.pass_number, 0);
        assert_eq!(rolled.content, "## Gear\n\nboots");
        assert_eq!(store.history("job-1", "gear").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_job_to_initial_document() {
        let store = setup();
        store
            .record_version("job-1", 1, version("gear", 1, "## Gear\n\nnew boots", true))
            .await
            .unwrap();

        let doc = store.rollback_job("job-1", 0).await.unwrap();
        assert_eq!(doc, Document::parse("Intro\n\n## Gear\n\nboots"));
    }

    #[tokio::test]
    async fn test_recorded_before_takes_latest_earlier_version() {
        let store = setup();
        store
            .record_version("job-1", 1, version("gear", 1, "## Gear\n\nboots v1", true))
            .await
            .unwrap();
        store
            .record_version("job-1", 3, version("gear", 1, "## Gear\n\nboots v3", true))
            .await
            .unwrap();

        let at_3 = store.recorded_before("job-1", 3).await.unwrap();
        assert_eq!(at_3, Document::parse("Intro\n\n## Gear\n\nboots v1"));
        let at_1 = store.recorded_before("job-1", 1).await.unwrap();
        assert_eq!(at_1, Document::parse("Intro\n\n## Gear\n\nboots"));
    }

    #[tokio::test]
    async fn test_rollback_job_to_unfinished_pass() {
        let store = setup();
        let err = store.rollback_job("job-1", 5).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PassNotCompleted { pass_number: 5, .. }));
    }
}
