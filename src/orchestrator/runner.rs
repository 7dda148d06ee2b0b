//! Job orchestrator: the only component that moves a job between states.
//!
//! Passes run strictly in order. After each one the executor's outcome is
//! committed in a single transaction together with the advanced checkpoint,
//! so a crash between passes never loses or repeats completed work.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::capability::{Evaluator, Transformer};
use crate::delta::PassDelta;
use crate::document::{Document, Section};
use crate::errors::{OrchestratorError, PassError};
use crate::orchestrator::executor::{ExecutorSettings, PassExecutor, PassOutcome};
use crate::orchestrator::report::QualityReport;
use crate::pass::{PassDefinition, validate_order};
use crate::store::{ClaimOutcome, DbHandle, Job, JobStatus, PauseOutcome, SectionVersion};
use crate::versions::SectionVersionStore;

/// How often a running executor refreshes its job's `updated_at`.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Quiet period after which `recover_interrupted` treats a running job as dead.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

/// How a call to `start` or `resume` ended without error.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(QualityReport),
    /// Stopped on a pause request before running the pass at this index
    Paused { current_pass_index: usize },
}

/// Read-only projection of a job's persisted state.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub job_id: String,
    pub document_ref: String,
    pub status: JobStatus,
    pub current_pass_index: usize,
    pub total_passes: usize,
    pub last_delta: Option<PassDelta>,
    /// Only set once the job has completed
    pub quality_report: Option<QualityReport>,
    pub error: Option<String>,
    pub pause_requested: bool,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct JobOrchestrator {
    db: DbHandle,
    executor: PassExecutor,
    versions: SectionVersionStore,
}

impl JobOrchestrator {
    pub fn new(
        db: DbHandle,
        transformer: Arc<dyn Transformer>,
        evaluator: Arc<dyn Evaluator>,
        settings: ExecutorSettings,
    ) -> Self {
        let versions = SectionVersionStore::new(db.clone());
        let executor = PassExecutor::new(transformer, evaluator, versions.clone(), settings);
        Self {
            db,
            executor,
            versions,
        }
    }

    pub fn versions(&self) -> &SectionVersionStore {
        &self.versions
    }

    /// Register a pending job for `document` with a fixed pass list.
    pub async fn create_job(
        &self,
        document_ref: &str,
        passes: Vec<PassDefinition>,
        document: Document,
    ) -> Result<Job, OrchestratorError> {
        validate_order(&passes)?;
        let id = uuid::Uuid::new_v4().to_string();
        let document_ref = document_ref.to_string();
        let job = self
            .db
            .call(move |db| db.create_job(&id, &document_ref, &passes, &document))
            .await?;
        tracing::info!(
            job_id = %job.id,
            document_ref = %job.document_ref,
            passes = job.total_passes(),
            sections = job.document.sections.len(),
            "job created"
        );
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        let id = job_id.to_string();
        self.db
            .call(move |db| db.get_job(&id))
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, OrchestratorError> {
        Ok(self.db.call(|db| db.list_jobs()).await?)
    }

    /// Run a pending or paused job from its checkpoint.
    ///
    /// Starting a completed job returns its stored report without running
    /// anything. Starting a job another executor is running fails with
    /// `ResumeConflict`.
    pub async fn start(&self, job_id: &str) -> Result<RunOutcome, OrchestratorError> {
        match self.claim(job_id, true).await? {
            ClaimOutcome::Claimed(job) => self.run(job).await,
            ClaimOutcome::Rejected(job) => match job.status {
                JobStatus::Completed => {
                    let report = match job.quality_report {
                        Some(report) => report,
                        None => self.report(job_id).await?,
                    };
                    Ok(RunOutcome::Completed(report))
                }
                JobStatus::Running => Err(OrchestratorError::ResumeConflict {
                    job_id: job_id.to_string(),
                }),
                status => Err(OrchestratorError::InvalidTransition {
                    job_id: job_id.to_string(),
                    status,
                    action: "start",
                }),
            },
            ClaimOutcome::NotFound => Err(OrchestratorError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// Continue a paused job from its checkpoint.
    pub async fn resume(&self, job_id: &str) -> Result<RunOutcome, OrchestratorError> {
        match self.claim(job_id, false).await? {
            ClaimOutcome::Claimed(job) => self.run(job).await,
            ClaimOutcome::Rejected(job) if job.status == JobStatus::Running => {
                Err(OrchestratorError::ResumeConflict {
                    job_id: job_id.to_string(),
                })
            }
            ClaimOutcome::Rejected(job) => Err(OrchestratorError::InvalidTransition {
                job_id: job_id.to_string(),
                status: job.status,
                action: "resume",
            }),
            ClaimOutcome::NotFound => Err(OrchestratorError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// Pause an idle job now, or ask a running one to stop before its next pass.
    pub async fn pause(&self, job_id: &str) -> Result<PauseOutcome, OrchestratorError> {
        let id = job_id.to_string();
        let outcome = self.db.call(move |db| db.request_pause(&id)).await?;
        match outcome {
            PauseOutcome::Paused | PauseOutcome::Requested => {
                tracing::info!(job_id, ?outcome, "pause accepted");
                Ok(outcome)
            }
            PauseOutcome::Rejected(status) => Err(OrchestratorError::InvalidTransition {
                job_id: job_id.to_string(),
                status,
                action: "pause",
            }),
            PauseOutcome::NotFound => Err(OrchestratorError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    pub async fn progress(&self, job_id: &str) -> Result<JobProgress, OrchestratorError> {
        let job = self.get_job(job_id).await?;
        let id = job_id.to_string();
        let last_delta = self.db.call(move |db| db.last_delta(&id)).await?;
        Ok(JobProgress {
            total_passes: job.total_passes(),
            quality_report: job
                .quality_report
                .filter(|_| job.status == JobStatus::Completed),
            job_id: job.id,
            document_ref: job.document_ref,
            status: job.status,
            current_pass_index: job.current_pass_index,
            last_delta,
            error: job.error,
            pause_requested: job.cancel_requested,
            updated_at: job.updated_at,
        })
    }

    /// Quality report for any job; partial unless the job has completed.
    pub async fn report(&self, job_id: &str) -> Result<QualityReport, OrchestratorError> {
        let job = self.get_job(job_id).await?;
        if let Some(report) = job.quality_report {
            return Ok(report);
        }
        let id = job_id.to_string();
        let deltas = self.db.call(move |db| db.list_deltas(&id)).await?;
        Ok(QualityReport::from_deltas(job_id, job.total_passes(), &deltas))
    }

    /// Restore the document, or one section of it, to its state after `target_pass`.
    ///
    /// The restored content becomes the job's current document. The pass index
    /// and every recorded version are left untouched.
    pub async fn rollback(
        &self,
        job_id: &str,
        target_pass: u32,
        section_key: Option<&str>,
    ) -> Result<Document, OrchestratorError> {
        let job = self.get_job(job_id).await?;
        if job.status == JobStatus::Running {
            return Err(OrchestratorError::InvalidTransition {
                job_id: job_id.to_string(),
                status: job.status,
                action: "roll back",
            });
        }
        if target_pass as usize > job.current_pass_index {
            return Err(OrchestratorError::PassNotCompleted {
                job_id: job_id.to_string(),
                pass_number: target_pass,
            });
        }

        let document = match section_key {
            Some(key) => {
                let version = self
                    .versions
                    .rollback_section(job_id, key, target_pass)
                    .await?;
                with_section(job.document, &version)
            }
            None => self.versions.rollback_job(job_id, target_pass).await?,
        };

        let (id, replacement) = (job_id.to_string(), document.clone());
        let replaced = self
            .db
            .call(move |db| db.replace_document(&id, &replacement))
            .await?;
        if !replaced {
            return Err(OrchestratorError::InvalidTransition {
                job_id: job_id.to_string(),
                status: JobStatus::Running,
                action: "roll back",
            });
        }
        tracing::info!(job_id, target_pass, section = ?section_key, "rolled back");
        Ok(document)
    }

    /// Every recorded version of one section, oldest first.
    pub async fn versions_of(
        &self,
        job_id: &str,
        section_key: &str,
    ) -> Result<Vec<SectionVersion>, OrchestratorError> {
        self.get_job(job_id).await?;
        self.versions.history(job_id, section_key).await
    }

    /// Pause jobs left `running` by a process that died mid-run.
    ///
    /// Jobs whose executor wrote or heartbeated within `stale_after` are
    /// left alone.
    pub async fn recover_interrupted(
        &self,
        stale_after: Duration,
    ) -> Result<Vec<String>, OrchestratorError> {
        let recovered = self
            .db
            .call(move |db| db.recover_interrupted(stale_after))
            .await?;
        for job_id in &recovered {
            tracing::warn!(job_id = %job_id, "interrupted job paused for resume");
        }
        Ok(recovered)
    }

    async fn claim(
        &self,
        job_id: &str,
        allow_pending: bool,
    ) -> Result<ClaimOutcome, OrchestratorError> {
        let id = job_id.to_string();
        Ok(self
            .db
            .call(move |db| db.claim_job(&id, allow_pending))
            .await?)
    }

    async fn run(&self, mut job: Job) -> Result<RunOutcome, OrchestratorError> {
        let token = job.claim_token.clone().ok_or_else(|| {
            OrchestratorError::Store(anyhow::anyhow!("Job {} was claimed without a token", job.id))
        })?;
        tracing::info!(
            job_id = %job.id,
            completed = job.current_pass_index,
            total = job.total_passes(),
            "job running"
        );

        while let Some(pass) = job.next_pass().cloned() {
            let id = job.id.clone();
            if self.db.call(move |db| db.is_cancel_requested(&id)).await? {
                let (id, held) = (job.id.clone(), token.clone());
                if !self.db.call(move |db| db.mark_paused(&id, &held)).await? {
                    return Err(self.claim_lost(&job));
                }
                tracing::info!(job_id = %job.id, next_pass = pass.number, "job paused");
                return Ok(RunOutcome::Paused {
                    current_pass_index: job.current_pass_index,
                });
            }

            tracing::info!(job_id = %job.id, pass = pass.number, name = %pass.name, "pass started");
            let heartbeat = self.spawn_heartbeat(&job.id, &token);
            let outcome = self.executor.run_pass(&job.id, &pass, &job.document).await;
            heartbeat.abort();
            let commit = match outcome {
                PassOutcome::Applied(commit) | PassOutcome::Reverted(commit) => commit,
                PassOutcome::Failed(err) => return Err(self.fail(&job, &token, err).await),
            };

            let index = job.current_pass_index;
            let document = commit.document.clone();
            let (id, held) = (job.id.clone(), token.clone());
            if let Err(source) = self
                .db
                .call(move |db| db.commit_pass(&id, &held, index, &commit))
                .await
            {
                let (id, held) = (job.id.clone(), token.clone());
                if !self.db.call(move |db| db.holds_claim(&id, &held)).await? {
                    return Err(self.claim_lost(&job));
                }
                let err = PassError::Persistence {
                    pass: pass.number,
                    source,
                };
                return Err(self.fail(&job, &token, err).await);
            }

            job.document = document;
            job.current_pass_index += 1;
        }

        let report = self.report(&job.id).await?;
        let (id, held, stored) = (job.id.clone(), token.clone(), report.clone());
        self.db
            .call(move |db| db.mark_completed(&id, &held, &stored))
            .await?;
        tracing::info!(
            job_id = %job.id,
            applied = report.passes_applied,
            reverted = report.passes_reverted,
            final_score = ?report.final_score,
            "job completed"
        );
        Ok(RunOutcome::Completed(report))
    }

    /// Keep `updated_at` fresh while a pass is in flight so recovery leaves
    /// the job alone.
    fn spawn_heartbeat(&self, job_id: &str, token: &str) -> tokio::task::JoinHandle<()> {
        let (db, job_id, token) = (self.db.clone(), job_id.to_string(), token.to_string());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (id, held) = (job_id.clone(), token.clone());
                match db.call(move |db| db.heartbeat(&id, &held)).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(job_id = %job_id, "claim lost, heartbeat stopped");
                        break;
                    }
                    Err(e) => tracing::warn!(job_id = %job_id, error = %e, "heartbeat failed"),
                }
            }
        })
    }

    /// Another executor took over the job; leave its state alone.
    fn claim_lost(&self, job: &Job) -> OrchestratorError {
        tracing::warn!(job_id = %job.id, pass_index = job.current_pass_index, "claim lost, stopping");
        OrchestratorError::ResumeConflict {
            job_id: job.id.clone(),
        }
    }

    /// Record the failure on the job and build the error returned to the caller.
    async fn fail(&self, job: &Job, token: &str, err: PassError) -> OrchestratorError {
        let (id, held, message) = (job.id.clone(), token.to_string(), err.to_string());
        match self
            .db
            .call(move |db| db.mark_failed(&id, &held, &message))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job_id = %job.id, "claim lost before failure was recorded");
            }
            Err(store_err) => {
                tracing::error!(job_id = %job.id, error = %store_err, "failed to record job failure");
            }
        }
        tracing::error!(job_id = %job.id, pass = err.pass_number(), error = %err, "job failed");
        OrchestratorError::PassFailed {
            job_id: job.id.clone(),
            pass_number: err.pass_number(),
            source: err,
        }
    }
}

/// Replace (or re-insert) one section of `document` with a recorded version.
fn with_section(mut document: Document, version: &SectionVersion) -> Document {
    let section = Section::from_text(&version.section_key, &version.content);
    match document
        .sections
        .iter_mut()
        .find(|s| s.key == version.section_key)
    {
        Some(existing) => *existing = section,
        None => {
            let at = version.position.min(document.sections.len());
            document.sections.insert(at, section);
        }
    }
    document
}
