use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::delta::PassDelta;
use crate::document::Document;
use crate::orchestrator::report::QualityReport;
use crate::pass::PassDefinition;
use crate::snapshot::{RuleResults, RuleSnapshot};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// One document's run through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub document_ref: String,
    pub passes: Vec<PassDefinition>,
    /// Number of passes completed; index of the next pass to run
    pub current_pass_index: usize,
    pub status: JobStatus,
    /// Document as of the last committed pass
    pub document: Document,
    pub quality_report: Option<QualityReport>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    /// Token of the executor holding the job; set only while `running`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,
    pub created_at: String,
    /// Refreshed by every write, including the running executor's heartbeat
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl Job {
    pub fn total_passes(&self) -> usize {
        self.passes.len()
    }

    /// Next pass to run, `None` once every pass has been completed.
    pub fn next_pass(&self) -> Option<&PassDefinition> {
        self.passes.get(self.current_pass_index)
    }
}

/// Raw row from `jobs`; JSON columns are decoded in `into_job`.
pub(crate) struct JobRow {
    pub id: String,
    pub document_ref: String,
    pub passes: String,
    pub current_pass_index: i64,
    pub status: String,
    pub document: String,
    pub quality_report: Option<String>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub claim_token: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl JobRow {
    pub fn into_job(self) -> anyhow::Result<Job> {
        let status = JobStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?;
        let passes: Vec<PassDefinition> = serde_json::from_str(&self.passes)
            .map_err(|e| anyhow::anyhow!("Invalid passes JSON for job {}: {}", self.id, e))?;
        let document: Document = serde_json::from_str(&self.document)
            .map_err(|e| anyhow::anyhow!("Invalid document JSON for job {}: {}", self.id, e))?;
        let quality_report = self
            .quality_report
            .as_deref()
            .map(serde_json::from_str::<QualityReport>)
            .transpose()
            .map_err(|e| anyhow::anyhow!("Invalid report JSON for job {}: {}", self.id, e))?;
        Ok(Job {
            id: self.id,
            document_ref: self.document_ref,
            passes,
            current_pass_index: usize::try_from(self.current_pass_index)?,
            status,
            document,
            quality_report,
            error: self.error,
            cancel_requested: self.cancel_requested,
            claim_token: self.claim_token,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

/// Content of one section after one pass. Immutable apart from `is_best`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionVersion {
    pub id: i64,
    pub job_id: String,
    pub section_key: String,
    /// Pass that produced this content; 0 is the job's initial document
    pub pass_number: u32,
    /// Position of the section in the document at that pass
    pub position: usize,
    pub content: String,
    pub content_hash: String,
    /// Rule results for this section alone, when section scoring is enabled
    pub rule_snapshot: Option<RuleResults>,
    pub is_best: bool,
    pub created_at: String,
}

/// A section version waiting to be committed.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSectionVersion {
    pub section_key: String,
    pub position: usize,
    pub content: String,
    pub rule_snapshot: Option<RuleResults>,
    pub mark_best: bool,
}

/// Everything one completed pass writes, committed atomically with the checkpoint.
#[derive(Debug, Clone)]
pub struct PassCommit {
    pub before: RuleSnapshot,
    pub after: RuleSnapshot,
    pub delta: PassDelta,
    pub versions: Vec<NewSectionVersion>,
    /// Document the pipeline continues with (transformed or reverted)
    pub document: Document,
}

/// Result of trying to move a job into `running`.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Job),
    /// The job exists but its status does not allow the transition
    Rejected(Job),
    NotFound,
}

/// Result of a pause request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    /// Job was idle and is now paused
    Paused,
    /// Job is running; it pauses before its next pass
    Requested,
    Rejected(JobStatus),
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::from_str("cancelled").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
