//! Typed error hierarchy for the draftsmith pipeline.
//!
//! Three enums cover the three layers:
//! - `TransformError`: a single call to the transformation capability
//! - `PassError`: one pass attempt inside the executor
//! - `OrchestratorError`: job-level failures surfaced to callers

use std::time::Duration;

use thiserror::Error;

use crate::store::JobStatus;

/// Errors returned by a `Transformer` for a single call.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Network hiccup, rate limit, provider overload. Worth retrying.
    #[error("transient transformation error: {0}")]
    Transient(String),

    #[error("transformation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Bad request, missing binary, unusable output. Not retried.
    #[error("transformation error: {0}")]
    Fatal(String),
}

impl TransformError {
    /// Whether the executor should spend another attempt on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Errors from a single pass execution.
#[derive(Debug, Error)]
pub enum PassError {
    #[error("Pass {pass} transformation failed after {attempts} attempt(s): {message}")]
    Transformation {
        pass: u32,
        attempts: u32,
        message: String,
    },

    #[error("Pass {pass} evaluation failed during {stage} snapshot: {message}")]
    Evaluation {
        pass: u32,
        stage: String,
        message: String,
    },

    #[error("Pass {pass} persistence failed: {source:#}")]
    Persistence {
        pass: u32,
        #[source]
        source: anyhow::Error,
    },
}

impl PassError {
    pub fn pass_number(&self) -> u32 {
        match self {
            Self::Transformation { pass, .. }
            | Self::Evaluation { pass, .. }
            | Self::Persistence { pass, .. } => *pass,
        }
    }
}

/// Errors from the job orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Job {job_id} is already running")]
    ResumeConflict { job_id: String },

    #[error("Job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Cannot {action} job {job_id} while it is {status}")]
    InvalidTransition {
        job_id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Job {job_id} failed at pass {pass_number}: {source}")]
    PassFailed {
        job_id: String,
        pass_number: u32,
        #[source]
        source: PassError,
    },

    #[error("No version of section '{section_key}' at or before pass {pass_number} in job {job_id}")]
    VersionNotFound {
        job_id: String,
        section_key: String,
        pass_number: u32,
    },

    #[error("Pass {pass_number} has not been completed for job {job_id}")]
    PassNotCompleted { job_id: String, pass_number: u32 },

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_error_retry_classification() {
        assert!(TransformError::Transient("rate limited".into()).is_retryable());
        assert!(TransformError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!TransformError::Fatal("bad prompt".into()).is_retryable());
    }

    #[test]
    fn transform_error_timeout_mentions_seconds() {
        let err = TransformError::Timeout(Duration::from_secs(42));
        assert!(err.to_string().contains("42s"));
    }

    #[test]
    fn pass_error_carries_pass_number() {
        let err = PassError::Evaluation {
            pass: 4,
            stage: "after".into(),
            message: "rule engine crashed".into(),
        };
        assert_eq!(err.pass_number(), 4);
        assert!(err.to_string().contains("after"));
        assert!(err.to_string().contains("rule engine crashed"));
    }

    #[test]
    fn orchestrator_error_converts_from_anyhow() {
        let err: OrchestratorError = anyhow::anyhow!("disk full").into();
        match &err {
            OrchestratorError::Store(inner) => assert_eq!(inner.to_string(), "disk full"),
            _ => panic!("Expected Store variant"),
        }
    }

    #[test]
    fn pass_failed_exposes_source() {
        use std::error::Error as _;
        let err = OrchestratorError::PassFailed {
            job_id: "job-1".into(),
            pass_number: 2,
            source: PassError::Transformation {
                pass: 2,
                attempts: 3,
                message: "503 overloaded".into(),
            },
        };
        let source = err.source().expect("source should be set");
        assert!(source.to_string().contains("503 overloaded"));
    }

    #[test]
    fn invalid_transition_names_action_and_status() {
        let err = OrchestratorError::InvalidTransition {
            job_id: "job-9".into(),
            status: JobStatus::Completed,
            action: "pause",
        };
        let msg = err.to_string();
        assert!(msg.contains("pause"));
        assert!(msg.contains("completed"));
    }
}
