//! SQLite persistence for jobs, section versions, rule snapshots and pass deltas.

pub mod db;
pub mod models;

pub use db::{DbHandle, PipelineDb};
pub use models::{
    ClaimOutcome, Job, JobStatus, NewSectionVersion, PassCommit, PauseOutcome, SectionVersion,
};
