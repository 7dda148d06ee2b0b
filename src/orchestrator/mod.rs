pub mod executor;
pub mod report;
pub mod runner;

#[cfg(test)]
mod stubs;

pub use executor::{ExecutorSettings, PassExecutor, PassOutcome};
pub use report::{PassSummary, QualityReport};
pub use runner::{DEFAULT_STALE_AFTER, JobOrchestrator, JobProgress, RunOutcome};
