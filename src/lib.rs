pub mod capability;
pub mod config;
pub mod delta;
pub mod document;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod pass;
pub mod pipeline_config;
pub mod snapshot;
pub mod store;
pub mod versions;
