pub mod config;
pub mod errors;
pub mod hashing;
pub mod run_id;

pub use config::{ExecutionMode, OrchestratorConfig, RerunMode};
pub use errors::{PipelineError, Result};
pub use run_id::{generate_run_id, is_valid_run_id};
