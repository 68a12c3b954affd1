use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::config::ExecutionMode;
use crate::planning::{ExecutionPlan, SkippedModule};
use crate::registry::ArtifactDescriptor;
use crate::storage::PipelineRunStatus;

/// Per-module state inside one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    TimedOut,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Pending => "pending",
            ModuleStatus::Ready => "ready",
            ModuleStatus::Running => "running",
            ModuleStatus::Completed => "completed",
            ModuleStatus::Failed => "failed",
            ModuleStatus::Skipped => "skipped",
            ModuleStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModuleStatus::Completed
                | ModuleStatus::Failed
                | ModuleStatus::Skipped
                | ModuleStatus::TimedOut
        )
    }

    /// Failed or timed out; dependents get skipped
    pub fn is_failure(&self) -> bool {
        matches!(self, ModuleStatus::Failed | ModuleStatus::TimedOut)
    }
}

/// Final state of one module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleOutcome {
    pub module: String,
    pub status: ModuleStatus,
    pub duration_ms: u64,
    pub module_run_id: Option<i64>,
    pub output_hash: Option<String>,
    pub from_cache: bool,
    /// Skip reason or error message
    pub reason: Option<String>,
}

/// A module-level error recorded without aborting the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleError {
    pub module: String,
    pub category: String,
    pub message: String,
}

/// Result of one `execute` call.
///
/// `modules_run`, `modules_failed`, `cache_hits` and `modules_skipped` never
/// share a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub pipeline_run_id: i64,
    pub run_id: String,
    pub transcript_key: String,
    pub status: PipelineRunStatus,
    pub mode: ExecutionMode,
    pub plan: ExecutionPlan,
    /// Modules in the order they were dispatched, cache hits included
    pub execution_order: Vec<String>,
    /// Modules that were invoked and completed
    pub modules_run: Vec<String>,
    /// Modules that failed or timed out
    pub modules_failed: Vec<String>,
    pub modules_skipped: Vec<SkippedModule>,
    pub cache_hits: Vec<String>,
    pub errors: Vec<ModuleError>,
    pub outcomes: BTreeMap<String, ModuleOutcome>,
    pub module_results: BTreeMap<String, Value>,
    pub artifacts: BTreeMap<String, Vec<ArtifactDescriptor>>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.status == PipelineRunStatus::Completed
    }

    pub fn outcome(&self, module: &str) -> Option<&ModuleOutcome> {
        self.outcomes.get(module)
    }

    pub fn status_of(&self, module: &str) -> Option<ModuleStatus> {
        self.outcomes.get(module).map(|o| o.status)
    }

    pub fn skip_reason(&self, module: &str) -> Option<&str> {
        self.modules_skipped
            .iter()
            .find(|s| s.module == module)
            .map(|s| s.reason.as_str())
    }
}
