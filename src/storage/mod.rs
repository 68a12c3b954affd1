//! Run & artifact ledger.
//!
//! Records every pipeline run, every module attempt and every artifact a
//! module produced. The engine and the cache layer write through the
//! [`Ledger`] trait; the garbage collector reads and deletes through it.

pub mod sqlite_ledger;

pub use sqlite_ledger::SqliteLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::errors::PipelineError;
use crate::registry::{ArtifactDescriptor, ArtifactRole};

/// Cache reason recorded on rows created from a cache hit
pub const CACHE_REASON_HIT: &str = "cache_hit";
pub const CACHE_REASON_NOT_CACHEABLE: &str = "module declared non-cacheable";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parse error: {0}")]
    ParseError(#[from] chrono::ParseError),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Invariant(message) => PipelineError::ledger_invariant(message),
            StorageError::NotFound(id) => PipelineError::not_found("record".to_string(), id),
            StorageError::Io(e) => PipelineError::io("ledger", e),
            other => PipelineError::database("ledger", other),
        }
    }
}

/// Represents the status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PipelineRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineRunStatus::Pending => "pending",
            PipelineRunStatus::Running => "running",
            PipelineRunStatus::Completed => "completed",
            PipelineRunStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(PipelineRunStatus::Pending),
            "running" => Ok(PipelineRunStatus::Running),
            "completed" => Ok(PipelineRunStatus::Completed),
            "failed" => Ok(PipelineRunStatus::Failed),
            _ => Err(format!("Unknown pipeline run status: {}", s)),
        }
    }
}

/// Represents the status of a module run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl ModuleRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleRunStatus::Pending => "pending",
            ModuleRunStatus::Running => "running",
            ModuleRunStatus::Completed => "completed",
            ModuleRunStatus::Failed => "failed",
            ModuleRunStatus::TimedOut => "timed_out",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(ModuleRunStatus::Pending),
            "running" => Ok(ModuleRunStatus::Running),
            "completed" => Ok(ModuleRunStatus::Completed),
            "failed" => Ok(ModuleRunStatus::Failed),
            "timed_out" => Ok(ModuleRunStatus::TimedOut),
            _ => Err(format!("Unknown module run status: {}", s)),
        }
    }
}

/// Transcript file record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptFile {
    pub id: i64,
    pub transcript_key: String,
    pub file_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Pipeline run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: i64,
    pub transcript_file_id: i64,
    /// Caller-supplied run identifier
    pub run_id: String,
    pub pipeline_version: String,
    pub pipeline_config_hash: String,
    pub pipeline_input_hash: String,
    pub status: PipelineRunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Module run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRun {
    pub id: i64,
    pub pipeline_run_id: i64,
    pub transcript_file_id: i64,
    pub module_name: String,
    pub module_version: String,
    pub module_config_hash: String,
    pub module_input_hash: String,
    pub output_hash: Option<String>,
    pub status: ModuleRunStatus,
    pub duration_ms: Option<i64>,
    pub is_cacheable: bool,
    pub cache_reason: Option<String>,
    pub replaces_module_run_id: Option<i64>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModuleRun {
    /// Completed, cacheable and not superseded
    pub fn is_current(&self) -> bool {
        self.status == ModuleRunStatus::Completed
            && self.is_cacheable
            && self.superseded_at.is_none()
    }
}

/// Artifact index record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: i64,
    pub module_run_id: i64,
    pub artifact_key: String,
    pub artifact_type: String,
    pub artifact_role: ArtifactRole,
    pub relative_path: String,
    pub artifact_root: Option<String>,
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ArtifactRecord {
    pub fn descriptor(&self) -> ArtifactDescriptor {
        ArtifactDescriptor {
            key: self.artifact_key.clone(),
            artifact_type: self.artifact_type.clone(),
            role: self.artifact_role,
            relative_path: self.relative_path.clone(),
            root: self.artifact_root.as_ref().map(Into::into),
            content_hash: self.content_hash.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPipelineRun {
    pub transcript_file_id: i64,
    pub run_id: String,
    pub pipeline_version: String,
    pub pipeline_config_hash: String,
    pub pipeline_input_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewModuleRun {
    pub pipeline_run_id: i64,
    pub transcript_file_id: i64,
    pub module_name: String,
    pub module_version: String,
    pub module_config_hash: String,
    pub module_input_hash: String,
    pub is_cacheable: bool,
    pub cache_reason: Option<String>,
}

/// Terminal state of a module attempt
#[derive(Debug, Clone)]
pub struct ModuleCompletion {
    pub status: ModuleRunStatus,
    pub output_hash: Option<String>,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub payload: Option<Value>,
    pub artifacts: Vec<ArtifactDescriptor>,
}

/// Which transcripts a maintenance pass looks at
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptFilter {
    #[serde(default)]
    pub transcript_file_ids: Vec<i64>,
    #[serde(default)]
    pub file_name_contains: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionCounts {
    pub pipeline_runs: u64,
    pub module_runs: u64,
    pub artifacts: u64,
}

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub transcript_files: i64,
    pub pipeline_runs: i64,
    pub module_runs: i64,
    pub current_module_runs: i64,
    pub artifacts: i64,
}

/// Persistent record of runs, module attempts and artifacts
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Get or create the transcript file row for a transcript key
    async fn ensure_transcript_file(
        &self,
        transcript_key: &str,
        file_name: Option<&str>,
    ) -> Result<TranscriptFile, StorageError>;

    async fn list_transcript_files(
        &self,
        filter: &TranscriptFilter,
    ) -> Result<Vec<TranscriptFile>, StorageError>;

    async fn create_pipeline_run(&self, run: NewPipelineRun) -> Result<PipelineRun, StorageError>;

    async fn update_pipeline_run_status(
        &self,
        id: i64,
        status: PipelineRunStatus,
    ) -> Result<(), StorageError>;

    async fn get_pipeline_run(&self, id: i64) -> Result<Option<PipelineRun>, StorageError>;

    async fn pipeline_runs_for_transcript(
        &self,
        transcript_file_id: i64,
    ) -> Result<Vec<PipelineRun>, StorageError>;

    /// Insert a module attempt in the `running` state
    async fn create_module_run(&self, run: NewModuleRun) -> Result<ModuleRun, StorageError>;

    /// Record the terminal state of an attempt together with its artifacts.
    ///
    /// A completed cacheable attempt supersedes whatever row was current for
    /// the same module and input hash, in the same transaction.
    async fn complete_module_run(
        &self,
        id: i64,
        completion: ModuleCompletion,
    ) -> Result<ModuleRun, StorageError>;

    /// Record a cache hit: a new completed row in `pipeline_run_id` that
    /// copies `source`'s output hash, payload and artifact rows and
    /// supersedes `source`.
    async fn record_cache_hit(
        &self,
        pipeline_run_id: i64,
        source: &ModuleRun,
    ) -> Result<ModuleRun, StorageError>;

    /// The current row for a module and input hash. More than one is an
    /// invariant violation.
    async fn find_current_module_run(
        &self,
        module_name: &str,
        module_input_hash: &str,
    ) -> Result<Option<ModuleRun>, StorageError>;

    async fn get_module_run(&self, id: i64) -> Result<Option<ModuleRun>, StorageError>;

    async fn module_runs_for_pipeline(
        &self,
        pipeline_run_id: i64,
    ) -> Result<Vec<ModuleRun>, StorageError>;

    async fn module_run_payload(&self, id: i64) -> Result<Option<Value>, StorageError>;

    async fn artifacts_for_module_run(
        &self,
        module_run_id: i64,
    ) -> Result<Vec<ArtifactRecord>, StorageError>;

    async fn artifacts_by_content_hash(
        &self,
        content_hash: &str,
    ) -> Result<Vec<ArtifactRecord>, StorageError>;

    async fn artifacts_at_location(
        &self,
        artifact_root: &str,
        relative_path: &str,
    ) -> Result<Vec<ArtifactRecord>, StorageError>;

    /// Distinct `(artifact_root, relative_path)` pairs across rows that have a root
    async fn artifact_locations(&self) -> Result<Vec<(String, String)>, StorageError>;

    /// Delete pipeline runs, their module runs and artifact rows explicitly
    async fn delete_pipeline_runs(&self, ids: &[i64]) -> Result<DeletionCounts, StorageError>;

    async fn stats(&self) -> Result<LedgerStats, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            ModuleRunStatus::Pending,
            ModuleRunStatus::Running,
            ModuleRunStatus::Completed,
            ModuleRunStatus::Failed,
            ModuleRunStatus::TimedOut,
        ] {
            assert_eq!(ModuleRunStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(PipelineRunStatus::from_str("cancelled").is_err());
    }

    #[test]
    fn test_invariant_maps_to_pipeline_error() {
        let err: PipelineError = StorageError::Invariant("two current rows".into()).into();
        assert_eq!(err.category(), "ledger_invariant");
    }
}
