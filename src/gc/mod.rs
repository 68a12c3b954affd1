//! Retention and cleanup of old pipeline runs.
//!
//! For every transcript with more than one pipeline run, the newest run (by
//! creation time, then id) is kept and the rest are deleted together with
//! their module runs and artifact rows. Artifact files of deleted runs are
//! only removed when they live under the outputs root and no surviving row
//! still references them.

pub mod disk;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::errors::{PipelineError, Result};
use crate::storage::{Ledger, PipelineRun, TranscriptFilter};
pub use disk::{DiskOnlyPlan, DiskOnlyReport};

#[derive(Debug, Clone, Default)]
pub struct PruneOptions {
    /// Without `apply` nothing is deleted; the report is a plan
    pub apply: bool,
    /// Also unlink artifact files of deleted runs
    pub delete_files: bool,
    /// Files outside this root are never touched. Also enables the
    /// disk-only pass.
    pub outputs_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunedRunInfo {
    pub pipeline_run_id: i64,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub status: String,
}

impl From<&PipelineRun> for PrunedRunInfo {
    fn from(run: &PipelineRun) -> Self {
        Self {
            pipeline_run_id: run.id,
            run_id: run.run_id.clone(),
            created_at: run.created_at,
            status: run.status.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunePlanItem {
    pub transcript_file_id: i64,
    pub transcript_file_name: Option<String>,
    pub keep: PrunedRunInfo,
    pub delete: Vec<PrunedRunInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Delete,
    StillReferenced,
    Missing,
    /// Outside the outputs root, or no outputs root configured
    Unsafe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePlanItem {
    pub path: PathBuf,
    pub action: FileAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub dry_run: bool,
    pub transcripts_considered: usize,
    pub transcripts_with_deletions: usize,
    pub pipeline_runs_to_delete: usize,
    pub pipeline_runs_deleted: u64,
    pub module_runs_deleted: u64,
    pub artifact_rows_deleted: u64,
    pub plan: Vec<PrunePlanItem>,

    pub artifact_candidates: usize,
    /// One entry per candidate file, in both modes
    pub file_plan: Vec<FilePlanItem>,
    pub files_deleted: usize,
    /// Still referenced by a retained row
    pub files_skipped: usize,
    pub files_missing: usize,
    pub files_unsafe: usize,
    pub files_failed: usize,

    pub disk_only: DiskOnlyReport,
}

/// Newest run by `(created_at, id)`
fn choose_keep_run(runs: &[PipelineRun]) -> Option<&PipelineRun> {
    runs.iter().max_by_key(|run| (run.created_at, run.id))
}

/// Canonical form when the path exists, lexical normalization otherwise
fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        if let Ok(parent) = std::fs::canonicalize(parent) {
            return parent.join(name);
        }
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub(crate) fn is_within(path: &Path, root: &Path) -> bool {
    normalize(path).starts_with(normalize(root))
}

pub struct GarbageCollector {
    ledger: Arc<dyn Ledger>,
}

impl GarbageCollector {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub async fn prune(&self, filter: &TranscriptFilter, options: &PruneOptions) -> Result<PruneReport> {
        let mut report = PruneReport {
            dry_run: !options.apply,
            ..Default::default()
        };

        let transcripts = self.ledger.list_transcript_files(filter).await?;
        report.transcripts_considered = transcripts.len();

        let mut runs_to_delete: Vec<i64> = Vec::new();
        for transcript in &transcripts {
            let runs = self.ledger.pipeline_runs_for_transcript(transcript.id).await?;
            if runs.len() <= 1 {
                continue;
            }
            let Some(keep) = choose_keep_run(&runs) else {
                continue;
            };
            let delete: Vec<PrunedRunInfo> = runs
                .iter()
                .filter(|run| run.id != keep.id)
                .map(PrunedRunInfo::from)
                .collect();

            report.transcripts_with_deletions += 1;
            report.pipeline_runs_to_delete += delete.len();
            runs_to_delete.extend(delete.iter().map(|run| run.pipeline_run_id));
            report.plan.push(PrunePlanItem {
                transcript_file_id: transcript.id,
                transcript_file_name: transcript.file_name.clone(),
                keep: PrunedRunInfo::from(keep),
                delete,
            });
        }

        info!(
            transcripts = report.transcripts_considered,
            runs_to_delete = report.pipeline_runs_to_delete,
            apply = options.apply,
            "Planned pipeline run pruning"
        );

        // Disk-only runs are judged against the ledger as it is before deletion
        if let Some(outputs_root) = &options.outputs_root {
            let paths: Vec<PathBuf> = self
                .ledger
                .artifact_locations()
                .await?
                .into_iter()
                .map(|(root, relative_path)| normalize(&Path::new(&root).join(relative_path)))
                .collect();
            report.disk_only = disk::prune_disk_only_runs(outputs_root, &paths, options.apply)
                .await
                .map_err(|e| PipelineError::io("scan outputs root", e))?;
        }

        if runs_to_delete.is_empty() {
            return Ok(report);
        }

        let (module_run_ids, candidates) = if options.delete_files {
            self.artifact_candidates(&runs_to_delete).await?
        } else {
            (BTreeSet::new(), BTreeMap::new())
        };
        report.artifact_candidates = candidates.len();

        if !options.apply {
            for ((root, relative_path), path) in candidates {
                let action = self
                    .classify(&root, &relative_path, &path, &module_run_ids, options)
                    .await?;
                report.file_plan.push(FilePlanItem { path, action });
            }
            return Ok(report);
        }

        let counts = self.ledger.delete_pipeline_runs(&runs_to_delete).await?;
        report.pipeline_runs_deleted = counts.pipeline_runs;
        report.module_runs_deleted = counts.module_runs;
        report.artifact_rows_deleted = counts.artifacts;

        for ((root, relative_path), path) in candidates {
            let action = self
                .classify(&root, &relative_path, &path, &module_run_ids, options)
                .await?;
            match action {
                FileAction::Unsafe => report.files_unsafe += 1,
                FileAction::StillReferenced => report.files_skipped += 1,
                FileAction::Missing => report.files_missing += 1,
                FileAction::Delete => match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!(path = %path.display(), "Deleted artifact file");
                        report.files_deleted += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        report.files_missing += 1
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to delete artifact file");
                        report.files_failed += 1;
                    }
                },
            }
            report.file_plan.push(FilePlanItem { path, action });
        }

        info!(
            pipeline_runs_deleted = report.pipeline_runs_deleted,
            files_deleted = report.files_deleted,
            files_skipped = report.files_skipped,
            "Pruned pipeline runs"
        );
        Ok(report)
    }

    /// What the file pass does with one candidate path
    async fn classify(
        &self,
        root: &str,
        relative_path: &str,
        path: &Path,
        deleted_module_runs: &BTreeSet<i64>,
        options: &PruneOptions,
    ) -> Result<FileAction> {
        let inside = options
            .outputs_root
            .as_deref()
            .map(|outputs_root| is_within(path, outputs_root))
            .unwrap_or(false);
        if !inside {
            return Ok(FileAction::Unsafe);
        }

        let still_referenced = self
            .ledger
            .artifacts_at_location(root, relative_path)
            .await?
            .iter()
            .any(|row| !deleted_module_runs.contains(&row.module_run_id));
        if still_referenced {
            return Ok(FileAction::StillReferenced);
        }

        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(FileAction::Missing);
        }
        Ok(FileAction::Delete)
    }

    /// Module runs of the doomed pipeline runs and their unique artifact
    /// locations, keyed by `(artifact_root, relative_path)`
    async fn artifact_candidates(
        &self,
        pipeline_run_ids: &[i64],
    ) -> Result<(BTreeSet<i64>, BTreeMap<(String, String), PathBuf>)> {
        let mut module_run_ids = BTreeSet::new();
        let mut candidates = BTreeMap::new();

        for pipeline_run_id in pipeline_run_ids {
            for module_run in self.ledger.module_runs_for_pipeline(*pipeline_run_id).await? {
                module_run_ids.insert(module_run.id);
                for artifact in self.ledger.artifacts_for_module_run(module_run.id).await? {
                    let Some(root) = artifact.artifact_root else {
                        continue;
                    };
                    let path = Path::new(&root).join(&artifact.relative_path);
                    candidates.insert((root, artifact.relative_path), path);
                }
            }
        }

        Ok((module_run_ids, candidates))
    }
}
