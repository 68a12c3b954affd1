//! Run directories that exist on disk but are not referenced by the ledger.
//!
//! Layout is `<outputs_root>/<slug>/<run_id>/...`. For every slug, run
//! directories no artifact location (root joined with relative path) points
//! into are "disk-only"; when a slug has
//! more than one, the newest (by run id) is kept and the rest are removed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::normalize;
use crate::core::run_id::is_valid_run_id;

/// Disk-only run directories planned for one slug
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskOnlyPlan {
    pub slug: String,
    pub delete: Vec<String>,
    pub keep: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskOnlyReport {
    /// Slugs with at least one disk-only run
    pub slugs_scanned: usize,
    pub runs_found: usize,
    pub runs_to_delete: usize,
    pub runs_deleted: usize,
    pub plan: Vec<DiskOnlyPlan>,
}

/// Run ids under `slug_dir` that some artifact location points into
fn referenced_run_ids(slug_dir: &Path, artifact_paths: &[PathBuf]) -> BTreeSet<String> {
    let slug_dir = normalize(slug_dir);
    artifact_paths
        .iter()
        .filter_map(|path| {
            let rest = path.strip_prefix(&slug_dir).ok()?;
            let run_dir = rest.components().next()?.as_os_str().to_str()?;
            is_valid_run_id(run_dir).then(|| run_dir.to_string())
        })
        .collect()
}

async fn subdirectories(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !entry.file_type().await?.is_dir() {
            continue;
        }
        found.push((name, entry.path()));
    }
    found.sort();
    Ok(found)
}

/// Map slug to its sorted disk-only run ids
pub(crate) async fn find_disk_only_runs(
    outputs_root: &Path,
    artifact_paths: &[PathBuf],
) -> std::io::Result<BTreeMap<String, Vec<String>>> {
    let mut disk_only = BTreeMap::new();
    if !tokio::fs::try_exists(outputs_root).await? {
        return Ok(disk_only);
    }

    for (slug, slug_dir) in subdirectories(outputs_root).await? {
        let run_dirs = subdirectories(&slug_dir).await?;
        if run_dirs.len() <= 1 {
            continue;
        }

        let referenced = referenced_run_ids(&slug_dir, artifact_paths);
        let mut run_ids: Vec<String> = run_dirs
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| is_valid_run_id(name) && !referenced.contains(name))
            .collect();
        if run_ids.is_empty() {
            continue;
        }
        run_ids.sort();
        disk_only.insert(slug, run_ids);
    }

    Ok(disk_only)
}

/// Plan and, when `apply` is set, remove superseded disk-only run directories.
///
/// `artifact_paths` are normalized artifact file locations from the ledger.
pub(crate) async fn prune_disk_only_runs(
    outputs_root: &Path,
    artifact_paths: &[PathBuf],
    apply: bool,
) -> std::io::Result<DiskOnlyReport> {
    let disk_only = find_disk_only_runs(outputs_root, artifact_paths).await?;
    let mut report = DiskOnlyReport {
        slugs_scanned: disk_only.len(),
        ..Default::default()
    };

    for (slug, mut run_ids) in disk_only {
        report.runs_found += run_ids.len();
        let Some(keep) = run_ids.pop() else {
            continue;
        };
        if run_ids.is_empty() {
            continue;
        }

        report.runs_to_delete += run_ids.len();
        if apply {
            let slug_dir = outputs_root.join(&slug);
            for run_id in &run_ids {
                let run_dir = slug_dir.join(run_id);
                match tokio::fs::remove_dir_all(&run_dir).await {
                    Ok(()) => {
                        debug!(path = %run_dir.display(), "Removed disk-only run directory");
                        report.runs_deleted += 1;
                    }
                    Err(e) => {
                        warn!(path = %run_dir.display(), error = %e, "Failed to remove run directory")
                    }
                }
            }
        }
        report.plan.push(DiskOnlyPlan {
            slug,
            delete: run_ids,
            keep,
        });
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn make_runs(root: &Path, slug: &str, run_ids: &[&str]) {
        for run_id in run_ids {
            std::fs::create_dir_all(root.join(slug).join(run_id)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_keeps_newest_disk_only_run() {
        let dir = tempfile::tempdir().unwrap();
        make_runs(
            dir.path(),
            "interview",
            &[
                "20240101_100000_aaaaaaaa",
                "20240102_100000_bbbbbbbb",
                "20240103_100000_cccccccc",
            ],
        );

        let report = prune_disk_only_runs(dir.path(), &[], true).await.unwrap();
        assert_eq!(report.runs_found, 3);
        assert_eq!(report.runs_deleted, 2);
        assert_eq!(report.plan[0].keep, "20240103_100000_cccccccc");
        assert!(dir.path().join("interview/20240103_100000_cccccccc").exists());
        assert!(!dir.path().join("interview/20240101_100000_aaaaaaaa").exists());
    }

    #[tokio::test]
    async fn test_referenced_and_malformed_dirs_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        make_runs(
            dir.path(),
            "podcast",
            &[
                "20240101_100000_aaaaaaaa",
                "20240102_100000_bbbbbbbb",
                "latest",
            ],
        );
        let paths = vec![normalize(
            &dir.path().join("podcast/20240101_100000_aaaaaaaa/stats/summary.json"),
        )];

        let report = prune_disk_only_runs(dir.path(), &paths, true).await.unwrap();
        assert_eq!(report.runs_found, 1);
        assert_eq!(report.runs_to_delete, 0);
        assert!(dir.path().join("podcast/20240101_100000_aaaaaaaa").exists());
        assert!(dir.path().join("podcast/latest").exists());
    }

    #[tokio::test]
    async fn test_dry_run_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        make_runs(
            dir.path(),
            "call",
            &["20240101_100000_aaaaaaaa", "20240102_100000_bbbbbbbb"],
        );

        let report = prune_disk_only_runs(dir.path(), &[], false).await.unwrap();
        assert_eq!(report.runs_to_delete, 1);
        assert_eq!(report.runs_deleted, 0);
        assert!(dir.path().join("call/20240101_100000_aaaaaaaa").exists());
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let report = prune_disk_only_runs(&dir.path().join("absent"), &[], true)
            .await
            .unwrap();
        assert_eq!(report, DiskOnlyReport::default());
    }

    #[tokio::test]
    async fn test_run_id_inside_relative_path_counts_as_referenced() {
        let dir = tempfile::tempdir().unwrap();
        make_runs(
            dir.path(),
            "call",
            &["20240105_100000_eeeeeeee", "20240109_100000_aaaaaaaa"],
        );
        let live = dir.path().join("call/20240105_100000_eeeeeeee/stats.json");
        std::fs::write(&live, "{}").unwrap();
        let paths = vec![normalize(&live)];

        let report = prune_disk_only_runs(dir.path(), &paths, true).await.unwrap();
        assert_eq!(report.runs_found, 1);
        assert_eq!(report.runs_to_delete, 0);
        assert!(live.exists());
    }

    #[test]
    fn test_run_id_must_be_first_component_under_slug() {
        let slug_dir = PathBuf::from("/outputs/call");
        let paths = vec![
            PathBuf::from("/outputs/call/20240105_100000_eeeeeeee/stats.json"),
            PathBuf::from("/outputs/call/latest/20240106_100000_ffffffff/x.json"),
            PathBuf::from("/outputs/other/20240107_100000_00000000/x.json"),
        ];
        let referenced = referenced_run_ids(&slug_dir, &paths);
        assert_eq!(
            referenced.into_iter().collect::<Vec<_>>(),
            vec!["20240105_100000_eeeeeeee".to_string()]
        );
    }
}
