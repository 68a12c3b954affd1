//! Pruning old pipeline runs through the orchestrator

mod common;

use analysis_orchestrator::gc::FileAction;
use analysis_orchestrator::{
    module_fn, AnalysisModule, ArtifactDescriptor, ContextView, ExecutionRequest, Ledger,
    ModuleDefinition, ModuleOutput, OrchestratorConfig, PruneOptions, RerunMode, TranscriptFilter,
};
use common::*;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Writes `stats/call-<n>.json` plus a shared `stats/summary.json`
fn stats_module(calls: Arc<AtomicUsize>) -> Arc<dyn AnalysisModule> {
    module_fn(move |_ctx: ContextView, _config: Value| {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok::<_, anyhow::Error>(
                ModuleOutput::new(json!({ "call": n }))
                    .with_artifact(ArtifactDescriptor::primary(
                        "call",
                        format!("stats/call-{}.json", n),
                    ))
                    .with_artifact(ArtifactDescriptor::secondary(
                        "summary",
                        "stats/summary.json",
                    )),
            )
        }
    })
}

fn write_outputs(dir: &Path, n: usize) {
    std::fs::create_dir_all(dir.join("stats")).unwrap();
    std::fs::write(dir.join(format!("stats/call-{}.json", n)), format!("{n}")).unwrap();
    std::fs::write(dir.join("stats/summary.json"), "summary").unwrap();
}

fn apply(outputs_root: Option<PathBuf>) -> PruneOptions {
    PruneOptions {
        apply: true,
        delete_files: true,
        outputs_root,
    }
}

#[tokio::test]
async fn test_prune_keeps_newest_run_and_its_files() {
    let outputs = tempfile::tempdir().unwrap();
    let run_dir = outputs.path().join("interview");
    let (orchestrator, ledger) = orchestrator(OrchestratorConfig::default()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    orchestrator
        .register(ModuleDefinition::new("stats").with_module(stats_module(calls.clone())))
        .unwrap();

    let mut pipeline_runs = Vec::new();
    for n in 1..=3 {
        // Files exist before the module reports them so content hashes resolve
        write_outputs(&run_dir, n);
        let report = orchestrator
            .execute(
                ExecutionRequest::new(transcript())
                    .transcript_key("interview")
                    .modules(["stats"])
                    .rerun_mode(RerunMode::Recompute)
                    .output_dir(&run_dir),
            )
            .await
            .unwrap();
        assert!(report.succeeded());
        pipeline_runs.push(report.pipeline_run_id);
    }

    let plan = orchestrator
        .prune(
            &TranscriptFilter::default(),
            PruneOptions {
                apply: false,
                ..apply(Some(outputs.path().to_path_buf()))
            },
        )
        .await
        .unwrap();
    assert!(plan.dry_run);
    assert_eq!(plan.plan.len(), 1);
    assert_eq!(plan.plan[0].keep.pipeline_run_id, pipeline_runs[2]);
    assert_eq!(plan.pipeline_runs_to_delete, 2);
    assert_eq!(plan.file_plan.len(), 3);
    assert_eq!(
        plan.file_plan
            .iter()
            .filter(|item| item.action == FileAction::StillReferenced)
            .count(),
        1
    );
    assert!(run_dir.join("stats/call-1.json").exists());
    assert_eq!(ledger.stats().await.unwrap().pipeline_runs, 3);

    let report = orchestrator
        .prune(
            &TranscriptFilter::default(),
            apply(Some(outputs.path().to_path_buf())),
        )
        .await
        .unwrap();
    assert_eq!(report.pipeline_runs_deleted, 2);
    assert_eq!(report.artifact_candidates, 3);
    assert_eq!(report.files_deleted, 2);
    assert_eq!(report.files_skipped, 1);

    assert!(!run_dir.join("stats/call-1.json").exists());
    assert!(!run_dir.join("stats/call-2.json").exists());
    assert!(run_dir.join("stats/call-3.json").exists());
    assert!(run_dir.join("stats/summary.json").exists());

    let stats = ledger.stats().await.unwrap();
    assert_eq!(stats.pipeline_runs, 1);
    assert_eq!(stats.current_module_runs, 1);
    assert!(ledger
        .get_pipeline_run(pipeline_runs[2])
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_prune_spares_files_referenced_by_cache_hits() {
    let outputs = tempfile::tempdir().unwrap();
    let run_dir = outputs.path().join("podcast");
    let (orchestrator, _ledger) = orchestrator(OrchestratorConfig {
        outputs_root: Some(outputs.path().to_path_buf()),
        ..Default::default()
    })
    .await;
    let calls = Arc::new(AtomicUsize::new(0));
    orchestrator
        .register(ModuleDefinition::new("stats").with_module(stats_module(calls.clone())))
        .unwrap();
    let request = || {
        ExecutionRequest::new(transcript())
            .modules(["stats"])
            .output_dir(&run_dir)
    };

    write_outputs(&run_dir, 1);
    orchestrator.execute(request()).await.unwrap();
    let hit = orchestrator.execute(request()).await.unwrap();
    assert_eq!(hit.cache_hits, vec!["stats"]);

    let report = orchestrator
        .prune(&TranscriptFilter::default(), apply(None))
        .await
        .unwrap();
    assert_eq!(report.pipeline_runs_deleted, 1);
    assert_eq!(report.files_deleted, 0);
    assert_eq!(report.files_skipped, 2);
    assert!(run_dir.join("stats/call-1.json").exists());

    let again = orchestrator.execute(request()).await.unwrap();
    assert_eq!(again.cache_hits, vec!["stats"]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_prune_removes_superseded_disk_only_runs() {
    let outputs = tempfile::tempdir().unwrap();
    for run_id in [
        "20240301_090000_0000000a",
        "20240302_090000_0000000b",
        "20240303_090000_0000000c",
    ] {
        std::fs::create_dir_all(outputs.path().join("lecture").join(run_id)).unwrap();
    }
    let (orchestrator, _ledger) = orchestrator(OrchestratorConfig {
        outputs_root: Some(outputs.path().to_path_buf()),
        ..Default::default()
    })
    .await;

    let report = orchestrator
        .prune(&TranscriptFilter::default(), apply(None))
        .await
        .unwrap();
    assert_eq!(report.disk_only.runs_found, 3);
    assert_eq!(report.disk_only.runs_deleted, 2);
    assert_eq!(report.disk_only.plan[0].keep, "20240303_090000_0000000c");
    assert!(outputs
        .path()
        .join("lecture/20240303_090000_0000000c")
        .exists());
    assert!(!outputs
        .path()
        .join("lecture/20240301_090000_0000000a")
        .exists());
}

#[tokio::test]
async fn test_disk_only_pass_spares_ledger_runs_under_the_same_slug() {
    let outputs = tempfile::tempdir().unwrap();
    let live_run = "20240105_100000_eeeeeeee";
    let slug_dir = outputs.path().join("call");
    for run_id in ["20240101_100000_00000001", live_run, "20240109_100000_aaaaaaaa"] {
        std::fs::create_dir_all(slug_dir.join(run_id)).unwrap();
    }
    let live_file = slug_dir.join(live_run).join("stats.json");
    std::fs::write(&live_file, r#"{"words": 9}"#).unwrap();

    let (orchestrator, ledger) = orchestrator(OrchestratorConfig {
        outputs_root: Some(outputs.path().to_path_buf()),
        ..Default::default()
    })
    .await;
    let root = outputs.path().to_path_buf();
    let stats = module_fn(move |_ctx: ContextView, _config: Value| {
        let root = root.clone();
        async move {
            Ok::<_, anyhow::Error>(
                ModuleOutput::new(json!({"words": 9})).with_artifact(
                    ArtifactDescriptor::primary("stats", format!("call/{}/stats.json", live_run))
                        .with_root(root),
                ),
            )
        }
    });
    orchestrator
        .register(ModuleDefinition::new("stats").with_module(stats))
        .unwrap();
    let report = orchestrator
        .execute(
            ExecutionRequest::new(transcript())
                .transcript_key("call")
                .run_id(live_run)
                .modules(["stats"]),
        )
        .await
        .unwrap();
    assert!(report.succeeded());

    let pruned = orchestrator
        .prune(&TranscriptFilter::default(), apply(None))
        .await
        .unwrap();
    assert_eq!(pruned.disk_only.runs_found, 2);
    assert_eq!(pruned.disk_only.plan.len(), 1);
    assert_eq!(pruned.disk_only.plan[0].keep, "20240109_100000_aaaaaaaa");
    assert_eq!(
        pruned.disk_only.plan[0].delete,
        vec!["20240101_100000_00000001".to_string()]
    );
    assert!(live_file.exists());
    assert!(!slug_dir.join("20240101_100000_00000001").exists());
    assert!(slug_dir.join("20240109_100000_aaaaaaaa").exists());
    assert_eq!(ledger.stats().await.unwrap().pipeline_runs, 1);
}
