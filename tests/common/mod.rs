//! Shared fixtures for the integration tests

#![allow(dead_code)]

use analysis_orchestrator::{
    module_blocking_fn, module_fn, AnalysisModule, ContextView, ModuleOutput, Orchestrator, OrchestratorConfig,
    Segment, SqliteLedger, TranscriptData,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn transcript() -> TranscriptData {
    TranscriptData::new(vec![
        Segment::new(Some("SPEAKER_00"), "Thanks for joining the call today.", 0.0, 2.4),
        Segment::new(Some("SPEAKER_01"), "Happy to be here.", 2.4, 3.6),
        Segment::new(Some("SPEAKER_00"), "Let's start with the roadmap.", 3.6, 5.9),
    ])
}

pub fn unlabeled_transcript() -> TranscriptData {
    TranscriptData::new(vec![Segment::new(None, "Just one voice here.", 0.0, 1.0)])
}

pub async fn ledger() -> Arc<SqliteLedger> {
    Arc::new(SqliteLedger::in_memory().await.expect("in-memory ledger"))
}

pub async fn orchestrator(config: OrchestratorConfig) -> (Orchestrator, Arc<SqliteLedger>) {
    let ledger = ledger().await;
    let orchestrator = Orchestrator::new(ledger.clone(), config).expect("valid config");
    (orchestrator, ledger)
}

/// Returns `payload` and counts invocations
pub fn counting(counter: Arc<AtomicUsize>, payload: Value) -> Arc<dyn AnalysisModule> {
    module_fn(move |_ctx: ContextView, _config: Value| {
        let counter = counter.clone();
        let payload = payload.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ModuleOutput::new(payload))
        }
    })
}

pub fn constant(payload: Value) -> Arc<dyn AnalysisModule> {
    counting(Arc::new(AtomicUsize::new(0)), payload)
}

pub fn failing(message: &'static str) -> Arc<dyn AnalysisModule> {
    module_fn(move |_ctx: ContextView, _config: Value| async move {
        Err::<ModuleOutput, _>(anyhow::anyhow!(message))
    })
}

pub fn sleeping(duration: Duration) -> Arc<dyn AnalysisModule> {
    module_fn(move |_ctx: ContextView, _config: Value| async move {
        tokio::time::sleep(duration).await;
        Ok(ModuleOutput::new(json!({ "slept_ms": duration.as_millis() as u64 })))
    })
}

/// Holds its thread for `duration` without yielding
pub fn blocking(duration: Duration) -> Arc<dyn AnalysisModule> {
    module_blocking_fn(move |_ctx: ContextView, _config: Value| {
        std::thread::sleep(duration);
        Ok(ModuleOutput::new(json!({ "blocked_ms": duration.as_millis() as u64 })))
    })
}

/// Echoes the payloads of the named dependencies
pub fn echo_dependencies(deps: &'static [&'static str]) -> Arc<dyn AnalysisModule> {
    module_fn(move |ctx: ContextView, _config: Value| async move {
        let mut seen = serde_json::Map::new();
        for dep in deps {
            let payload = ctx
                .payload(dep)
                .ok_or_else(|| anyhow::anyhow!("missing result for {}", dep))?;
            seen.insert(dep.to_string(), payload);
        }
        Ok::<_, anyhow::Error>(ModuleOutput::new(Value::Object(seen)))
    })
}
