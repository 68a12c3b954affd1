//! Per-run execution state and the sequential loop.
//!
//! Everything that touches the ledger, the cache or the authoritative
//! context happens on the engine's own task. Module code runs in spawned
//! tasks and only hands its output back.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{error, info, warn};

use super::context::{ContextView, ModuleResult, PipelineContext};
use super::events::{EventEmitter, PipelineEvent};
use super::report::{ModuleError, ModuleOutcome, ModuleStatus};
use crate::cache::{compute_output_hash, finalize_artifacts, CacheDecision, CacheKey, CacheLayer};
use crate::core::config::RerunMode;
use crate::core::errors::{PipelineError, Result};
use crate::planning::preflight::SKIP_DEPENDENCY_FAILED;
use crate::planning::SkippedModule;
use crate::registry::{
    AnalysisModule, ArtifactDescriptor, Availability, ModuleDefinition, ModuleOutput,
    ModuleRegistry,
};
use crate::storage::{Ledger, ModuleCompletion, ModuleRunStatus, NewModuleRun, PipelineRun};

/// A module ready to be invoked, with its ledger row already created
pub(crate) struct Invocation {
    pub module: String,
    pub definition: ModuleDefinition,
    pub handle: Arc<dyn AnalysisModule>,
    pub config: Value,
    pub timeout: Duration,
    pub module_run_id: i64,
}

pub(crate) enum Prepared {
    Skipped,
    Cached,
    Invoke(Invocation),
}

pub(crate) enum InvocationOutcome {
    Succeeded(ModuleOutput),
    Failed(String),
    TimedOut(Duration),
}

pub(crate) struct InvocationResult {
    pub outcome: InvocationOutcome,
    pub duration: Duration,
}

/// Run one module under its timeout
pub(crate) async fn invoke_module(
    handle: Arc<dyn AnalysisModule>,
    view: ContextView,
    config: Value,
    timeout: Duration,
) -> InvocationResult {
    let started = Instant::now();
    let outcome = match tokio::time::timeout(timeout, handle.run(&view, &config)).await {
        Ok(Ok(output)) => InvocationOutcome::Succeeded(output),
        Ok(Err(e)) => InvocationOutcome::Failed(format!("{:#}", e)),
        Err(_) => InvocationOutcome::TimedOut(timeout),
    };
    InvocationResult {
        outcome,
        duration: started.elapsed(),
    }
}

/// A panicking module task counts as an execution failure
pub(crate) fn joined(
    result: std::result::Result<InvocationResult, JoinError>,
    started: Instant,
) -> InvocationResult {
    result.unwrap_or_else(|e| InvocationResult {
        outcome: InvocationOutcome::Failed(format!("module task aborted: {}", e)),
        duration: started.elapsed(),
    })
}

/// Report pieces accumulated while the run progresses
#[derive(Debug, Default)]
pub(crate) struct RunTally {
    pub execution_order: Vec<String>,
    pub modules_run: Vec<String>,
    pub modules_failed: Vec<String>,
    pub modules_skipped: Vec<SkippedModule>,
    pub cache_hits: Vec<String>,
    pub errors: Vec<ModuleError>,
    pub outcomes: BTreeMap<String, ModuleOutcome>,
    pub module_results: BTreeMap<String, Value>,
    pub artifacts: BTreeMap<String, Vec<ArtifactDescriptor>>,
}

pub(crate) struct RunState {
    pub registry: ModuleRegistry,
    pub ledger: Arc<dyn Ledger>,
    pub cache: CacheLayer,
    pub events: Arc<EventEmitter>,
    pub context: PipelineContext,
    pub pipeline_run: PipelineRun,
    pub transcript_hash: String,
    pub rerun: RerunMode,
    pub default_timeout: Duration,
    pub output_dir: Option<PathBuf>,
    pub module_configs: BTreeMap<String, Value>,
    /// In-closure dependencies of every resolved module
    pub dependency_graph: BTreeMap<String, Vec<String>>,
    pub statuses: BTreeMap<String, ModuleStatus>,
    pub output_hashes: BTreeMap<String, String>,
    pub tally: RunTally,
}

impl RunState {
    fn run_id(&self) -> String {
        self.context.run_id()
    }

    fn dependencies(&self, module: &str) -> &[String] {
        self.dependency_graph
            .get(module)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn dependencies_completed(&self, module: &str) -> bool {
        self.dependencies(module)
            .iter()
            .all(|dep| self.statuses.get(dep) == Some(&ModuleStatus::Completed))
    }

    /// Why `module` can no longer run, if one of its dependencies did not
    /// complete. A skip caused upstream by a failure names the failed module.
    pub(crate) fn blocked_reason(&self, module: &str) -> Option<String> {
        for dep in self.dependencies(module) {
            match self.statuses.get(dep) {
                Some(status) if status.is_failure() => {
                    return Some(format!("{}: {}", SKIP_DEPENDENCY_FAILED, dep))
                }
                Some(ModuleStatus::Skipped) => {
                    return Some(match self.failed_ancestor(dep) {
                        Some(failed) => {
                            format!("{}: {} (via {})", SKIP_DEPENDENCY_FAILED, failed, dep)
                        }
                        None => format!("dependency skipped: {}", dep),
                    })
                }
                _ => {}
            }
        }
        None
    }

    /// First failed module reached through skipped dependencies of `module`
    fn failed_ancestor(&self, module: &str) -> Option<String> {
        self.dependencies(module)
            .iter()
            .find_map(|dep| match self.statuses.get(dep) {
                Some(status) if status.is_failure() => Some(dep.clone()),
                Some(ModuleStatus::Skipped) => self.failed_ancestor(dep),
                _ => None,
            })
    }

    pub(crate) fn transitive_dependencies(&self, module: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![module];
        while let Some(current) = stack.pop() {
            for dep in self.dependencies(current) {
                if seen.insert(dep.clone()) {
                    stack.push(dep.as_str());
                }
            }
        }
        seen
    }

    fn set_status(&mut self, module: &str, status: ModuleStatus) {
        self.statuses.insert(module.to_string(), status);
    }

    /// Record a skip decided by preflight
    pub(crate) fn record_planned_skip(&mut self, skipped: &SkippedModule) {
        self.tally.outcomes.insert(
            skipped.module.clone(),
            ModuleOutcome {
                module: skipped.module.clone(),
                status: ModuleStatus::Skipped,
                duration_ms: 0,
                module_run_id: None,
                output_hash: None,
                from_cache: false,
                reason: Some(skipped.reason.clone()),
            },
        );
        self.set_status(&skipped.module, ModuleStatus::Skipped);
        self.tally.modules_skipped.push(skipped.clone());
        self.events.emit(
            &self.run_id(),
            PipelineEvent::ModuleSkipped {
                module: skipped.module.clone(),
                reason: skipped.reason.clone(),
            },
        );
    }

    pub(crate) fn skip(&mut self, module: &str, reason: String) {
        warn!(module, %reason, "Skipping module");
        self.record_planned_skip(&SkippedModule::new(module, reason));
    }

    /// Decide how a module proceeds: skipped, served from cache, or invoked.
    pub(crate) async fn prepare(&mut self, module: &str) -> Result<Prepared> {
        if let Some(reason) = self.blocked_reason(module) {
            self.skip(module, reason);
            return Ok(Prepared::Skipped);
        }
        self.set_status(module, ModuleStatus::Ready);

        let definition = self
            .registry
            .get(module)
            .ok_or_else(|| PipelineError::unknown_module(module))?;
        let handle = match self.registry.resolve_function(module)? {
            Availability::Available(handle) => handle,
            Availability::Unavailable { reason } => {
                self.skip(module, format!("unavailable: {}", reason));
                return Ok(Prepared::Skipped);
            }
        };

        let config = self
            .module_configs
            .get(module)
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let dependency_hashes: BTreeMap<String, String> = self
            .dependencies(module)
            .iter()
            .filter_map(|dep| {
                self.output_hashes
                    .get(dep)
                    .map(|hash| (dep.clone(), hash.clone()))
            })
            .collect();
        let key = CacheKey::compute(&definition, &config, &self.transcript_hash, &dependency_hashes);

        self.tally.execution_order.push(module.to_string());

        match self.cache.lookup(&definition, &key, self.rerun).await? {
            CacheDecision::Hit {
                source,
                payload,
                artifacts,
            } => {
                let row = self.cache.record_hit(self.pipeline_run.id, &source).await?;
                let output_hash = row.output_hash.clone().unwrap_or_default();

                self.context.store_result(ModuleResult {
                    module: module.to_string(),
                    payload: payload.clone(),
                    output_hash: output_hash.clone(),
                    artifacts: artifacts.clone(),
                    from_cache: true,
                })?;
                self.output_hashes.insert(module.to_string(), output_hash.clone());
                self.set_status(module, ModuleStatus::Completed);

                self.tally.cache_hits.push(module.to_string());
                self.tally.module_results.insert(module.to_string(), payload);
                self.tally.artifacts.insert(module.to_string(), artifacts);
                self.tally.outcomes.insert(
                    module.to_string(),
                    ModuleOutcome {
                        module: module.to_string(),
                        status: ModuleStatus::Completed,
                        duration_ms: 0,
                        module_run_id: Some(row.id),
                        output_hash: Some(output_hash),
                        from_cache: true,
                        reason: None,
                    },
                );

                info!(module, module_run_id = row.id, source = source.id, "Cache hit");
                self.events.emit(
                    &self.run_id(),
                    PipelineEvent::CacheHit {
                        module: module.to_string(),
                        module_run_id: row.id,
                        source_module_run_id: source.id,
                    },
                );
                Ok(Prepared::Cached)
            }
            CacheDecision::Miss { reason } => {
                let row = self
                    .ledger
                    .create_module_run(NewModuleRun {
                        pipeline_run_id: self.pipeline_run.id,
                        transcript_file_id: self.pipeline_run.transcript_file_id,
                        module_name: module.to_string(),
                        module_version: definition.version.clone(),
                        module_config_hash: key.module_config_hash.clone(),
                        module_input_hash: key.module_input_hash.clone(),
                        is_cacheable: definition.cacheable,
                        cache_reason: Some(reason),
                    })
                    .await?;

                self.set_status(module, ModuleStatus::Running);
                self.events.emit(
                    &self.run_id(),
                    PipelineEvent::ModuleStarted {
                        module: module.to_string(),
                        module_run_id: row.id,
                    },
                );

                let timeout = definition.timeout.unwrap_or(self.default_timeout);
                Ok(Prepared::Invoke(Invocation {
                    module: module.to_string(),
                    definition,
                    handle,
                    config,
                    timeout,
                    module_run_id: row.id,
                }))
            }
        }
    }

    /// Merge a finished invocation into the ledger, the context and the tally
    pub(crate) async fn finish(&mut self, inv: Invocation, result: InvocationResult) -> Result<()> {
        let duration_ms = result.duration.as_millis() as u64;

        let status = match result.outcome {
            InvocationOutcome::Succeeded(output) => {
                match finalize_artifacts(output.artifacts, self.output_dir.as_deref()) {
                    Ok(artifacts) => {
                        self.complete(&inv, output.payload, artifacts, duration_ms)
                            .await?;
                        ModuleStatus::Completed
                    }
                    Err(message) => {
                        let err = PipelineError::execution(inv.module.clone(), message);
                        self.fail(&inv, ModuleStatus::Failed, err, duration_ms).await?;
                        ModuleStatus::Failed
                    }
                }
            }
            InvocationOutcome::Failed(message) => {
                let err = PipelineError::execution(inv.module.clone(), message);
                self.fail(&inv, ModuleStatus::Failed, err, duration_ms).await?;
                ModuleStatus::Failed
            }
            InvocationOutcome::TimedOut(timeout) => {
                let err = PipelineError::timeout(inv.module.clone(), timeout);
                self.fail(&inv, ModuleStatus::TimedOut, err, duration_ms).await?;
                ModuleStatus::TimedOut
            }
        };

        self.events.emit(
            &self.run_id(),
            PipelineEvent::ModuleCompleted {
                module: inv.module.clone(),
                status: status.as_str().to_string(),
                duration_ms,
            },
        );
        Ok(())
    }

    async fn complete(
        &mut self,
        inv: &Invocation,
        payload: Value,
        artifacts: Vec<ArtifactDescriptor>,
        duration_ms: u64,
    ) -> Result<()> {
        let output_hash = compute_output_hash(&inv.definition, &artifacts, &payload);
        self.ledger
            .complete_module_run(
                inv.module_run_id,
                ModuleCompletion {
                    status: ModuleRunStatus::Completed,
                    output_hash: Some(output_hash.clone()),
                    duration_ms: duration_ms as i64,
                    error_message: None,
                    payload: Some(payload.clone()),
                    artifacts: artifacts.clone(),
                },
            )
            .await?;

        self.context.store_result(ModuleResult {
            module: inv.module.clone(),
            payload: payload.clone(),
            output_hash: output_hash.clone(),
            artifacts: artifacts.clone(),
            from_cache: false,
        })?;
        self.output_hashes.insert(inv.module.clone(), output_hash.clone());
        self.set_status(&inv.module, ModuleStatus::Completed);

        self.tally.modules_run.push(inv.module.clone());
        self.tally.module_results.insert(inv.module.clone(), payload);
        self.tally.artifacts.insert(inv.module.clone(), artifacts);
        self.tally.outcomes.insert(
            inv.module.clone(),
            ModuleOutcome {
                module: inv.module.clone(),
                status: ModuleStatus::Completed,
                duration_ms,
                module_run_id: Some(inv.module_run_id),
                output_hash: Some(output_hash),
                from_cache: false,
                reason: None,
            },
        );

        info!(module = %inv.module, duration_ms, "Module completed");
        Ok(())
    }

    async fn fail(
        &mut self,
        inv: &Invocation,
        status: ModuleStatus,
        err: PipelineError,
        duration_ms: u64,
    ) -> Result<()> {
        let row_status = if status == ModuleStatus::TimedOut {
            ModuleRunStatus::TimedOut
        } else {
            ModuleRunStatus::Failed
        };
        let message = err.to_string();
        error!(module = %inv.module, category = err.category(), error = %message, "Module failed");

        self.ledger
            .complete_module_run(
                inv.module_run_id,
                ModuleCompletion {
                    status: row_status,
                    output_hash: None,
                    duration_ms: duration_ms as i64,
                    error_message: Some(message.clone()),
                    payload: None,
                    artifacts: Vec::new(),
                },
            )
            .await?;

        self.set_status(&inv.module, status);
        self.tally.modules_failed.push(inv.module.clone());
        self.tally.errors.push(ModuleError {
            module: inv.module.clone(),
            category: err.category().to_string(),
            message: message.clone(),
        });
        self.tally.outcomes.insert(
            inv.module.clone(),
            ModuleOutcome {
                module: inv.module.clone(),
                status,
                duration_ms,
                module_run_id: Some(inv.module_run_id),
                output_hash: None,
                from_cache: false,
                reason: Some(message),
            },
        );
        Ok(())
    }

    /// Single worker, resolved order, shared mutable context
    pub(crate) async fn run_sequential(&mut self, order: &[String]) -> Result<()> {
        for module in order {
            if let Prepared::Invoke(inv) = self.prepare(module).await? {
                let view = self.context.view();
                let started = Instant::now();
                let task = tokio::spawn(invoke_module(
                    inv.handle.clone(),
                    view,
                    inv.config.clone(),
                    inv.timeout,
                ));
                let result = joined(task.await, started);
                self.finish(inv, result).await?;
            }
        }
        Ok(())
    }
}
