//! Entry point: resolve, preflight, record and execute one analysis request.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::context::{PipelineContext, TranscriptData};
use super::events::{EventEmitter, EventSink, PipelineEvent};
use super::executor::{RunState, RunTally};
use super::report::{ExecutionReport, ModuleStatus};
use crate::cache::CacheLayer;
use crate::core::config::{ExecutionMode, OrchestratorConfig, RerunMode};
use crate::core::errors::Result;
use crate::core::hashing;
use crate::core::run_id::generate_run_id;
use crate::gc::{GarbageCollector, PruneOptions, PruneReport};
use crate::planning::{DependencyResolver, ExecutionPlan, PreflightChecker, Resolution};
use crate::registry::{ModuleDefinition, ModuleRegistry};
use crate::storage::{Ledger, NewPipelineRun, PipelineRunStatus, TranscriptFilter};

/// One analysis request against one transcript
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub transcript: Arc<TranscriptData>,
    /// Stable identity of the transcript; defaults to its content hash
    pub transcript_key: Option<String>,
    pub file_name: Option<String>,
    /// Requested modules; empty means every default module
    pub modules: Vec<String>,
    pub run_id: Option<String>,
    pub rerun_mode: Option<RerunMode>,
    pub execution_mode: Option<ExecutionMode>,
    /// Where modules write artifacts and where the plan file goes
    pub output_dir: Option<PathBuf>,
    /// Per-module overrides on top of the orchestrator configuration
    pub module_configs: BTreeMap<String, Value>,
}

impl ExecutionRequest {
    pub fn new(transcript: TranscriptData) -> Self {
        Self {
            transcript: Arc::new(transcript),
            transcript_key: None,
            file_name: None,
            modules: Vec::new(),
            run_id: None,
            rerun_mode: None,
            execution_mode: None,
            output_dir: None,
            module_configs: BTreeMap::new(),
        }
    }

    pub fn modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn transcript_key(mut self, key: impl Into<String>) -> Self {
        self.transcript_key = Some(key.into());
        self
    }

    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn rerun_mode(mut self, mode: RerunMode) -> Self {
        self.rerun_mode = Some(mode);
        self
    }

    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = Some(mode);
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn module_config(mut self, module: impl Into<String>, config: Value) -> Self {
        self.module_configs.insert(module.into(), config);
        self
    }
}

pub struct Orchestrator {
    registry: ModuleRegistry,
    ledger: Arc<dyn Ledger>,
    config: OrchestratorConfig,
    events: Arc<EventEmitter>,
}

impl Orchestrator {
    pub fn new(ledger: Arc<dyn Ledger>, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: ModuleRegistry::new(),
            ledger,
            config,
            events: Arc::new(EventEmitter::default()),
        })
    }

    pub fn with_registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Arc::new(EventEmitter::new(Some(sink)));
        self
    }

    pub fn register(&self, definition: ModuleDefinition) -> Result<()> {
        self.registry.register(definition)
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        self.ledger.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn resolution<S: AsRef<str>>(&self, requested: &[S]) -> Result<Resolution> {
        DependencyResolver::new(&self.registry).resolve(requested)
    }

    /// Dependency-closed execution order for `requested`
    pub fn resolve<S: AsRef<str>>(&self, requested: &[S]) -> Result<Vec<String>> {
        Ok(self.resolution(requested)?.order)
    }

    /// Resolve and preflight without executing anything
    pub fn preflight<S: AsRef<str>>(
        &self,
        requested: &[S],
        transcript: Option<&TranscriptData>,
    ) -> Result<ExecutionPlan> {
        let resolution = self.resolution(requested)?;
        self.check(&resolution, transcript, &self.config.module_configs)
    }

    fn check(
        &self,
        resolution: &Resolution,
        transcript: Option<&TranscriptData>,
        module_configs: &BTreeMap<String, Value>,
    ) -> Result<ExecutionPlan> {
        let mut checker = PreflightChecker::new(&self.registry);
        if let Some(transcript) = transcript {
            checker = checker.with_transcript(transcript);
        }
        checker.check(resolution, module_configs)
    }

    /// Prune old pipeline runs. `outputs_root` falls back to the configured one.
    pub async fn prune(&self, filter: &TranscriptFilter, options: PruneOptions) -> Result<PruneReport> {
        let options = PruneOptions {
            outputs_root: options
                .outputs_root
                .or_else(|| self.config.outputs_root.clone()),
            ..options
        };
        GarbageCollector::new(self.ledger.clone())
            .prune(filter, &options)
            .await
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport> {
        let started = Instant::now();
        let mode = request.execution_mode.unwrap_or(self.config.execution_mode);
        let rerun = request.rerun_mode.unwrap_or(self.config.rerun_mode);
        let run_id = request.run_id.clone().unwrap_or_else(generate_run_id);

        let mut module_configs = self.config.module_configs.clone();
        module_configs.extend(request.module_configs.clone());

        let requested = if request.modules.is_empty() {
            self.registry.default_modules()
        } else {
            request.modules.clone()
        };

        // A cycle fails here, before anything is recorded
        let resolution = self.resolution(requested.as_slice())?;
        let plan = self.check(&resolution, Some(request.transcript.as_ref()), &module_configs)?;

        if self.config.write_execution_plan {
            if let Some(output_dir) = &request.output_dir {
                if let Err(e) = plan.write_to(output_dir) {
                    warn!(run_id = %run_id, error = %e, "Failed to write execution plan");
                }
            }
        }

        let transcript_hash = request.transcript.content_hash()?;
        let transcript_key = request
            .transcript_key
            .clone()
            .unwrap_or_else(|| transcript_hash.clone());
        let transcript_file = self
            .ledger
            .ensure_transcript_file(&transcript_key, request.file_name.as_deref())
            .await?;

        let mut sorted_requested = requested.clone();
        sorted_requested.sort();
        let pipeline_config_hash = hashing::hash_json(&json!({
            "pipeline_version": self.config.pipeline_version,
            "modules": sorted_requested,
            "module_configs": module_configs,
        }));
        let pipeline_run = self
            .ledger
            .create_pipeline_run(NewPipelineRun {
                transcript_file_id: transcript_file.id,
                run_id: run_id.clone(),
                pipeline_version: self.config.pipeline_version.clone(),
                pipeline_config_hash: pipeline_config_hash.clone(),
                pipeline_input_hash: hashing::pipeline_input_hash(
                    &transcript_hash,
                    &pipeline_config_hash,
                ),
            })
            .await?;
        self.ledger
            .update_pipeline_run_status(pipeline_run.id, PipelineRunStatus::Running)
            .await?;

        info!(
            run_id = %run_id,
            pipeline_run_id = pipeline_run.id,
            transcript_key = %transcript_key,
            modules = ?plan.order,
            skipped = plan.skipped.len(),
            mode = mode.as_str(),
            rerun = rerun.as_str(),
            "Starting pipeline run"
        );
        self.events.emit(
            &run_id,
            PipelineEvent::RunStarted {
                pipeline_run_id: pipeline_run.id,
                modules: plan.order.clone(),
                mode: mode.as_str().to_string(),
            },
        );
        for module in &plan.order {
            if let Some(planned) = plan.dependency_graph.get(module) {
                self.events.emit(
                    &run_id,
                    PipelineEvent::ModulePlanned {
                        module: module.clone(),
                        dependencies: planned.dependencies.clone(),
                        included_reason: planned.included_reason.clone(),
                    },
                );
            }
        }

        let context = PipelineContext::new(
            request.transcript.clone(),
            transcript_key.clone(),
            run_id.clone(),
        );
        let mut state = RunState {
            registry: self.registry.clone(),
            ledger: self.ledger.clone(),
            cache: CacheLayer::new(self.ledger.clone(), self.config.verify_artifact_hashes),
            events: self.events.clone(),
            context: context.clone(),
            pipeline_run: pipeline_run.clone(),
            transcript_hash,
            rerun,
            default_timeout: self.config.default_timeout(),
            output_dir: request.output_dir.clone(),
            module_configs,
            dependency_graph: resolution.dependency_graph.clone(),
            statuses: plan
                .order
                .iter()
                .map(|m| (m.clone(), ModuleStatus::Pending))
                .collect(),
            output_hashes: BTreeMap::new(),
            tally: RunTally::default(),
        };
        for skipped in &plan.skipped {
            state.record_planned_skip(skipped);
        }

        let outcome = match &mode {
            ExecutionMode::Sequential => state.run_sequential(&plan.order).await,
            ExecutionMode::Parallel { max_workers } => {
                state.run_parallel(&plan.order, *max_workers).await
            }
        };
        context.freeze();

        if let Err(e) = outcome {
            error!(run_id = %run_id, pipeline_run_id = pipeline_run.id, error = %e, "Pipeline run aborted");
            if let Err(update) = self
                .ledger
                .update_pipeline_run_status(pipeline_run.id, PipelineRunStatus::Failed)
                .await
            {
                warn!(pipeline_run_id = pipeline_run.id, error = %update, "Failed to mark pipeline run failed");
            }
            return Err(e);
        }

        let tally = state.tally;
        let status = if tally.modules_failed.is_empty() {
            PipelineRunStatus::Completed
        } else {
            PipelineRunStatus::Failed
        };
        self.ledger
            .update_pipeline_run_status(pipeline_run.id, status)
            .await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id,
            pipeline_run_id = pipeline_run.id,
            status = status.as_str(),
            run = tally.modules_run.len(),
            cached = tally.cache_hits.len(),
            failed = tally.modules_failed.len(),
            skipped = tally.modules_skipped.len(),
            duration_ms,
            "Pipeline run finished"
        );
        self.events.emit(
            &run_id,
            PipelineEvent::RunFinished {
                pipeline_run_id: pipeline_run.id,
                status: status.as_str().to_string(),
                duration_ms,
            },
        );

        Ok(ExecutionReport {
            pipeline_run_id: pipeline_run.id,
            run_id,
            transcript_key,
            status,
            mode,
            plan,
            execution_order: tally.execution_order,
            modules_run: tally.modules_run,
            modules_failed: tally.modules_failed,
            modules_skipped: tally.modules_skipped,
            cache_hits: tally.cache_hits,
            errors: tally.errors,
            outcomes: tally.outcomes,
            module_results: tally.module_results,
            artifacts: tally.artifacts,
            duration_ms,
        })
    }
}
