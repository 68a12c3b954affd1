//! Dependency-aware orchestration of transcript analysis modules.
//!
//! Modules are registered with their dependencies, resolved into a
//! deterministic order, checked before execution and run sequentially or
//! in parallel waves. Every attempt is recorded in a SQLite ledger that
//! doubles as a content-addressed cache; old runs are pruned by the
//! garbage collector.

pub mod cache;
pub mod core;
pub mod engine;
pub mod gc;
pub mod planning;
pub mod registry;
pub mod storage;
pub mod telemetry;

pub use crate::core::config::{ExecutionMode, OrchestratorConfig, RerunMode};
pub use crate::core::errors::{PipelineError, Result};
pub use cache::{CacheDecision, CacheKey, CacheLayer};
pub use engine::{
    BufferingEventSink, ContextView, EventSink, ExecutionReport, ExecutionRequest,
    LoggingEventSink, ModuleOutcome, ModuleStatus, Orchestrator, PipelineContext, PipelineEvent,
    Segment, TranscriptData,
};
pub use gc::{GarbageCollector, PruneOptions, PruneReport};
pub use planning::{DependencyResolver, ExecutionPlan, PreflightChecker, SkippedModule};
pub use registry::{
    module_blocking_fn, module_fn, AnalysisModule, ArtifactDescriptor, ArtifactRole, Category,
    ModuleDefinition, ModuleOutput, ModuleRegistry, Requirement,
};
pub use storage::{Ledger, SqliteLedger, TranscriptFilter};
