//! Execution engine: per-run context, sequential and wave-parallel
//! execution, lifecycle events and the final report.

pub mod context;
pub mod events;
mod executor;
pub mod orchestrator;
mod parallel;
pub mod report;

pub use context::{ContextView, ModuleResult, PipelineContext, Segment, TranscriptData};
pub use events::{
    BufferingEventSink, EventEmitter, EventSink, LoggingEventSink, PipelineEvent,
    PipelineEventEnvelope,
};
pub use orchestrator::{ExecutionRequest, Orchestrator};
pub use report::{ExecutionReport, ModuleError, ModuleOutcome, ModuleStatus};
