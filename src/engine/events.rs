//! Typed lifecycle events emitted while a pipeline runs

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const EVENT_VERSION: u32 = 1;

/// Runtime event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    RunStarted {
        pipeline_run_id: i64,
        modules: Vec<String>,
        mode: String,
    },
    ModulePlanned {
        module: String,
        dependencies: Vec<String>,
        included_reason: String,
    },
    WaveStarted {
        wave: usize,
        modules: Vec<String>,
    },
    ModuleStarted {
        module: String,
        module_run_id: i64,
    },
    ModuleCompleted {
        module: String,
        status: String,
        duration_ms: u64,
    },
    ModuleSkipped {
        module: String,
        reason: String,
    },
    CacheHit {
        module: String,
        module_run_id: i64,
        source_module_run_id: i64,
    },
    RunFinished {
        pipeline_run_id: i64,
        status: String,
        duration_ms: u64,
    },
}

/// Event envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEventEnvelope {
    pub version: u32,
    pub sequence: u64,
    pub run_id: String,
    pub timestamp: u64,
    pub event: PipelineEvent,
}

/// Event sink trait for emitting events
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &PipelineEventEnvelope);
}

/// Forwards events to `tracing` at debug level
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &PipelineEventEnvelope) {
        tracing::debug!(
            sequence = envelope.sequence,
            run_id = %envelope.run_id,
            event = ?envelope.event,
            "Pipeline event"
        );
    }
}

/// A buffering event sink that collects events
#[derive(Default)]
pub struct BufferingEventSink {
    events: RwLock<Vec<PipelineEventEnvelope>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<PipelineEventEnvelope> {
        self.events.read().clone()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &PipelineEventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Wraps events in sequenced envelopes. Sequence numbers are monotonic per
/// emitter, across runs.
#[derive(Default)]
pub struct EventEmitter {
    sink: Option<Arc<dyn EventSink>>,
    sequence: AtomicU64,
}

impl EventEmitter {
    pub fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            sink,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn emit(&self, run_id: &str, event: PipelineEvent) {
        if let Some(sink) = &self.sink {
            let envelope = PipelineEventEnvelope {
                version: EVENT_VERSION,
                sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
                run_id: run_id.to_string(),
                timestamp: now_ms(),
                event,
            };
            sink.emit(&envelope);
        }
    }
}

/// Get current timestamp in milliseconds
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
