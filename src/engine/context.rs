//! Pipeline context shared between the engine and the modules it runs.
//!
//! The engine owns a [`PipelineContext`] and is the only writer of module
//! results. Modules only ever see a [`ContextView`]: the shared read-write
//! view in sequential mode, or a frozen read-only snapshot holding just their
//! dependencies' results in parallel mode.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::core::errors::{PipelineError, Result};
use crate::core::hashing;
use crate::registry::module::ArtifactDescriptor;

/// One transcript segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub speaker: Option<String>,
    pub text: String,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
}

impl Segment {
    pub fn new(speaker: Option<&str>, text: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            speaker: speaker.map(str::to_string),
            text: text.into(),
            start,
            end,
        }
    }
}

/// Parsed transcript handed to the orchestrator by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptData {
    pub segments: Vec<Segment>,
    /// Raw speaker label to display name
    #[serde(default)]
    pub speaker_map: BTreeMap<String, String>,
}

impl TranscriptData {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments,
            speaker_map: BTreeMap::new(),
        }
    }

    pub fn with_speaker_map(mut self, speaker_map: BTreeMap<String, String>) -> Self {
        self.speaker_map = speaker_map;
        self
    }

    /// SHA-256 of the segments; used as the transcript key when the caller
    /// does not supply one.
    pub fn content_hash(&self) -> Result<String> {
        hashing::hash_serializable(&self.segments)
    }

    pub fn has_segments(&self) -> bool {
        !self.segments.is_empty()
    }

    pub fn has_speaker_labels(&self) -> bool {
        self.segments.iter().any(|s| {
            s.speaker
                .as_deref()
                .map(|label| !label.trim().is_empty())
                .unwrap_or(false)
        })
    }
}

/// A completed module's contribution to the context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleResult {
    pub module: String,
    pub payload: Value,
    pub output_hash: String,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDescriptor>,
    /// True when the result was loaded from a cached ModuleRun
    #[serde(default)]
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
struct ContextState {
    transcript: Arc<TranscriptData>,
    transcript_key: String,
    run_id: String,
    results: BTreeMap<String, Arc<ModuleResult>>,
    computed: BTreeMap<String, Value>,
    frozen: bool,
}

/// Authoritative per-run context, writable only by the engine
#[derive(Debug, Clone)]
pub struct PipelineContext {
    state: Arc<RwLock<ContextState>>,
}

impl PipelineContext {
    pub fn new(
        transcript: Arc<TranscriptData>,
        transcript_key: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(ContextState {
                transcript,
                transcript_key: transcript_key.into(),
                run_id: run_id.into(),
                results: BTreeMap::new(),
                computed: BTreeMap::new(),
                frozen: false,
            })),
        }
    }

    /// Freeze the context. Irreversible: every later write fails.
    pub fn freeze(&self) {
        self.state.write().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.state.read().frozen
    }

    pub fn store_result(&self, result: ModuleResult) -> Result<()> {
        let mut state = self.state.write();
        if state.frozen {
            return Err(PipelineError::frozen(format!(
                "store result for {}",
                result.module
            )));
        }
        state.results.insert(result.module.clone(), Arc::new(result));
        Ok(())
    }

    pub fn store_computed_value(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        let mut state = self.state.write();
        if state.frozen {
            return Err(PipelineError::frozen(format!("store computed value {}", key)));
        }
        state.computed.insert(key, value);
        Ok(())
    }

    pub fn result(&self, module: &str) -> Option<Arc<ModuleResult>> {
        self.state.read().results.get(module).cloned()
    }

    pub fn results(&self) -> BTreeMap<String, Arc<ModuleResult>> {
        self.state.read().results.clone()
    }

    pub fn transcript(&self) -> Arc<TranscriptData> {
        self.state.read().transcript.clone()
    }

    pub fn transcript_key(&self) -> String {
        self.state.read().transcript_key.clone()
    }

    pub fn run_id(&self) -> String {
        self.state.read().run_id.clone()
    }

    /// Shared read-write view handed to modules in sequential mode
    pub fn view(&self) -> ContextView {
        ContextView {
            state: self.state.clone(),
            read_only: false,
        }
    }

    /// Read-only view over the live state
    pub fn read_only(&self) -> ContextView {
        ContextView {
            state: self.state.clone(),
            read_only: true,
        }
    }

    /// Frozen, read-only copy holding only the results of `modules`.
    ///
    /// Computed values are copied as they are at snapshot time. Later writes
    /// to the authoritative context are not visible through the snapshot.
    pub fn snapshot(&self, modules: &BTreeSet<String>) -> ContextView {
        let state = self.state.read();
        let results = state
            .results
            .iter()
            .filter(|(name, _)| modules.contains(*name))
            .map(|(name, result)| (name.clone(), result.clone()))
            .collect();

        ContextView {
            state: Arc::new(RwLock::new(ContextState {
                transcript: state.transcript.clone(),
                transcript_key: state.transcript_key.clone(),
                run_id: state.run_id.clone(),
                results,
                computed: state.computed.clone(),
                frozen: true,
            })),
            read_only: true,
        }
    }
}

/// What a module sees while it runs
#[derive(Debug, Clone)]
pub struct ContextView {
    state: Arc<RwLock<ContextState>>,
    read_only: bool,
}

impl ContextView {
    pub fn transcript(&self) -> Arc<TranscriptData> {
        self.state.read().transcript.clone()
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.state.read().transcript.segments.clone()
    }

    pub fn speaker_map(&self) -> BTreeMap<String, String> {
        self.state.read().transcript.speaker_map.clone()
    }

    pub fn transcript_key(&self) -> String {
        self.state.read().transcript_key.clone()
    }

    pub fn run_id(&self) -> String {
        self.state.read().run_id.clone()
    }

    pub fn result(&self, module: &str) -> Option<Arc<ModuleResult>> {
        self.state.read().results.get(module).cloned()
    }

    /// Payload of a dependency's result
    pub fn payload(&self, module: &str) -> Option<Value> {
        self.state
            .read()
            .results
            .get(module)
            .map(|r| r.payload.clone())
    }

    pub fn result_names(&self) -> Vec<String> {
        self.state.read().results.keys().cloned().collect()
    }

    pub fn computed_value(&self, key: &str) -> Option<Value> {
        self.state.read().computed.get(key).cloned()
    }

    pub fn is_frozen(&self) -> bool {
        self.state.read().frozen
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Store a scratch value for later modules. Fails on read-only or frozen
    /// views.
    pub fn store_computed_value(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        if self.read_only {
            return Err(PipelineError::read_only(format!("store computed value {}", key)));
        }
        let mut state = self.state.write();
        if state.frozen {
            return Err(PipelineError::frozen(format!("store computed value {}", key)));
        }
        state.computed.insert(key, value);
        Ok(())
    }
}
