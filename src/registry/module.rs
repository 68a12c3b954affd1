//! The contract every analysis module implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::context::ContextView;

/// Role of an artifact in cache validation and output hashing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactRole {
    Primary,
    Secondary,
}

impl ArtifactRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactRole::Primary => "primary",
            ArtifactRole::Secondary => "secondary",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(ArtifactRole::Primary),
            "secondary" => Some(ArtifactRole::Secondary),
            _ => None,
        }
    }
}

/// A file produced by a module, located by `root` + `relative_path`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub key: String,
    pub artifact_type: String,
    pub role: ArtifactRole,
    pub relative_path: String,
    /// Defaults to the request's output directory when unset
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Computed from the file when unset
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl ArtifactDescriptor {
    pub fn primary(key: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            artifact_type: "file".to_string(),
            role: ArtifactRole::Primary,
            relative_path: relative_path.into(),
            root: None,
            content_hash: None,
        }
    }

    pub fn secondary(key: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            role: ArtifactRole::Secondary,
            ..Self::primary(key, relative_path)
        }
    }

    pub fn with_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = artifact_type.into();
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Absolute location, if the root is known
    pub fn location(&self) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(&self.relative_path))
    }
}

/// Output from a module run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleOutput {
    /// Result payload stored in the context and the ledger
    pub payload: Value,
    pub artifacts: Vec<ArtifactDescriptor>,
    /// Optional metrics about the execution
    pub metrics: Option<Value>,
}

impl ModuleOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            artifacts: Vec::new(),
            metrics: None,
        }
    }

    pub fn with_artifact(mut self, artifact: ArtifactDescriptor) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_metrics(mut self, metrics: Value) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// An opaque analysis unit.
///
/// Modules read what they need from the [`ContextView`] and return their
/// output. They never write results into the context themselves. A timeout
/// only interrupts a module at an `.await`; blocking or CPU-bound work should
/// be wrapped with [`module_blocking_fn`].
#[async_trait]
pub trait AnalysisModule: Send + Sync {
    async fn run(&self, ctx: &ContextView, config: &Value) -> anyhow::Result<ModuleOutput>;
}

/// Adapter turning an async closure into an [`AnalysisModule`]
pub struct FnModule<F> {
    func: F,
}

impl<F> FnModule<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> AnalysisModule for FnModule<F>
where
    F: Fn(ContextView, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ModuleOutput>> + Send + 'static,
{
    async fn run(&self, ctx: &ContextView, config: &Value) -> anyhow::Result<ModuleOutput> {
        (self.func)(ctx.clone(), config.clone()).await
    }
}

/// Wrap an async closure as a shareable module handle
pub fn module_fn<F, Fut>(func: F) -> Arc<dyn AnalysisModule>
where
    F: Fn(ContextView, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ModuleOutput>> + Send + 'static,
{
    Arc::new(FnModule::new(func))
}

/// Adapter running a synchronous closure on the blocking thread pool
pub struct BlockingFnModule<F> {
    func: Arc<F>,
}

impl<F> BlockingFnModule<F> {
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl<F> AnalysisModule for BlockingFnModule<F>
where
    F: Fn(ContextView, Value) -> anyhow::Result<ModuleOutput> + Send + Sync + 'static,
{
    async fn run(&self, ctx: &ContextView, config: &Value) -> anyhow::Result<ModuleOutput> {
        let func = self.func.clone();
        let (ctx, config) = (ctx.clone(), config.clone());
        // On timeout the engine stops waiting; the thread finishes on its own
        tokio::task::spawn_blocking(move || func(ctx, config))
            .await
            .map_err(|e| anyhow::anyhow!("blocking module task aborted: {}", e))?
    }
}

/// Wrap a blocking closure as a shareable module handle
pub fn module_blocking_fn<F>(func: F) -> Arc<dyn AnalysisModule>
where
    F: Fn(ContextView, Value) -> anyhow::Result<ModuleOutput> + Send + Sync + 'static,
{
    Arc::new(BlockingFnModule::new(func))
}
