use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::module::AnalysisModule;

/// Cost tag of a module. Also the first tie-break key of the resolved order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Light,
    Medium,
    Heavy,
}

impl Category {
    pub fn rank(&self) -> u8 {
        match self {
            Category::Light => 0,
            Category::Medium => 1,
            Category::Heavy => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Light => "light",
            Category::Medium => "medium",
            Category::Heavy => "heavy",
        }
    }
}

/// Data a module needs from the transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    Segments,
    SpeakerLabels,
}

impl Requirement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Requirement::Segments => "segments",
            Requirement::SpeakerLabels => "speaker_labels",
        }
    }
}

pub type LoaderFn = dyn Fn() -> Result<Arc<dyn AnalysisModule>, String> + Send + Sync;

/// How the registry obtains a module's implementation
#[derive(Clone, Default)]
pub enum ModuleLoader {
    /// Implementation supplied at registration time
    Ready(Arc<dyn AnalysisModule>),
    /// Called at most once, on first resolution
    Lazy(Arc<LoaderFn>),
    #[default]
    Missing,
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleLoader::Ready(_) => f.write_str("Ready"),
            ModuleLoader::Lazy(_) => f.write_str("Lazy"),
            ModuleLoader::Missing => f.write_str("Missing"),
        }
    }
}

/// Static description of a module. Immutable once registered.
#[derive(Debug, Clone)]
pub struct ModuleDefinition {
    pub name: String,
    pub description: String,
    pub category: Category,
    pub dependencies: BTreeSet<String>,
    /// Falls back to the orchestrator's default timeout when unset
    pub timeout: Option<Duration>,
    pub cacheable: bool,
    /// Part of the module input hash; bump when the output changes
    pub version: String,
    pub requirements: BTreeSet<Requirement>,
    /// JSON Schema the module configuration must satisfy
    pub config_schema: Option<Value>,
    pub exclude_from_default: bool,
    /// Set when the module is known to be unusable in this environment
    pub unavailable_reason: Option<String>,
    pub loader: ModuleLoader,
}

impl ModuleDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            category: Category::Light,
            dependencies: BTreeSet::new(),
            timeout: None,
            cacheable: true,
            version: "1".to_string(),
            requirements: BTreeSet::new(),
            config_schema: None,
            exclude_from_default: false,
            unavailable_reason: None,
            loader: ModuleLoader::Missing,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn requires(mut self, requirement: Requirement) -> Self {
        self.requirements.insert(requirement);
        self
    }

    pub fn config_schema(mut self, schema: Value) -> Self {
        self.config_schema = Some(schema);
        self
    }

    pub fn exclude_from_default(mut self) -> Self {
        self.exclude_from_default = true;
        self
    }

    pub fn unavailable(mut self, reason: impl Into<String>) -> Self {
        self.unavailable_reason = Some(reason.into());
        self
    }

    pub fn with_module(mut self, module: Arc<dyn AnalysisModule>) -> Self {
        self.loader = ModuleLoader::Ready(module);
        self
    }

    pub fn with_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn AnalysisModule>, String> + Send + Sync + 'static,
    {
        self.loader = ModuleLoader::Lazy(Arc::new(loader));
        self
    }
}
