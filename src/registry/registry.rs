//! Registry of module definitions with lazy function resolution.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use super::definition::{ModuleDefinition, ModuleLoader};
use super::module::AnalysisModule;
use crate::core::errors::{PipelineError, Result};

/// Outcome of resolving a module's implementation
#[derive(Clone)]
pub enum Availability {
    Available(Arc<dyn AnalysisModule>),
    Unavailable { reason: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available(_))
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        match self {
            Availability::Available(_) => None,
            Availability::Unavailable { reason } => Some(reason),
        }
    }
}

impl fmt::Debug for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Available(_) => f.write_str("Available"),
            Availability::Unavailable { reason } => {
                f.debug_struct("Unavailable").field("reason", reason).finish()
            }
        }
    }
}

struct RegistryEntry {
    definition: ModuleDefinition,
    resolved: OnceLock<Availability>,
}

impl RegistryEntry {
    fn resolve(&self) -> Availability {
        self.resolved
            .get_or_init(|| {
                let def = &self.definition;
                if let Some(reason) = &def.unavailable_reason {
                    return Availability::Unavailable {
                        reason: reason.clone(),
                    };
                }
                match &def.loader {
                    ModuleLoader::Ready(module) => Availability::Available(module.clone()),
                    ModuleLoader::Lazy(loader) => match loader() {
                        Ok(module) => {
                            debug!(module = %def.name, "Resolved module implementation");
                            Availability::Available(module)
                        }
                        Err(reason) => {
                            warn!(module = %def.name, %reason, "Module implementation failed to load");
                            Availability::Unavailable { reason }
                        }
                    },
                    ModuleLoader::Missing => Availability::Unavailable {
                        reason: "no implementation registered".to_string(),
                    },
                }
            })
            .clone()
    }
}

/// Registry for module definitions
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    entries: Arc<DashMap<String, Arc<RegistryEntry>>>,
}

impl ModuleRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing any previous one with the same name.
    ///
    /// A replaced definition gets a fresh entry, so its loader is resolved
    /// again on first use. Surrounding whitespace is stripped from the name.
    pub fn register(&self, mut definition: ModuleDefinition) -> Result<()> {
        let name = definition.name.trim().to_string();
        if name.is_empty() {
            return Err(PipelineError::configuration("module name must not be empty"));
        }
        definition.name = name.clone();

        debug!(
            module = %name,
            category = definition.category.as_str(),
            dependencies = ?definition.dependencies,
            "Registered module"
        );
        let entry = Arc::new(RegistryEntry {
            definition,
            resolved: OnceLock::new(),
        });
        if self.entries.insert(name.clone(), entry).is_some() {
            info!(module = %name, "Replaced module registration");
        }
        Ok(())
    }

    /// Get a definition by name
    pub fn get(&self, name: &str) -> Option<ModuleDefinition> {
        self.entries.get(name).map(|e| e.definition.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn dependencies_of(&self, name: &str) -> Result<BTreeSet<String>> {
        self.entries
            .get(name)
            .map(|e| e.definition.dependencies.clone())
            .ok_or_else(|| PipelineError::unknown_module(name))
    }

    /// Resolve a module's implementation.
    ///
    /// The loader runs at most once per registration; later calls return the
    /// memoized outcome, including a failed one.
    pub fn resolve_function(&self, name: &str) -> Result<Availability> {
        let entry = self
            .entries
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| PipelineError::unknown_module(name))?;
        Ok(entry.resolve())
    }

    /// All registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Modules run when the caller does not name any
    pub fn default_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.definition.exclude_from_default)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
