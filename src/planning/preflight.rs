//! Preflight: turn a resolution into an execution plan.
//!
//! Nothing here raises for a single bad module. Every problem becomes either
//! a skip with a reason or a warning, so a run always has a plan to report.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::resolver::Resolution;
use crate::core::errors::{PipelineError, Result};
use crate::engine::context::TranscriptData;
use crate::registry::{Availability, ModuleDefinition, ModuleRegistry, Requirement};

pub const PLAN_DIR: &str = ".pipeline";
pub const PLAN_FILE: &str = "execution_plan.json";

pub const SKIP_NOT_REGISTERED: &str = "not registered";
pub const SKIP_DEPENDENCY_FAILED: &str = "dependency failed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedModule {
    pub module: String,
    pub reason: String,
}

impl SkippedModule {
    pub fn new(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            reason: reason.into(),
        }
    }
}

/// Per-module entry of the plan's dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedModule {
    pub category: String,
    pub dependencies: Vec<String>,
    pub included_reason: String,
    pub cacheable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Runnable modules in resolved order
    pub order: Vec<String>,
    pub skipped: Vec<SkippedModule>,
    pub warnings: Vec<String>,
    pub requested: Vec<String>,
    pub added_as_dependencies: Vec<String>,
    pub dependency_graph: BTreeMap<String, PlannedModule>,
}

impl ExecutionPlan {
    pub fn skip_reason(&self, module: &str) -> Option<&str> {
        self.skipped
            .iter()
            .find(|s| s.module == module)
            .map(|s| s.reason.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn plan_path(output_dir: &Path) -> PathBuf {
        output_dir.join(PLAN_DIR).join(PLAN_FILE)
    }

    /// Write the plan as pretty JSON under `<output_dir>/.pipeline/`
    pub fn write_to(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = Self::plan_path(output_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::io(format!("create {}", parent.display()), e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .map_err(|e| PipelineError::io(format!("write {}", path.display()), e))?;
        Ok(path)
    }
}

pub struct PreflightChecker<'a> {
    registry: &'a ModuleRegistry,
    transcript: Option<&'a TranscriptData>,
}

impl<'a> PreflightChecker<'a> {
    pub fn new(registry: &'a ModuleRegistry) -> Self {
        Self {
            registry,
            transcript: None,
        }
    }

    /// Also check module data requirements against this transcript
    pub fn with_transcript(mut self, transcript: &'a TranscriptData) -> Self {
        self.transcript = Some(transcript);
        self
    }

    pub fn check(
        &self,
        resolution: &Resolution,
        module_configs: &BTreeMap<String, Value>,
    ) -> Result<ExecutionPlan> {
        let mut plan = ExecutionPlan {
            requested: resolution.requested.clone(),
            added_as_dependencies: resolution.added_as_dependencies.clone(),
            ..Default::default()
        };

        for name in &resolution.unknown {
            plan.skipped.push(SkippedModule::new(name, SKIP_NOT_REGISTERED));
        }

        let mut skipped: BTreeSet<String> = BTreeSet::new();
        for name in &resolution.order {
            let def = self
                .registry
                .get(name)
                .ok_or_else(|| PipelineError::unknown_module(name.as_str()))?;

            plan.dependency_graph.insert(
                name.clone(),
                PlannedModule {
                    category: def.category.as_str().to_string(),
                    dependencies: def.dependencies.iter().cloned().collect(),
                    included_reason: resolution
                        .included_reason
                        .get(name)
                        .cloned()
                        .unwrap_or_default(),
                    cacheable: def.cacheable,
                },
            );

            let config = module_configs
                .get(name)
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));

            match self.skip_reason(&def, &config, &skipped)? {
                Some(reason) => {
                    warn!(module = %name, %reason, "Preflight skipping module");
                    skipped.insert(name.clone());
                    plan.skipped.push(SkippedModule::new(name, reason));
                }
                None => {
                    plan.warnings.extend(self.warnings_for(&def));
                    plan.order.push(name.clone());
                }
            }
        }

        info!(
            runnable = plan.order.len(),
            skipped = plan.skipped.len(),
            warnings = plan.warnings.len(),
            "Preflight complete"
        );
        Ok(plan)
    }

    fn skip_reason(
        &self,
        def: &ModuleDefinition,
        config: &Value,
        skipped: &BTreeSet<String>,
    ) -> Result<Option<String>> {
        for dep in &def.dependencies {
            if !self.registry.contains(dep) {
                return Ok(Some(format!("missing dependency: {}", dep)));
            }
            if skipped.contains(dep) {
                return Ok(Some(format!("dependency skipped: {}", dep)));
            }
        }

        if let Availability::Unavailable { reason } = self.registry.resolve_function(&def.name)? {
            return Ok(Some(format!("unavailable: {}", reason)));
        }

        if let Some(transcript) = self.transcript {
            for requirement in &def.requirements {
                let met = match requirement {
                    Requirement::Segments => transcript.has_segments(),
                    Requirement::SpeakerLabels => transcript.has_speaker_labels(),
                };
                if !met {
                    return Ok(Some(format!("requirement unmet: {}", requirement.as_str())));
                }
            }
        }

        if let Some(schema) = &def.config_schema {
            let compiled = match jsonschema::validator_for(schema) {
                Ok(compiled) => compiled,
                Err(e) => return Ok(Some(format!("invalid configuration schema: {}", e))),
            };
            if let Err(error) = compiled.validate(config) {
                return Ok(Some(format!("invalid configuration: {}", error)));
            }
        }

        Ok(None)
    }

    fn warnings_for(&self, def: &ModuleDefinition) -> Vec<String> {
        if !def.cacheable {
            return Vec::new();
        }
        def.dependencies
            .iter()
            .filter_map(|dep| self.registry.get(dep))
            .filter(|dep| !dep.cacheable)
            .map(|dep| {
                format!(
                    "{} is cacheable but depends on non-cacheable {}",
                    def.name, dep.name
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::Segment;
    use crate::planning::resolver::DependencyResolver;
    use crate::registry::module::{module_fn, ModuleOutput};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ready(def: ModuleDefinition) -> ModuleDefinition {
        def.with_module(module_fn(|_ctx, _cfg| async { Ok(ModuleOutput::new(json!({}))) }))
    }

    fn plan(registry: &ModuleRegistry, requested: &[&str]) -> ExecutionPlan {
        let resolution = DependencyResolver::new(registry).resolve(requested).unwrap();
        PreflightChecker::new(registry)
            .check(&resolution, &BTreeMap::new())
            .unwrap()
    }

    #[test]
    fn test_unknown_requested_is_skipped_not_warned() {
        let registry = ModuleRegistry::new();
        registry.register(ready(ModuleDefinition::new("stats"))).unwrap();

        let plan = plan(&registry, &["stats", "ghost"]);
        assert_eq!(plan.order, vec!["stats"]);
        assert_eq!(plan.skip_reason("ghost"), Some(SKIP_NOT_REGISTERED));
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_unavailable_skip_propagates_to_dependents() {
        let registry = ModuleRegistry::new();
        registry
            .register(ModuleDefinition::new("ner").unavailable("model not installed"))
            .unwrap();
        registry
            .register(ready(ModuleDefinition::new("entities").depends_on(["ner"])))
            .unwrap();
        registry.register(ready(ModuleDefinition::new("stats"))).unwrap();

        let plan = plan(&registry, &["entities", "stats"]);
        assert_eq!(plan.order, vec!["stats"]);
        assert_eq!(plan.skip_reason("ner"), Some("unavailable: model not installed"));
        assert_eq!(plan.skip_reason("entities"), Some("dependency skipped: ner"));
    }

    #[test]
    fn test_missing_declared_dependency() {
        let registry = ModuleRegistry::new();
        registry
            .register(ready(ModuleDefinition::new("topics").depends_on(["embeddings"])))
            .unwrap();
        let plan = plan(&registry, &["topics"]);
        assert!(plan.order.is_empty());
        assert_eq!(plan.skip_reason("topics"), Some("missing dependency: embeddings"));
    }

    #[test]
    fn test_invalid_config_against_schema() {
        let registry = ModuleRegistry::new();
        registry
            .register(ready(ModuleDefinition::new("sentiment").config_schema(json!({
                "type": "object",
                "properties": {"threshold": {"type": "number"}},
                "required": ["threshold"]
            }))))
            .unwrap();

        let resolution = DependencyResolver::new(&registry).resolve(&["sentiment"]).unwrap();
        let checker = PreflightChecker::new(&registry);

        let plan = checker.check(&resolution, &BTreeMap::new()).unwrap();
        assert!(plan
            .skip_reason("sentiment")
            .unwrap()
            .starts_with("invalid configuration"));

        let mut configs = BTreeMap::new();
        configs.insert("sentiment".to_string(), json!({"threshold": 0.2}));
        let plan = checker.check(&resolution, &configs).unwrap();
        assert_eq!(plan.order, vec!["sentiment"]);
    }

    #[test]
    fn test_requirement_unmet_with_transcript() {
        let registry = ModuleRegistry::new();
        registry
            .register(ready(
                ModuleDefinition::new("interactions").requires(Requirement::SpeakerLabels),
            ))
            .unwrap();
        let transcript = TranscriptData::new(vec![Segment::new(None, "hello", 0.0, 1.0)]);
        let resolution = DependencyResolver::new(&registry)
            .resolve(&["interactions"])
            .unwrap();
        let plan = PreflightChecker::new(&registry)
            .with_transcript(&transcript)
            .check(&resolution, &BTreeMap::new())
            .unwrap();
        assert_eq!(
            plan.skip_reason("interactions"),
            Some("requirement unmet: speaker_labels")
        );
    }

    #[test]
    fn test_warns_on_non_cacheable_dependency() {
        let registry = ModuleRegistry::new();
        registry
            .register(ready(ModuleDefinition::new("clock").cacheable(false)))
            .unwrap();
        registry
            .register(ready(ModuleDefinition::new("report").depends_on(["clock"])))
            .unwrap();
        let plan = plan(&registry, &["report"]);
        assert_eq!(plan.order, vec!["clock", "report"]);
        assert_eq!(plan.warnings.len(), 1);
        assert_eq!(plan.dependency_graph["clock"].included_reason, "dependency of report");
    }

    #[test]
    fn test_write_plan_file() {
        let registry = ModuleRegistry::new();
        registry.register(ready(ModuleDefinition::new("stats"))).unwrap();
        let plan = plan(&registry, &["stats"]);

        let dir = tempfile::tempdir().unwrap();
        let path = plan.write_to(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(".pipeline").join("execution_plan.json"));
        let loaded: ExecutionPlan =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(loaded, plan);
    }
}
