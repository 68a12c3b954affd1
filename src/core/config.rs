use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::{PipelineError, Result};

/// How a rerun treats previously recorded module outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerunMode {
    /// Reuse a current cached ModuleRun with an identical input hash
    #[default]
    Reuse,
    /// Always execute and supersede whatever was current
    Recompute,
}

impl RerunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RerunMode::Reuse => "reuse",
            RerunMode::Recompute => "recompute",
        }
    }
}

/// Concurrency used by the execution engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One module at a time against the shared mutable context
    #[default]
    Sequential,
    /// Waves of independent modules, bounded by `max_workers`
    Parallel { max_workers: usize },
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel { .. } => "parallel",
        }
    }

    pub fn max_workers(&self) -> usize {
        match self {
            ExecutionMode::Sequential => 1,
            ExecutionMode::Parallel { max_workers } => *max_workers,
        }
    }
}

/// Orchestrator-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Version string recorded on every PipelineRun
    #[serde(default = "default_pipeline_version")]
    pub pipeline_version: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Timeout applied to modules that do not declare their own
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default)]
    pub rerun_mode: RerunMode,
    /// Root directory that GC is allowed to delete under
    #[serde(default)]
    pub outputs_root: Option<PathBuf>,
    /// Re-hash primary artifacts before accepting a cache hit
    #[serde(default = "default_true")]
    pub verify_artifact_hashes: bool,
    /// Write `<output_dir>/.pipeline/execution_plan.json` during preflight
    #[serde(default = "default_true")]
    pub write_execution_plan: bool,
    /// Per-module configuration passed to `AnalysisModule::run`
    #[serde(default)]
    pub module_configs: BTreeMap<String, Value>,
}

fn default_pipeline_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pipeline_version: default_pipeline_version(),
            execution_mode: ExecutionMode::Sequential,
            default_timeout_secs: default_timeout_secs(),
            rerun_mode: RerunMode::Reuse,
            outputs_root: None,
            verify_artifact_hashes: true,
            write_execution_plan: true,
            module_configs: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load and validate a configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Configuration value for a module, `{}` when none is set
    pub fn module_config(&self, module: &str) -> Value {
        self.module_configs
            .get(module)
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_version.trim().is_empty() {
            return Err(PipelineError::invalid_field(
                "pipeline_version",
                "pipeline_version must not be empty",
            ));
        }

        if self.default_timeout_secs == 0 {
            return Err(PipelineError::invalid_field(
                "default_timeout_secs",
                "default_timeout_secs must be greater than 0",
            ));
        }
        if self.default_timeout_secs > 86400 {
            // 24 hours
            return Err(PipelineError::invalid_field(
                "default_timeout_secs",
                "default_timeout_secs cannot exceed 24 hours",
            ));
        }

        if let ExecutionMode::Parallel { max_workers } = self.execution_mode {
            if max_workers == 0 {
                return Err(PipelineError::invalid_field(
                    "execution_mode.max_workers",
                    "max_workers must be greater than 0",
                ));
            }
            if max_workers > 256 {
                return Err(PipelineError::invalid_field(
                    "execution_mode.max_workers",
                    "max_workers cannot exceed 256",
                ));
            }
        }

        for (module, value) in &self.module_configs {
            if !value.is_object() && !value.is_null() {
                return Err(PipelineError::invalid_field(
                    format!("module_configs.{}", module),
                    "module configuration must be a mapping".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Merges two configurations, with override_with taking precedence.
    /// Module configurations are merged per module.
    pub fn merge(base: &Self, override_with: &Self) -> Result<Self> {
        let mut module_configs = base.module_configs.clone();
        for (module, value) in &override_with.module_configs {
            module_configs.insert(module.clone(), value.clone());
        }

        let merged = Self {
            pipeline_version: override_with.pipeline_version.clone(),
            execution_mode: override_with.execution_mode,
            default_timeout_secs: override_with.default_timeout_secs,
            rerun_mode: override_with.rerun_mode,
            outputs_root: override_with
                .outputs_root
                .clone()
                .or_else(|| base.outputs_root.clone()),
            verify_artifact_hashes: override_with.verify_artifact_hashes,
            write_execution_plan: override_with.write_execution_plan,
            module_configs,
        };

        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_timeout(), Duration::from_secs(600));
        assert_eq!(config.execution_mode.max_workers(), 1);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
pipeline_version: "2024.1"
execution_mode:
  mode: parallel
  max_workers: 4
rerun_mode: recompute
module_configs:
  sentiment:
    threshold: 0.5
"#;
        let config = OrchestratorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.pipeline_version, "2024.1");
        assert_eq!(config.execution_mode, ExecutionMode::Parallel { max_workers: 4 });
        assert_eq!(config.rerun_mode, RerunMode::Recompute);
        assert_eq!(config.module_config("sentiment"), json!({"threshold": 0.5}));
        assert_eq!(config.module_config("ner"), json!({}));
        assert!(config.verify_artifact_hashes);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = OrchestratorConfig {
            execution_mode: ExecutionMode::Parallel { max_workers: 0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_scalar_module_config() {
        let mut config = OrchestratorConfig::default();
        config.module_configs.insert("ner".into(), json!(3));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_keeps_base_module_configs() {
        let mut base = OrchestratorConfig::default();
        base.module_configs.insert("ner".into(), json!({"model": "small"}));
        base.outputs_root = Some(PathBuf::from("/tmp/outputs"));

        let mut over = OrchestratorConfig::default();
        over.module_configs.insert("stats".into(), json!({}));

        let merged = OrchestratorConfig::merge(&base, &over).unwrap();
        assert_eq!(merged.module_configs.len(), 2);
        assert_eq!(merged.outputs_root, Some(PathBuf::from("/tmp/outputs")));
    }
}
