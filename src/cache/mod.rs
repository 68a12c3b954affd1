//! Content-addressed module cache on top of the ledger.
//!
//! A module attempt is identified by its input hash. Under `reuse`, a current
//! ModuleRun with the same module name and input hash is a hit, provided its
//! recorded output can still be validated. Anything else is a miss.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::RerunMode;
use crate::core::errors::{PipelineError, Result};
use crate::core::hashing;
use crate::registry::{ArtifactDescriptor, ArtifactRole, ModuleDefinition};
use crate::storage::{Ledger, ModuleRun, CACHE_REASON_NOT_CACHEABLE};

pub const MISS_RECOMPUTE: &str = "recompute requested";
pub const MISS_NO_ENTRY: &str = "no cached run";

/// Hashes identifying one module attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub module_config_hash: String,
    pub module_input_hash: String,
}

impl CacheKey {
    pub fn compute(
        def: &ModuleDefinition,
        config: &Value,
        transcript_content_hash: &str,
        dependency_output_hashes: &BTreeMap<String, String>,
    ) -> Self {
        let module_config_hash = hashing::module_config_hash(&def.name, config);
        let module_input_hash = hashing::module_input_hash(
            transcript_content_hash,
            &module_config_hash,
            &def.version,
            dependency_output_hashes,
        );
        Self {
            module_config_hash,
            module_input_hash,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CacheDecision {
    /// Reuse `source` without invoking the module
    Hit {
        source: ModuleRun,
        payload: Value,
        artifacts: Vec<ArtifactDescriptor>,
    },
    /// Run the module; `reason` is recorded as the new row's cache reason
    Miss { reason: String },
}

impl CacheDecision {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheDecision::Hit { .. })
    }
}

#[derive(Clone)]
pub struct CacheLayer {
    ledger: Arc<dyn Ledger>,
    verify_artifact_hashes: bool,
}

impl CacheLayer {
    pub fn new(ledger: Arc<dyn Ledger>, verify_artifact_hashes: bool) -> Self {
        Self {
            ledger,
            verify_artifact_hashes,
        }
    }

    pub async fn lookup(
        &self,
        def: &ModuleDefinition,
        key: &CacheKey,
        rerun: RerunMode,
    ) -> Result<CacheDecision> {
        if !def.cacheable {
            return Ok(CacheDecision::Miss {
                reason: CACHE_REASON_NOT_CACHEABLE.to_string(),
            });
        }
        if rerun == RerunMode::Recompute {
            return Ok(CacheDecision::Miss {
                reason: MISS_RECOMPUTE.to_string(),
            });
        }

        // More than one current row is a ledger invariant violation and aborts
        let Some(source) = self
            .ledger
            .find_current_module_run(&def.name, &key.module_input_hash)
            .await?
        else {
            return Ok(CacheDecision::Miss {
                reason: MISS_NO_ENTRY.to_string(),
            });
        };

        match self.validate(&source).await {
            Ok((payload, artifacts)) => {
                debug!(
                    module = %def.name,
                    module_run_id = source.id,
                    "Cache entry validated"
                );
                Ok(CacheDecision::Hit {
                    source,
                    payload,
                    artifacts,
                })
            }
            Err(err @ PipelineError::CacheHashMismatch { .. }) => {
                warn!(
                    module = %def.name,
                    module_run_id = source.id,
                    error = %err,
                    "Cache entry rejected; recomputing"
                );
                Ok(CacheDecision::Miss {
                    reason: err.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Check that a cached run's output can still be located.
    ///
    /// Primary artifacts with a known root must exist on disk and, when
    /// verification is enabled, still hash to their recorded content hash.
    /// The stored payload must decode.
    async fn validate(&self, run: &ModuleRun) -> Result<(Value, Vec<ArtifactDescriptor>)> {
        let module = run.module_name.as_str();
        if run.output_hash.is_none() {
            return Err(PipelineError::cache_mismatch(module, "no output hash recorded"));
        }

        let artifacts: Vec<ArtifactDescriptor> = self
            .ledger
            .artifacts_for_module_run(run.id)
            .await?
            .iter()
            .map(|a| a.descriptor())
            .collect();

        for artifact in artifacts.iter().filter(|a| a.role == ArtifactRole::Primary) {
            let Some(path) = artifact.location() else {
                continue;
            };
            if !path.is_file() {
                return Err(PipelineError::cache_mismatch(
                    module.to_string(),
                    format!("artifact {} missing at {}", artifact.key, path.display()),
                ));
            }
            if self.verify_artifact_hashes {
                if let Some(expected) = &artifact.content_hash {
                    let actual = hashing::hash_file(&path)
                        .map_err(|e| PipelineError::io(format!("hash {}", path.display()), e))?;
                    if &actual != expected {
                        return Err(PipelineError::cache_mismatch(
                            module.to_string(),
                            format!("artifact {} content changed", artifact.key),
                        ));
                    }
                }
            }
        }

        let payload = match self.ledger.module_run_payload(run.id).await {
            Ok(payload) => payload.unwrap_or(Value::Null),
            Err(e) => {
                return Err(PipelineError::cache_mismatch(
                    module.to_string(),
                    format!("stored payload unreadable: {}", e),
                ))
            }
        };

        Ok((payload, artifacts))
    }

    pub async fn record_hit(&self, pipeline_run_id: i64, source: &ModuleRun) -> Result<ModuleRun> {
        Ok(self.ledger.record_cache_hit(pipeline_run_id, source).await?)
    }
}

/// Resolve roots and content hashes of the artifacts a module returned.
///
/// Artifacts without a root are placed under `default_root`. Missing content
/// hashes are computed from the file, which must then exist. Keys must be
/// unique within one module run.
pub fn finalize_artifacts(
    artifacts: Vec<ArtifactDescriptor>,
    default_root: Option<&Path>,
) -> std::result::Result<Vec<ArtifactDescriptor>, String> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut finalized = Vec::with_capacity(artifacts.len());

    for mut artifact in artifacts {
        if !seen.insert(artifact.key.clone()) {
            return Err(format!("duplicate artifact key {}", artifact.key));
        }
        if artifact.root.is_none() {
            artifact.root = default_root.map(Path::to_path_buf);
        }
        if artifact.content_hash.is_none() {
            if let Some(path) = artifact.location() {
                let hash = hashing::hash_file(&path).map_err(|e| {
                    format!("artifact {} unreadable at {}: {}", artifact.key, path.display(), e)
                })?;
                artifact.content_hash = Some(hash);
            }
        }
        finalized.push(artifact);
    }

    Ok(finalized)
}

/// Output hash of a completed module from its finalized artifacts
pub fn compute_output_hash(
    def: &ModuleDefinition,
    artifacts: &[ArtifactDescriptor],
    payload: &Value,
) -> String {
    let primary: Vec<(String, String)> = artifacts
        .iter()
        .filter(|a| a.role == ArtifactRole::Primary)
        .map(|a| (a.key.clone(), a.content_hash.clone().unwrap_or_default()))
        .collect();
    hashing::output_hash(&def.name, &def.version, &primary, payload)
}
