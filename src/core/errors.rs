use std::time::Duration;
use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A requested module name is not registered
    #[error("Unknown module: {name}")]
    UnknownModule { name: String },

    /// The dependency graph of the requested closure contains a cycle
    #[error("Dependency cycle detected among modules: {}", modules.join(", "))]
    DependencyCycle { modules: Vec<String> },

    /// The module is registered but its function could not be resolved
    #[error("Module {module} is unavailable: {reason}")]
    CapabilityUnavailable { module: String, reason: String },

    /// The module raised an error while running
    #[error("Module {module} failed: {message}")]
    ModuleExecution { module: String, message: String },

    /// The module exceeded its timeout
    #[error("Module {module} timed out after {}ms", timeout.as_millis())]
    ModuleTimeout { module: String, timeout: Duration },

    /// A cached entry's recorded output could not be validated
    #[error("Cache entry for {module} is invalid: {message}")]
    CacheHashMismatch { module: String, message: String },

    /// The authoritative context was written after it was frozen
    #[error("Pipeline context is frozen: cannot {operation}")]
    ContextFrozen { operation: String },

    /// A module attempted to write through a read-only view
    #[error("Pipeline context is read-only: cannot {operation}")]
    ReadOnlyContext { operation: String },

    /// The ledger holds rows that break one of its invariants
    #[error("Ledger invariant violated: {message}")]
    LedgerInvariant { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Record lookups that found nothing
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// Database/persistence errors
    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Filesystem errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    pub fn unknown_module<S: Into<String>>(name: S) -> Self {
        Self::UnknownModule { name: name.into() }
    }

    pub fn dependency_cycle(mut modules: Vec<String>) -> Self {
        modules.sort();
        modules.dedup();
        Self::DependencyCycle { modules }
    }

    pub fn unavailable<S: Into<String>>(module: S, reason: S) -> Self {
        Self::CapabilityUnavailable {
            module: module.into(),
            reason: reason.into(),
        }
    }

    pub fn execution<S: Into<String>>(module: S, message: S) -> Self {
        Self::ModuleExecution {
            module: module.into(),
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(module: S, timeout: Duration) -> Self {
        Self::ModuleTimeout {
            module: module.into(),
            timeout,
        }
    }

    pub fn cache_mismatch<S: Into<String>>(module: S, message: S) -> Self {
        Self::CacheHashMismatch {
            module: module.into(),
            message: message.into(),
        }
    }

    pub fn frozen<S: Into<String>>(operation: S) -> Self {
        Self::ContextFrozen {
            operation: operation.into(),
        }
    }

    pub fn read_only<S: Into<String>>(operation: S) -> Self {
        Self::ReadOnlyContext {
            operation: operation.into(),
        }
    }

    pub fn ledger_invariant<S: Into<String>>(message: S) -> Self {
        Self::LedgerInvariant {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn invalid_field<S: Into<String>>(field: S, message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found<S: Into<String>>(kind: S, id: S) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn database<S: Into<String>, E>(operation: S, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Coarse category used in logs and reports
    pub fn category(&self) -> &'static str {
        match self {
            Self::UnknownModule { .. } => "unknown_module",
            Self::DependencyCycle { .. } => "dependency_cycle",
            Self::CapabilityUnavailable { .. } => "capability_unavailable",
            Self::ModuleExecution { .. } => "module_execution",
            Self::ModuleTimeout { .. } => "module_timeout",
            Self::CacheHashMismatch { .. } => "cache_hash_mismatch",
            Self::ContextFrozen { .. } => "context_frozen",
            Self::ReadOnlyContext { .. } => "read_only_context",
            Self::LedgerInvariant { .. } => "ledger_invariant",
            Self::Configuration { .. } => "configuration",
            Self::NotFound { .. } => "not_found",
            Self::Database { .. } => "database",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }

    /// Whether the run can continue after this error.
    ///
    /// Recoverable errors are demoted to a skip, a per-module failure, or a
    /// cache miss. Everything else aborts the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnknownModule { .. }
                | Self::CapabilityUnavailable { .. }
                | Self::ModuleExecution { .. }
                | Self::ModuleTimeout { .. }
                | Self::CacheHashMismatch { .. }
        )
    }
}

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::database("sqlite", err)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::io("filesystem", err)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "json".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            format: "yaml".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<chrono::ParseError> for PipelineError {
    fn from(err: chrono::ParseError) -> Self {
        Self::Serialization {
            format: "rfc3339".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_modules_sorted() {
        let err = PipelineError::dependency_cycle(vec![
            "b".to_string(),
            "a".to_string(),
            "b".to_string(),
        ]);
        assert_eq!(err.to_string(), "Dependency cycle detected among modules: a, b");
        assert_eq!(err.category(), "dependency_cycle");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(PipelineError::execution("sentiment", "boom").is_recoverable());
        assert!(PipelineError::timeout("ner", Duration::from_millis(50)).is_recoverable());
        assert!(PipelineError::cache_mismatch("ner", "missing").is_recoverable());
        assert!(!PipelineError::frozen("store_result").is_recoverable());
        assert!(!PipelineError::ledger_invariant("two current rows").is_recoverable());
    }

    #[test]
    fn test_timeout_display() {
        let err = PipelineError::timeout("stats", Duration::from_millis(250));
        assert_eq!(err.to_string(), "Module stats timed out after 250ms");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PipelineError = io.into();
        assert_eq!(err.category(), "io");
    }
}
