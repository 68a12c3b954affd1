pub mod preflight;
pub mod resolver;

pub use preflight::{ExecutionPlan, PlannedModule, PreflightChecker, SkippedModule};
pub use resolver::{DependencyResolver, Resolution};
