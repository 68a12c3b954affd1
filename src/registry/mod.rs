pub mod definition;
pub mod module;
pub mod registry;

pub use definition::{Category, ModuleDefinition, ModuleLoader, Requirement};
pub use module::{
    module_blocking_fn, module_fn, AnalysisModule, ArtifactDescriptor, ArtifactRole,
    BlockingFnModule, FnModule, ModuleOutput,
};
pub use registry::{Availability, ModuleRegistry};
