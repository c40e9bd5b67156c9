//! Pipeline execution runtime
//!
//! This crate provides the demand-driven scheduler that runs workflow
//! graphs, the graph arena it runs over, and the module registry that
//! resolves step functions.

mod graph;
mod registry;
mod runtime;
mod scheduler;

pub use graph::{GraphIssue, StepIndex, WorkflowGraph};
pub use registry::{
    FunctionMap, FunctionMetadata, FunctionModule, FunctionResolver, LazyModule, ModuleLoader,
    ModuleRegistry,
};
pub use runtime::{EngineConfig, PipelineRuntime};
pub use scheduler::Scheduler;
