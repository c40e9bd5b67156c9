//! Core abstractions for the pipeline engine
//!
//! This crate provides the data model shared by every other component:
//! step definitions, per-run node records, the step function seam, the
//! event channel and the error taxonomy. It has no scheduling logic.

mod error;
pub mod events;
mod function;
mod node;

pub use error::{PipelineError, StepError, WorkflowError};
pub use events::{EventCallback, EventChannel, NodeEvent, Subscription};
pub use function::{normalize_output, step_fn, FnStep, RunConfig, StepContext, StepFunction};
pub use node::{NodeState, Output, PipelineNode, Record, StepDef};

/// Identifier of a single run (and of a delegated nested run)
pub type RunId = uuid::Uuid;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
