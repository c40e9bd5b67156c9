//! Standard step library
//!
//! Collection of built-in step functions for common operations, packaged
//! as a module that can be bound to any workflow.

mod debug;
mod http;
mod seq;
mod time;
mod transform;

pub use debug::DebugLog;
pub use http::HttpFetch;
pub use seq::Range;
pub use time::Delay;
pub use transform::{JsonParse, JsonStringify};

use pipecore::{Record, StepError};
use piperuntime::{FunctionMetadata, FunctionModule, ModuleRegistry};
use serde_json::Value;

/// All standard functions, keyed by their dotted names
pub fn module() -> FunctionModule {
    FunctionModule::new()
        .with_metadata("debug.log", DebugLog, metadata("Logs input values for debugging", "debug"))
        .with_metadata("json.parse", JsonParse, metadata("Parse JSON string", "transform"))
        .with_metadata(
            "json.stringify",
            JsonStringify,
            metadata("Convert value to JSON string", "transform"),
        )
        .with_metadata(
            "time.delay",
            Delay,
            metadata("Delay for the given milliseconds, then pass input through", "time"),
        )
        .with_metadata(
            "seq.range",
            Range,
            metadata("Emit one record per integer in [start, end)", "seq"),
        )
        .with_metadata("http.fetch", HttpFetch::new(), metadata("Make HTTP requests", "http"))
}

/// Bind the standard library to a workflow
pub fn register_all(registry: &mut ModuleRegistry, workflow: impl Into<String>) {
    registry.bind(workflow, module());
}

fn metadata(description: &str, category: &str) -> FunctionMetadata {
    FunctionMetadata {
        description: description.to_string(),
        category: category.to_string(),
    }
}

pub(crate) fn require<'a>(input: &'a Record, key: &str) -> Result<&'a Value, StepError> {
    input
        .get(key)
        .ok_or_else(|| StepError::Runtime(format!("Missing required input: {}", key)))
}

pub(crate) fn require_str<'a>(input: &'a Record, key: &str) -> Result<&'a str, StepError> {
    require(input, key)?
        .as_str()
        .ok_or_else(|| StepError::Runtime(format!("Input '{}' must be a string", key)))
}
