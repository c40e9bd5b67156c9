use crate::{Output, Record, RunId, StepError};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Per-run configuration supplied by the caller of `run`
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Overlaid on the entry step's declared args
    pub args: Option<Record>,
    /// Free-form context handed to every step of the run
    pub scope: Value,
    /// Free-form context shared with delegated runs as well
    pub global: Value,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_args(mut self, args: Record) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_scope(mut self, scope: Value) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_global(mut self, global: Value) -> Self {
        self.global = global;
        self
    }
}

/// Ambient context threaded through every step invocation
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub workflow: String,
    pub step: String,
    pub scope: Arc<Value>,
    pub global: Arc<Value>,
}

impl StepContext {
    /// Look up a key in the scope object, falling back to the global one
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        self.scope.get(key).or_else(|| self.global.get(key))
    }
}

/// The callable behind a step.
///
/// The returned value follows the output contract: `null` or `false` means
/// no output, an object is a single record, and an array of objects fans out
/// one propagation per element. Anything else is rejected as malformed.
#[async_trait]
pub trait StepFunction: Send + Sync {
    async fn call(&self, input: Record, ctx: StepContext) -> Result<Value, StepError>;
}

/// Adapter turning an async closure into a `StepFunction`
pub struct FnStep<F>(F);

#[async_trait]
impl<F, Fut> StepFunction for FnStep<F>
where
    F: Fn(Record, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    async fn call(&self, input: Record, ctx: StepContext) -> Result<Value, StepError> {
        (self.0)(input, ctx).await
    }
}

pub fn step_fn<F, Fut>(f: F) -> FnStep<F>
where
    F: Fn(Record, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    FnStep(f)
}

/// Normalize a step's return value into its stored output
pub fn normalize_output(value: Value) -> Result<Option<Output>, StepError> {
    match value {
        Value::Null | Value::Bool(false) => Ok(None),
        Value::Object(record) => Ok(Some(vec![record])),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(record) => Ok(record),
                other => Err(StepError::MalformedOutput(format!(
                    "element {} is {}, expected an object",
                    i,
                    kind(&other)
                ))),
            })
            .collect::<Result<Output, _>>()
            .map(Some),
        other => Err(StepError::MalformedOutput(format!(
            "expected an object or an array of objects, got {}",
            kind(&other)
        ))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
