use async_trait::async_trait;
use pipecore::{Record, StepContext, StepError, StepFunction};
use serde_json::Value;

/// Logs its input and passes it through unchanged
pub struct DebugLog;

#[async_trait]
impl StepFunction for DebugLog {
    async fn call(&self, input: Record, ctx: StepContext) -> Result<Value, StepError> {
        let message = input
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("(no message)");

        tracing::info!("DEBUG [{}.{}]: {}", ctx.workflow, ctx.step, message);

        // Also log all inputs for visibility
        for (key, value) in &input {
            tracing::info!("  {}: {}", key, value);
        }

        Ok(Value::Object(input))
    }
}
