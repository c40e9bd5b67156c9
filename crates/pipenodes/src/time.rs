use async_trait::async_trait;
use pipecore::{Record, StepContext, StepError, StepFunction};
use serde_json::Value;
use tokio::time::{sleep, Duration};

/// Sleep for `delay_ms` milliseconds, then pass input through
pub struct Delay;

#[async_trait]
impl StepFunction for Delay {
    async fn call(&self, input: Record, _ctx: StepContext) -> Result<Value, StepError> {
        let delay_ms = match input.get("delay_ms") {
            None => 1000,
            Some(value) => value.as_u64().ok_or_else(|| {
                StepError::Runtime("Input 'delay_ms' must be a non-negative integer".into())
            })?,
        };

        tracing::debug!("Delaying for {}ms", delay_ms);
        sleep(Duration::from_millis(delay_ms)).await;

        Ok(Value::Object(input))
    }
}
