use async_trait::async_trait;
use pipecore::{Record, StepContext, StepError, StepFunction};
use serde_json::Value;

/// Emit one record per integer in `[start, end)`, stepping by `step`.
///
/// Each record holds the integer under `key` (default `"i"`), so every
/// successor is activated once per element.
pub struct Range;

fn int(input: &Record, key: &str, default: Option<i64>) -> Result<i64, StepError> {
    match input.get(key) {
        Some(value) => value
            .as_i64()
            .ok_or_else(|| StepError::Runtime(format!("Input '{}' must be an integer", key))),
        None => default.ok_or_else(|| StepError::Runtime(format!("Missing required input: {}", key))),
    }
}

#[async_trait]
impl StepFunction for Range {
    async fn call(&self, input: Record, _ctx: StepContext) -> Result<Value, StepError> {
        let start = int(&input, "start", Some(0))?;
        let end = int(&input, "end", None)?;
        let step = int(&input, "step", Some(1))?;
        if step <= 0 {
            return Err(StepError::Runtime("Input 'step' must be positive".into()));
        }
        let key = input.get("key").and_then(Value::as_str).unwrap_or("i");

        let mut items = Vec::new();
        let mut n = start;
        while n < end {
            let mut item = Record::new();
            item.insert(key.to_string(), Value::from(n));
            items.push(Value::Object(item));
            match n.checked_add(step) {
                Some(next) => n = next,
                None => break,
            }
        }

        Ok(Value::Array(items))
    }
}
