use crate::{require, require_str};
use async_trait::async_trait;
use pipecore::{Record, StepContext, StepError, StepFunction};
use serde_json::{json, Value};

/// Parse the `json` input string into `parsed`
pub struct JsonParse;

#[async_trait]
impl StepFunction for JsonParse {
    async fn call(&self, input: Record, _ctx: StepContext) -> Result<Value, StepError> {
        let text = require_str(&input, "json")?;
        let parsed: Value = serde_json::from_str(text)
            .map_err(|e| StepError::Runtime(format!("JSON parse error: {}", e)))?;

        Ok(json!({ "parsed": parsed }))
    }
}

/// Render the `value` input as pretty-printed JSON in `json`
pub struct JsonStringify;

#[async_trait]
impl StepFunction for JsonStringify {
    async fn call(&self, input: Record, _ctx: StepContext) -> Result<Value, StepError> {
        let value = require(&input, "value")?;
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| StepError::Runtime(format!("JSON stringify error: {}", e)))?;

        Ok(json!({ "json": text }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipecore::RunId;
    use std::sync::Arc;

    fn ctx() -> StepContext {
        StepContext {
            run_id: RunId::new_v4(),
            workflow: "w".into(),
            step: "t".into(),
            scope: Arc::new(Value::Null),
            global: Arc::new(Value::Null),
        }
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn parse_then_stringify() {
        let parsed = JsonParse
            .call(record(json!({"json": "{\"a\": [1, 2]}"})), ctx())
            .await
            .unwrap();
        assert_eq!(parsed["parsed"]["a"], json!([1, 2]));

        let text = JsonStringify
            .call(record(json!({"value": {"a": 1}})), ctx())
            .await
            .unwrap();
        assert_eq!(text["json"], json!("{\n  \"a\": 1\n}"));
    }

    #[tokio::test]
    async fn parse_rejects_bad_input() {
        let err = JsonParse.call(record(json!({})), ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing required input: json");

        let err = JsonParse.call(record(json!({"json": 3})), ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "Input 'json' must be a string");

        let err = JsonParse
            .call(record(json!({"json": "{oops"})), ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("JSON parse error"));
    }
}
