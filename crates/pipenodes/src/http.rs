use crate::require_str;
use async_trait::async_trait;
use pipecore::{Record, StepContext, StepError, StepFunction};
use serde_json::{json, Value};

/// HTTP request step.
///
/// Inputs: `url` (required), `method` (default `GET`), `headers` (object of
/// strings) and `body` (sent as JSON, or as text when it is a string).
/// Output: `status`, `body`, `headers`, plus `json` when the response body
/// parses as JSON.
pub struct HttpFetch {
    client: reqwest::Client,
}

impl HttpFetch {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepFunction for HttpFetch {
    async fn call(&self, input: Record, _ctx: StepContext) -> Result<Value, StepError> {
        let url = require_str(&input, "url")?;
        let method = input.get("method").and_then(Value::as_str).unwrap_or("GET");

        tracing::info!("{} {}", method, url);

        let mut request = match method.to_uppercase().as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "PATCH" => self.client.patch(url),
            "DELETE" => self.client.delete(url),
            _ => return Err(StepError::Runtime(format!("Unsupported method: {}", method))),
        };

        match input.get("body") {
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(Value::Null) | None => {}
            Some(body) => request = request.json(body),
        }

        if let Some(Value::Object(headers)) = input.get("headers") {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key.as_str(), value);
                }
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| StepError::Runtime(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        let headers: Record = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();

        let body = response
            .text()
            .await
            .map_err(|e| StepError::Runtime(format!("Failed to read response: {}", e)))?;

        tracing::debug!("Response status: {}", status);

        let mut output = json!({
            "status": status,
            "headers": headers,
        });
        if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
            output["json"] = parsed;
        }
        output["body"] = Value::String(body);
        Ok(output)
    }
}
