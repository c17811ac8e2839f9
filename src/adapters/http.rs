//! HTTP agent.
//!
//! POSTs the [`AgentRequest`] as JSON and reads the JSON reply. A reply of
//! the form `{"output": ...}` is unwrapped; any other JSON body is the payload.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{Agent, AgentRequest};

/// Agent reached over HTTP
pub struct HttpAgent {
    name: String,
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpAgent {
    /// Create a new client
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            name: "http".to_string(),
            endpoint: endpoint.into(),
            token: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Agent for HttpAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &AgentRequest) -> Result<Value> {
        debug!(agent = %self.name, effect_id = %request.effect_id, endpoint = %self.endpoint, "Invoking HTTP agent");

        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to reach agent endpoint {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Agent endpoint returned {}: {}", status, body.trim());
        }

        let body: Value = response
            .json()
            .await
            .context("Failed to parse agent response")?;

        Ok(unwrap_output(body))
    }

    async fn health_check(&self) -> Result<()> {
        self.client
            .head(&self.endpoint)
            .send()
            .await
            .with_context(|| format!("Agent endpoint {} is unreachable", self.endpoint))?;
        Ok(())
    }
}

fn unwrap_output(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("output") => {
            map.remove("output").unwrap_or(Value::Null)
        }
        other => other,
    }
}
