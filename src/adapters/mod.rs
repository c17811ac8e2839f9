//! Agent interfaces for external task execution.
//!
//! The engine treats agents as opaque services: it hands over an
//! [`AgentRequest`] and gets back a raw JSON payload, which is validated by the
//! executor before anyone trusts it.

pub mod command;
pub mod http;
pub mod prompt;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{AgentSpec, TaskIo};

pub use command::CommandAgent;
pub use http::HttpAgent;
pub use prompt::{decode_text, extract_first_json, render_prompt, DEFAULT_TEMPLATE};

/// Everything an agent needs to perform one task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub run_id: Uuid,
    pub effect_id: String,
    /// Task name the effect was derived from
    pub task: String,
    pub title: String,
    pub agent: AgentSpec,
    /// Input snapshot of the call
    pub input: Value,
    pub io: TaskIo,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Trait for external agents
#[async_trait]
pub trait Agent: Send + Sync {
    /// Human-readable agent name
    fn name(&self) -> &str;

    /// Perform the task and return the raw JSON payload.
    ///
    /// The executor applies the deadline; implementations must not leave work
    /// running once the returned future is dropped.
    async fn invoke(&self, request: &AgentRequest) -> Result<Value>;

    /// Check the agent is reachable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Routes `agent.name` of a task to an [`Agent`]
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
    fallback: Option<Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that sends every task to one agent
    pub fn with_default(agent: Arc<dyn Agent>) -> Self {
        Self {
            agents: HashMap::new(),
            fallback: Some(agent),
        }
    }

    /// Route tasks naming `name` to `agent`
    pub fn register(&mut self, name: impl Into<String>, agent: Arc<dyn Agent>) -> &mut Self {
        self.agents.insert(name.into(), agent);
        self
    }

    /// Agent used when no agent is registered under the task's agent name
    pub fn set_default(&mut self, agent: Arc<dyn Agent>) -> &mut Self {
        self.fallback = Some(agent);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents
            .get(name)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.fallback.is_none()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.agents.keys().collect();
        names.sort();
        f.debug_struct("AgentRegistry")
            .field("agents", &names)
            .field("default", &self.fallback.as_ref().map(|a| a.name().to_string()))
            .finish()
    }
}
