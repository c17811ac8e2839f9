//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

use keel::adapters::{Agent, AgentRegistry, AgentRequest};
use keel::config::EngineConfig;
use keel::core::{BreakpointManager, EffectStore, ProcessDriver, RunContext, RunStore, TaskExecutor};
use keel::domain::{define_task, AgentSpec, Prompt, TaskDefinition, TaskDescriptor};

type Script = dyn Fn(&AgentRequest, usize) -> Result<Value> + Send + Sync;

/// In-test agent: answers with a script and counts invocations per task
pub struct ScriptedAgent {
    script: Box<Script>,
    delay: Option<Duration>,
    total: AtomicUsize,
    per_task: Mutex<HashMap<String, usize>>,
}

impl ScriptedAgent {
    /// The script gets the request and the 1-based invocation count of its task
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&AgentRequest, usize) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay: None,
            total: AtomicUsize::new(0),
            per_task: Mutex::new(HashMap::new()),
        }
    }

    /// Agent that echoes its input back as `{"success": true, "input": ...}`
    pub fn echo() -> Self {
        Self::new(|request, _| Ok(json!({"success": true, "input": request.input})))
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, task: &str) -> usize {
        self.per_task.lock().unwrap().get(task).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &AgentRequest) -> Result<Value> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let nth = {
            let mut per_task = self.per_task.lock().unwrap();
            let count = per_task.entry(request.task.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(request, nth)
    }
}

/// Engine config rooted in a temp dir, with a short watcher debounce
pub fn test_config(temp: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::with_home(temp.path());
    config.breakpoint_debounce_ms = 50;
    config
}

pub fn test_driver(temp: &TempDir, agent: Arc<ScriptedAgent>) -> ProcessDriver {
    ProcessDriver::new(&test_config(temp), AgentRegistry::with_default(agent))
}

/// A context for driving tasks directly, without a process definition
pub async fn test_context(temp: &TempDir, agent: Arc<ScriptedAgent>) -> RunContext {
    let runs_dir = temp.path().join("runs");
    let executor = TaskExecutor::new(Arc::new(EffectStore::new(&runs_dir)), AgentRegistry::with_default(agent));
    context_for(&runs_dir, Uuid::new_v4(), Arc::new(executor)).await
}

pub async fn context_for(runs_dir: &std::path::Path, run_id: Uuid, executor: Arc<TaskExecutor>) -> RunContext {
    let store = RunStore::open(runs_dir, run_id).await.unwrap();
    let breakpoints = Arc::new(BreakpointManager::new(runs_dir).with_debounce(Duration::from_millis(50)));
    RunContext::new(store, executor, breakpoints)
}

/// Agent task whose output must match `schema`
pub fn agent_task(name: &str, schema: Value) -> TaskDefinition {
    let title = format!("Run {}", name);
    define_task(name, move |args, task| {
        TaskDescriptor::agent(
            title.clone(),
            AgentSpec::new("general-purpose", Prompt::new("tester", "Answer with JSON"))
                .with_context(args.clone())
                .with_output_schema(schema.clone()),
            task,
        )
    })
}

/// `{"success": boolean}` is required
pub fn success_schema() -> Value {
    json!({
        "type": "object",
        "required": ["success"],
        "properties": { "success": { "type": "boolean" } }
    })
}

/// Poll until `check` holds, failing the test after five seconds
pub async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
