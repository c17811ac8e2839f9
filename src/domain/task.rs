//! Task definitions produced by `define_task`.
//!
//! A [`TaskDefinition`] is a name plus a builder. The builder is called once per
//! task invocation with the call arguments and a [`TaskCtx`] carrying the
//! derived effect id, and returns the [`TaskDescriptor`] the executor runs.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

type Builder = dyn Fn(&Value, &TaskCtx) -> TaskDescriptor + Send + Sync;

/// Immutable task definition
#[derive(Clone)]
pub struct TaskDefinition {
    name: String,
    builder: Arc<Builder>,
}

/// Declare a task.
///
/// ```rust,ignore
/// let plan = define_task("plan", |args, task| {
///     TaskDescriptor::agent(
///         "Draft a plan",
///         AgentSpec::new("general-purpose", Prompt::new("planner", "Draft a plan"))
///             .with_context(args.clone())
///             .with_output_schema(json!({"type": "object", "required": ["plan"]})),
///         task,
///     )
/// });
/// ```
pub fn define_task<F>(name: impl Into<String>, builder: F) -> TaskDefinition
where
    F: Fn(&Value, &TaskCtx) -> TaskDescriptor + Send + Sync + 'static,
{
    TaskDefinition {
        name: name.into(),
        builder: Arc::new(builder),
    }
}

impl TaskDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve the descriptor for one invocation
    pub fn build(&self, args: &Value, task: &TaskCtx) -> TaskDescriptor {
        (self.builder)(args, task)
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition").field("name", &self.name).finish()
    }
}

/// Per-invocation context handed to a task builder
#[derive(Debug, Clone)]
pub struct TaskCtx {
    pub run_id: Uuid,
    pub effect_id: String,
    pub ordinal: u32,
}

impl TaskCtx {
    /// Canonical run-relative path of the input snapshot
    pub fn input_json_path(&self) -> String {
        format!("tasks/{}/input.json", self.effect_id)
    }

    /// Canonical run-relative path of the output snapshot
    pub fn output_json_path(&self) -> String {
        format!("tasks/{}/result.json", self.effect_id)
    }

    /// IO paths pointing at the canonical snapshots
    pub fn io(&self) -> TaskIo {
        TaskIo {
            input_json_path: self.input_json_path(),
            output_json_path: self.output_json_path(),
        }
    }
}

/// Resolved task descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub kind: TaskKind,
    pub title: String,
    pub agent: AgentSpec,
    pub io: TaskIo,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl TaskDescriptor {
    /// An agent task whose IO points at the canonical snapshot paths
    pub fn agent(title: impl Into<String>, agent: AgentSpec, task: &TaskCtx) -> Self {
        Self {
            kind: TaskKind::Agent,
            title: title.into(),
            agent,
            io: task.io(),
            labels: Vec::new(),
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Agent,
}

/// Which agent runs the task, what it is told, and what it must return
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub name: String,
    pub prompt: Prompt,
    /// Structural contract for the returned payload
    #[serde(default = "default_output_schema")]
    pub output_schema: Value,
}

fn default_output_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, prompt: Prompt) -> Self {
        Self {
            name: name.into(),
            prompt,
            output_schema: default_output_schema(),
        }
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.prompt.context = context;
        self
    }
}

/// Structured prompt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub role: String,
    pub task: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub output_format: String,
}

impl Prompt {
    pub fn new(role: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn with_instructions<I, S>(mut self, instructions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instructions = instructions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = format.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIo {
    pub input_json_path: String,
    pub output_json_path: String,
}
