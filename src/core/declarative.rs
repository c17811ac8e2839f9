//! Declarative process definitions loaded from YAML.
//!
//! A process is an ordered list of steps; each step is either an agent task
//! or a breakpoint. Task outputs are collected by step name and returned as
//! the run result.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::context::RunContext;
use super::driver::ProcessDefinition;
use super::executor::{RetryPolicy, TaskOptions};
use super::schema;
use crate::domain::{define_task, AgentSpec, Artifact, BreakpointSpec, Outcome, Prompt, TaskDescriptor};

/// A complete process definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclarativeProcess {
    /// Process name (used in CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Ordered list of steps to execute
    pub steps: Vec<Step>,
}

impl DeclarativeProcess {
    /// Load a process from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read process file: {}", path.display()))?;

        Self::from_yaml(&content).with_context(|| format!("Failed to load {}", path.display()))
    }

    /// Parse a process from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse process YAML")
    }

    /// Validate the process definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Process name cannot be empty");
        }

        if self.steps.is_empty() {
            anyhow::bail!("Process must have at least one step");
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                anyhow::bail!("Step {} has an empty name", i);
            }

            if self.step_index(&step.name) != Some(i) {
                anyhow::bail!("Step name '{}' is used more than once", step.name);
            }

            let StepAction::Task(ref task) = step.action else {
                continue;
            };

            schema::check_schema(&task.output_schema)
                .with_context(|| format!("Step '{}' has an invalid output schema", step.name))?;

            // Check that previous_step references exist
            if let InputSource::PreviousStep { ref previous_step } = task.input_from {
                match self.step_index(previous_step) {
                    Some(idx) if idx >= i => {
                        anyhow::bail!(
                            "Step '{}' references future step '{}' (forward references not allowed)",
                            step.name,
                            previous_step
                        );
                    }
                    Some(idx) if !matches!(self.steps[idx].action, StepAction::Task(_)) => {
                        anyhow::bail!(
                            "Step '{}' takes input from breakpoint '{}', which has no output",
                            step.name,
                            previous_step
                        );
                    }
                    None => {
                        anyhow::bail!("Step '{}' references non-existent step '{}'", step.name, previous_step);
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// Get a step by name
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Get the index of a step by name
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }
}

/// A single step in a process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within the process; also the task name)
    pub name: String,

    #[serde(flatten)]
    pub action: StepAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Task(TaskStep),
    Breakpoint(BreakpointStep),
}

/// Agent task step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub title: String,

    /// Agent the task is routed to
    #[serde(default = "default_agent")]
    pub agent: String,

    pub prompt: Prompt,

    #[serde(default = "default_output_schema")]
    pub output_schema: Value,

    #[serde(default)]
    pub labels: Vec<String>,

    /// Where to get input from
    #[serde(default)]
    pub input_from: InputSource,

    /// Override the engine's task timeout
    pub timeout_seconds: Option<u64>,

    /// Retry execution failures (no retry when unset)
    pub retry_policy: Option<RetryPolicy>,
}

fn default_agent() -> String {
    "default".to_string()
}

fn default_output_schema() -> Value {
    json!({ "type": "object" })
}

impl TaskStep {
    fn options(&self) -> TaskOptions {
        TaskOptions {
            timeout: self.timeout_seconds.map(Duration::from_secs),
            retry: self.retry_policy.clone(),
        }
    }
}

/// Human review step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointStep {
    pub title: String,
    pub question: String,
    #[serde(default)]
    pub files: Vec<Artifact>,
}

/// Source of input for a task step
///
/// Supports multiple YAML formats:
/// - Simple: `input_from: process_input`
/// - Previous step: `input_from: { previous_step: step_name }`
/// - Static: `input_from: { static: { key: value } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSource {
    /// Use the process inputs (simple string "process_input")
    ProcessInput(ProcessInputMarker),

    /// Use output from a previous step
    PreviousStep { previous_step: String },

    /// Static value
    Static {
        #[serde(rename = "static")]
        value: Value,
    },
}

/// Marker for process_input (deserializes from the string "process_input")
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessInputMarker {
    ProcessInput,
}

impl Default for InputSource {
    fn default() -> Self {
        Self::ProcessInput(ProcessInputMarker::ProcessInput)
    }
}

fn resolve_input(source: &InputSource, inputs: &Value, outputs: &Map<String, Value>, step: &str) -> Result<Value> {
    match source {
        InputSource::ProcessInput(_) => Ok(inputs.clone()),
        InputSource::PreviousStep { previous_step } => outputs.get(previous_step).cloned().with_context(|| {
            format!("Step '{}' references missing output of step '{}'", step, previous_step)
        }),
        InputSource::Static { value } => Ok(value.clone()),
    }
}

#[async_trait]
impl ProcessDefinition for DeclarativeProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn entry(&self, inputs: Value, ctx: &RunContext) -> Result<Value> {
        let mut outputs = Map::new();

        for step in &self.steps {
            match &step.action {
                StepAction::Task(task) => {
                    let input = resolve_input(&task.input_from, &inputs, &outputs, &step.name)?;

                    let spec = task.clone();
                    let definition = define_task(step.name.clone(), move |args, task_ctx| {
                        TaskDescriptor::agent(
                            spec.title.clone(),
                            AgentSpec::new(spec.agent.clone(), spec.prompt.clone())
                                .with_context(args.clone())
                                .with_output_schema(spec.output_schema.clone()),
                            task_ctx,
                        )
                        .with_labels(spec.labels.clone())
                    });

                    let output = ctx.task_with(&definition, input, task.options()).await?;
                    outputs.insert(step.name.clone(), output);
                }
                StepAction::Breakpoint(breakpoint) => {
                    let mut spec = BreakpointSpec::new(&breakpoint.title, &breakpoint.question)
                        .with_context("process", json!(self.name))
                        .with_context("step", json!(step.name))
                        .with_context("outputs", Value::Object(outputs.clone()));
                    spec.files = breakpoint.files.clone();

                    let resolution = ctx.breakpoint(spec).await?;
                    if resolution.outcome == Outcome::Reject {
                        anyhow::bail!(
                            "Breakpoint '{}' rejected{}",
                            step.name,
                            resolution.notes.map(|n| format!(": {}", n)).unwrap_or_default()
                        );
                    }
                    ctx.log(format!("Breakpoint '{}' resolved: {:?}", step.name, resolution.outcome))
                        .await?;
                }
            }
        }

        Ok(Value::Object(outputs))
    }
}
