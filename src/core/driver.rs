//! Process driver: starts, resumes and aborts runs of process definitions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::breakpoints::BreakpointManager;
use super::context::RunContext;
use super::declarative::DeclarativeProcess;
use super::effect_store::EffectStore;
use super::error::{run_error_from, EngineError};
use super::executor::TaskExecutor;
use super::run_store::RunStore;
use crate::adapters::AgentRegistry;
use crate::config::EngineConfig;
use crate::domain::{Artifact, ErrorKind, EventType, JournalEvent, Resolution, RunError, RunRecord, RunStatus};

/// A workflow the engine can run
#[async_trait]
pub trait ProcessDefinition: Send + Sync {
    /// Name used to look the process up and recorded on its runs
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Entry function: drive the run through `ctx` and return its result
    async fn entry(&self, inputs: Value, ctx: &RunContext) -> Result<Value>;
}

/// Process definitions by name
#[derive(Default, Clone)]
pub struct ProcessRegistry {
    processes: HashMap<String, Arc<dyn ProcessDefinition>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, process: Arc<dyn ProcessDefinition>) -> &mut Self {
        self.processes.insert(process.name().to_string(), process);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProcessDefinition>> {
        self.processes.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.processes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Register every `*.yaml`/`*.yml` declarative process in a directory
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            let process = DeclarativeProcess::from_file(&path)?;
            process
                .validate()
                .with_context(|| format!("Invalid process definition: {}", path.display()))?;
            self.register(Arc::new(process));
            loaded += 1;
        }

        Ok(loaded)
    }
}

/// What a run ended with
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub artifacts: Vec<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// The workflow result, or the error that ended the run
    pub fn into_result(self) -> Result<Value, EngineError> {
        match self.status {
            RunStatus::Completed => Ok(self.result.unwrap_or(Value::Null)),
            RunStatus::Aborted => Err(EngineError::RunAborted {
                run_id: self.run_id,
                breakpoint_id: self.error.and_then(|e| e.breakpoint_id),
            }),
            status => {
                let error = self.error.unwrap_or_else(|| RunError {
                    kind: ErrorKind::Workflow,
                    message: format!("run ended as {}", status),
                    task: None,
                    effect_id: None,
                    breakpoint_id: None,
                    violations: Vec::new(),
                });
                Err(EngineError::RunFailed {
                    run_id: self.run_id,
                    error,
                })
            }
        }
    }
}

/// Runs process definitions against shared effect and breakpoint stores
pub struct ProcessDriver {
    runs_dir: PathBuf,
    executor: Arc<TaskExecutor>,
    breakpoints: Arc<BreakpointManager>,
}

impl ProcessDriver {
    pub fn new(config: &EngineConfig, agents: AgentRegistry) -> Self {
        let runs_dir = config.runs_dir();
        let effects = Arc::new(EffectStore::new(&runs_dir));
        let executor = TaskExecutor::new(effects, agents)
            .with_default_timeout(config.task_timeout())
            .with_stale_after(config.stale_pending());
        let breakpoints = BreakpointManager::new(&runs_dir).with_debounce(config.breakpoint_debounce());

        Self {
            runs_dir,
            executor: Arc::new(executor),
            breakpoints: Arc::new(breakpoints),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn effects(&self) -> &EffectStore {
        self.executor.effects()
    }

    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    /// Start a new run
    pub async fn run_process(&self, process: &dyn ProcessDefinition, inputs: Value) -> Result<RunOutcome> {
        self.run_with_id(Uuid::new_v4(), process, inputs).await
    }

    /// Start a run under a given id, or re-execute it if it already exists.
    ///
    /// Completed effects of an existing run are answered from the store.
    #[instrument(skip(self, process, inputs), fields(process = %process.name()))]
    pub async fn run_with_id(&self, run_id: Uuid, process: &dyn ProcessDefinition, inputs: Value) -> Result<RunOutcome> {
        let store = RunStore::open(&self.runs_dir, run_id).await?;

        match store.load_record().await? {
            Some(record) => {
                if record.process_name != process.name() {
                    anyhow::bail!(
                        "Run {} belongs to process '{}', not '{}'",
                        run_id,
                        record.process_name,
                        process.name()
                    );
                }
                info!(%run_id, previous = %record.status, "Resuming run");
                store.clear_abort().await?;
                store
                    .transition(
                        JournalEvent::new(run_id, EventType::RunResumed, format!("Process '{}' resumed", process.name()))
                            .with_data(json!({"previousStatus": record.status})),
                    )
                    .await?;
            }
            None => {
                info!(%run_id, "Starting run");
                store
                    .transition(
                        JournalEvent::new(run_id, EventType::RunStarted, format!("Process '{}' started", process.name()))
                            .with_data(json!({"processName": process.name(), "inputs": inputs})),
                    )
                    .await?;
            }
        }

        let ctx = RunContext::new(store.clone(), self.executor.clone(), self.breakpoints.clone());
        let outcome = process.entry(inputs, &ctx).await;
        let artifacts = ctx.artifacts();

        match outcome {
            Ok(result) => {
                store
                    .transition(
                        JournalEvent::new(run_id, EventType::RunCompleted, format!("Process '{}' completed", process.name()))
                            .with_data(json!({"result": result, "artifacts": artifacts})),
                    )
                    .await?;
                info!(%run_id, artifacts = artifacts.len(), "Run completed");

                Ok(RunOutcome {
                    run_id,
                    status: RunStatus::Completed,
                    result: Some(result),
                    artifacts,
                    error: None,
                })
            }
            Err(e) => {
                let run_error = run_error_from(&e);
                let (event_type, status) = if run_error.kind == ErrorKind::RunAborted {
                    (EventType::RunAborted, RunStatus::Aborted)
                } else {
                    (EventType::RunFailed, RunStatus::Failed)
                };

                store
                    .transition(
                        JournalEvent::new(run_id, event_type, format!("Process '{}' {}", process.name(), status))
                            .with_data(serde_json::to_value(&run_error).context("Failed to serialize run error")?)
                            .with_error(&run_error.message),
                    )
                    .await?;

                if status == RunStatus::Aborted {
                    warn!(%run_id, "Run aborted");
                } else {
                    error!(%run_id, error = %run_error.message, effect_id = ?run_error.effect_id, "Run failed");
                }

                Ok(RunOutcome {
                    run_id,
                    status,
                    result: None,
                    artifacts,
                    error: Some(run_error),
                })
            }
        }
    }

    /// Re-execute a recorded run with its recorded inputs
    pub async fn resume(&self, run_id: Uuid, process: &dyn ProcessDefinition) -> Result<RunOutcome> {
        let record = self
            .status(run_id)
            .await?
            .with_context(|| format!("Run {} not found", run_id))?;
        self.run_with_id(run_id, process, record.inputs).await
    }

    /// Ask a run to stop. A suspended run stops at once; a running one at its
    /// next task or breakpoint call.
    #[instrument(skip(self))]
    pub async fn abort(&self, run_id: Uuid, reason: Option<String>) -> Result<()> {
        if !self.run_exists(run_id) {
            anyhow::bail!("Run {} not found", run_id);
        }
        let store = RunStore::open(&self.runs_dir, run_id).await?;

        store.request_abort(reason).await?;
        if let Some(breakpoint_id) = self.breakpoints.abort(run_id).await? {
            info!(%run_id, %breakpoint_id, "Abort delivered to breakpoint");
        }
        Ok(())
    }

    /// Deliver a breakpoint resolution
    pub async fn resolve_breakpoint(
        &self,
        run_id: Uuid,
        breakpoint_id: &str,
        resolution: Resolution,
    ) -> Result<(), EngineError> {
        self.breakpoints.resolve(run_id, breakpoint_id, resolution).await
    }

    /// Current RunRecord of a run, rebuilt from its journal if the snapshot is missing
    pub async fn status(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        if !self.run_exists(run_id) {
            return Ok(None);
        }
        let store = RunStore::open(&self.runs_dir, run_id).await?;
        if let Some(record) = store.load_record().await? {
            return Ok(Some(record));
        }
        Ok(RunRecord::from_events(&store.replay().await?))
    }

    /// Most recent runs first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut runs = Vec::new();
        for run_id in RunStore::list_runs(&self.runs_dir).await? {
            if let Some(record) = self.status(run_id).await? {
                runs.push(record);
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn run_exists(&self, run_id: Uuid) -> bool {
        self.runs_dir.join(run_id.to_string()).is_dir()
    }

    /// Journal entries of a run
    pub async fn journal(&self, run_id: Uuid) -> Result<Vec<JournalEvent>> {
        if !self.run_exists(run_id) {
            anyhow::bail!("Run {} not found", run_id);
        }
        RunStore::open(&self.runs_dir, run_id).await?.replay().await
    }
}
