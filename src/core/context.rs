//! Run context: the `ctx` handed to a process's entry function.
//!
//! Ordinals are assigned when a call is made, not when it finishes, so the
//! effect ids of a run depend only on the order of calls. `task` therefore
//! does its bookkeeping synchronously and returns the future to await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::artifacts::ArtifactAggregator;
use super::breakpoints::BreakpointManager;
use super::error::EngineError;
use super::executor::{RunScope, TaskCall, TaskExecutor, TaskOptions};
use super::run_store::RunStore;
use crate::domain::{Artifact, BreakpointSpec, EventType, JournalEvent, Resolution, TaskDefinition};

/// Engine services scoped to one run
pub struct RunContext {
    store: RunStore,
    executor: Arc<TaskExecutor>,
    breakpoints: Arc<BreakpointManager>,
    artifacts: ArtifactAggregator,
    ordinals: Mutex<HashMap<String, u32>>,
    call_sequence: AtomicU64,
    breakpoint_ordinal: AtomicU32,
}

impl RunContext {
    pub fn new(store: RunStore, executor: Arc<TaskExecutor>, breakpoints: Arc<BreakpointManager>) -> Self {
        Self {
            store,
            executor,
            breakpoints,
            artifacts: ArtifactAggregator::new(),
            ordinals: Mutex::new(HashMap::new()),
            call_sequence: AtomicU64::new(0),
            breakpoint_ordinal: AtomicU32::new(0),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.store.run_id()
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Run a task with the engine's default options
    pub fn task(&self, task: &TaskDefinition, args: Value) -> impl Future<Output = Result<Value, EngineError>> + '_ {
        self.task_with(task, args, TaskOptions::default())
    }

    /// Run a task with a deadline and/or retry policy
    pub fn task_with(
        &self,
        task: &TaskDefinition,
        args: Value,
        options: TaskOptions,
    ) -> impl Future<Output = Result<Value, EngineError>> + '_ {
        let task = task.clone();
        let ordinal = self.next_ordinal(task.name());
        let sequence = self.call_sequence.fetch_add(1, Ordering::SeqCst);
        let slot = self.artifacts.reserve();

        async move {
            self.check_abort()?;

            let scope = RunScope {
                store: &self.store,
                artifacts: &self.artifacts,
                slot,
            };
            let call = TaskCall {
                task: &task,
                args,
                ordinal,
                sequence,
                options,
            };
            self.executor.execute(scope, call).await
        }
    }

    /// Suspend the run until a reviewer resolves the breakpoint
    pub fn breakpoint(&self, spec: BreakpointSpec) -> impl Future<Output = Result<Resolution, EngineError>> + '_ {
        let ordinal = self.breakpoint_ordinal.fetch_add(1, Ordering::SeqCst);

        async move {
            self.check_abort()?;
            self.breakpoints.suspend(&self.store, ordinal, spec).await
        }
    }

    /// Log a workflow message to tracing and the run journal
    pub async fn log(&self, message: impl Into<String>) -> Result<(), EngineError> {
        let message = message.into();
        info!(run_id = %self.run_id(), "{}", message);
        self.store
            .append(JournalEvent::new(self.run_id(), EventType::Log, message))
            .await?;
        Ok(())
    }

    /// Wall-clock time (not recorded, so not stable across replays)
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Contribute artifacts directly from the workflow
    pub fn add_artifacts(&self, artifacts: Vec<Artifact>) {
        self.artifacts.append(artifacts);
    }

    /// Artifacts collected so far, in call order
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.artifacts.all()
    }

    fn next_ordinal(&self, name: &str) -> u32 {
        let mut ordinals = self.ordinals.lock().unwrap_or_else(|e| e.into_inner());
        let counter = ordinals.entry(name.to_string()).or_insert(0);
        let ordinal = *counter;
        *counter += 1;
        ordinal
    }

    fn check_abort(&self) -> Result<(), EngineError> {
        if self.store.abort_requested() {
            return Err(EngineError::RunAborted {
                run_id: self.run_id(),
                breakpoint_id: None,
            });
        }
        Ok(())
    }
}
