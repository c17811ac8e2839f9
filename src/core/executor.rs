//! Task execution with durable, idempotent effects.
//!
//! A task call maps to one effect id. The executor holds the effect's lock
//! for the whole call, so concurrent callers of the same effect wait for the
//! first one and then read its cached output.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::artifacts::{ArtifactAggregator, ArtifactSlot};
use super::effect_store::{generate_effect_id, hash_input, EffectLock, EffectStore};
use super::error::EngineError;
use super::run_store::RunStore;
use super::schema;
use crate::adapters::{AgentRegistry, AgentRequest};
use crate::domain::{
    Artifact, EffectFailure, EffectRecord, EffectStatus, EventType, FailureKind, JournalEvent, TaskCtx,
    TaskDefinition, TaskDescriptor,
};

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Deadline for one agent invocation (engine default when unset)
    pub timeout: Option<Duration>,

    /// Retry execution and timeout failures under the same effect id
    pub retry: Option<RetryPolicy>,
}

impl TaskOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Retry policy for failed agent invocations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Shared task executor (one per driver, used by every run)
pub struct TaskExecutor {
    effects: Arc<EffectStore>,
    agents: AgentRegistry,
    default_timeout: Duration,
    stale_after: Duration,
}

/// One task call, with its ordinal already assigned
pub struct TaskCall<'a> {
    pub task: &'a TaskDefinition,
    pub args: Value,
    pub ordinal: u32,
    /// Position of this call among all task calls of the run
    pub sequence: u64,
    pub options: TaskOptions,
}

/// Where a run's side effects go
pub struct RunScope<'a> {
    pub store: &'a RunStore,
    pub artifacts: &'a ArtifactAggregator,
    pub slot: ArtifactSlot,
}

/// How one agent attempt ended, before it is recorded
enum Attempt {
    Completed(Value),
    Rejected(Value, Vec<schema::Violation>),
    Failed(EffectFailure),
}

impl TaskExecutor {
    pub fn new(effects: Arc<EffectStore>, agents: AgentRegistry) -> Self {
        Self {
            effects,
            agents,
            default_timeout: Duration::from_secs(300),
            stale_after: Duration::from_secs(3600),
        }
    }

    /// Deadline applied when a call sets none
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Age after which a pending record is presumed orphaned
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn effects(&self) -> &Arc<EffectStore> {
        &self.effects
    }

    /// Execute a task call: answer it from the effect store, or invoke the
    /// agent, validate its payload and persist the outcome.
    pub async fn execute(&self, scope: RunScope<'_>, call: TaskCall<'_>) -> Result<Value, EngineError> {
        let run_id = scope.store.run_id();
        let name = call.task.name().to_string();
        let effect_id = generate_effect_id(run_id, &name, call.ordinal);

        let task_ctx = TaskCtx {
            run_id,
            effect_id: effect_id.clone(),
            ordinal: call.ordinal,
        };
        let descriptor = call.task.build(&call.args, &task_ctx);

        let lock = self.effects.lock(run_id, &effect_id).await;

        let mut record = match self.effects.get(run_id, &effect_id).await? {
            Some(existing) if existing.is_completed() => {
                return self.replay_cached(&scope, existing, &call.args).await;
            }
            Some(existing) if existing.status == EffectStatus::Pending => {
                if !existing.is_stale(self.stale_after) {
                    return Err(EngineError::TaskExecution {
                        task: name,
                        effect_id,
                        message: "effect is pending in another process".to_string(),
                    });
                }
                warn!(%run_id, %effect_id, task = %name, "Retrying orphaned pending effect");
                self.orphan(&lock, existing).await?
            }
            Some(mut failed) => {
                debug!(%run_id, %effect_id, status = %failed.status, "Re-invoking failed effect");
                failed.input = call.args.clone();
                failed.input_hash = hash_input(&call.args.to_string());
                failed
            }
            None => EffectRecord::pending(run_id, &effect_id, &name, call.ordinal, call.args.clone())
                .with_sequence(call.sequence),
        };

        if let Err(source) = schema::check_schema(&descriptor.agent.output_schema) {
            let mut failure = EffectFailure::new(FailureKind::InvalidSchema, source.to_string());
            failure.payload = Some(descriptor.agent.output_schema.clone());
            record.fail(failure);
            self.effects.put_locked(&lock, &record).await?;
            self.journal_failure(scope.store, &record, "invalid output schema").await?;
            return Err(EngineError::InvalidSchema {
                task: name,
                effect_id,
                source,
            });
        }

        let timeout = call.options.timeout.unwrap_or(self.default_timeout);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            record.restart();
            record.attempts += 1;
            self.effects.put_locked(&lock, &record).await?;

            scope
                .store
                .append(
                    JournalEvent::new(run_id, EventType::TaskStarted, format!("Task '{}' attempt {}", name, attempt))
                        .with_effect(&effect_id)
                        .with_data(json!({
                            "task": name,
                            "title": descriptor.title,
                            "agent": descriptor.agent.name,
                            "ordinal": call.ordinal,
                            "attempt": record.attempts,
                        })),
                )
                .await?;

            let started = Instant::now();
            let outcome = self.attempt(&descriptor, &record, timeout).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Attempt::Completed(output) => {
                    record.complete(output.clone());
                    self.effects.put_locked(&lock, &record).await?;

                    let artifacts = Artifact::from_output(&output);
                    scope
                        .store
                        .append(
                            JournalEvent::new(
                                run_id,
                                EventType::TaskCompleted,
                                format!("Task '{}' completed in {}ms", name, duration_ms),
                            )
                            .with_effect(&effect_id)
                            .with_data(json!({"durationMs": duration_ms, "artifacts": artifacts.len()})),
                        )
                        .await?;
                    scope.artifacts.fill(scope.slot, artifacts);

                    info!(%run_id, %effect_id, task = %name, duration_ms, "Task completed");
                    return Ok(output);
                }
                Attempt::Rejected(payload, violations) => {
                    let mut failure = EffectFailure::new(FailureKind::Validation, schema::format_violations(&violations));
                    failure.violations = violations.clone();
                    failure.payload = Some(payload);
                    record.fail(failure);
                    self.effects.put_locked(&lock, &record).await?;
                    self.journal_failure(scope.store, &record, "output failed validation").await?;

                    warn!(%run_id, %effect_id, task = %name, violations = violations.len(), "Task output rejected");
                    return Err(EngineError::TaskValidation {
                        task: name,
                        effect_id,
                        violations,
                    });
                }
                Attempt::Failed(failure) => {
                    let message = failure.message.clone();
                    let timed_out = failure.kind == FailureKind::Timeout;
                    record.fail(failure);

                    if let Some(policy) = call.options.retry.as_ref().filter(|p| p.should_retry(attempt)) {
                        let delay = policy.delay_for_attempt(attempt);
                        self.effects.put_locked(&lock, &record).await?;
                        self.journal_failure(scope.store, &record, &format!("retrying in {:?}", delay))
                            .await?;

                        warn!(
                            %run_id,
                            %effect_id,
                            task = %name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "Task failed, retrying"
                        );

                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    self.effects.put_locked(&lock, &record).await?;
                    self.journal_failure(scope.store, &record, &format!("failed after {} attempts", attempt))
                        .await?;

                    error!(%run_id, %effect_id, task = %name, attempt, error = %message, "Task failed permanently");
                    return Err(if timed_out {
                        EngineError::TaskTimeout {
                            task: name,
                            effect_id,
                            timeout,
                        }
                    } else {
                        EngineError::TaskExecution {
                            task: name,
                            effect_id,
                            message,
                        }
                    });
                }
            }
        }
    }

    /// One agent invocation under the deadline, plus validation
    async fn attempt(&self, descriptor: &TaskDescriptor, record: &EffectRecord, timeout: Duration) -> Attempt {
        let Some(agent) = self.agents.resolve(&descriptor.agent.name) else {
            return Attempt::Failed(EffectFailure::new(
                FailureKind::Execution,
                format!("no agent registered for '{}'", descriptor.agent.name),
            ));
        };

        let request = AgentRequest {
            run_id: record.run_id,
            effect_id: record.effect_id.clone(),
            task: record.task_name.clone(),
            title: descriptor.title.clone(),
            agent: descriptor.agent.clone(),
            input: record.input.clone(),
            io: descriptor.io.clone(),
            labels: descriptor.labels.clone(),
        };

        let payload = match tokio::time::timeout(timeout, agent.invoke(&request)).await {
            Err(_) => {
                return Attempt::Failed(EffectFailure::new(
                    FailureKind::Timeout,
                    format!("agent '{}' exceeded {:?}", agent.name(), timeout),
                ));
            }
            Ok(Err(e)) => return Attempt::Failed(EffectFailure::new(FailureKind::Execution, format!("{:#}", e))),
            Ok(Ok(payload)) => payload,
        };

        match schema::validate(&payload, &descriptor.agent.output_schema) {
            Ok(violations) if violations.is_empty() => Attempt::Completed(payload),
            Ok(violations) => Attempt::Rejected(payload, violations),
            // Checked before the first attempt
            Err(e) => Attempt::Failed(EffectFailure::new(FailureKind::InvalidSchema, e.to_string())),
        }
    }

    /// Answer a call from a completed record
    async fn replay_cached(&self, scope: &RunScope<'_>, record: EffectRecord, args: &Value) -> Result<Value, EngineError> {
        let run_id = record.run_id;
        let input_hash = hash_input(&args.to_string());
        if input_hash != record.input_hash {
            warn!(
                %run_id,
                effect_id = %record.effect_id,
                task = %record.task_name,
                recorded = %record.input_hash,
                replayed = %input_hash,
                "Replay diverged from recorded input; returning cached output"
            );
        }

        let output = record.output.unwrap_or(Value::Null);
        scope
            .store
            .append(
                JournalEvent::new(run_id, EventType::TaskCached, format!("Task '{}' answered from cache", record.task_name))
                    .with_effect(&record.effect_id)
                    .with_data(json!({"diverged": input_hash != record.input_hash})),
            )
            .await?;
        scope.artifacts.fill(scope.slot, Artifact::from_output(&output));

        debug!(%run_id, effect_id = %record.effect_id, "Task answered from effect store");
        Ok(output)
    }

    /// Close out an abandoned pending record so it can be retried
    async fn orphan(&self, lock: &EffectLock, mut record: EffectRecord) -> Result<EffectRecord, EngineError> {
        record.fail(EffectFailure::new(
            FailureKind::Orphaned,
            "pending record abandoned by a previous process",
        ));
        self.effects.put_locked(lock, &record).await?;
        Ok(record)
    }

    async fn journal_failure(&self, store: &RunStore, record: &EffectRecord, summary: &str) -> Result<(), EngineError> {
        let failure = record.failure.as_ref();
        let mut event = JournalEvent::new(
            record.run_id,
            EventType::TaskFailed,
            format!("Task '{}' {}", record.task_name, summary),
        )
        .with_effect(&record.effect_id)
        .with_data(json!({
            "status": record.status.to_string(),
            "attempts": record.attempts,
            "violations": failure.map(|f| f.violations.clone()).unwrap_or_default(),
        }));

        if let Some(failure) = failure {
            event = event.with_error(&failure.message);
        }

        store.append(event).await?;
        Ok(())
    }
}
