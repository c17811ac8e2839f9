//! Engine error taxonomy.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use super::schema::{format_violations, SchemaError, Violation};
use crate::domain::{ErrorKind, Outcome, RunError};

/// Errors raised by the engine to workflows and callers
#[derive(Debug, Error)]
pub enum EngineError {
    /// Agent output failed its schema check (recoverable, the workflow decides)
    #[error("task '{task}' ({effect_id}) returned invalid output: {}", format_violations(.violations))]
    TaskValidation {
        task: String,
        effect_id: String,
        violations: Vec<Violation>,
    },

    /// Agent call failed or was unreachable
    #[error("task '{task}' ({effect_id}) failed: {message}")]
    TaskExecution {
        task: String,
        effect_id: String,
        message: String,
    },

    /// Agent call exceeded its deadline
    #[error("task '{task}' ({effect_id}) timed out after {timeout:?}")]
    TaskTimeout {
        task: String,
        effect_id: String,
        timeout: Duration,
    },

    /// The task's output schema is malformed (configuration error)
    #[error("task '{task}' ({effect_id}) declares an invalid output schema: {source}")]
    InvalidSchema {
        task: String,
        effect_id: String,
        #[source]
        source: SchemaError,
    },

    /// Attempt to overwrite a completed effect; the effect-id derivation is broken
    #[error("effect {effect_id} of run {run_id} is already finalized")]
    EffectAlreadyFinalized { run_id: Uuid, effect_id: String },

    /// A second breakpoint was opened while one is unresolved
    #[error("run {run_id} already has unresolved breakpoint {active}")]
    BreakpointConflict { run_id: Uuid, active: String },

    #[error("breakpoint {breakpoint_id} not found in run {run_id}")]
    BreakpointNotFound { run_id: Uuid, breakpoint_id: String },

    #[error("breakpoint {breakpoint_id} of run {run_id} is already resolved")]
    BreakpointResolved { run_id: Uuid, breakpoint_id: String },

    /// Only the engine resolves a breakpoint as aborted, through `abort`
    #[error("outcome {outcome:?} cannot be submitted for breakpoint {breakpoint_id} of run {run_id}")]
    InvalidResolution {
        run_id: Uuid,
        breakpoint_id: String,
        outcome: Outcome,
    },

    /// Operator cancelled the run
    #[error("run {run_id} was aborted")]
    RunAborted {
        run_id: Uuid,
        breakpoint_id: Option<String>,
    },

    /// The workflow terminated with an uncaught error
    #[error("run {run_id} failed: {}", .error.message)]
    RunFailed { run_id: Uuid, error: RunError },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Validation, execution and timeout failures are the workflow's to handle
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TaskValidation { .. } | Self::TaskExecution { .. } | Self::TaskTimeout { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskValidation { .. } => ErrorKind::TaskValidation,
            Self::TaskExecution { .. } => ErrorKind::TaskExecution,
            Self::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            Self::InvalidSchema { .. } => ErrorKind::InvalidSchema,
            Self::EffectAlreadyFinalized { .. } => ErrorKind::EffectAlreadyFinalized,
            Self::BreakpointConflict { .. }
            | Self::BreakpointNotFound { .. }
            | Self::BreakpointResolved { .. }
            | Self::InvalidResolution { .. } => ErrorKind::BreakpointConflict,
            Self::RunAborted { .. } => ErrorKind::RunAborted,
            Self::RunFailed { error, .. } => error.kind,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Structured form recorded on a failed run
    pub fn to_run_error(&self) -> RunError {
        if let Self::RunFailed { error, .. } = self {
            return error.clone();
        }

        let mut error = RunError {
            kind: self.kind(),
            message: self.to_string(),
            task: None,
            effect_id: None,
            breakpoint_id: None,
            violations: Vec::new(),
        };

        match self {
            Self::TaskValidation {
                task,
                effect_id,
                violations,
            } => {
                error.task = Some(task.clone());
                error.effect_id = Some(effect_id.clone());
                error.violations = violations.clone();
            }
            Self::TaskExecution { task, effect_id, .. }
            | Self::TaskTimeout { task, effect_id, .. }
            | Self::InvalidSchema { task, effect_id, .. } => {
                error.task = Some(task.clone());
                error.effect_id = Some(effect_id.clone());
            }
            Self::EffectAlreadyFinalized { effect_id, .. } => {
                error.effect_id = Some(effect_id.clone());
            }
            Self::BreakpointConflict { active, .. } => {
                error.breakpoint_id = Some(active.clone());
            }
            Self::BreakpointNotFound { breakpoint_id, .. }
            | Self::BreakpointResolved { breakpoint_id, .. }
            | Self::InvalidResolution { breakpoint_id, .. } => {
                error.breakpoint_id = Some(breakpoint_id.clone());
            }
            Self::RunAborted { breakpoint_id, .. } => {
                error.breakpoint_id = breakpoint_id.clone();
            }
            Self::RunFailed { .. } | Self::Storage(_) => {}
        }

        error
    }
}

/// Build the structured error for any workflow failure.
///
/// Engine errors keep their ids and violations; anything else the workflow
/// raised is recorded as a workflow error with its full context chain.
pub fn run_error_from(err: &anyhow::Error) -> RunError {
    match err.downcast_ref::<EngineError>() {
        Some(engine) => engine.to_run_error(),
        None => RunError {
            kind: ErrorKind::Workflow,
            message: format!("{:#}", err),
            task: None,
            effect_id: None,
            breakpoint_id: None,
            violations: Vec::new(),
        },
    }
}
