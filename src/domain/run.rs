//! Run records and reconstruction from the journal.
//!
//! A run is one execution of a process's entry function.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::events::{EventType, JournalEvent};
use crate::core::schema::Violation;

/// Durable state of a process run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Unique identifier for this run
    pub run_id: Uuid,

    /// Name of the process being executed
    pub process_name: String,

    /// Inputs the process was started with
    #[serde(default)]
    pub inputs: Value,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// Current status
    pub status: RunStatus,

    /// The breakpoint the run is waiting on, if suspended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_breakpoint: Option<String>,

    /// When the run reached a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Structured failure, if the run failed or was aborted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunRecord {
    /// Create a record for a run that is starting now
    pub fn new(run_id: Uuid, process_name: impl Into<String>, inputs: Value) -> Self {
        Self {
            run_id,
            process_name: process_name.into(),
            inputs,
            started_at: Utc::now(),
            status: RunStatus::Running,
            current_breakpoint: None,
            completed_at: None,
            error: None,
        }
    }

    /// Reconstruct run state from journal entries
    pub fn from_events(events: &[JournalEvent]) -> Option<Self> {
        let first = events.first()?;

        let mut record = Self {
            run_id: first.run_id,
            process_name: String::new(),
            inputs: Value::Null,
            started_at: first.timestamp,
            status: RunStatus::Running,
            current_breakpoint: None,
            completed_at: None,
            error: None,
        };

        for event in events {
            record.apply_event(event);
        }

        Some(record)
    }

    /// Apply a single journal entry
    pub fn apply_event(&mut self, event: &JournalEvent) {
        match event.event_type {
            EventType::RunStarted => {
                self.status = RunStatus::Running;
                self.started_at = event.timestamp;
                if let Some(data) = &event.data {
                    if let Some(name) = data.get("processName").and_then(Value::as_str) {
                        self.process_name = name.to_string();
                    }
                    if let Some(inputs) = data.get("inputs") {
                        self.inputs = inputs.clone();
                    }
                }
            }
            EventType::RunResumed => {
                self.status = RunStatus::Running;
                self.current_breakpoint = None;
                self.completed_at = None;
                self.error = None;
            }
            EventType::RunSuspended => {
                self.status = RunStatus::Suspended;
                self.current_breakpoint = event.breakpoint_id.clone();
            }
            EventType::BreakpointResolved => {
                if self.status == RunStatus::Suspended {
                    self.status = RunStatus::Running;
                }
                self.current_breakpoint = None;
            }
            EventType::RunCompleted => {
                self.status = RunStatus::Completed;
                self.current_breakpoint = None;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed | EventType::RunAborted => {
                self.status = if event.event_type == EventType::RunFailed {
                    RunStatus::Failed
                } else {
                    RunStatus::Aborted
                };
                self.current_breakpoint = None;
                self.completed_at = Some(event.timestamp);
                self.error = event
                    .data
                    .clone()
                    .and_then(|d| serde_json::from_value(d).ok())
                    .or_else(|| {
                        event.error.as_ref().map(|message| RunError {
                            kind: ErrorKind::Workflow,
                            message: message.clone(),
                            task: None,
                            effect_id: None,
                            breakpoint_id: None,
                            violations: Vec::new(),
                        })
                    });
            }
            EventType::TaskStarted
            | EventType::TaskCached
            | EventType::TaskCompleted
            | EventType::TaskFailed
            | EventType::BreakpointOpened
            | EventType::Log => {}
        }
    }

    /// Check if the run can still make progress
    pub fn is_active(&self) -> bool {
        matches!(self.status, RunStatus::Running | RunStatus::Suspended)
    }

    /// Check if the run reached a terminal status
    pub fn is_finished(&self) -> bool {
        !self.is_active()
    }
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Currently executing
    Running,

    /// Waiting on a breakpoint resolution
    Suspended,

    /// Completed successfully
    Completed,

    /// Failed with a structured error
    Failed,

    /// Cancelled by an operator
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Structured error recorded on a failed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

/// Classification of a run failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TaskValidation,
    TaskExecution,
    TaskTimeout,
    InvalidSchema,
    EffectAlreadyFinalized,
    BreakpointConflict,
    RunAborted,
    Storage,
    /// Error raised by the workflow itself
    Workflow,
}
