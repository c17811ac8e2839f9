//! Journal entries for the per-run append-only log.
//!
//! Every state change of a run is recorded as an immutable entry. The
//! RunRecord snapshot in `run.json` can always be rebuilt from the journal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single entry in a run's journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEvent {
    /// Monotonic sequence number within the run (starts at 1)
    pub seq: u64,

    /// When this entry was written (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this entry belongs to
    pub run_id: Uuid,

    /// Type of entry
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Effect the entry refers to (task entries)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect_id: Option<String>,

    /// Breakpoint the entry refers to (breakpoint entries)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint_id: Option<String>,

    /// Human-readable summary
    pub summary: String,

    /// Structured payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Error message if the entry records a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JournalEvent {
    /// Create an entry stamped with the current time.
    ///
    /// `seq` is assigned by the run store when the entry is appended.
    pub fn new(run_id: Uuid, event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            run_id,
            event_type,
            effect_id: None,
            breakpoint_id: None,
            summary: summary.into(),
            data: None,
            error: None,
        }
    }

    pub fn with_effect(mut self, effect_id: impl Into<String>) -> Self {
        self.effect_id = Some(effect_id.into());
        self
    }

    pub fn with_breakpoint(mut self, breakpoint_id: impl Into<String>) -> Self {
        self.breakpoint_id = Some(breakpoint_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of journal entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// A recorded run is being re-executed
    RunResumed,

    /// An agent invocation is about to start
    TaskStarted,

    /// A task call was answered from the effect store
    TaskCached,

    /// A task completed and its output was validated
    TaskCompleted,

    /// A task failed (execution, timeout or validation)
    TaskFailed,

    /// A breakpoint was opened
    BreakpointOpened,

    /// A breakpoint received its resolution
    BreakpointResolved,

    /// The run is waiting on a breakpoint
    RunSuspended,

    /// Free-form workflow log line
    Log,

    /// The run completed successfully
    RunCompleted,

    /// The run failed
    RunFailed,

    /// The run was aborted by an operator
    RunAborted,
}
