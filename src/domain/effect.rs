//! Effect records: the durable unit of task idempotency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::schema::Violation;

/// One record per distinct task invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectRecord {
    pub effect_id: String,
    pub run_id: Uuid,

    /// Task name the effect was derived from
    pub task_name: String,

    /// Call ordinal of the task name within the run
    pub ordinal: u32,

    /// Position of the first call among all task calls of the run
    #[serde(default)]
    pub sequence: u64,

    /// Input snapshot (persisted as `input.json`)
    #[serde(skip)]
    pub input: Value,

    /// Output snapshot (persisted as `result.json`), once completed
    #[serde(skip)]
    pub output: Option<Value>,

    /// Hash of the canonical input, used to detect replay divergence
    pub input_hash: String,

    pub status: EffectStatus,

    /// Number of agent invocations made for this effect
    #[serde(default)]
    pub attempts: u32,

    /// Set when the task call first occurs, never moved afterwards
    pub created_at: DateTime<Utc>,

    /// Start of the latest agent attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<EffectFailure>,
}

impl EffectRecord {
    /// Create a pending record for a first invocation
    pub fn pending(
        run_id: Uuid,
        effect_id: impl Into<String>,
        task_name: impl Into<String>,
        ordinal: u32,
        input: Value,
    ) -> Self {
        let input_hash = crate::core::hash_input(&input.to_string());
        Self {
            effect_id: effect_id.into(),
            run_id,
            task_name: task_name.into(),
            ordinal,
            sequence: 0,
            input,
            output: None,
            input_hash,
            status: EffectStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            attempted_at: None,
            completed_at: None,
            failure: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Move a record back to pending for another attempt
    pub fn restart(&mut self) {
        self.status = EffectStatus::Pending;
        self.output = None;
        self.failure = None;
        self.completed_at = None;
        self.attempted_at = Some(Utc::now());
    }

    /// Finalize the record with a validated output
    pub fn complete(&mut self, output: Value) {
        self.status = EffectStatus::Completed;
        self.output = Some(output);
        self.failure = None;
        self.completed_at = Some(Utc::now());
    }

    /// Record a failure
    pub fn fail(&mut self, failure: EffectFailure) {
        self.status = if failure.kind == FailureKind::Timeout {
            EffectStatus::FailedTimeout
        } else {
            EffectStatus::Failed
        };
        self.failure = Some(failure);
        self.completed_at = Some(Utc::now());
    }

    pub fn is_completed(&self) -> bool {
        self.status == EffectStatus::Completed
    }

    /// A pending record older than `stale_after` is presumed orphaned by a crash
    pub fn is_stale(&self, stale_after: std::time::Duration) -> bool {
        let since = self.attempted_at.unwrap_or(self.created_at);
        let age = Utc::now().signed_duration_since(since);
        age.to_std().map(|age| age >= stale_after).unwrap_or(false)
    }
}

/// Lifecycle status of an effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectStatus {
    /// Persisted before the agent was invoked
    Pending,

    /// Output validated and persisted (final)
    Completed,

    /// Agent failed or returned an invalid payload
    Failed,

    /// Agent exceeded its deadline
    FailedTimeout,
}

impl std::fmt::Display for EffectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::FailedTimeout => "failed_timeout",
        };
        f.write_str(s)
    }
}

/// Why an effect failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    /// The rejected payload, kept for triage without replaying the agent call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl EffectFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            violations: Vec::new(),
            payload: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Execution,
    Timeout,
    Validation,
    InvalidSchema,
    /// A pending record was abandoned by a crashed process
    Orphaned,
}
