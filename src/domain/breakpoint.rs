//! Breakpoints: human-in-the-loop checkpoints and their resolutions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::artifact::Artifact;

/// What a workflow asks for when it calls `ctx.breakpoint(...)`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointSpec {
    pub title: String,
    pub question: String,
    /// Free-form review context
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Files the reviewer should look at
    #[serde(default)]
    pub files: Vec<Artifact>,
}

impl BreakpointSpec {
    pub fn new(title: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            question: question.into(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_file(mut self, file: Artifact) -> Self {
        self.files.push(file);
        self
    }
}

/// Persisted breakpoint (`breakpoints/{id}/breakpoint.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointRecord {
    pub breakpoint_id: String,
    pub run_id: Uuid,
    pub title: String,
    pub question: String,
    /// Review payload context: `{runId, ...freeform, files}`
    pub context: Value,
    pub files: Vec<Artifact>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl BreakpointRecord {
    /// Build the record for a newly opened breakpoint
    pub fn open(run_id: Uuid, breakpoint_id: impl Into<String>, spec: BreakpointSpec) -> Self {
        let mut context = spec.context;
        context.insert("runId".to_string(), Value::String(run_id.to_string()));
        context.insert(
            "files".to_string(),
            serde_json::to_value(&spec.files).unwrap_or(Value::Array(Vec::new())),
        );

        Self {
            breakpoint_id: breakpoint_id.into(),
            run_id,
            title: spec.title,
            question: spec.question,
            context: Value::Object(context),
            files: spec.files,
            created_at: Utc::now(),
            resolution: None,
            resolved_at: None,
        }
    }

    /// The human-readable review payload `{question, title, context}`
    pub fn payload(&self) -> Value {
        serde_json::json!({
            "question": self.question,
            "title": self.title,
            "context": self.context,
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Reviewer decision delivered to a suspended run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Resolution {
    pub fn new(outcome: Outcome) -> Self {
        Self { outcome, notes: None }
    }

    pub fn approve() -> Self {
        Self::new(Outcome::Approve)
    }

    pub fn reject(notes: impl Into<String>) -> Self {
        Self::new(Outcome::Reject).with_notes(notes)
    }

    pub fn aborted() -> Self {
        Self::new(Outcome::Aborted)
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn is_approved(&self) -> bool {
        self.outcome == Outcome::Approve
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Approve,
    Reject,
    Edit,
    /// Set by the engine when an operator aborts a suspended run
    Aborted,
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "edit" => Ok(Self::Edit),
            "aborted" => Err("outcome 'aborted' is reserved for aborting a run".to_string()),
            other => Err(format!("unknown breakpoint outcome '{}'", other)),
        }
    }
}
