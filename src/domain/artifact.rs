//! Artifacts surfaced by task results and workflows.
//!
//! An artifact is a reference to a file a task produced, not its content.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A named, typed output reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path of the produced file (relative to the workspace the agent ran in)
    pub path: String,

    /// Format hint, e.g. "markdown", "json", "pdf"
    #[serde(default)]
    pub format: String,

    /// Human-readable label
    #[serde(default)]
    pub label: String,
}

impl Artifact {
    /// Create a new artifact reference
    pub fn new(path: impl Into<String>, format: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            format: format.into(),
            label: label.into(),
        }
    }

    /// Collect the `artifacts` array of a task output.
    ///
    /// Entries that are not artifact objects are skipped with a warning; the
    /// output schema is responsible for rejecting them outright.
    pub fn from_output(output: &Value) -> Vec<Artifact> {
        let Some(items) = output.get("artifacts").and_then(Value::as_array) else {
            return Vec::new();
        };

        items
            .iter()
            .filter_map(|item| match serde_json::from_value::<Artifact>(item.clone()) {
                Ok(artifact) => Some(artifact),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed artifact entry");
                    None
                }
            })
            .collect()
    }
}
