//! Domain types for the keel engine.
//!
//! This module contains the core data structures:
//! - RunRecord: durable run state
//! - JournalEvent: immutable per-run log entries
//! - EffectRecord: task idempotency records
//! - BreakpointRecord: human review checkpoints
//! - TaskDefinition: task descriptors produced by `define_task`
//! - Artifact: output references

pub mod artifact;
pub mod breakpoint;
pub mod effect;
pub mod events;
pub mod run;
pub mod task;

// Re-export commonly used types
pub use artifact::Artifact;
pub use breakpoint::{BreakpointRecord, BreakpointSpec, Outcome, Resolution};
pub use effect::{EffectFailure, EffectRecord, EffectStatus, FailureKind};
pub use events::{EventType, JournalEvent};
pub use run::{ErrorKind, RunError, RunRecord, RunStatus};
pub use task::{
    define_task, AgentSpec, Prompt, TaskCtx, TaskDefinition, TaskDescriptor, TaskIo, TaskKind,
};
