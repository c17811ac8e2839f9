//! Core engine logic.
//!
//! This module contains:
//! - EffectStore: durable, idempotent task effects
//! - Schema: structural validation of agent payloads
//! - TaskExecutor: cache lookup, agent invocation and validation
//! - BreakpointManager: human-in-the-loop suspension
//! - RunStore: run snapshot and append-only journal
//! - RunContext / ProcessDriver: the workflow-facing surface

pub mod artifacts;
pub mod breakpoints;
pub mod context;
pub mod declarative;
pub mod driver;
pub mod effect_store;
pub mod error;
pub mod executor;
pub mod persist;
pub mod run_store;
pub mod schema;

// Re-export commonly used types
pub use artifacts::{ArtifactAggregator, ArtifactSlot};
pub use breakpoints::{generate_breakpoint_id, BreakpointManager};
pub use context::RunContext;
pub use declarative::{DeclarativeProcess, InputSource, Step, StepAction};
pub use driver::{ProcessDefinition, ProcessDriver, ProcessRegistry, RunOutcome};
pub use effect_store::{generate_effect_id, hash_input, EffectLock, EffectStore};
pub use error::{run_error_from, EngineError};
pub use executor::{RetryPolicy, RunScope, TaskCall, TaskExecutor, TaskOptions};
pub use run_store::RunStore;
pub use schema::{validate, SchemaError, Violation};
