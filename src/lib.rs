//! keel - durable, resumable task orchestration for agent workflows
//!
//! A workflow is an async entry function that calls agent tasks and
//! human breakpoints through a [`core::RunContext`]. Every task call is an
//! effect with a deterministic id; completed effects are persisted, so
//! re-running a workflow replays finished work from disk and only invokes
//! agents for what is left.
//!
//! # Architecture
//!
//! - Effects live under `runs/<run-id>/tasks/<effect-id>/`
//! - Run state is a `run.json` snapshot plus an append-only `journal.jsonl`
//! - Breakpoints suspend a run until a resolution is delivered, in process
//!   or through `resolution.json` from another process
//!
//! # Modules
//!
//! - `adapters`: Agent integrations (subprocess, HTTP)
//! - `core`: Engine logic (EffectStore, TaskExecutor, BreakpointManager, ProcessDriver)
//! - `domain`: Data structures (RunRecord, EffectRecord, JournalEvent, Artifact)
//! - `config`: Engine configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a declarative process
//! keel run review --input brief.json
//!
//! # Approve the breakpoint it is waiting on
//! keel breakpoints <run-id>
//! keel resolve <run-id> <breakpoint-id> --outcome approve
//!
//! # Re-execute a failed run; finished tasks are not re-invoked
//! keel resume <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{Agent, AgentRegistry, AgentRequest};
pub use config::EngineConfig;
pub use core::{EngineError, ProcessDefinition, ProcessDriver, RunContext, RunOutcome};
pub use domain::{define_task, Artifact, BreakpointSpec, Outcome, Resolution, RunRecord, RunStatus};
