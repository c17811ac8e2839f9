//! CLI commands for keel
//!
//! Commands:
//! - run: Start a process run
//! - resume: Re-execute a run, answering finished tasks from the effect store
//! - status / runs / journal: Inspect runs
//! - effects / breakpoints: Inspect a run's tasks and reviews
//! - resolve / abort: Operate on suspended runs

use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;

use crate::adapters::{Agent, AgentRegistry, CommandAgent, HttpAgent};
use crate::config::{AgentSettings, EngineConfig};
use crate::core::{ProcessDriver, ProcessRegistry, RunOutcome};
use crate::domain::{EffectStatus, Outcome, Resolution};

/// keel - durable, resumable task orchestration for agent workflows
#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Durable, resumable task orchestration for agent workflows")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a process
    Run {
        /// Name of the process to run
        process: String,

        /// JSON input file (reads stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Run ID to use (re-executes the run if it exists)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Resume a run with its recorded inputs
    Resume {
        /// Run ID to resume
        run_id: String,
    },

    /// Show status of a run
    Status {
        /// Run ID to check
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List the effects (task invocations) of a run
    Effects {
        /// Run ID
        run_id: String,
    },

    /// Print the journal of a run
    Journal {
        /// Run ID
        run_id: String,
    },

    /// List the breakpoints of a run
    Breakpoints {
        /// Run ID
        run_id: String,
    },

    /// Resolve a pending breakpoint
    Resolve {
        /// Run ID
        run_id: String,

        /// Breakpoint ID (see `keel breakpoints`)
        breakpoint_id: String,

        /// Reviewer decision: approve, reject or edit
        #[arg(short, long)]
        outcome: Outcome,

        /// Notes passed to the workflow
        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Abort a run
    Abort {
        /// Run ID
        run_id: String,

        /// Reason recorded with the abort request
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Show configuration
    Config {
        /// Check that every configured agent is reachable
        #[arg(long)]
        check: bool,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { process, input, run_id } => run_process(&process, input, run_id).await,
            Commands::Resume { run_id } => resume_run(&run_id).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Effects { run_id } => list_effects(&run_id).await,
            Commands::Journal { run_id } => show_journal(&run_id).await,
            Commands::Breakpoints { run_id } => list_breakpoints(&run_id).await,
            Commands::Resolve {
                run_id,
                breakpoint_id,
                outcome,
                notes,
            } => resolve_breakpoint(&run_id, &breakpoint_id, outcome, notes).await,
            Commands::Abort { run_id, reason } => abort_run(&run_id, reason).await,
            Commands::Config { check } => show_config(check).await,
        }
    }
}

/// Driver and process registry built from the loaded configuration
fn engine() -> Result<(EngineConfig, ProcessDriver, ProcessRegistry)> {
    let config = EngineConfig::load()?;
    let agents = build_agents(&config)?;

    let mut processes = ProcessRegistry::new();
    processes.load_dir(&config.processes_dir)?;

    let driver = ProcessDriver::new(&config, agents);
    Ok((config, driver, processes))
}

/// Build the agent registry: `agent` is the fallback, `agents` are routed by name
pub fn build_agents(config: &EngineConfig) -> Result<AgentRegistry> {
    let mut registry = AgentRegistry::new();

    if config.agent.is_configured() {
        registry.set_default(build_agent("default", &config.agent)?);
    }
    for (name, settings) in &config.agents {
        if settings.is_configured() {
            registry.register(name.clone(), build_agent(name, settings)?);
        }
    }

    Ok(registry)
}

fn build_agent(name: &str, settings: &AgentSettings) -> Result<Arc<dyn Agent>> {
    if let Some(ref endpoint) = settings.endpoint {
        let mut agent = HttpAgent::new(endpoint.clone()).with_name(name);
        if let Some(ref var) = settings.token_env {
            let token = std::env::var(var).with_context(|| format!("Agent '{}' expects a token in ${}", name, var))?;
            agent = agent.with_token(token);
        }
        return Ok(Arc::new(agent));
    }

    let program = settings
        .command
        .clone()
        .with_context(|| format!("Agent '{}' has neither a command nor an endpoint", name))?;
    let mut agent = CommandAgent::new(program, settings.args.clone()).with_name(name);
    if let Some(ref path) = settings.template {
        let template = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt template: {}", path.display()))?;
        agent = agent.with_template(template);
    }
    Ok(Arc::new(agent))
}

fn parse_run_id(run_id: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id).with_context(|| format!("Invalid run ID: {}", run_id))
}

/// Read process inputs from a file or piped stdin; non-JSON text becomes a string
fn read_inputs(input: Option<PathBuf>) -> Result<Value> {
    let text = match input {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?,
        None if !std::io::stdin().is_terminal() => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read from stdin")?;
            buffer
        }
        None => String::new(),
    };

    if text.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Run a process
async fn run_process(name: &str, input: Option<PathBuf>, run_id: Option<String>) -> Result<()> {
    let (_, driver, processes) = engine()?;

    let process = processes.get(name).with_context(|| {
        format!(
            "Process '{}' not found. Available: {}",
            name,
            processes.names().join(", ")
        )
    })?;

    let inputs = read_inputs(input)?;
    let outcome = match run_id {
        Some(id) => driver.run_with_id(parse_run_id(&id)?, process.as_ref(), inputs).await?,
        None => driver.run_process(process.as_ref(), inputs).await?,
    };

    report(outcome)
}

/// Resume a run with its recorded inputs
async fn resume_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (_, driver, processes) = engine()?;

    let record = driver
        .status(run_id)
        .await?
        .with_context(|| format!("Run {} not found", run_id))?;
    let process = processes
        .get(&record.process_name)
        .with_context(|| format!("Process '{}' of run {} is not defined", record.process_name, run_id))?;

    let outcome = driver.resume(run_id, process.as_ref()).await?;
    report(outcome)
}

fn report(outcome: RunOutcome) -> Result<()> {
    let run_id = outcome.run_id;
    let artifacts = outcome.artifacts.clone();

    match outcome.into_result() {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            for artifact in &artifacts {
                eprintln!("  artifact: {} ({}) {}", artifact.path, artifact.format, artifact.label);
            }
            eprintln!("\n[Run {} completed successfully]", run_id);
            Ok(())
        }
        Err(e) => {
            let error = e.to_run_error();
            eprintln!("\n[{}]", e);
            if let Some(ref effect_id) = error.effect_id {
                eprintln!("  effect: {}", effect_id);
            }
            if let Some(ref breakpoint_id) = error.breakpoint_id {
                eprintln!("  breakpoint: {}", breakpoint_id);
            }
            for violation in &error.violations {
                eprintln!("  {}", violation);
            }
            eprintln!("To resume: keel resume {}", run_id);
            std::process::exit(1);
        }
    }
}

/// Show run status
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (_, driver, _) = engine()?;

    let record = driver
        .status(run_id)
        .await?
        .with_context(|| format!("Run {} not found", run_id))?;

    println!("Run ID:   {}", record.run_id);
    println!("Process:  {}", record.process_name);
    println!("Status:   {}", record.status);
    println!("Started:  {}", record.started_at);
    if let Some(completed) = record.completed_at {
        println!("Finished: {}", completed);
    }
    if let Some(ref breakpoint) = record.current_breakpoint {
        println!("Waiting on breakpoint: {}", breakpoint);
    }
    if let Some(ref error) = record.error {
        println!("Error:    {:?}: {}", error.kind, error.message);
        if let Some(ref effect_id) = error.effect_id {
            println!("Effect:   {}", effect_id);
        }
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let (_, driver, _) = engine()?;
    let runs = driver.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<10} {}", "RUN ID", "PROCESS", "STATUS", "STARTED");
    println!("{}", "-".repeat(95));
    for run in runs {
        println!(
            "{:<38} {:<20} {:<10} {}",
            run.run_id,
            run.process_name,
            run.status.to_string(),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// List effects of a run
async fn list_effects(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (_, driver, _) = engine()?;
    let effects = driver.effects().list(run_id).await?;

    if effects.is_empty() {
        println!("No effects recorded for run {}", run_id);
        return Ok(());
    }

    println!("{:<48} {:<16} {:<8}", "EFFECT ID", "STATUS", "ATTEMPTS");
    println!("{}", "-".repeat(75));
    for effect in effects {
        println!("{:<48} {:<16} {:<8}", effect.effect_id, effect.status.to_string(), effect.attempts);
        if effect.status != EffectStatus::Completed {
            if let Some(ref failure) = effect.failure {
                println!("    {}", failure.message);
            }
        }
    }

    Ok(())
}

/// Print the journal of a run, one JSON line per entry
async fn show_journal(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (_, driver, _) = engine()?;

    for event in driver.journal(run_id).await? {
        println!("{}", serde_json::to_string(&event)?);
    }

    Ok(())
}

/// List breakpoints of a run
async fn list_breakpoints(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (_, driver, _) = engine()?;
    let breakpoints = driver.breakpoints().list(run_id).await?;

    if breakpoints.is_empty() {
        println!("No breakpoints for run {}", run_id);
        return Ok(());
    }

    for breakpoint in breakpoints {
        let state = match breakpoint.resolution {
            Some(ref resolution) => format!("{:?}", resolution.outcome).to_lowercase(),
            None => "pending".to_string(),
        };
        println!("{}  [{}]  {}", breakpoint.breakpoint_id, state, breakpoint.title);
        println!("    {}", breakpoint.question);
        for file in &breakpoint.files {
            println!("    - {} ({})", file.path, file.label);
        }
    }

    Ok(())
}

/// Resolve a pending breakpoint
async fn resolve_breakpoint(run_id_str: &str, breakpoint_id: &str, outcome: Outcome, notes: Option<String>) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (_, driver, _) = engine()?;

    let mut resolution = Resolution::new(outcome);
    resolution.notes = notes;
    driver.resolve_breakpoint(run_id, breakpoint_id, resolution).await?;

    eprintln!("[Breakpoint {} resolved: {:?}]", breakpoint_id, outcome);
    Ok(())
}

/// Abort a run
async fn abort_run(run_id_str: &str, reason: Option<String>) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let (_, driver, _) = engine()?;

    driver.abort(run_id, reason).await?;
    eprintln!("[Abort requested for run {}]", run_id);
    Ok(())
}

/// Show current configuration
async fn show_config(check: bool) -> Result<()> {
    let cfg = EngineConfig::load()?;

    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Runs:      {}", cfg.runs_dir().display());
    println!("  Processes: {}", cfg.processes_dir.display());
    println!();
    println!("Engine:");
    println!("  Task timeout:        {}s", cfg.task_timeout_seconds);
    println!("  Stale pending after: {}s", cfg.stale_pending_seconds);
    println!("  Breakpoint debounce: {}ms", cfg.breakpoint_debounce_ms);
    println!();
    println!("Agents:");
    print_agent("default", &cfg.agent);
    let mut names: Vec<&String> = cfg.agents.keys().collect();
    names.sort();
    for name in names {
        print_agent(name, &cfg.agents[name]);
    }

    if check {
        println!();
        println!("Agent health:");
        let mut settings: Vec<(&str, &AgentSettings)> = vec![("default", &cfg.agent)];
        settings.extend(cfg.agents.iter().map(|(name, s)| (name.as_str(), s)));
        for (name, settings) in settings.into_iter().filter(|(_, s)| s.is_configured()) {
            let status = match build_agent(name, settings) {
                Ok(agent) => match agent.health_check().await {
                    Ok(()) => "ok".to_string(),
                    Err(e) => format!("unreachable: {:#}", e),
                },
                Err(e) => format!("misconfigured: {:#}", e),
            };
            println!("  {:<12} {}", name, status);
        }
    }

    Ok(())
}

fn print_agent(name: &str, settings: &AgentSettings) {
    match (&settings.command, &settings.endpoint) {
        (_, Some(endpoint)) => println!("  {:<12} http {}", name, endpoint),
        (Some(command), None) => println!("  {:<12} {} {}", name, command, settings.args.join(" ")),
        (None, None) => println!("  {:<12} (not configured)", name),
    }
}
