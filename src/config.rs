//! Engine configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (KEEL_HOME)
//! 2. Config file (.keel/config.yaml)
//! 3. Defaults (~/.keel)
//!
//! Config file discovery:
//! - Searches current directory and parents for .keel/config.yaml
//! - `paths.home` is relative to the .keel/ directory, other paths to the
//!   project root (the parent of .keel/)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: EngineSection,
    /// Default agent
    #[serde(default)]
    pub agent: AgentSettings,
    /// Agents by name, matched against a task's `agent.name`
    #[serde(default)]
    pub agents: HashMap<String, AgentSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .keel/)
    pub home: Option<String>,
    /// Declarative process directory (relative to the project root)
    pub processes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineSection {
    pub task_timeout_seconds: Option<u64>,
    pub stale_pending_seconds: Option<u64>,
    pub breakpoint_debounce_ms: Option<u64>,
}

/// How to reach an agent: a command (`command` + `args`) or an HTTP `endpoint`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub endpoint: Option<String>,
    /// Environment variable holding a bearer token for `endpoint`
    pub token_env: Option<String>,
    /// Prompt template file for `command` agents
    pub template: Option<PathBuf>,
}

impl AgentSettings {
    pub fn is_configured(&self) -> bool {
        self.command.is_some() || self.endpoint.is_some()
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine state directory (runs live under `home/runs`)
    pub home: PathBuf,
    /// Directory of declarative process files
    pub processes_dir: PathBuf,
    pub task_timeout_seconds: u64,
    pub stale_pending_seconds: u64,
    pub breakpoint_debounce_ms: u64,
    pub agent: AgentSettings,
    pub agents: HashMap<String, AgentSettings>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl EngineConfig {
    /// Defaults rooted at `home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            processes_dir: home.join("processes"),
            home,
            task_timeout_seconds: 300,
            stale_pending_seconds: 3600,
            breakpoint_debounce_ms: 200,
            agent: AgentSettings::default(),
            agents: HashMap::new(),
            config_file: None,
        }
    }

    /// Load configuration from all sources
    pub fn load() -> Result<Self> {
        let default_home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".keel");

        let env_home = std::env::var("KEEL_HOME").ok().map(PathBuf::from);

        let Some(config_path) = find_config_file() else {
            return Ok(Self::with_home(env_home.unwrap_or(default_home)));
        };

        let file = load_config_file(&config_path)?;

        // .keel/ and the project root around it
        let keel_dir = config_path.parent().unwrap_or(Path::new("."));
        let base_dir = keel_dir.parent().unwrap_or(Path::new("."));

        let home = env_home
            .or_else(|| file.paths.home.as_deref().map(|home| resolve_path(keel_dir, home)))
            .unwrap_or(default_home);

        let mut config = Self::with_home(home);
        if let Some(ref processes) = file.paths.processes {
            config.processes_dir = resolve_path(base_dir, processes);
        }
        if let Some(seconds) = file.engine.task_timeout_seconds {
            config.task_timeout_seconds = seconds;
        }
        if let Some(seconds) = file.engine.stale_pending_seconds {
            config.stale_pending_seconds = seconds;
        }
        if let Some(ms) = file.engine.breakpoint_debounce_ms {
            config.breakpoint_debounce_ms = ms;
        }

        config.agent = resolve_agent(base_dir, file.agent);
        config.agents = file
            .agents
            .into_iter()
            .map(|(name, settings)| (name, resolve_agent(base_dir, settings)))
            .collect();
        config.config_file = Some(config_path);

        Ok(config)
    }

    /// Get the runs directory ($KEEL_HOME/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }

    pub fn stale_pending(&self) -> Duration {
        Duration::from_secs(self.stale_pending_seconds)
    }

    pub fn breakpoint_debounce(&self) -> Duration {
        Duration::from_millis(self.breakpoint_debounce_ms)
    }
}

fn resolve_agent(base: &Path, mut settings: AgentSettings) -> AgentSettings {
    if let Some(template) = settings.template.take() {
        settings.template = Some(if template.is_absolute() {
            template
        } else {
            base.join(template)
        });
    }
    settings
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".keel").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}
