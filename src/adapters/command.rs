//! Subprocess agent.
//!
//! Renders the task prompt, pipes it to the configured command's stdin and
//! takes the first JSON value found on stdout as the payload.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::prompt::{decode_text, extract_first_json, render_prompt, DEFAULT_TEMPLATE};
use super::{Agent, AgentRequest};

/// Agent backed by an external command
pub struct CommandAgent {
    name: String,
    program: String,
    args: Vec<String>,
    template: String,
    working_dir: Option<PathBuf>,
}

impl CommandAgent {
    /// Create an agent that runs `program args...` once per task
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            name: program.clone(),
            program,
            args,
            template: DEFAULT_TEMPLATE.to_string(),
            working_dir: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the prompt template (`{{task}}`, `{{context}}`)
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn run(&self, prompt: &str, request: &AgentRequest) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("KEEL_RUN_ID", request.run_id.to_string())
            .env("KEEL_EFFECT_ID", &request.effect_id)
            .env("KEEL_TASK", &request.task)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn agent '{}' for task '{}'", self.program, request.task))?;

        // Feed stdin concurrently so a chatty agent cannot fill its stdout pipe first
        let writer = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                stdin.write_all(prompt.as_bytes()).await
                // stdin dropped here: EOF
            })
        });

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for agent '{}'", self.program))?;

        if let Some(writer) = writer {
            if let Err(e) = writer.await.context("Prompt writer task failed")? {
                // Agents may exit without reading their whole prompt
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e).context("Failed to write prompt to agent stdin");
                }
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Agent '{}' failed with exit code {}: {}",
                self.program,
                exit_code,
                stderr.trim()
            );
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &AgentRequest) -> Result<Value> {
        let prompt = render_prompt(&self.template, request)?;
        debug!(agent = %self.name, effect_id = %request.effect_id, bytes = prompt.len(), "Invoking command agent");

        let stdout = self.run(&prompt, request).await?;
        let text = decode_text(&stdout);

        extract_first_json(&text).with_context(|| {
            format!(
                "Agent '{}' returned no JSON object or array for task '{}'",
                self.name, request.task
            )
        })
    }

    async fn health_check(&self) -> Result<()> {
        Command::new(&self.program)
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .with_context(|| format!("Agent command '{}' is not runnable", self.program))?;
        Ok(())
    }
}
