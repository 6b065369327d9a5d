//! LLM completion service abstraction.
//!
//! The planner talks to the model through [`CompletionService`]. The stock
//! backend, [`CommandCompletion`], pipes the request JSON to an external
//! command and reads the completion text from its stdout. Tests use scripted
//! services that return canned completions without spawning processes.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::io::config::PlannerConfig;
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One planner request: the message sequence plus the expected response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub response_schema: Value,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            response_schema: proposal_schema(),
        }
    }
}

/// JSON Schema of an action proposal.
pub fn proposal_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "tool": {"type": "string"},
            "arguments": {"type": "object"},
            "target": {"type": ["string", "null"]},
            "rationale": {"type": "string"}
        },
        "required": ["tool", "arguments"]
    })
}

/// Abstraction over completion backends.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Return the raw completion text. Well-formedness is not guaranteed.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Completion backend that spawns an external command.
///
/// The request is written to stdin as JSON; stdout is the completion.
#[derive(Debug, Clone)]
pub struct CommandCompletion {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandCompletion {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        if command.is_empty() || command[0].trim().is_empty() {
            bail!("planner command must be a non-empty array");
        }
        Ok(Self {
            command,
            timeout,
            output_limit_bytes,
        })
    }

    pub fn from_config(config: &PlannerConfig) -> Result<Self> {
        Self::new(
            config.command.clone(),
            Duration::from_secs(config.timeout_secs),
            config.output_limit_bytes,
        )
    }
}

#[async_trait]
impl CompletionService for CommandCompletion {
    #[instrument(skip_all, fields(program = %self.command[0], messages = request.messages.len()))]
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let payload = serde_json::to_vec(request).context("serialize completion request")?;
        let command = self.command.clone();
        let timeout = self.timeout;
        let limit = self.output_limit_bytes;
        info!("requesting completion");

        let output = tokio::task::spawn_blocking(move || {
            let mut cmd = Command::new(&command[0]);
            cmd.args(&command[1..]);
            run_command_with_timeout(cmd, Some(&payload), timeout, limit, None)
        })
        .await
        .map_err(|err| anyhow!("completion task failed: {err}"))?
        .context("run planner command")?;

        if let Err(err) = output.ensure_success("planner command") {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "planner command failed");
            return Err(err);
        }
        if output.stdout_truncated > 0 {
            warn!(
                truncated = output.stdout_truncated,
                "planner output truncated"
            );
        }
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(bytes = text.len(), "completion received");
        Ok(text)
    }
}
