//! Tool callable contract and the stock adapters.
//!
//! Every tool implements [`Tool`]: one async call taking validated arguments
//! and a cancellation token. Blocking work goes through [`BlockingTool`] so it
//! runs on tokio's blocking pool instead of an executor thread.

use std::process::Command;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::io::process::run_command_with_timeout;

/// Input handed to a tool for one attempt.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub arguments: Map<String, Value>,
    pub target: Option<String>,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Cancelled when the engine abandons this attempt (timeout).
    pub cancel: CancellationToken,
}

impl ToolCall {
    pub fn new(arguments: Map<String, Value>) -> Self {
        Self {
            arguments,
            target: None,
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// String argument, or an error naming the missing field.
    pub fn str_arg(&self, name: &str) -> Result<&str> {
        self.arguments
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing string argument '{name}'"))
    }
}

/// A validated-input callable the engine may invoke.
///
/// The returned string becomes the step's observation; an error is a failed
/// attempt and is retried per the tool's retry count.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn call(&self, call: ToolCall) -> Result<String>;
}

/// Adapts a synchronous closure into a [`Tool`] run on `spawn_blocking`.
pub struct BlockingTool<F> {
    f: Arc<F>,
}

impl<F> BlockingTool<F>
where
    F: Fn(ToolCall) -> Result<String> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl<F> Tool for BlockingTool<F>
where
    F: Fn(ToolCall) -> Result<String> + Send + Sync + 'static,
{
    async fn call(&self, call: ToolCall) -> Result<String> {
        let f = Arc::clone(&self.f);
        tokio::task::spawn_blocking(move || f(call))
            .await
            .map_err(|err| anyhow!("blocking tool task failed: {err}"))?
    }
}

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex is valid")
});

/// Tool backed by an external command.
///
/// Each argv element may contain `{name}` placeholders filled from the call's
/// arguments (strings verbatim, other values as JSON). Stdout is the
/// observation; a non-zero exit is an error.
#[derive(Debug, Clone)]
pub struct CommandTool {
    argv: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandTool {
    pub fn new(argv: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        if argv.is_empty() || argv[0].trim().is_empty() {
            bail!("command must be a non-empty array");
        }
        Ok(Self {
            argv,
            timeout,
            output_limit_bytes,
        })
    }

    /// Fill placeholders in every argv element.
    pub fn render_argv(&self, arguments: &Map<String, Value>) -> Result<Vec<String>> {
        self.argv
            .iter()
            .map(|part| render_placeholders(part, arguments))
            .collect()
    }
}

fn render_placeholders(template: &str, arguments: &Map<String, Value>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = match arguments.get(name.as_str()) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => bail!("missing argument '{}' for command", name.as_str()),
            Some(other) => other.to_string(),
        };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

#[async_trait]
impl Tool for CommandTool {
    #[instrument(skip_all, fields(program = %self.argv[0], attempt = call.attempt))]
    async fn call(&self, call: ToolCall) -> Result<String> {
        let argv = self.render_argv(&call.arguments)?;
        let timeout = self.timeout;
        let limit = self.output_limit_bytes;
        let cancel = call.cancel.clone();
        debug!(?argv, "running command tool");
        tokio::task::spawn_blocking(move || {
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            let output = run_command_with_timeout(cmd, None, timeout, limit, Some(&cancel))?;
            output.ensure_success(&argv[0])?;
            Ok(output.stdout_lossy())
        })
        .await
        .map_err(|err| anyhow!("command tool task failed: {err}"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn renders_placeholders() {
        let tool = CommandTool::new(
            vec!["ls".into(), "-l".into(), "{path}".into(), "--depth={depth}".into()],
            Duration::from_secs(1),
            1024,
        )
        .expect("tool");
        let argv = tool
            .render_argv(&args(json!({"path": "/tmp", "depth": 2})))
            .expect("render");
        assert_eq!(argv, vec!["ls", "-l", "/tmp", "--depth=2"]);
    }

    #[test]
    fn missing_placeholder_argument_is_an_error() {
        let tool =
            CommandTool::new(vec!["cat".into(), "{file}".into()], Duration::from_secs(1), 1024)
                .expect("tool");
        assert!(tool.render_argv(&Map::new()).is_err());
    }

    #[test]
    fn empty_command_rejected() {
        assert!(CommandTool::new(Vec::new(), Duration::from_secs(1), 1024).is_err());
    }

    #[tokio::test]
    async fn blocking_tool_runs_closure() {
        let tool = BlockingTool::new(|call: ToolCall| Ok(format!("hi {}", call.str_arg("name")?)));
        let out = tool
            .call(ToolCall::new(args(json!({"name": "ops"}))))
            .await
            .expect("call");
        assert_eq!(out, "hi ops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_tool_returns_stdout() {
        let tool = CommandTool::new(
            vec!["echo".into(), "{word}".into()],
            Duration::from_secs(5),
            1024,
        )
        .expect("tool");
        let out = tool
            .call(ToolCall::new(args(json!({"word": "pong"}))))
            .await
            .expect("call");
        assert_eq!(out.trim(), "pong");
    }
}
