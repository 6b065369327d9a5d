//! Test-only helpers: canned step records, scripted collaborators, temp workspaces.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use tempfile::TempDir;

use crate::core::types::{
    ActionProposal, AttemptOutcome, AttemptRecord, FINISH_TOOL, FailureKind, FinalStatus,
    StepRecord, StepStatus,
};
use crate::io::completion::{CompletionRequest, CompletionService};
use crate::io::config::{EngineConfig, write_config};
use crate::io::tool::{Tool, ToolCall};

fn attempt(outcome: AttemptOutcome) -> AttemptRecord {
    AttemptRecord {
        attempt: 1,
        started_at: Utc::now(),
        duration_ms: 5,
        outcome,
    }
}

/// A successful single-attempt step for `tool`.
pub fn success_record(tool: &str, observation: &str) -> StepRecord {
    StepRecord {
        rationale: format!("run {tool}"),
        tool: Some(tool.to_string()),
        arguments: Map::new(),
        target: None,
        observation: observation.to_string(),
        status: StepStatus::Success,
        failure: None,
        started_at: Utc::now(),
        duration_ms: 5,
        attempts: vec![attempt(AttemptOutcome::Success)],
    }
}

/// A failed single-attempt step for `tool`.
pub fn failure_record(tool: &str, observation: &str) -> StepRecord {
    StepRecord {
        status: StepStatus::Failure,
        failure: Some(FailureKind::Execution),
        attempts: vec![attempt(AttemptOutcome::Failed {
            error: observation.to_string(),
        })],
        ..success_record(tool, observation)
    }
}

/// A successful `finish` step carrying `status` and `reason`.
pub fn finish_record(status: FinalStatus, reason: &str) -> StepRecord {
    let mut arguments = Map::new();
    arguments.insert("status".to_string(), json!(status.as_str()));
    arguments.insert("reason".to_string(), json!(reason));
    StepRecord {
        arguments,
        ..success_record(FINISH_TOOL, reason)
    }
}

/// Proposal for `tool` with object `arguments`.
pub fn proposal(tool: &str, arguments: Value) -> ActionProposal {
    let Value::Object(arguments) = arguments else {
        panic!("proposal arguments must be a JSON object");
    };
    ActionProposal::new(tool, arguments)
}

/// Completion service returning canned responses in order (`Err` strings become service errors).
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().expect("responses lock").len()
    }

    pub fn assert_drained(&self) {
        let remaining = self.remaining();
        assert_eq!(remaining, 0, "{remaining} scripted completion(s) unused");
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.responses.lock().expect("responses lock").pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(err)) => Err(anyhow!(err)),
            None => Err(anyhow!("scripted completion exhausted")),
        }
    }
}

/// Tool that counts calls and returns a fixed observation.
pub struct CountingTool {
    calls: Arc<AtomicU32>,
    output: String,
}

impl CountingTool {
    pub fn new(calls: Arc<AtomicU32>, output: &str) -> Self {
        Self {
            calls,
            output: output.to_string(),
        }
    }
}

#[async_trait]
impl Tool for CountingTool {
    async fn call(&self, _call: ToolCall) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

/// Tool that counts calls and always fails with `message`.
pub struct FailingTool {
    calls: Arc<AtomicU32>,
    message: String,
}

impl FailingTool {
    pub fn new(calls: Arc<AtomicU32>, message: &str) -> Self {
        Self {
            calls,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Tool for FailingTool {
    async fn call(&self, call: ToolCall) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("{} (attempt {})", self.message, call.attempt))
    }
}

/// Tool that sleeps on the tokio clock before answering, unless cancelled first.
pub struct SlowTool {
    delay: Duration,
}

impl SlowTool {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Tool for SlowTool {
    async fn call(&self, call: ToolCall) -> Result<String> {
        tokio::select! {
            () = tokio::time::sleep(self.delay) => Ok("done".to_string()),
            () = call.cancel.cancelled() => Err(anyhow!("cancelled")),
        }
    }
}

/// Temporary working directory with config, audit and plugin locations.
pub struct TestWorkspace {
    temp: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir().context("create temp workspace")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join(".taskloop").join("config.toml")
    }

    /// Default config with audit and plugin dirs inside the workspace.
    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            audit_dir: self.path().join(".taskloop").join("audit"),
            plugins_dir: self.path().join(".taskloop").join("tools.d"),
            ..EngineConfig::default()
        }
    }

    pub fn write_config(&self, config: &EngineConfig) -> Result<()> {
        write_config(&self.config_path(), config)
    }

    pub fn write_manifest(&self, file_name: &str, contents: &str) -> Result<PathBuf> {
        let dir = self.config().plugins_dir;
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(file_name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
