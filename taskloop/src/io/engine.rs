//! Tool execution engine.
//!
//! Turns the pending proposal of a task into exactly one step record. Lookup
//! and validation failures short-circuit before any side effect; callables run
//! on a spawned task raced against their timeout and are retried immediately
//! and sequentially. Nothing escapes: every failure becomes a failed record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Map;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::core::goals::{GoalEdit, summarize_diff};
use crate::core::routing::finish_arguments;
use crate::core::state::{StateError, TaskState};
use crate::core::types::{
    ActionProposal, AttemptOutcome, AttemptRecord, FINISH_TOOL, FailureKind, StepRecord,
    StepStatus, UPDATE_GOALS_TOOL,
};
use crate::io::registry::{RegistryError, ToolEntry, ToolKind, ToolRegistry};
use crate::io::tool::{Tool, ToolCall};
use crate::io::validation::ValidationFailure;

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFailure {
    #[error("tool '{name}' not found")]
    ToolNotFound { name: String },
    #[error("tool '{name}' is blocked by policy in safe mode")]
    ToolBlocked { name: String },
    #[error("invalid arguments for '{tool}': {failure}")]
    Validation {
        tool: String,
        failure: ValidationFailure,
    },
    #[error("tool '{tool}' failed after {attempts} attempt(s): {error}")]
    Execution {
        tool: String,
        attempts: u32,
        error: String,
    },
    #[error("tool '{tool}' timed out after {timeout_ms}ms ({attempts} attempt(s))")]
    Timeout {
        tool: String,
        attempts: u32,
        timeout_ms: u64,
    },
    #[error("planner output unusable: {reason}")]
    PlannerParse { reason: String },
}

impl ExecutionFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExecutionFailure::ToolNotFound { .. } => FailureKind::ToolNotFound,
            ExecutionFailure::ToolBlocked { .. } => FailureKind::ToolBlocked,
            ExecutionFailure::Validation { .. } => FailureKind::Validation,
            ExecutionFailure::Execution { .. } => FailureKind::Execution,
            ExecutionFailure::Timeout { .. } => FailureKind::Timeout,
            ExecutionFailure::PlannerParse { .. } => FailureKind::PlannerParse,
        }
    }
}

impl From<RegistryError> for ExecutionFailure {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Blocked { name } => ExecutionFailure::ToolBlocked { name },
            RegistryError::NotFound { name } | RegistryError::InvalidName { name } => {
                ExecutionFailure::ToolNotFound { name }
            }
            RegistryError::InvalidSchema { name, reason } => ExecutionFailure::Execution {
                tool: name,
                attempts: 0,
                error: reason,
            },
        }
    }
}

/// Executes proposals against a shared registry.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    registry: Arc<ToolRegistry>,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Consume the task's pending proposal and append exactly one step record.
    ///
    /// Only fails when the task is already terminated.
    #[instrument(skip_all, fields(task_id = %state.task_id(), step = state.steps_taken() + 1))]
    pub async fn execute(&self, state: &mut TaskState) -> Result<(), StateError> {
        if let Some(reason) = state.termination() {
            return Err(StateError::Terminated {
                task_id: state.task_id().to_string(),
                reason: reason.to_string(),
            });
        }
        let proposal = state.take_pending();
        let plan_error = state.take_plan_error();
        let record = match proposal {
            Some(proposal) => self.execute_proposal(state, proposal).await,
            None => {
                let reason =
                    plan_error.unwrap_or_else(|| "planner produced no proposal".to_string());
                failed_without_attempts(
                    None,
                    Map::new(),
                    None,
                    String::new(),
                    ExecutionFailure::PlannerParse { reason },
                )
            }
        };
        debug!(
            tool = record.tool.as_deref().unwrap_or("-"),
            status = ?record.status,
            attempts = record.attempts.len(),
            "step recorded"
        );
        state.push_step(record)
    }

    async fn execute_proposal(&self, state: &mut TaskState, proposal: ActionProposal) -> StepRecord {
        let ActionProposal {
            tool,
            arguments,
            target,
            rationale,
        } = proposal;

        let entry = match self.registry.lookup(&tool, state.config().safe_mode) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(tool = %tool, err = %err, "tool lookup failed");
                return failed_without_attempts(Some(tool), arguments, target, rationale, err.into());
            }
        };

        if let Err(failure) = entry.validator().validate(&arguments) {
            warn!(tool = %tool, fields = ?failure.fields, "argument validation failed");
            let failure = ExecutionFailure::Validation {
                tool: tool.clone(),
                failure,
            };
            return failed_without_attempts(Some(tool), arguments, target, rationale, failure);
        }

        let (observation, attempts, failure) = match entry.kind() {
            ToolKind::Intrinsic => apply_intrinsic(state, &entry, &arguments),
            ToolKind::Callable(callable) => {
                run_with_retries(&entry, Arc::clone(callable), &arguments, target.as_deref())
                    .await
            }
        };

        let (started_at, duration_ms) = attempts
            .last()
            .map(|a| (a.started_at, a.duration_ms))
            .unwrap_or_else(|| (Utc::now(), 0));
        StepRecord {
            rationale,
            tool: Some(tool),
            arguments,
            target,
            observation,
            status: if failure.is_none() {
                StepStatus::Success
            } else {
                StepStatus::Failure
            },
            failure,
            started_at,
            duration_ms,
            attempts,
        }
    }
}

type Outcome = (String, Vec<AttemptRecord>, Option<FailureKind>);

/// Run the callable up to `retries + 1` times, stopping at the first success.
async fn run_with_retries(
    entry: &ToolEntry,
    tool: Arc<dyn Tool>,
    arguments: &Map<String, serde_json::Value>,
    target: Option<&str>,
) -> Outcome {
    let spec = entry.spec();
    let max_attempts = spec.retries.saturating_add(1);
    let timeout_ms = spec.timeout.as_millis() as u64;
    let mut attempts = Vec::new();
    let mut last_failure = None;

    for attempt in 1..=max_attempts {
        let cancel = CancellationToken::new();
        let call = ToolCall {
            arguments: arguments.clone(),
            target: target.map(str::to_string),
            attempt,
            cancel: cancel.clone(),
        };
        let started_at: DateTime<Utc> = Utc::now();
        let clock = Instant::now();
        let callable = Arc::clone(&tool);
        let handle = tokio::spawn(async move { callable.call(call).await });
        let result = tokio::time::timeout(spec.timeout, handle).await;
        let duration_ms = clock.elapsed().as_millis() as u64;

        let failure = match result {
            Ok(Ok(Ok(observation))) => {
                attempts.push(AttemptRecord {
                    attempt,
                    started_at,
                    duration_ms,
                    outcome: AttemptOutcome::Success,
                });
                debug!(tool = %spec.name, attempt, duration_ms, "tool attempt succeeded");
                return (observation, attempts, None);
            }
            Ok(Ok(Err(err))) => ExecutionFailure::Execution {
                tool: spec.name.clone(),
                attempts: attempt,
                error: format!("{err:#}"),
            },
            Ok(Err(join_err)) => ExecutionFailure::Execution {
                tool: spec.name.clone(),
                attempts: attempt,
                error: format!("tool task aborted: {join_err}"),
            },
            Err(_elapsed) => {
                // The spawned task is detached, not killed; the token lets cooperative tools stop.
                cancel.cancel();
                ExecutionFailure::Timeout {
                    tool: spec.name.clone(),
                    attempts: attempt,
                    timeout_ms,
                }
            }
        };

        let outcome = match &failure {
            ExecutionFailure::Timeout { timeout_ms, .. } => AttemptOutcome::TimedOut {
                timeout_ms: *timeout_ms,
            },
            ExecutionFailure::Execution { error, .. } => AttemptOutcome::Failed {
                error: error.clone(),
            },
            other => AttemptOutcome::Failed {
                error: other.to_string(),
            },
        };
        warn!(tool = %spec.name, attempt, max_attempts, err = %failure, "tool attempt failed");
        attempts.push(AttemptRecord {
            attempt,
            started_at,
            duration_ms,
            outcome,
        });
        last_failure = Some(failure);
    }

    match last_failure {
        Some(failure) => {
            warn!(tool = %spec.name, attempts = max_attempts, "retries exhausted");
            (failure.to_string(), attempts, Some(failure.kind()))
        }
        None => (String::new(), attempts, None),
    }
}

/// Apply `finish` or `update_goals` to the task state.
fn apply_intrinsic(
    state: &mut TaskState,
    entry: &ToolEntry,
    arguments: &Map<String, serde_json::Value>,
) -> Outcome {
    let started_at = Utc::now();
    let clock = Instant::now();
    let result: Result<String, String> = match entry.name() {
        FINISH_TOOL => {
            let (status, reason) = finish_arguments(arguments);
            Ok(format!("finish requested ({status}): {reason}"))
        }
        UPDATE_GOALS_TOOL => GoalEdit::from_arguments(arguments).and_then(|edit| {
            let before = state.goal_snapshot();
            let stack = edit
                .apply(state.sub_goals(), state.current_goal_index())
                .map_err(|err| err.to_string())?;
            state.set_goal_stack(stack);
            Ok(summarize_diff(&before, &state.goal_snapshot()))
        }),
        other => Err(format!("no intrinsic handler for '{other}'")),
    };
    let duration_ms = clock.elapsed().as_millis() as u64;

    match result {
        Ok(observation) => (
            observation,
            vec![AttemptRecord {
                attempt: 1,
                started_at,
                duration_ms,
                outcome: AttemptOutcome::Success,
            }],
            None,
        ),
        Err(error) => {
            warn!(tool = %entry.name(), err = %error, "intrinsic tool failed");
            let failure = ExecutionFailure::Execution {
                tool: entry.name().to_string(),
                attempts: 1,
                error: error.clone(),
            };
            (
                failure.to_string(),
                vec![AttemptRecord {
                    attempt: 1,
                    started_at,
                    duration_ms,
                    outcome: AttemptOutcome::Failed { error },
                }],
                Some(FailureKind::Execution),
            )
        }
    }
}

fn failed_without_attempts(
    tool: Option<String>,
    arguments: Map<String, serde_json::Value>,
    target: Option<String>,
    rationale: String,
    failure: ExecutionFailure,
) -> StepRecord {
    StepRecord {
        rationale,
        tool,
        arguments,
        target,
        observation: failure.to_string(),
        status: StepStatus::Failure,
        failure: Some(failure.kind()),
        started_at: Utc::now(),
        duration_ms: 0,
        attempts: Vec::new(),
    }
}
