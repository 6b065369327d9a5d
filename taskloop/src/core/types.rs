//! Shared deterministic types for the task execution engine.
//!
//! These types define stable contracts between the planner, the execution
//! engine, routing and provenance. They carry no I/O and serialize to stable
//! JSON so audit output stays diffable across runs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the intrinsic tool that ends a task.
pub const FINISH_TOOL: &str = "finish";

/// Name of the intrinsic tool that edits the sub-goal stack.
pub const UPDATE_GOALS_TOOL: &str = "update_goals";

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failure,
}

/// Final status of a task, as recorded in its provenance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Success,
    Failure,
    Partial,
}

impl FinalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalStatus::Success => "success",
            FinalStatus::Failure => "failure",
            FinalStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(FinalStatus::Success),
            "failure" => Ok(FinalStatus::Failure),
            "partial" => Ok(FinalStatus::Partial),
            other => Err(format!("unknown final status '{other}'")),
        }
    }
}

/// Why a task stopped. Set exactly once per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    /// The planner chose the `finish` action.
    Finished { status: FinalStatus, reason: String },
    /// `steps_taken` reached the configured iteration cap.
    IterationCapReached { max_iterations: u32 },
    /// An external cancellation request was observed at a loop boundary.
    Cancelled,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Finished { status, reason } => {
                write!(f, "finished ({status}): {reason}")
            }
            TerminationReason::IterationCapReached { max_iterations } => {
                write!(f, "iteration cap reached ({max_iterations} steps)")
            }
            TerminationReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Structured action proposed by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub rationale: String,
}

impl ActionProposal {
    pub fn new(tool: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool: tool.into(),
            arguments,
            target: None,
            rationale: String::new(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }
}

/// Failure taxonomy for a step. Every variant degrades into a failed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ToolNotFound,
    ToolBlocked,
    Validation,
    Execution,
    Timeout,
    PlannerParse,
}

/// Result of one execution attempt of a tool callable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed { error: String },
    TimedOut { timeout_ms: u64 },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

/// One attempt inside a step (the engine retries sequentially).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
}

/// One plan→execute cycle. Immutable once appended to a task's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub rationale: String,
    /// `None` when the planner produced no usable proposal.
    pub tool: Option<String>,
    pub arguments: Map<String, Value>,
    pub target: Option<String>,
    pub observation: String,
    pub status: StepStatus,
    pub failure: Option<FailureKind>,
    /// Start of the winning or final attempt.
    pub started_at: DateTime<Utc>,
    /// Duration of the winning or final attempt.
    pub duration_ms: u64,
    pub attempts: Vec<AttemptRecord>,
}

impl StepRecord {
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub fn tool_is(&self, name: &str) -> bool {
        self.tool.as_deref() == Some(name)
    }

    /// Wall-clock end of the winning or final attempt.
    pub fn ended_at(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::milliseconds(self.duration_ms as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_status_parses_case_insensitively() {
        assert_eq!("Success".parse::<FinalStatus>(), Ok(FinalStatus::Success));
        assert_eq!(" partial ".parse::<FinalStatus>(), Ok(FinalStatus::Partial));
        assert!("done".parse::<FinalStatus>().is_err());
    }

    #[test]
    fn termination_reason_serializes_with_kind_tag() {
        let reason = TerminationReason::IterationCapReached { max_iterations: 2 };
        let json = serde_json::to_value(&reason).expect("serialize");
        assert_eq!(json["kind"], "iteration_cap_reached");
        assert_eq!(json["max_iterations"], 2);
    }
}
