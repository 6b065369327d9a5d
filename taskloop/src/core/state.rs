//! Task State: the single mutable record threaded through every cycle.
//!
//! Fields are private so the invariants hold by construction:
//! - `steps_taken()` is derived from the history length.
//! - history is append-only and closed once a termination reason is set.
//! - the termination reason is set at most once.
//! - the focus index is always clamped into the sub-goal bounds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::goals::{GoalSnapshot, GoalStack, clamp_index};
use crate::core::invariants::validate_task_invariants;
use crate::core::types::{ActionProposal, StepRecord, TerminationReason};

/// Per-task runtime configuration, fixed at task creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub max_iterations: u32,
    pub context_window_tokens: usize,
    /// Budget for planner input (a fraction of the context window).
    pub prompt_budget_tokens: usize,
    /// History entries kept verbatim when the prompt is compressed.
    pub history_keep: usize,
    pub safe_mode: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            context_window_tokens: 8192,
            prompt_budget_tokens: 6553,
            history_keep: 3,
            safe_mode: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid task id '{id}': {reason}")]
    InvalidTaskId { id: String, reason: String },
    #[error("task {task_id} is terminated ({reason}); history is closed")]
    Terminated { task_id: String, reason: String },
    #[error("task {task_id} already has a termination reason ({existing})")]
    AlreadyTerminated { task_id: String, existing: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    task_id: String,
    prompt: String,
    created_at: DateTime<Utc>,
    history: Vec<StepRecord>,
    sub_goals: Vec<String>,
    current_goal: usize,
    termination: Option<TerminationReason>,
    config: RuntimeConfig,
    pending: Option<ActionProposal>,
    plan_error: Option<String>,
}

impl TaskState {
    /// Create a task with an explicit identifier.
    pub fn new(
        task_id: impl Into<String>,
        prompt: impl Into<String>,
        config: RuntimeConfig,
    ) -> Result<Self, StateError> {
        let task_id = task_id.into();
        validate_task_id(&task_id)?;
        Ok(Self {
            task_id,
            prompt: prompt.into(),
            created_at: Utc::now(),
            history: Vec::new(),
            sub_goals: Vec::new(),
            current_goal: 0,
            termination: None,
            config,
            pending: None,
            plan_error: None,
        })
    }

    /// Create a task with a fresh `task-<uuid>` identifier.
    pub fn with_generated_id(prompt: impl Into<String>, config: RuntimeConfig) -> Self {
        Self {
            task_id: format!("task-{}", uuid::Uuid::new_v4()),
            prompt: prompt.into(),
            created_at: Utc::now(),
            history: Vec::new(),
            sub_goals: Vec::new(),
            current_goal: 0,
            termination: None,
            config,
            pending: None,
            plan_error: None,
        }
    }

    /// Seed the sub-goal list (builder style, used at task creation).
    pub fn with_sub_goals(mut self, sub_goals: Vec<String>) -> Self {
        self.set_goal_stack(GoalStack::new(sub_goals, 0));
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn history(&self) -> &[StepRecord] {
        &self.history
    }

    pub fn steps_taken(&self) -> usize {
        self.history.len()
    }

    pub fn last_step(&self) -> Option<&StepRecord> {
        self.history.last()
    }

    pub fn termination(&self) -> Option<&TerminationReason> {
        self.termination.as_ref()
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_some()
    }

    pub fn sub_goals(&self) -> &[String] {
        &self.sub_goals
    }

    pub fn current_goal_index(&self) -> usize {
        self.current_goal
    }

    pub fn current_sub_goal(&self) -> Option<&str> {
        self.sub_goals.get(self.current_goal).map(String::as_str)
    }

    pub fn goal_stack(&self) -> GoalStack {
        GoalStack::new(self.sub_goals.clone(), self.current_goal)
    }

    pub fn goal_snapshot(&self) -> GoalSnapshot {
        GoalSnapshot {
            goal: self.prompt.clone(),
            sub_goals: self.sub_goals.clone(),
            current_index: self.current_goal,
        }
    }

    /// Replace the sub-goal stack with the result of a goal operation.
    pub fn set_goal_stack(&mut self, stack: GoalStack) {
        self.current_goal = clamp_index(stack.goals.len(), stack.current);
        self.sub_goals = stack.goals;
    }

    pub fn pending(&self) -> Option<&ActionProposal> {
        self.pending.as_ref()
    }

    pub fn set_pending(&mut self, proposal: Option<ActionProposal>) {
        self.pending = proposal;
    }

    /// Consume the pending proposal (cleared once consumed).
    pub fn take_pending(&mut self) -> Option<ActionProposal> {
        self.pending.take()
    }

    pub fn plan_error(&self) -> Option<&str> {
        self.plan_error.as_deref()
    }

    pub fn set_plan_error(&mut self, error: Option<String>) {
        self.plan_error = error;
    }

    pub fn take_plan_error(&mut self) -> Option<String> {
        self.plan_error.take()
    }

    /// Append a step record. Refused once the task is terminated.
    pub fn push_step(&mut self, record: StepRecord) -> Result<(), StateError> {
        if let Some(reason) = &self.termination {
            return Err(StateError::Terminated {
                task_id: self.task_id.clone(),
                reason: reason.to_string(),
            });
        }
        self.history.push(record);
        Ok(())
    }

    /// Set the termination reason. Succeeds exactly once.
    pub fn terminate(&mut self, reason: TerminationReason) -> Result<(), StateError> {
        if let Some(existing) = &self.termination {
            return Err(StateError::AlreadyTerminated {
                task_id: self.task_id.clone(),
                existing: existing.to_string(),
            });
        }
        self.termination = Some(reason);
        self.pending = None;
        Ok(())
    }

    /// Semantic invariant violations (empty when the state is consistent).
    pub fn check_invariants(&self) -> Vec<String> {
        validate_task_invariants(self)
    }
}

/// Validate that an id is safe to use as a file name in the audit directory.
pub fn validate_task_id(id: &str) -> Result<(), StateError> {
    let invalid = |reason: &str| StateError::InvalidTaskId {
        id: id.to_string(),
        reason: reason.to_string(),
    };
    if id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if id.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(invalid("must be [A-Za-z0-9._-] only"));
    }
    Ok(())
}
