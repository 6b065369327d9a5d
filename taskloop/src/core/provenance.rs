//! Provenance record construction.
//!
//! A provenance record is the write-once audit trail of a terminated task.
//! It is built from the task state alone and exposes no mutators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::routing::finish_arguments;
use crate::core::state::TaskState;
use crate::core::types::{FINISH_TOOL, FailureKind, FinalStatus, StepStatus, TerminationReason};

/// One audit entry per step record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceStep {
    pub index: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tool: Option<String>,
    pub arguments: Map<String, Value>,
    pub target: Option<String>,
    pub rationale: String,
    pub observation: String,
    pub status: StepStatus,
    pub failure: Option<FailureKind>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    task_id: String,
    prompt: String,
    final_status: FinalStatus,
    termination: Option<TerminationReason>,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    sub_goals: Vec<String>,
    steps: Vec<ProvenanceStep>,
}

impl ProvenanceRecord {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn final_status(&self) -> FinalStatus {
        self.final_status
    }

    pub fn termination(&self) -> Option<&TerminationReason> {
        self.termination.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub fn sub_goals(&self) -> &[String] {
        &self.sub_goals
    }

    pub fn steps(&self) -> &[ProvenanceStep] {
        &self.steps
    }
}

/// Final status from the last step record:
/// - `finish` → the status it carried
/// - failed → failure
/// - otherwise (including no steps) → partial
pub fn final_status(state: &TaskState) -> FinalStatus {
    match state.last_step() {
        Some(last) if last.tool_is(FINISH_TOOL) && last.is_success() => {
            finish_arguments(&last.arguments).0
        }
        Some(last) if !last.is_success() => FinalStatus::Failure,
        _ => FinalStatus::Partial,
    }
}

/// Build the audit record for a task, stamped with `completed_at`.
pub fn build_provenance(state: &TaskState, completed_at: DateTime<Utc>) -> ProvenanceRecord {
    let steps = state
        .history()
        .iter()
        .enumerate()
        .map(|(index, step)| ProvenanceStep {
            index,
            started_at: step.started_at,
            ended_at: step.ended_at(),
            duration_ms: step.duration_ms,
            tool: step.tool.clone(),
            arguments: step.arguments.clone(),
            target: step.target.clone(),
            rationale: step.rationale.clone(),
            observation: step.observation.clone(),
            status: step.status,
            failure: step.failure,
            attempts: step.attempts.len() as u32,
        })
        .collect();

    ProvenanceRecord {
        task_id: state.task_id().to_string(),
        prompt: state.prompt().to_string(),
        final_status: final_status(state),
        termination: state.termination().cloned(),
        started_at: state.created_at(),
        completed_at,
        sub_goals: state.sub_goals().to_vec(),
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::RuntimeConfig;
    use crate::test_support::{failure_record, finish_record, success_record};

    fn state() -> TaskState {
        TaskState::new("task-prov", "restart web", RuntimeConfig::default()).expect("state")
    }

    #[test]
    fn final_status_follows_finish_argument() {
        let mut s = state();
        s.push_step(success_record("restart", "ok")).expect("push");
        s.push_step(finish_record(FinalStatus::Failure, "gave up"))
            .expect("push");
        assert_eq!(final_status(&s), FinalStatus::Failure);
    }

    #[test]
    fn final_status_failure_when_last_step_failed() {
        let mut s = state();
        s.push_step(failure_record("restart", "boom")).expect("push");
        assert_eq!(final_status(&s), FinalStatus::Failure);
    }

    #[test]
    fn final_status_partial_without_finish() {
        let mut s = state();
        assert_eq!(final_status(&s), FinalStatus::Partial);
        s.push_step(success_record("restart", "ok")).expect("push");
        assert_eq!(final_status(&s), FinalStatus::Partial);
    }

    #[test]
    fn record_has_one_ordered_entry_per_step() {
        let mut s = state();
        s.push_step(success_record("a", "one")).expect("push");
        s.push_step(failure_record("b", "two")).expect("push");
        s.terminate(TerminationReason::IterationCapReached { max_iterations: 2 })
            .expect("terminate");

        let record = build_provenance(&s, Utc::now());
        assert_eq!(record.task_id(), "task-prov");
        assert_eq!(record.prompt(), "restart web");
        assert_eq!(record.steps().len(), 2);
        assert_eq!(record.steps()[0].index, 0);
        assert_eq!(record.steps()[0].observation, "one");
        assert_eq!(record.steps()[1].tool.as_deref(), Some("b"));
        assert_eq!(record.steps()[1].status, StepStatus::Failure);
        assert!(record.steps()[0].ended_at >= record.steps()[0].started_at);
        assert_eq!(
            record.termination(),
            Some(&TerminationReason::IterationCapReached { max_iterations: 2 })
        );
    }
}
