//! Semantic invariants of a task state that the type system does not enforce.

use crate::core::goals::clamp_index;
use crate::core::state::TaskState;
use crate::core::types::{FINISH_TOOL, StepStatus, TerminationReason};

/// Check invariants of a (possibly deserialized) task state:
/// - focus index within `[0, len(sub_goals) - 1]`, or `0` when empty
/// - no pending proposal once terminated
/// - a successful `finish` step is the last history entry
/// - history never exceeds the iteration cap
/// - attempt numbers are `1..=n` and a step's status matches its final attempt
pub fn validate_task_invariants(state: &TaskState) -> Vec<String> {
    let mut errors = Vec::new();
    let goals = state.sub_goals();
    let current = state.current_goal_index();

    if current != clamp_index(goals.len(), current) {
        errors.push(format!(
            "current goal index {} out of bounds for {} sub-goals",
            current,
            goals.len()
        ));
    }

    if state.is_terminated() && state.pending().is_some() {
        errors.push("pending proposal present after termination".to_string());
    }

    let history = state.history();
    if let Some(pos) = history
        .iter()
        .position(|step| step.tool_is(FINISH_TOOL) && step.is_success())
        && pos + 1 != history.len()
    {
        errors.push(format!(
            "step {} finished the task but {} step(s) follow it",
            pos,
            history.len() - pos - 1
        ));
    }

    let cap = state.config().max_iterations as usize;
    if history.len() > cap {
        errors.push(format!(
            "history has {} steps, exceeding iteration cap {}",
            history.len(),
            cap
        ));
    }

    if let Some(TerminationReason::IterationCapReached { max_iterations }) = state.termination()
        && history.len() < *max_iterations as usize
    {
        errors.push(format!(
            "terminated for iteration cap {} after only {} steps",
            max_iterations,
            history.len()
        ));
    }

    for (index, step) in history.iter().enumerate() {
        for (i, attempt) in step.attempts.iter().enumerate() {
            if attempt.attempt as usize != i + 1 {
                errors.push(format!(
                    "step {}: attempt {} recorded at position {}",
                    index,
                    attempt.attempt,
                    i + 1
                ));
            }
        }
        if let Some(last) = step.attempts.last() {
            let expected = if last.outcome.is_success() {
                StepStatus::Success
            } else {
                StepStatus::Failure
            };
            if step.status != expected {
                errors.push(format!(
                    "step {}: status {:?} disagrees with final attempt",
                    index, step.status
                ));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::RuntimeConfig;
    use crate::core::types::{AttemptOutcome, FinalStatus};
    use crate::test_support::{failure_record, finish_record, success_record};

    fn state_with_cap(cap: u32) -> TaskState {
        TaskState::new(
            "task-inv",
            "prompt",
            RuntimeConfig {
                max_iterations: cap,
                ..RuntimeConfig::default()
            },
        )
        .expect("state")
    }

    #[test]
    fn consistent_state_has_no_violations() {
        let mut state = state_with_cap(5);
        state.push_step(success_record("list_dir", "ok")).expect("push");
        state
            .push_step(finish_record(FinalStatus::Success, "done"))
            .expect("push");
        assert!(validate_task_invariants(&state).is_empty());
    }

    #[test]
    fn reports_steps_after_finish_and_status_mismatch() {
        let mut state = state_with_cap(5);
        state
            .push_step(finish_record(FinalStatus::Success, "done"))
            .expect("push");
        let mut bad = failure_record("list_dir", "boom");
        bad.attempts[0].outcome = AttemptOutcome::Success;
        state.push_step(bad).expect("push");

        let errors = validate_task_invariants(&state);
        assert!(errors.iter().any(|e| e.contains("finished the task")));
        assert!(errors.iter().any(|e| e.contains("disagrees with final attempt")));
    }

    #[test]
    fn reports_history_over_cap() {
        let mut state = state_with_cap(1);
        state.push_step(success_record("a", "ok")).expect("push");
        state.push_step(success_record("b", "ok")).expect("push");
        let errors = validate_task_invariants(&state);
        assert!(errors.iter().any(|e| e.contains("exceeding iteration cap")));
    }
}
