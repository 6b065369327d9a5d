//! Task loop driver: plan → execute → route until terminated.
//!
//! Each responsibility is an independently callable step taking and returning
//! the task state, so an external orchestrator can wire them itself. [`TaskRunner::run`]
//! is the built-in wiring.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::agents::planner::{PlanOutcome, PlannerAgent};
use crate::core::provenance::{ProvenanceRecord, build_provenance};
use crate::core::routing::{Phase, Route, route};
use crate::core::state::{StateError, TaskState};
use crate::core::types::TerminationReason;
use crate::io::completion::CompletionService;
use crate::io::engine::ExecutionEngine;
use crate::io::registry::ToolRegistry;

/// A terminated task and its audit record.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub state: TaskState,
    pub provenance: ProvenanceRecord,
}

pub struct TaskRunner {
    planner: PlannerAgent,
    engine: ExecutionEngine,
}

impl TaskRunner {
    pub fn new(registry: Arc<ToolRegistry>, completion: Arc<dyn CompletionService>) -> Result<Self> {
        Ok(Self {
            planner: PlannerAgent::new(completion)?,
            engine: ExecutionEngine::new(registry),
        })
    }

    pub fn with_planner(mut self, planner: PlannerAgent) -> Self {
        self.planner = planner;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.engine.registry()
    }

    /// Planning step: one completion call; the proposal (or plan error) lands in the state.
    pub async fn plan(&self, mut state: TaskState) -> (TaskState, PlanOutcome) {
        let tools = self.registry().describe(state.config().safe_mode);
        let outcome = self.planner.plan(&mut state, &tools).await;
        (state, outcome)
    }

    /// Execution step: appends exactly one step record.
    pub async fn execute(&self, mut state: TaskState) -> Result<TaskState, StateError> {
        self.engine.execute(&mut state).await?;
        Ok(state)
    }

    /// Routing step: decide the next move and record termination on stop.
    pub fn route(&self, mut state: TaskState) -> Result<(TaskState, Route), StateError> {
        let decision = route(&state);
        debug!(task_id = %state.task_id(), route = decision.as_str(), "routing decision");
        if let Route::Stop(reason) = &decision
            && !state.is_terminated()
        {
            state.terminate(reason.clone())?;
            info!(task_id = %state.task_id(), reason = %reason, "task terminated");
        }
        Ok((state, decision))
    }

    /// Summarization step: the audit record of a terminated task.
    pub fn summarize(&self, state: &TaskState) -> ProvenanceRecord {
        build_provenance(state, Utc::now())
    }

    /// Drive the task to termination.
    ///
    /// `cancel` is only observed at the loop boundary, before a new planning
    /// cycle, so an in-flight tool call always completes.
    #[instrument(skip_all, fields(task_id = %state.task_id()))]
    pub async fn run(&self, mut state: TaskState, cancel: &CancellationToken) -> Result<TaskRun> {
        let mut phase = Phase::Routing;
        loop {
            let (next, decision) = self.route(state)?;
            state = next;
            phase = phase.next(&decision);
            if phase == Phase::Terminated {
                break;
            }

            if cancel.is_cancelled() {
                state.terminate(TerminationReason::Cancelled)?;
                info!(task_id = %state.task_id(), "task cancelled");
                break;
            }

            let (next, _) = self.plan(state).await;
            phase = phase.next(&decision);
            state = self.execute(next).await?;
            phase = phase.next(&decision);
            debug!(steps = state.steps_taken(), ?phase, "cycle complete");
        }

        let provenance = self.summarize(&state);
        Ok(TaskRun { state, provenance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budget::{CharEstimator, LengthEstimator};
    use crate::core::state::RuntimeConfig;
    use crate::core::types::FinalStatus;
    use crate::io::prompt::PromptBuilder;
    use crate::test_support::ScriptedCompletion;

    fn runner(completions: Vec<Result<String, String>>) -> (TaskRunner, Arc<ScriptedCompletion>) {
        let completion = Arc::new(ScriptedCompletion::new(completions));
        let runner = TaskRunner::new(
            Arc::new(ToolRegistry::with_intrinsics()),
            completion.clone(),
        )
        .expect("runner");
        (runner, completion)
    }

    fn state(cap: u32) -> TaskState {
        TaskState::new(
            "task-loop",
            "say hi",
            RuntimeConfig {
                max_iterations: cap,
                ..RuntimeConfig::default()
            },
        )
        .expect("state")
    }

    #[tokio::test]
    async fn finish_terminates_with_its_status() {
        let (runner, completion) = runner(vec![Ok(
            r#"{"tool":"finish","arguments":{"status":"success","reason":"said hi"}}"#.to_string(),
        )]);
        let run = runner
            .run(state(5), &CancellationToken::new())
            .await
            .expect("run");
        completion.assert_drained();
        assert_eq!(run.state.steps_taken(), 1);
        assert_eq!(
            run.state.termination(),
            Some(&TerminationReason::Finished {
                status: FinalStatus::Success,
                reason: "said hi".to_string(),
            })
        );
        assert_eq!(run.provenance.final_status(), FinalStatus::Success);
        assert!(run.state.check_invariants().is_empty());
    }

    #[tokio::test]
    async fn pre_cancelled_task_never_plans() {
        let (runner, completion) = runner(Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = runner.run(state(5), &cancel).await.expect("run");
        assert_eq!(run.state.termination(), Some(&TerminationReason::Cancelled));
        assert_eq!(run.state.steps_taken(), 0);
        assert!(completion.requests().is_empty());
        assert_eq!(run.provenance.final_status(), FinalStatus::Partial);
    }

    #[tokio::test]
    async fn steps_compose_manually() {
        let (runner, _completion) = runner(vec![Ok(
            r#"{"tool":"update_goals","arguments":{"op":"insert","items":["check"]}}"#.to_string(),
        )]);
        let (s, outcome) = runner.plan(state(3)).await;
        assert!(matches!(outcome, PlanOutcome::Proposed { .. }));
        let s = runner.execute(s).await.expect("execute");
        assert_eq!(s.sub_goals(), ["check".to_string()]);
        let (s, decision) = runner.route(s).expect("route");
        assert_eq!(decision, Route::Continue);
        assert!(!s.is_terminated());
    }

    struct WordCount;

    impl LengthEstimator for WordCount {
        fn estimate(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    #[tokio::test]
    async fn planner_prompts_use_the_injected_estimator() {
        let completion = Arc::new(ScriptedCompletion::new(vec![Ok(
            r#"{"tool":"finish","arguments":{"status":"partial","reason":"too long"}}"#.to_string(),
        )]));
        let prompts = PromptBuilder::new()
            .expect("prompts")
            .with_estimator(Arc::new(WordCount));
        let planner = PlannerAgent::new(completion.clone())
            .expect("planner")
            .with_prompt_builder(prompts);
        let runner = TaskRunner::new(Arc::new(ToolRegistry::with_intrinsics()), completion.clone())
            .expect("runner")
            .with_planner(planner);

        let budget = 40;
        let state = TaskState::new(
            "task-words",
            "word ".repeat(200),
            RuntimeConfig {
                prompt_budget_tokens: budget,
                ..RuntimeConfig::default()
            },
        )
        .expect("state");
        let run = runner
            .run(state, &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(run.provenance.final_status(), FinalStatus::Partial);

        let requests = completion.requests();
        assert_eq!(requests.len(), 1);
        let messages = &requests[0].messages;
        let by_words: usize = messages
            .iter()
            .map(|m| WordCount.estimate_message(&m.content))
            .sum();
        let by_chars: usize = messages
            .iter()
            .map(|m| CharEstimator.estimate_message(&m.content))
            .sum();
        assert!(by_words <= budget);
        assert!(by_chars > budget);
        assert!(messages[1].content.starts_with("<task>"));
    }
}
