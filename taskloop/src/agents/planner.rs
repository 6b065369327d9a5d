//! Planner agent: one completion per cycle, parsed into a pending proposal.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::proposal::{ParseOutcome, parse_proposal};
use crate::core::state::TaskState;
use crate::io::completion::{CompletionRequest, CompletionService};
use crate::io::prompt::PromptBuilder;
use crate::io::registry::ToolEntry;

/// Result of one planning call, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// A proposal is pending for the named tool.
    Proposed { tool: String },
    /// No proposal; the reason is kept as the task's plan error.
    Unusable { reason: String },
}

/// Planner wrapper that owns the completion backend and prompt builder.
pub struct PlannerAgent {
    completion: Arc<dyn CompletionService>,
    prompts: PromptBuilder,
}

impl PlannerAgent {
    pub fn new(completion: Arc<dyn CompletionService>) -> Result<Self> {
        Ok(Self {
            completion,
            prompts: PromptBuilder::new()?,
        })
    }

    pub fn with_prompt_builder(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn prompts(&self) -> &PromptBuilder {
        &self.prompts
    }

    /// Ask the model for the next action and store it as the pending proposal.
    ///
    /// Never fails: prompt, service and parse errors all clear the proposal and
    /// leave a plan error for the execution step to record.
    #[instrument(skip_all, fields(task_id = %state.task_id(), step = state.steps_taken() + 1))]
    pub async fn plan(&self, state: &mut TaskState, tools: &[Arc<ToolEntry>]) -> PlanOutcome {
        state.set_pending(None);
        state.set_plan_error(None);

        let completion = match self.prompts.build(state, tools) {
            Ok(messages) => {
                debug!(
                    messages = messages.len(),
                    estimate = self.prompts.estimate(&messages),
                    "planner prompt built"
                );
                self.completion
                    .complete(&CompletionRequest::new(messages))
                    .await
            }
            Err(err) => Err(err.context("build planner prompt")),
        };

        let outcome = match completion {
            Ok(text) => parse_proposal(&text),
            Err(err) => ParseOutcome::Invalid {
                reason: format!("completion failed: {err:#}"),
            },
        };

        match outcome {
            ParseOutcome::Proposal(proposal) => {
                debug!(tool = %proposal.tool, "planner proposed action");
                let tool = proposal.tool.clone();
                state.set_pending(Some(proposal));
                PlanOutcome::Proposed { tool }
            }
            ParseOutcome::Invalid { reason } => {
                warn!(reason = %reason, "planner output unusable");
                state.set_plan_error(Some(reason.clone()));
                PlanOutcome::Unusable { reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::RuntimeConfig;
    use crate::io::registry::ToolRegistry;
    use crate::test_support::ScriptedCompletion;

    fn state() -> TaskState {
        TaskState::new("task-plan", "list files", RuntimeConfig::default()).expect("state")
    }

    #[tokio::test]
    async fn valid_completion_sets_pending() {
        let completion = Arc::new(ScriptedCompletion::new(vec![Ok(
            r#"{"tool":"list_dir","arguments":{"path":"/tmp"}}"#.to_string(),
        )]));
        let planner = PlannerAgent::new(completion.clone()).expect("planner");
        let tools = ToolRegistry::with_intrinsics().describe(true);
        let mut s = state();

        let outcome = planner.plan(&mut s, &tools).await;
        assert_eq!(
            outcome,
            PlanOutcome::Proposed {
                tool: "list_dir".to_string()
            }
        );
        assert_eq!(s.pending().expect("pending").tool, "list_dir");
        assert!(s.plan_error().is_none());
        completion.assert_drained();
        assert_eq!(completion.requests().len(), 1);
    }

    #[tokio::test]
    async fn garbage_completion_clears_pending() {
        let completion = Arc::new(ScriptedCompletion::new(vec![Ok(
            "I would list the files".to_string(),
        )]));
        let planner = PlannerAgent::new(completion).expect("planner");
        let mut s = state();
        s.set_pending(Some(crate::test_support::proposal(
            "stale",
            serde_json::json!({}),
        )));

        let outcome = planner.plan(&mut s, &[]).await;
        assert!(matches!(outcome, PlanOutcome::Unusable { .. }));
        assert!(s.pending().is_none());
        assert!(s.plan_error().is_some());
    }

    #[tokio::test]
    async fn service_error_is_not_raised() {
        let completion = Arc::new(ScriptedCompletion::new(vec![Err(
            "connection refused".to_string(),
        )]));
        let planner = PlannerAgent::new(completion).expect("planner");
        let mut s = state();

        let outcome = planner.plan(&mut s, &[]).await;
        match outcome {
            PlanOutcome::Unusable { reason } => assert!(reason.contains("connection refused")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
