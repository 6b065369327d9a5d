//! Prompt/context builder for deterministic planner input.
//!
//! The message sequence is `system, user, history...` with the most recent
//! step last. When it exceeds the budget, older history collapses into one
//! synthetic note and, as a last resort, message bodies are truncated.
//! The builder holds no state between calls, so equal task states always
//! produce identical output.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::budget::{CharEstimator, LengthEstimator, MIN_PROMPT_BUDGET_TOKENS};
use crate::core::state::TaskState;
use crate::core::types::{FINISH_TOOL, StepRecord, StepStatus, UPDATE_GOALS_TOOL};
use crate::io::completion::Message;
use crate::io::registry::ToolEntry;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const USER_TEMPLATE: &str = include_str!("prompts/user.md");

pub const TRUNCATION_MARKER: &str = "\n[truncated]";

#[derive(Debug, Clone, Serialize)]
struct ToolContext {
    signature: String,
    description: String,
    tags: Vec<String>,
}

impl ToolContext {
    fn from_entry(entry: &ToolEntry) -> Self {
        let spec = entry.spec();
        Self {
            signature: spec.signature(),
            description: spec.description.clone(),
            tags: spec.tags.clone(),
        }
    }
}

/// Builds the planner's message sequence within a token budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    estimator: Arc<dyn LengthEstimator>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("load system prompt template")?;
        env.add_template("user", USER_TEMPLATE)
            .context("load user prompt template")?;
        Ok(Self {
            env,
            estimator: Arc::new(CharEstimator),
        })
    }

    /// Swap the length estimator (e.g. for an exact tokenizer).
    pub fn with_estimator(mut self, estimator: Arc<dyn LengthEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Estimated size of a message sequence.
    pub fn estimate(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| self.estimator.estimate_message(&m.content))
            .sum()
    }

    /// Build the message sequence for `state`, advertising `tools`.
    ///
    /// Uses the task's `prompt_budget_tokens` and keeps `history_keep` recent
    /// steps verbatim when compressing.
    /// Fails when the budget is below [`MIN_PROMPT_BUDGET_TOKENS`]; otherwise
    /// the estimate of the result never exceeds the budget.
    pub fn build(&self, state: &TaskState, tools: &[Arc<ToolEntry>]) -> Result<Vec<Message>> {
        let budget = state.config().prompt_budget_tokens;
        let keep = state.config().history_keep;
        if budget < MIN_PROMPT_BUDGET_TOKENS {
            bail!("prompt budget {budget} is below the minimum {MIN_PROMPT_BUDGET_TOKENS} tokens");
        }

        let system = Message::system(self.render_system(tools)?);
        let user = Message::user(self.render_user(state)?);
        let history: Vec<Message> = state
            .history()
            .iter()
            .enumerate()
            .map(|(index, step)| Message::user(render_step(index, step)))
            .collect();

        let mut messages = vec![system.clone(), user.clone()];
        messages.extend(history.iter().cloned());
        if self.estimate(&messages) <= budget {
            return Ok(messages);
        }

        let total = history.len();
        for kept in (0..=keep.min(total)).rev() {
            let candidate = compressed(&system, &user, &history, kept);
            if self.estimate(&candidate) <= budget {
                debug!(
                    omitted = total - kept,
                    kept,
                    budget,
                    "compressed planner history"
                );
                return Ok(candidate);
            }
        }

        let mut messages = compressed(&system, &user, &history, 0);
        self.truncate_to_budget(&mut messages, budget);
        debug!(
            budget,
            estimate = self.estimate(&messages),
            "truncated planner prompt"
        );
        Ok(messages)
    }

    fn render_system(&self, tools: &[Arc<ToolEntry>]) -> Result<String> {
        let has_finish = tools.iter().any(|t| t.name() == FINISH_TOOL);
        let has_update_goals = tools.iter().any(|t| t.name() == UPDATE_GOALS_TOOL);
        let tools: Vec<ToolContext> = tools.iter().map(|t| ToolContext::from_entry(t)).collect();
        let rendered = self.env.get_template("system")?.render(context! {
            tools => tools,
            has_finish => has_finish,
            has_update_goals => has_update_goals,
        })?;
        Ok(rendered.trim().to_string())
    }

    fn render_user(&self, state: &TaskState) -> Result<String> {
        let rendered = self.env.get_template("user")?.render(context! {
            prompt => state.prompt().trim(),
            sub_goals => state.sub_goals(),
            current_index => state.current_goal_index(),
            current_goal => state.current_sub_goal(),
        })?;
        Ok(rendered.trim().to_string())
    }

    /// Drop or shrink history, then shrink the system preamble, then the user
    /// turn, until the estimate fits. The user turn keeps a non-empty prefix
    /// whenever one fits beside its marker.
    fn truncate_to_budget(&self, messages: &mut Vec<Message>, budget: usize) {
        while messages.len() > 2 {
            let total = self.estimate(messages);
            if total <= budget {
                return;
            }
            let oldest = self.estimator.estimate_message(&messages[2].content);
            let target = oldest.saturating_sub(total - budget);
            let shrunk = self.truncate_message(&messages[2].content, target);
            if shrunk.is_empty() {
                messages.remove(2);
            } else {
                messages[2].content = shrunk;
            }
        }
        for idx in [0, 1] {
            let total = self.estimate(messages);
            if total <= budget {
                return;
            }
            let current = self.estimator.estimate_message(&messages[idx].content);
            let target = current.saturating_sub(total - budget);
            messages[idx].content = self.truncate_message(&messages[idx].content, target);
        }
    }

    /// Longest prefix of `content` plus the marker whose message estimate fits
    /// `max_tokens`. Empty when not even the marker fits.
    fn truncate_message(&self, content: &str, max_tokens: usize) -> String {
        if self.estimator.estimate_message(content) <= max_tokens {
            return content.to_string();
        }
        let chars: Vec<char> = content.chars().collect();
        let with_prefix = |n: usize| -> String {
            let mut out: String = chars[..n].iter().collect();
            out.push_str(TRUNCATION_MARKER);
            out
        };
        if self.estimator.estimate_message(&with_prefix(0)) > max_tokens {
            return String::new();
        }
        let (mut lo, mut hi) = (0usize, chars.len());
        while lo < hi {
            let mid = lo + (hi - lo).div_ceil(2);
            if self.estimator.estimate_message(&with_prefix(mid)) <= max_tokens {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        with_prefix(lo)
    }
}

fn compressed(system: &Message, user: &Message, history: &[Message], kept: usize) -> Vec<Message> {
    let omitted = history.len() - kept;
    let mut messages = vec![system.clone(), user.clone()];
    if omitted > 0 {
        messages.push(Message::user(format!("[{omitted} earlier steps omitted]")));
    }
    messages.extend(history[omitted..].iter().cloned());
    messages
}

fn render_step(index: usize, step: &StepRecord) -> String {
    let status = match (step.status, step.failure) {
        (StepStatus::Success, _) => "success".to_string(),
        (StepStatus::Failure, Some(kind)) => format!(
            "failure ({})",
            serde_json::to_value(kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default()
        ),
        (StepStatus::Failure, None) => "failure".to_string(),
    };
    let action = match &step.tool {
        Some(tool) => format!(
            "{tool} {}",
            serde_json::Value::Object(step.arguments.clone())
        ),
        None => "(no action)".to_string(),
    };
    let target = step
        .target
        .as_deref()
        .map(|t| format!(" on {t}"))
        .unwrap_or_default();
    let attempts = if step.attempts.len() > 1 {
        format!(" after {} attempts", step.attempts.len())
    } else {
        String::new()
    };
    format!(
        "[step {}] {action}{target} -> {status}{attempts}\n{}",
        index + 1,
        step.observation.trim()
    )
}
