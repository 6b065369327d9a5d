//! Termination state machine.
//!
//! `PLANNING → EXECUTING → ROUTING → {PLANNING | TERMINATED}`. The routing
//! decision is a pure, total function of the task state.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::state::TaskState;
use crate::core::types::{FINISH_TOOL, FinalStatus, TerminationReason};

/// Loop phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planning,
    Executing,
    Routing,
    Terminated,
}

impl Phase {
    /// The phase that follows `self` given a routing decision.
    ///
    /// The decision only matters when leaving `Routing`.
    pub fn next(self, route: &Route) -> Phase {
        match self {
            Phase::Planning => Phase::Executing,
            Phase::Executing => Phase::Routing,
            Phase::Routing => match route {
                Route::Continue | Route::Replan => Phase::Planning,
                Route::Stop(_) => Phase::Terminated,
            },
            Phase::Terminated => Phase::Terminated,
        }
    }
}

/// Decision emitted after each cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Last step succeeded; plan the next action.
    Continue,
    /// Last step failed (tool error or unusable planner output); plan again.
    Replan,
    /// Stop with the given reason.
    Stop(TerminationReason),
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Continue => "continue",
            Route::Replan => "replan",
            Route::Stop(_) => "stop",
        }
    }
}

/// Decide the next move. Rules in priority order:
/// 1. termination reason already set → stop with it
/// 2. last step is a successful `finish` → stop with the reason it carries
/// 3. `steps_taken >= max_iterations` → stop with capacity exceeded
/// 4. otherwise continue (or replan when the last step failed)
pub fn route(state: &TaskState) -> Route {
    if let Some(reason) = state.termination() {
        return Route::Stop(reason.clone());
    }

    if let Some(last) = state.last_step()
        && last.tool_is(FINISH_TOOL)
        && last.is_success()
    {
        let (status, reason) = finish_arguments(&last.arguments);
        return Route::Stop(TerminationReason::Finished { status, reason });
    }

    let cap = state.config().max_iterations;
    if state.steps_taken() >= cap as usize {
        return Route::Stop(TerminationReason::IterationCapReached {
            max_iterations: cap,
        });
    }

    match state.last_step() {
        Some(last) if !last.is_success() => Route::Replan,
        _ => Route::Continue,
    }
}

/// Extract `(status, reason)` from `finish` arguments.
///
/// Unknown or missing status reads as `partial`.
pub fn finish_arguments(arguments: &Map<String, Value>) -> (FinalStatus, String) {
    let status = arguments
        .get("status")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(FinalStatus::Partial);
    let reason = arguments
        .get("reason")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("finished")
        .to_string();
    (status, reason)
}
