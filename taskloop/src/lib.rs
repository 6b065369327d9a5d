//! Autonomous task-execution engine.
//!
//! A task is driven through `plan → execute → route` cycles until the planner
//! calls `finish`, the iteration cap is reached, or the task is cancelled.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (task state, goal stack, routing,
//!   proposal parsing, provenance). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (tool registry and execution,
//!   prompt templates, completion backends, config and audit files).
//!
//! [`task_loop`] wires planner, engine and routing together.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod task_loop;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
