//! Stable exit codes for taskloop CLI commands.

use crate::core::types::FinalStatus;

/// Command succeeded, or the task finished with status `success`.
pub const OK: i32 = 0;
/// Invalid config/arguments or any other error.
pub const INVALID: i32 = 1;
/// The task ended with final status `failure`.
pub const TASK_FAILED: i32 = 2;
/// The task ended with final status `partial` (no explicit finish, cap or cancel).
pub const TASK_PARTIAL: i32 = 3;

pub fn for_final_status(status: FinalStatus) -> i32 {
    match status {
        FinalStatus::Success => OK,
        FinalStatus::Failure => TASK_FAILED,
        FinalStatus::Partial => TASK_PARTIAL,
    }
}
