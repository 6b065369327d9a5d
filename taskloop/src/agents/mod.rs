//! Agent wrappers around external model backends.

pub mod planner;
