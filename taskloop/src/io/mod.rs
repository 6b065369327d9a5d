//! Side-effecting collaborators of the task loop.

pub mod completion;
pub mod config;
pub mod engine;
pub mod plugins;
pub mod process;
pub mod prompt;
pub mod provenance_store;
pub mod registry;
pub mod tool;
pub mod validation;
