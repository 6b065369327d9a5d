//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod goals;
pub mod invariants;
pub mod proposal;
pub mod provenance;
pub mod routing;
pub mod state;
pub mod types;
