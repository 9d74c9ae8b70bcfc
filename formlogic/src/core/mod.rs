//! Deterministic, pure logic for form evaluation.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod data;
pub mod engine;
pub mod environment;
pub mod invariants;
pub mod orchestrator;
pub mod path;
pub mod shim;
pub mod types;
