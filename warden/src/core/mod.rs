//! Deterministic, pure logic shared by the orchestration modules.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values and return deterministic outputs suitable for tests.

pub mod budget;
pub mod outcome;
pub mod status;
pub mod types;
