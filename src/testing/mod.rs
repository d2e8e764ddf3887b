//! Testing utilities and fixtures
//!
//! Deterministic memory probes and keyed row fixtures shared by unit tests,
//! integration tests and benchmarks.

pub mod probes;
pub mod rows;

pub use probes::{FixedProbe, ScriptedProbe, SharedProbe};
pub use rows::{keyed_rows, sum_reducer, TestRow};
