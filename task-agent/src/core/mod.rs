//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod builtin;
pub mod compaction;
pub mod path;
pub mod quota;
pub mod safety;
pub mod shell;
pub mod tags;
pub mod types;
