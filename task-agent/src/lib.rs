//! LLM task orchestration engine.
//!
//! A natural-language task becomes a tree of agents that issue shell
//! commands, builtin tool calls and sub-tasks through tags in their replies.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (tag parsing, safety evaluation,
//!   quota bookkeeping, compaction planning). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config and rule files, process
//!   execution, model subprocess, snapshot records, filesystem journal).
//!
//! Orchestration modules ([`agent`], [`executor`], [`runtime`], [`approval`],
//! [`snapshot`]) coordinate core logic with I/O to implement the CLI commands.

pub mod agent;
pub mod approval;
pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod runtime;
pub mod snapshot;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
