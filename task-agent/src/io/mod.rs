//! I/O helpers for the orchestration engine.

pub mod agents;
pub mod builtin;
pub mod config;
pub mod fs_snapshot;
pub mod init;
pub mod model;
pub mod process;
pub mod prompt;
pub mod safety_rules;
pub mod session_store;
pub mod shell;

use rand::{Rng, distributions::Alphanumeric};

/// Random 8-character lowercase id for agents and background jobs.
pub fn new_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(8)
        .collect::<String>()
        .to_lowercase()
}
