//! Stable exit codes for task-agent CLI commands.

/// Command succeeded or the run completed.
pub const OK: i32 = 0;
/// Command failed due to invalid config, snapshots or other errors.
pub const ERROR: i32 = 1;
/// The run is suspended waiting for input or approval.
pub const SUSPENDED: i32 = 2;
