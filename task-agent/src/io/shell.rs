//! OS process execution for prepared command lines.
//!
//! The [`ProcessExecutor`] trait decouples the runtime from real process
//! spawning. Tests use a recording executor that returns scripted outcomes.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::ToolKind;
use crate::io::builtin::{job_log_path, run_builtin};
use crate::io::new_short_id;
use crate::io::process::run_command_with_timeout;

/// A fully prepared command ready to hand to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    /// Command line after working-directory wrapping.
    pub command_line: String,
    pub tool: ToolKind,
    pub timeout: Duration,
    pub background: bool,
    pub workspace: PathBuf,
}

/// Result of running a process. Failures are values, never errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutcome {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Self::default()
        }
    }
}

/// Abstraction over process execution backends.
pub trait ProcessExecutor {
    /// Run the request to completion (or detach it when `background`).
    /// Must enforce `request.timeout` and never panic or error.
    fn run(&self, request: &ProcessRequest) -> ProcessOutcome;
}

/// Executor that spawns `bash` / `pwsh` and runs builtins in-process.
#[derive(Debug, Clone)]
pub struct SystemProcessExecutor {
    output_limit_bytes: usize,
}

impl SystemProcessExecutor {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self { output_limit_bytes }
    }
}

fn powershell_program() -> &'static str {
    if cfg!(windows) { "powershell" } else { "pwsh" }
}

/// Build the interpreter invocation for a shell command line.
pub fn shell_command(tool: ToolKind, command_line: &str) -> Command {
    match tool {
        ToolKind::PowerShell => {
            let mut cmd = Command::new(powershell_program());
            cmd.args(["-NoProfile", "-NonInteractive", "-Command", command_line]);
            cmd
        }
        _ => {
            let mut cmd = Command::new("bash");
            cmd.arg("-c").arg(command_line);
            cmd
        }
    }
}

impl ProcessExecutor for SystemProcessExecutor {
    #[instrument(skip_all, fields(tool = ?request.tool, background = request.background))]
    fn run(&self, request: &ProcessRequest) -> ProcessOutcome {
        if request.tool == ToolKind::Builtin {
            return run_builtin(&request.command_line, &request.workspace);
        }
        if request.background {
            return match spawn_background(request) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "failed to start background job");
                    ProcessOutcome::failure(-1, format!("failed to start background job: {err:#}"))
                }
            };
        }

        let cmd = shell_command(request.tool, &request.command_line);
        match run_command_with_timeout(cmd, None, request.timeout, self.output_limit_bytes) {
            Ok(output) => {
                let mut stderr = output.stderr_text();
                if output.timed_out {
                    stderr.push_str(&format!(
                        "\n[timed out after {}s]",
                        request.timeout.as_secs()
                    ));
                }
                ProcessOutcome {
                    exit_code: output.exit_code(),
                    stdout: output.stdout_text(),
                    stderr,
                    timed_out: output.timed_out,
                }
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "command could not run");
                ProcessOutcome::failure(-1, format!("{err:#}"))
            }
        }
    }
}

/// Start a detached job whose output goes to its log file.
fn spawn_background(request: &ProcessRequest) -> Result<ProcessOutcome> {
    let job_id = new_short_id();
    let log_path = job_log_path(&request.workspace, &job_id);
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open {}", log_path.display()))?;
    let log_err = log.try_clone().context("clone job log handle")?;

    let mut cmd = shell_command(request.tool, &request.command_line);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    let child = cmd.spawn().context("spawn background job")?;
    info!(job_id = %job_id, pid = child.id(), "background job started");

    Ok(ProcessOutcome::success(format!(
        "started background job {job_id}\nlog: {}\nread it with builtin.get_job_log (job_id: {job_id})",
        log_path.display()
    )))
}
