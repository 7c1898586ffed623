//! Command runtime: workspace wrapping, timeout resolution and result folding.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::core::types::{CommandSpec, ToolKind};
use crate::io::shell::{ProcessExecutor, ProcessRequest};

/// Session-level settings a command runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub workspace: PathBuf,
    pub default_timeout: Duration,
}

/// Outcome of one command, with the summary folded into history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExecutionResult {
    /// Command line as handed to the process executor.
    pub executed_command: String,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.returncode == 0
    }

    /// Human-readable summary used verbatim in conversation history.
    pub fn summary(&self) -> String {
        if self.succeeded() {
            if self.stdout.trim().is_empty() {
                "success (no output)".to_string()
            } else {
                format!("success, output:\n{}", self.stdout.trim_end())
            }
        } else {
            let detail = if self.stderr.trim().is_empty() {
                &self.stdout
            } else {
                &self.stderr
            };
            format!("failed (exit {}):\n{}", self.returncode, detail.trim_end())
        }
    }
}

/// Quote a path for a bash command line.
fn bash_quote(path: &str) -> String {
    shlex::try_quote(path)
        .map(|quoted| quoted.into_owned())
        .unwrap_or_else(|_| format!("'{}'", path.replace('\'', r"'\''")))
}

/// Turn a spec into the command line to execute: shell commands get a
/// directory change into the workspace, builtins stay as written.
pub fn prepare(spec: &CommandSpec, workspace: &Path) -> String {
    let dir = workspace.to_string_lossy();
    if dir.is_empty() {
        return spec.command.clone();
    }
    match spec.tool {
        ToolKind::Builtin => spec.command.clone(),
        ToolKind::Bash => format!("cd {} && {}", bash_quote(&dir), spec.command),
        ToolKind::PowerShell => format!(
            "Set-Location -LiteralPath '{}'; {}",
            dir.replace('\'', "''"),
            spec.command
        ),
    }
}

/// Run one command through the process executor.
pub fn execute<P: ProcessExecutor + ?Sized>(
    spec: &CommandSpec,
    ctx: &ExecutionContext,
    process: &P,
) -> CommandExecutionResult {
    let timeout = spec
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(ctx.default_timeout);
    let command_line = prepare(spec, &ctx.workspace);
    debug!(tool = ?spec.tool, timeout_secs = timeout.as_secs(), "executing command");

    let outcome = process.run(&ProcessRequest {
        command_line: command_line.clone(),
        tool: spec.tool,
        timeout,
        background: spec.background,
        workspace: ctx.workspace.clone(),
    });
    info!(tool = ?spec.tool, exit_code = outcome.exit_code, "command finished");

    CommandExecutionResult {
        executed_command: command_line,
        returncode: outcome.exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
    }
}

/// History message for a command result (`id` is `executed` or `rejected`).
pub fn result_message(tool: ToolKind, id: &str, body: &str) -> String {
    let tag = format!("{}_result", tool.tag());
    format!("<{tag} id=\"{id}\">\n{body}\n</{tag}>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingProcess;
    use crate::io::shell::ProcessOutcome;

    #[test]
    fn bash_commands_are_wrapped_with_a_quoted_cd() {
        let spec = CommandSpec::new(ToolKind::Bash, "ls -la");
        assert_eq!(
            prepare(&spec, Path::new("/work/my dir")),
            "cd '/work/my dir' && ls -la"
        );
        assert_eq!(prepare(&spec, Path::new("/work")), "cd /work && ls -la");
    }

    #[test]
    fn powershell_commands_use_set_location() {
        let spec = CommandSpec::new(ToolKind::PowerShell, "Get-ChildItem");
        assert_eq!(
            prepare(&spec, Path::new("C:/it's")),
            "Set-Location -LiteralPath 'C:/it''s'; Get-ChildItem"
        );
    }

    #[test]
    fn builtins_and_empty_workspaces_are_untouched() {
        let builtin = CommandSpec::new(ToolKind::Builtin, "builtin.read_file\npath: a");
        assert_eq!(prepare(&builtin, Path::new("/work")), builtin.command);
        let bash = CommandSpec::new(ToolKind::Bash, "pwd");
        assert_eq!(prepare(&bash, Path::new("")), "pwd");
    }

    #[test]
    fn execute_resolves_timeout_and_summarizes() {
        let process = RecordingProcess::new();
        process.push(ProcessOutcome::success("a\nb\n"));
        process.push(ProcessOutcome::failure(2, "boom\n"));
        let ctx = ExecutionContext {
            workspace: PathBuf::from("/work"),
            default_timeout: Duration::from_secs(300),
        };

        let mut spec = CommandSpec::new(ToolKind::Bash, "ls");
        spec.timeout = Some(5);
        let ok = execute(&spec, &ctx, &process);
        assert_eq!(ok.summary(), "success, output:\na\nb");

        let failed = execute(&CommandSpec::new(ToolKind::Bash, "false"), &ctx, &process);
        assert_eq!(failed.summary(), "failed (exit 2):\nboom");

        let requests = process.requests();
        assert_eq!(requests[0].timeout, Duration::from_secs(5));
        assert_eq!(requests[1].timeout, Duration::from_secs(300));
        assert_eq!(requests[0].command_line, "cd /work && ls");
        process.assert_drained();
    }

    #[test]
    fn empty_output_and_result_tags() {
        let result = CommandExecutionResult {
            executed_command: "true".to_string(),
            returncode: 0,
            stdout: "  \n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(result.summary(), "success (no output)");
        assert_eq!(
            result_message(ToolKind::Bash, "executed", "success (no output)"),
            "<bash_call_result id=\"executed\">\nsuccess (no output)\n</bash_call_result>"
        );
    }
}
