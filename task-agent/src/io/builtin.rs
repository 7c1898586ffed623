//! Builtin tools executed in-process: `read_file`, `smart_edit`, `get_job_log`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, warn};

use crate::core::builtin::{BuiltinCall, BuiltinTool, parse_builtin, tool_name};
use crate::io::config::state_dir;
use crate::io::shell::ProcessOutcome;

/// Hard cap on lines returned by one paged read.
pub const MAX_LINES_CAP: usize = 2000;

const UTF8_BOM: &str = "\u{feff}";

/// Log file of a background job.
pub fn job_log_path(workspace: &Path, job_id: &str) -> PathBuf {
    state_dir(workspace).join("jobs").join(format!("job_{job_id}.log"))
}

/// Parse and run a builtin command. Failures become a non-zero outcome.
pub fn run_builtin(command: &str, workspace: &Path) -> ProcessOutcome {
    let name = tool_name(command);
    let result = parse_builtin(command)
        .map_err(anyhow::Error::from)
        .and_then(|call| dispatch(&call, workspace));
    match result {
        Ok(text) => ProcessOutcome::success(format!("{name}: {text}")),
        Err(err) => {
            warn!(tool = %name, err = %format!("{err:#}"), "builtin failed");
            ProcessOutcome::failure(1, format!("{name}: {err:#}"))
        }
    }
}

fn dispatch(call: &BuiltinCall, workspace: &Path) -> Result<String> {
    debug!(tool = call.tool.name(), "running builtin");
    match call.tool {
        BuiltinTool::ReadFile => read_file(call, workspace),
        BuiltinTool::SmartEdit => smart_edit(call, workspace),
        BuiltinTool::GetJobLog => get_job_log(call, workspace),
    }
}

fn resolve(workspace: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw.trim());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn read_file(call: &BuiltinCall, workspace: &Path) -> Result<String> {
    let raw = call.arg("path").unwrap_or_default();
    let path = resolve(workspace, raw);
    if !path.is_file() {
        bail!("file not found: {}", path.display());
    }
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    page_lines(
        text.strip_prefix(UTF8_BOM).unwrap_or(&text),
        &path.display().to_string(),
        call.number("start_line")?,
        call.number("max_lines")?,
    )
}

fn get_job_log(call: &BuiltinCall, workspace: &Path) -> Result<String> {
    let job_id = call.arg("job_id").unwrap_or_default().trim();
    if !job_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        bail!("invalid job_id {job_id:?}");
    }
    let path = job_log_path(workspace, job_id);
    if !path.is_file() {
        bail!("no log for job {job_id}");
    }
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    page_lines(
        &String::from_utf8_lossy(&bytes),
        &format!("job {job_id}"),
        call.number("start_line")?,
        call.number("max_lines")?,
    )
}

/// Return lines `start_line..start_line + max_lines` (1-based) under a header
/// naming the range and whether more content follows.
fn page_lines(text: &str, label: &str, start_line: usize, max_lines: usize) -> Result<String> {
    if max_lines == 0 {
        bail!("max_lines must be > 0");
    }
    let start_line = start_line.max(1);
    let max_lines = max_lines.min(MAX_LINES_CAP);
    let lines: Vec<&str> = text.lines().collect();
    let total = lines.len();
    if total == 0 {
        return Ok(format!("{label} is empty"));
    }
    if start_line > total {
        bail!("start_line {start_line} is past the end of {label} ({total} lines)");
    }

    let end = (start_line - 1 + max_lines).min(total);
    let mut out = format!("{label} lines {start_line}-{end} of {total}");
    if end < total {
        out.push_str(&format!(
            " (more content: continue with start_line: {})",
            end + 1
        ));
    }
    out.push('\n');
    out.push_str(&lines[start_line - 1..end].join("\n"));
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditMode {
    Patch,
    Create,
    Append,
    Prepend,
}

impl EditMode {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "patch" => Ok(EditMode::Patch),
            "create" => Ok(EditMode::Create),
            "append" => Ok(EditMode::Append),
            "prepend" => Ok(EditMode::Prepend),
            other => Err(anyhow!(
                "unknown mode {other:?} (expected Patch, Create, Append or Prepend)"
            )),
        }
    }
}

/// Line-ending and BOM style of an existing file.
struct TextStyle {
    bom: bool,
    crlf: bool,
}

impl TextStyle {
    fn detect(text: &str) -> Self {
        Self {
            bom: text.starts_with(UTF8_BOM),
            crlf: text.contains("\r\n"),
        }
    }

    fn apply(&self, body: &str) -> String {
        let body = if self.crlf {
            body.replace('\n', "\r\n")
        } else {
            body.to_string()
        };
        if self.bom {
            format!("{UTF8_BOM}{body}")
        } else {
            body
        }
    }
}

fn to_lf(text: &str) -> String {
    text.replace("\r\n", "\n")
}

fn smart_edit(call: &BuiltinCall, workspace: &Path) -> Result<String> {
    let mode = EditMode::parse(call.arg("mode").unwrap_or("Patch"))?;
    let raw = call.arg("path").unwrap_or_default();
    let path = resolve(workspace, raw);
    let new_text = to_lf(call.arg("new_text").unwrap_or_default());

    let existing = if path.exists() {
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?
    } else if mode == EditMode::Patch {
        bail!("file not found: {}", path.display());
    } else {
        String::new()
    };
    let style = TextStyle::detect(&existing);
    let body = to_lf(existing.strip_prefix(UTF8_BOM).unwrap_or(&existing));

    let updated = match mode {
        EditMode::Create => return create_file(&path, &new_text),
        EditMode::Patch => {
            let old_text = to_lf(call.arg("old_text").unwrap_or_default());
            if old_text.is_empty() {
                bail!("Patch mode requires old_text");
            }
            match body.matches(old_text.as_str()).count() {
                0 => bail!("old_text not found in {}", path.display()),
                1 => body.replacen(old_text.as_str(), &new_text, 1),
                n => bail!(
                    "old_text matches {n} times in {}; include more surrounding lines",
                    path.display()
                ),
            }
        }
        EditMode::Append => {
            let mut out = body;
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&new_text);
            out
        }
        EditMode::Prepend => {
            let mut out = new_text.clone();
            if !body.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&body);
            out
        }
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let output = style.apply(&updated);
    fs::write(&path, &output).with_context(|| format!("write {}", path.display()))?;
    Ok(format!(
        "{mode:?} applied to {} ({} bytes)",
        path.display(),
        output.len()
    ))
}

fn create_file(path: &Path, body: &str) -> Result<String> {
    if path.exists() {
        bail!("{} already exists; use Patch to modify it", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(format!("created {} ({} bytes)", path.display(), body.len()))
}
