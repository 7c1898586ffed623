//! Engine configuration stored under `.task-agent/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::compaction::CompactionPolicy;

/// Directory under the workspace root that holds config, rules, jobs and
/// snapshots. It is never captured by filesystem snapshots.
pub const STATE_DIR: &str = ".task-agent";
pub const CONFIG_FILE: &str = "config.toml";
pub const SAFETY_RULES_FILE: &str = "safety_rules.toml";
pub const AGENTS_DIR: &str = "agents";

/// Engine configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Deepest allowed agent depth; the sub-task quota is `max_depth²`.
    pub max_depth: u32,

    /// Default shell command timeout in seconds.
    pub command_timeout_secs: u64,

    /// Truncate captured command stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    pub max_output_tokens: u32,

    /// Extra attempts after a failed model call.
    pub model_retries: u32,

    /// Workspace commands are confined to. Defaults to the process cwd.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,

    pub compaction: CompactionPolicy,
    pub model: ModelConfig,
    pub snapshots: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Command that answers chat requests (JSON on stdin, JSON on stdout).
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: vec!["task-agent-model".to_string()],
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Capture the workspace alongside every snapshot record.
    pub enabled: bool,
    /// File or directory names skipped by filesystem snapshots.
    pub exclude: Vec<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude: vec![".git".to_string(), "target".to_string()],
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_depth: 4,
            command_timeout_secs: 300,
            output_limit_bytes: 100_000,
            max_output_tokens: 4096,
            model_retries: 2,
            workspace_dir: None,
            compaction: CompactionPolicy::default(),
            model: ModelConfig::default(),
            snapshots: SnapshotConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(anyhow!("max_depth must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_output_tokens == 0 {
            return Err(anyhow!("max_output_tokens must be > 0"));
        }
        if self.compaction.context_window_tokens == 0 {
            return Err(anyhow!("compaction.context_window_tokens must be > 0"));
        }
        if !(self.compaction.threshold > 0.0 && self.compaction.threshold <= 1.0) {
            return Err(anyhow!("compaction.threshold must be in (0, 1]"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.model.command.is_empty() || self.model.command[0].trim().is_empty() {
            return Err(anyhow!("model.command must be a non-empty array"));
        }
        Ok(())
    }

    /// Workspace root: the configured directory, else `fallback`.
    pub fn workspace_root(&self, fallback: &Path) -> PathBuf {
        match &self.workspace_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => fallback.join(dir),
            None => fallback.to_path_buf(),
        }
    }
}

/// `<root>/.task-agent`
pub fn state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    state_dir(root).join(CONFIG_FILE)
}

pub fn safety_rules_path(root: &Path) -> PathBuf {
    state_dir(root).join(SAFETY_RULES_FILE)
}

/// `<root>/.task-agent/agents`, one `<name>.toml` per predefined agent.
pub fn agents_dir(root: &Path) -> PathBuf {
    state_dir(root).join(AGENTS_DIR)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
