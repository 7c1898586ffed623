//! Initialization helpers for `.task-agent/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{
    AgentConfig, agents_dir, config_path, safety_rules_path, state_dir, write_atomic,
    write_config,
};
use crate::io::safety_rules::DEFAULT_RULES_TOML;
use crate::io::session_store::records_dir;

const STATE_GITIGNORE: &str = "# task-agent session state\n*\n";

/// Canonical paths within `.task-agent/` for a workspace root.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub safety_rules_path: PathBuf,
    pub snapshots_dir: PathBuf,
    pub agents_dir: PathBuf,
}

impl AgentPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = state_dir(&root);
        Self {
            gitignore_path: state_dir.join(".gitignore"),
            config_path: config_path(&root),
            safety_rules_path: safety_rules_path(&root),
            snapshots_dir: records_dir(&root),
            agents_dir: agents_dir(&root),
            state_dir,
            root,
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing config and rules files.
    pub force: bool,
}

/// Create `.task-agent/` scaffolding in `root`.
///
/// Existing config and rules files are kept unless `options.force` is set.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<AgentPaths> {
    let paths = AgentPaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "task-agent init: {} exists but is not a directory",
            paths.state_dir.display()
        ));
    }
    fs::create_dir_all(&paths.snapshots_dir)
        .with_context(|| format!("create directory {}", paths.snapshots_dir.display()))?;
    fs::create_dir_all(&paths.agents_dir)
        .with_context(|| format!("create directory {}", paths.agents_dir.display()))?;

    write_if_missing_or_force(&paths.gitignore_path, STATE_GITIGNORE, options.force)?;
    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &AgentConfig::default())?;
    }
    write_if_missing_or_force(&paths.safety_rules_path, DEFAULT_RULES_TOML, options.force)?;
    Ok(paths)
}

fn write_if_missing_or_force(path: &Path, contents: &str, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Ok(());
    }
    write_atomic(path, contents)
}
