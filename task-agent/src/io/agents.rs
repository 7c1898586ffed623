//! Predefined sub-agents from `.task-agent/agents/*.toml`.
//!
//! A definition gives a reusable flow a name. When a reply asks for
//! `<create_agent name="review">`, the child starts from the `review`
//! instructions followed by the requested task. Definitions can forbid
//! named agents from delegating to them, which also hides them from those
//! agents' system prompts.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefinition {
    /// Defaults to the file stem.
    pub name: String,
    pub description: String,
    /// Text added to the system prompt of agents allowed to use this one.
    pub prompt_injection: String,
    /// Flow the child follows, prepended to its task. The first non-empty
    /// line (without leading `#`) names the flow.
    pub instructions: String,
    /// Agent names that may not delegate to this definition.
    pub forbidden_agents: Vec<String>,
}

/// Names match case-insensitively with `_` and `-` interchangeable.
fn normalize(name: &str) -> String {
    name.trim().to_lowercase().replace('_', "-")
}

impl AgentDefinition {
    pub fn matches(&self, name: &str) -> bool {
        normalize(&self.name) == normalize(name)
    }

    /// Whether an agent called `caller` may delegate to this definition.
    /// The unnamed root agent is never forbidden.
    pub fn allows(&self, caller: Option<&str>) -> bool {
        let Some(caller) = caller else {
            return true;
        };
        !self
            .forbidden_agents
            .iter()
            .any(|forbidden| normalize(forbidden) == normalize(caller))
    }

    pub fn flow_name(&self) -> Option<&str> {
        self.instructions
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.trim_start_matches('#').trim())
            .filter(|line| !line.is_empty())
    }

    /// The child's first user message: instructions, a rule, then the task.
    pub fn compose_task(&self, task: &str) -> String {
        let instructions = self.instructions.trim();
        if instructions.is_empty() {
            return task.to_string();
        }
        let task = task.trim();
        match self.flow_name() {
            Some(flow) => format!("{instructions}\n\n---\n\nTask: use {flow}, {task}"),
            None => format!("{instructions}\n\n---\n\nTask: {task}"),
        }
    }

    /// One line for the system prompt.
    pub fn prompt_line(&self) -> String {
        let injection = self.prompt_injection.trim();
        if !injection.is_empty() {
            return injection.to_string();
        }
        match self.description.trim() {
            "" => format!("`{}`", self.name),
            description => format!("`{}`: {description}", self.name),
        }
    }
}

/// All predefined agents of a project, in file-name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentCatalog {
    definitions: Vec<AgentDefinition>,
}

impl AgentCatalog {
    pub fn new(definitions: Vec<AgentDefinition>) -> Self {
        Self { definitions }
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&AgentDefinition> {
        self.definitions.iter().find(|def| def.matches(name))
    }

    /// Definitions an agent called `caller` may delegate to.
    pub fn available_to<'c>(
        &'c self,
        caller: Option<&'c str>,
    ) -> impl Iterator<Item = &'c AgentDefinition> + 'c {
        self.definitions.iter().filter(move |def| def.allows(caller))
    }
}

/// Load every `*.toml` in `dir`. A missing directory yields an empty catalog.
pub fn load_agent_catalog(dir: &Path) -> Result<AgentCatalog> {
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "no predefined agents");
        return Ok(AgentCatalog::default());
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("read entry in {}", dir.display()))?
            .path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml")) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut definitions = Vec::with_capacity(paths.len());
    for path in paths {
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let mut definition: AgentDefinition =
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        if definition.name.trim().is_empty() {
            definition.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        definitions.push(definition);
    }
    debug!(count = definitions.len(), "predefined agents loaded");
    Ok(AgentCatalog::new(definitions))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, file: &str, contents: &str) {
        fs::write(dir.join(file), contents).expect("write agent file");
    }

    #[test]
    fn missing_directory_is_an_empty_catalog() {
        let temp = tempfile::tempdir().expect("tempdir");
        let catalog = load_agent_catalog(&temp.path().join("agents")).expect("load");
        assert!(catalog.is_empty());
    }

    #[test]
    fn loads_definitions_and_defaults_name_to_file_stem() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(
            temp.path(),
            "file_edit.toml",
            "description = \"edits files\"\ninstructions = \"# File edit flow\\n1. read\\n2. patch\"\n",
        );
        write(temp.path(), "notes.md", "not a definition");
        write(
            temp.path(),
            "a.toml",
            "name = \"Reviewer\"\nforbidden_agents = [\"reviewer\"]\n",
        );

        let catalog = load_agent_catalog(temp.path()).expect("load");
        let names: Vec<&str> = catalog
            .available_to(None)
            .map(|def| def.name.as_str())
            .collect();
        assert_eq!(names, vec!["Reviewer", "file_edit"]);

        let edit = catalog.find("File-Edit").expect("normalized lookup");
        assert_eq!(edit.flow_name(), Some("File edit flow"));
        assert_eq!(edit.prompt_line(), "`file_edit`: edits files");
    }

    #[test]
    fn forbidden_callers_are_refused() {
        let def = AgentDefinition {
            name: "deploy".to_string(),
            forbidden_agents: vec!["Code_Review".to_string()],
            ..AgentDefinition::default()
        };
        assert!(def.allows(None));
        assert!(def.allows(Some("tests")));
        assert!(!def.allows(Some("code-review")));

        let catalog = AgentCatalog::new(vec![def]);
        assert_eq!(catalog.available_to(Some("code_review")).count(), 0);
        assert_eq!(catalog.available_to(Some("tests")).count(), 1);
    }

    #[test]
    fn compose_task_prepends_instructions() {
        let def = AgentDefinition {
            name: "review".to_string(),
            instructions: "## Review flow\nCheck every diff.".to_string(),
            ..AgentDefinition::default()
        };
        assert_eq!(
            def.compose_task(" look at src/ "),
            "## Review flow\nCheck every diff.\n\n---\n\nTask: use Review flow, look at src/"
        );
        let bare = AgentDefinition::default();
        assert_eq!(bare.compose_task("do it"), "do it");
    }

    #[test]
    fn invalid_file_names_the_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "broken.toml", "forbidden_agents = 3\n");
        let err = load_agent_catalog(temp.path()).expect_err("invalid");
        assert!(format!("{err:#}").contains("broken.toml"));
    }
}
