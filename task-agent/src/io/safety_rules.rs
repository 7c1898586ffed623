//! Safety rule file under `.task-agent/safety_rules.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::safety::{SafetyRules, SafetyRulesFile};
use crate::io::config::write_atomic;

/// Rules written by `task-agent init`.
pub const DEFAULT_RULES_TOML: &str = r#"# Regex rules matched against each command invocation ("git status", "ls -la").
# Allowed patterns win over blocked ones; tool rules are checked before global rules.

[global]
allowed = []
blocked = ['^curl\b.*\|\s*(ba)?sh', '^chmod\s+-R']

[tools.bash]
allowed = ['^(ls|cat|head|tail|wc|grep|rg|find|pwd|echo)\b', '^git (status|diff|log|show)\b']
blocked = ['^git push\b.*(--force|-f)\b', '^git reset --hard\b']

[tools.powershell]
allowed = ['^(get-childitem|get-content|get-location|select-string)\b']
blocked = ['^git push\b.*(--force|-f)\b', '^stop-process\b']
"#;

/// Read the raw rules file; a missing file yields empty rule lists.
pub fn read_rules_file(path: &Path) -> Result<SafetyRulesFile> {
    if !path.exists() {
        debug!(path = %path.display(), "no safety rules file, using empty rules");
        return Ok(SafetyRulesFile::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Read and compile the rules file.
pub fn load_safety_rules(path: &Path) -> Result<SafetyRules> {
    let file = read_rules_file(path)?;
    SafetyRules::compile(&file).with_context(|| format!("load {}", path.display()))
}

/// Write the default rules unless a rules file already exists.
pub fn write_default_rules(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    write_atomic(path, DEFAULT_RULES_TOML)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::safety::SafetyGate;
    use crate::core::types::ToolKind;

    #[test]
    fn missing_file_gives_empty_rules() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = read_rules_file(&temp.path().join("none.toml")).expect("read");
        assert_eq!(file, SafetyRulesFile::default());
        load_safety_rules(&temp.path().join("none.toml")).expect("load");
    }

    #[test]
    fn default_rules_parse_and_apply() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("safety_rules.toml");
        assert!(write_default_rules(&path).expect("write"));
        assert!(!write_default_rules(&path).expect("second write"));

        let gate = SafetyGate::new(load_safety_rules(&path).expect("load"));
        assert!(gate.is_safe("git status", ToolKind::Bash, temp.path()));
        assert!(!gate.is_safe("git push --force origin main", ToolKind::Bash, temp.path()));
    }

    #[test]
    fn invalid_pattern_names_the_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("safety_rules.toml");
        fs::write(&path, "[global]\nblocked = ['(unclosed']\n").expect("write");
        let err = load_safety_rules(&path).expect_err("invalid regex");
        let chain = format!("{err:#}");
        assert!(chain.contains("safety_rules.toml"), "{chain}");
        assert!(chain.contains("invalid safety rule pattern"), "{chain}");
    }
}
