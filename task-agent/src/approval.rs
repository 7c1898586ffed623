//! Approval decisions for pending commands.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::safety::SafetyGate;
use crate::core::types::{CommandSpec, ToolKind};

/// Note folded into history when a rejection carries no text.
pub const DEFAULT_REJECTION_NOTE: &str = "user cancelled command execution";

/// How the caller answered a batch of pending commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    /// Approve this batch and auto-execute safe commands from now on.
    ApproveAndEnableAuto,
    Reject,
}

impl ApprovalDecision {
    /// Interpret an interactive answer. Anything that is not an approval
    /// rejects, and the raw text becomes the rejection note.
    pub fn from_input(input: &str) -> (Self, Option<String>) {
        let trimmed = input.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "y" | "yes" => (ApprovalDecision::Approve, None),
            "a" | "all" | "auto" => (ApprovalDecision::ApproveAndEnableAuto, None),
            "" | "n" | "no" => (ApprovalDecision::Reject, None),
            _ => (ApprovalDecision::Reject, Some(trimmed.to_string())),
        }
    }

    pub fn approves(self) -> bool {
        !matches!(self, ApprovalDecision::Reject)
    }
}

/// Builtins are always safe; shell commands go through the gate.
pub fn is_auto_safe(gate: &SafetyGate, spec: &CommandSpec, workspace: &Path) -> bool {
    match spec.tool {
        ToolKind::Builtin => true,
        tool => gate.is_safe(&spec.command, tool, workspace),
    }
}

/// All-or-nothing: a batch auto-executes only when auto mode is on and every
/// command is safe.
pub fn can_auto_execute(
    gate: &SafetyGate,
    auto_approve: bool,
    commands: &[CommandSpec],
    workspace: &Path,
) -> bool {
    auto_approve
        && commands
            .iter()
            .all(|spec| is_auto_safe(gate, spec, workspace))
}

pub fn rejection_note(note: Option<&str>) -> String {
    match note.map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => DEFAULT_REJECTION_NOTE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::safety::{SafetyRules, SafetyRulesFile};

    fn gate() -> SafetyGate {
        SafetyGate::new(SafetyRules::compile(&SafetyRulesFile::default()).expect("rules"))
    }

    #[test]
    fn parses_interactive_answers() {
        assert_eq!(ApprovalDecision::from_input("y\n"), (ApprovalDecision::Approve, None));
        assert_eq!(
            ApprovalDecision::from_input("A"),
            (ApprovalDecision::ApproveAndEnableAuto, None)
        );
        assert_eq!(ApprovalDecision::from_input(""), (ApprovalDecision::Reject, None));
        assert_eq!(
            ApprovalDecision::from_input("use git instead"),
            (ApprovalDecision::Reject, Some("use git instead".to_string()))
        );
    }

    #[test]
    fn auto_execution_is_all_or_nothing() {
        let gate = gate();
        let ws = Path::new("/work");
        let safe = CommandSpec::new(ToolKind::Bash, "ls");
        let builtin = CommandSpec::new(ToolKind::Builtin, "builtin.read_file\npath: /etc/passwd");
        let unsafe_cmd = CommandSpec::new(ToolKind::Bash, "rm -rf build");

        assert!(can_auto_execute(&gate, true, &[safe.clone(), builtin.clone()], ws));
        assert!(!can_auto_execute(&gate, false, &[safe.clone()], ws));
        assert!(!can_auto_execute(&gate, true, &[safe, unsafe_cmd], ws));
    }

    #[test]
    fn empty_notes_fall_back_to_default() {
        assert_eq!(rejection_note(None), DEFAULT_REJECTION_NOTE);
        assert_eq!(rejection_note(Some("  ")), DEFAULT_REJECTION_NOTE);
        assert_eq!(rejection_note(Some("no thanks")), "no thanks");
    }
}
