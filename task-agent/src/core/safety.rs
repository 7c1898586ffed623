//! Command safety gate: decides whether a command may run without a human.
//!
//! Evaluation order, stopping at the first decisive step:
//! 1. coarse denylist of destructive tokens (case-insensitive substring),
//! 2. per-invocation allow/block regex rules (tool rules before global ones;
//!    an allow match accepts the invocation even if a block rule matches),
//! 3. path confinement: every path-like argument must resolve inside the
//!    workspace.
//!
//! Builtin tool commands skip all checks.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::path::LexicalPath;
use crate::core::shell::{ShellInvocation, extract_invocations};
use crate::core::types::ToolKind;

/// Destructive-operation tokens rejected anywhere in the raw command.
pub const DENYLIST: &[&str] = &[
    "remove-item",
    "rm ",
    "rmdir ",
    "del ",
    "move-item",
    "mv ",
    "move ",
    "rename-item",
    "ren ",
    "sudo ",
];

/// PowerShell parameters whose value is always a path.
const PATH_FLAGS: &[&str] = &[
    "-path",
    "-literalpath",
    "-destination",
    "-filepath",
    "-outfile",
];

/// Regex patterns as written in the rules file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulePatterns {
    pub allowed: Vec<String>,
    pub blocked: Vec<String>,
}

/// The whole rules file: global patterns plus patterns keyed by tool
/// (`bash`, `powershell`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyRulesFile {
    pub global: RulePatterns,
    pub tools: BTreeMap<String, RulePatterns>,
}

/// Compiled allow/block lists.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    allowed: Vec<Regex>,
    blocked: Vec<Regex>,
}

impl RuleSet {
    pub fn compile(patterns: &RulePatterns) -> Result<Self> {
        Ok(Self {
            allowed: compile_all(&patterns.allowed)?,
            blocked: compile_all(&patterns.blocked)?,
        })
    }

    fn first_allowed(&self, text: &str) -> Option<&Regex> {
        self.allowed.iter().find(|re| re.is_match(text))
    }

    fn first_blocked(&self, text: &str) -> Option<&Regex> {
        self.blocked.iter().find(|re| re.is_match(text))
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).with_context(|| format!("invalid safety rule pattern {pattern:?}"))
        })
        .collect()
}

/// Compiled rules for the gate. An empty value allows everything at the
/// regex layer.
#[derive(Debug, Clone, Default)]
pub struct SafetyRules {
    global: RuleSet,
    tools: BTreeMap<String, RuleSet>,
}

impl SafetyRules {
    pub fn compile(file: &SafetyRulesFile) -> Result<Self> {
        let global = RuleSet::compile(&file.global).context("compile global safety rules")?;
        let mut tools = BTreeMap::new();
        for (tool, patterns) in &file.tools {
            let set = RuleSet::compile(patterns)
                .with_context(|| format!("compile safety rules for tool {tool}"))?;
            tools.insert(tool.to_ascii_lowercase(), set);
        }
        Ok(Self { global, tools })
    }

    /// Rule decision for one invocation: `Some(Ok(()))` when allowed,
    /// `Some(Err(pattern))` when blocked, `None` when nothing matched.
    fn decide(&self, tool: ToolKind, policy_text: &str) -> Option<Result<(), String>> {
        let tool_rules = self.tools.get(tool.rule_key());
        let allowed = tool_rules
            .and_then(|rules| rules.first_allowed(policy_text))
            .or_else(|| self.global.first_allowed(policy_text));
        if allowed.is_some() {
            return Some(Ok(()));
        }
        tool_rules
            .and_then(|rules| rules.first_blocked(policy_text))
            .or_else(|| self.global.first_blocked(policy_text))
            .map(|re| Err(re.as_str().to_string()))
    }
}

/// Why a command was or was not cleared for automatic execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    Denylisted { token: String },
    Blocked { signature: String, pattern: String },
    PathOutside { path: String },
    PathUnresolved { path: String },
}

impl SafetyVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, SafetyVerdict::Safe)
    }
}

impl fmt::Display for SafetyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyVerdict::Safe => write!(f, "safe"),
            SafetyVerdict::Denylisted { token } => {
                write!(f, "contains destructive token {:?}", token.trim())
            }
            SafetyVerdict::Blocked { signature, pattern } => {
                write!(f, "`{signature}` matches blocked rule {pattern:?}")
            }
            SafetyVerdict::PathOutside { path } => write!(f, "path {path} is outside the workspace"),
            SafetyVerdict::PathUnresolved { path } => write!(f, "path {path} cannot be resolved"),
        }
    }
}

/// Safety gate holding an explicit, replaceable rule set.
#[derive(Debug, Clone, Default)]
pub struct SafetyGate {
    rules: SafetyRules,
}

impl SafetyGate {
    pub fn new(rules: SafetyRules) -> Self {
        Self { rules }
    }

    pub fn replace_rules(&mut self, rules: SafetyRules) {
        self.rules = rules;
    }

    pub fn is_safe(&self, command: &str, tool: ToolKind, workspace_dir: &Path) -> bool {
        self.assess(command, tool, workspace_dir).is_safe()
    }

    pub fn assess(&self, command: &str, tool: ToolKind, workspace_dir: &Path) -> SafetyVerdict {
        if tool == ToolKind::Builtin {
            return SafetyVerdict::Safe;
        }

        let lowered = command.to_lowercase();
        if let Some(token) = DENYLIST.iter().find(|token| lowered.contains(*token)) {
            return SafetyVerdict::Denylisted {
                token: (*token).to_string(),
            };
        }

        let invocations = extract_invocations(command, tool);
        for invocation in invocations.iter().filter(|inv| !inv.policy_text.is_empty()) {
            if let Some(Err(pattern)) = self.rules.decide(tool, &invocation.policy_text) {
                return SafetyVerdict::Blocked {
                    signature: invocation.signature.clone(),
                    pattern,
                };
            }
        }

        let workspace = resolve_workspace(workspace_dir);
        for candidate in path_candidates(command, tool, &invocations) {
            let Some(workspace) = &workspace else {
                return SafetyVerdict::PathUnresolved {
                    path: workspace_dir.display().to_string(),
                };
            };
            let resolved = LexicalPath::resolve(&candidate, &workspace.to_string());
            match resolved {
                None => return SafetyVerdict::PathUnresolved { path: candidate },
                Some(path) if !path.is_within(workspace) => {
                    return SafetyVerdict::PathOutside { path: candidate };
                }
                Some(_) => {}
            }
        }

        SafetyVerdict::Safe
    }
}

fn resolve_workspace(workspace_dir: &Path) -> Option<LexicalPath> {
    LexicalPath::from_path(workspace_dir).or_else(|| {
        std::path::absolute(workspace_dir)
            .ok()
            .and_then(|abs| LexicalPath::from_path(&abs))
    })
}

/// Collect path-like arguments: values of path parameters, bare tokens
/// shaped like paths and every redirection target. Falls back to whitespace
/// tokens when the command did not parse into invocations. Bash words are
/// brace-expanded first.
fn path_candidates(command: &str, tool: ToolKind, invocations: &[ShellInvocation]) -> Vec<String> {
    let fallback;
    let argvs: Vec<&[String]> = if invocations.is_empty() {
        fallback = vec![
            command
                .split_whitespace()
                .map(|t| t.trim_matches('"').trim_matches('\'').to_string())
                .collect::<Vec<_>>(),
        ];
        fallback.iter().map(Vec::as_slice).collect()
    } else {
        invocations.iter().map(|inv| inv.argv.as_slice()).collect()
    };

    let mut paths: Vec<String> = invocations
        .iter()
        .flat_map(|inv| &inv.redirects)
        .filter(|target| target.as_str() != "/dev/null" && !is_nested(target, tool))
        .cloned()
        .collect();
    for argv in argvs {
        let mut expect_path = false;
        let words: Vec<String> = match tool {
            ToolKind::Bash => argv.iter().skip(1).flat_map(|w| expand_braces(w)).collect(),
            _ => argv.iter().skip(1).cloned().collect(),
        };
        for token in &words {
            if expect_path {
                expect_path = false;
                if !is_nested(token, tool) {
                    paths.push(token.clone());
                }
                continue;
            }
            let lowered = token.to_ascii_lowercase();
            if PATH_FLAGS.contains(&lowered.as_str()) {
                expect_path = true;
                continue;
            }
            if token.starts_with('-') {
                if let Some((flag, value)) = token.split_once([':', '='])
                    && (PATH_FLAGS.contains(&flag.to_ascii_lowercase().as_str())
                        || looks_like_path(value, tool))
                {
                    paths.push(value.to_string());
                }
                continue;
            }
            if looks_like_path(token, tool) {
                paths.push(token.clone());
            }
        }
    }
    paths
}

/// Tokens standing for nested code rather than a path. In bash `{` and `(`
/// are ordinary word characters (brace expansion), so only substitutions count.
fn is_nested(token: &str, tool: ToolKind) -> bool {
    let prefixes: &[&str] = match tool {
        ToolKind::Bash => &["$(", "<(", ">("],
        _ => &["$(", "@(", "(", "{"],
    };
    prefixes.iter().any(|prefix| token.starts_with(prefix))
}

/// Upper bound on words produced by expanding one bash word.
const MAX_BRACE_WORDS: usize = 64;

/// Bash brace expansion of comma lists: `a{b,c}d` -> `abd`, `acd`.
/// Ranges like `{1..3}` and unbalanced braces stay as written.
fn expand_braces(word: &str) -> Vec<String> {
    let mut done = Vec::new();
    let mut pending = vec![word.to_string()];
    while let Some(current) = pending.pop() {
        match split_brace_group(&current) {
            Some((prefix, alternatives, suffix)) if done.len() + pending.len() < MAX_BRACE_WORDS => {
                for alt in alternatives.iter().rev() {
                    pending.push(format!("{prefix}{alt}{suffix}"));
                }
            }
            _ => done.push(current),
        }
    }
    done
}

/// First `{...}` group holding a top-level comma, split into its parts.
fn split_brace_group(word: &str) -> Option<(&str, Vec<&str>, &str)> {
    let bytes = word.as_bytes();
    for (open, &b) in bytes.iter().enumerate() {
        if b != b'{' || (open > 0 && bytes[open - 1] == b'$') {
            continue;
        }
        let mut depth = 0usize;
        let mut commas = Vec::new();
        for (i, &c) in bytes.iter().enumerate().skip(open) {
            match c {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        if commas.is_empty() {
                            break;
                        }
                        let mut parts = Vec::new();
                        let mut start = open + 1;
                        for comma in commas {
                            parts.push(&word[start..comma]);
                            start = comma + 1;
                        }
                        parts.push(&word[start..i]);
                        return Some((&word[..open], parts, &word[i + 1..]));
                    }
                }
                b',' if depth == 1 => commas.push(i),
                _ => {}
            }
        }
    }
    None
}

fn looks_like_path(token: &str, tool: ToolKind) -> bool {
    if token.is_empty()
        || is_nested(token, tool)
        || token.contains("://")
        || token == "/dev/null"
    {
        return false;
    }
    let bytes = token.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    has_drive || token.starts_with('~') || token.contains('/') || token.contains('\\')
}
