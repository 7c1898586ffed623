//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between the parser, the agents and the
//! scheduler. Everything here is plain data: serializable, comparable and free
//! of I/O so snapshots can capture it verbatim.

use serde::{Deserialize, Serialize};

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One entry of an agent's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Unix seconds when the message was appended.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_timestamp(),
            reasoning: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_reasoning(mut self, reasoning: Option<String>) -> Self {
        self.reasoning = reasoning.filter(|text| !text.trim().is_empty());
        self
    }
}

fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Which runtime a command is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Bash,
    #[serde(rename = "powershell")]
    PowerShell,
    Builtin,
}

impl ToolKind {
    /// The host's default shell dialect.
    pub fn primary_shell() -> Self {
        if cfg!(windows) {
            ToolKind::PowerShell
        } else {
            ToolKind::Bash
        }
    }

    /// The shell dialect that is not the host default.
    pub fn secondary_shell() -> Self {
        match Self::primary_shell() {
            ToolKind::PowerShell => ToolKind::Bash,
            _ => ToolKind::PowerShell,
        }
    }

    /// Tag name used in model output for this tool.
    pub fn tag(self) -> &'static str {
        match self {
            ToolKind::Bash => "bash_call",
            ToolKind::PowerShell => "ps_call",
            ToolKind::Builtin => "builtin",
        }
    }

    /// Key used for per-tool safety rules.
    pub fn rule_key(self) -> &'static str {
        match self {
            ToolKind::Bash => "bash",
            ToolKind::PowerShell => "powershell",
            ToolKind::Builtin => "builtin",
        }
    }

    pub fn is_shell(self) -> bool {
        !matches!(self, ToolKind::Builtin)
    }
}

/// A normalized, not-yet-executed command request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub tool: ToolKind,
    pub command: String,
    /// Per-command timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub background: bool,
}

impl CommandSpec {
    pub fn new(tool: ToolKind, command: impl Into<String>) -> Self {
        Self {
            tool,
            command: command.into(),
            timeout: None,
            background: false,
        }
    }
}

/// A request to delegate work to a child agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub task: String,
}

/// What the scheduler should do after an agent step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Continue,
    Wait,
    Complete,
}

/// Outcome of a single agent step. Never mutated after it is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    /// Ordered text fragments for display.
    pub outputs: Vec<String>,
    pub action: Action,
    pub pending_commands: Vec<CommandSpec>,
    /// Sub-tasks admitted by the quota check, in tag order.
    pub sub_tasks: Vec<SubTaskRequest>,
    /// Completion body when `action == Complete`.
    pub summary: Option<String>,
}

impl StepResult {
    pub fn new(action: Action) -> Self {
        Self {
            outputs: Vec::new(),
            action,
            pending_commands: Vec::new(),
            sub_tasks: Vec::new(),
            summary: None,
        }
    }
}
