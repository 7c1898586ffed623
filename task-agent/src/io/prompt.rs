//! System prompt rendering.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::types::{Message, Role, ToolKind};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// First line of every rendered system prompt.
pub const SYSTEM_PROMPT_HEADER: &str = "# task-agent system prompt";

/// Facts the system prompt reflects for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    pub workspace: String,
    pub depth: u32,
    pub max_depth: u32,
    /// Sub-tasks still available to the run.
    pub remaining: u32,
    pub task_name: Option<String>,
    /// Prompt lines of the predefined agents this agent may start.
    pub agents: Vec<String>,
}

impl PromptContext {
    pub fn can_delegate(&self) -> bool {
        self.depth < self.max_depth && self.remaining > 0
    }
}

fn shell_label(tool: ToolKind) -> &'static str {
    match tool {
        ToolKind::PowerShell => "PowerShell",
        _ => "bash",
    }
}

/// Render the system prompt for an agent.
pub fn render_system_prompt(ctx: &PromptContext) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("system", SYSTEM_TEMPLATE)
        .context("load system prompt template")?;
    let template = env.get_template("system")?;
    let primary = ToolKind::primary_shell();
    let secondary = ToolKind::secondary_shell();
    let rendered = template
        .render(context! {
            workspace => ctx.workspace,
            os => std::env::consts::OS,
            depth => ctx.depth,
            max_depth => ctx.max_depth,
            remaining => ctx.remaining,
            can_delegate => ctx.can_delegate(),
            task_name => ctx.task_name.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            agents => ctx.agents,
            primary_tag => primary.tag(),
            primary_shell => shell_label(primary),
            secondary_tag => secondary.tag(),
            secondary_shell => shell_label(secondary),
        })
        .context("render system prompt")?;
    Ok(rendered.trim().to_string())
}

/// True for messages produced by [`render_system_prompt`].
pub fn is_system_prompt(message: &Message) -> bool {
    message.role == Role::System && message.content.starts_with(SYSTEM_PROMPT_HEADER)
}

/// Keep only the most recent system prompt, moved to the front.
pub fn dedup_system_prompts(history: &[Message]) -> Vec<Message> {
    let Some(latest) = history.iter().rposition(is_system_prompt) else {
        return history.to_vec();
    };
    let mut out = Vec::with_capacity(history.len());
    out.push(history[latest].clone());
    out.extend(history.iter().filter(|msg| !is_system_prompt(msg)).cloned());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(depth: u32, remaining: u32) -> PromptContext {
        PromptContext {
            workspace: "/work".to_string(),
            depth,
            max_depth: 4,
            remaining,
            task_name: None,
            agents: Vec::new(),
        }
    }

    #[test]
    fn prompt_starts_with_header_and_reflects_limits() {
        let text = render_system_prompt(&ctx(1, 5)).expect("render");
        assert!(text.starts_with(SYSTEM_PROMPT_HEADER));
        assert!(text.contains("depth 1 of at most 4"));
        assert!(text.contains("5 sub-tasks remain"));
        assert!(text.contains("<create_agent"));
    }

    #[test]
    fn delegation_is_hidden_at_the_limits() {
        let deep = render_system_prompt(&ctx(4, 5)).expect("render");
        assert!(!deep.contains("<create_agent"));
        let exhausted = render_system_prompt(&ctx(0, 0)).expect("render");
        assert!(exhausted.contains("Delegation is not available"));
    }

    #[test]
    fn sub_task_name_is_mentioned() {
        let mut context = ctx(1, 3);
        context.task_name = Some("tests".to_string());
        let text = render_system_prompt(&context).expect("render");
        assert!(text.contains("sub-task agent \"tests\""));
    }

    #[test]
    fn predefined_agents_are_listed_only_when_delegating() {
        let mut context = ctx(0, 3);
        context.agents = vec!["`review`: checks diffs".to_string()];
        let text = render_system_prompt(&context).expect("render");
        assert!(text.contains("## Predefined agents"));
        assert!(text.contains("- `review`: checks diffs"));

        context.depth = 4;
        let deep = render_system_prompt(&context).expect("render");
        assert!(!deep.contains("Predefined agents"));
    }

    #[test]
    fn dedup_keeps_latest_prompt_first() {
        let old = Message::system(format!("{SYSTEM_PROMPT_HEADER}\nold"));
        let new = Message::system(format!("{SYSTEM_PROMPT_HEADER}\nnew"));
        let history = vec![
            old,
            Message::user("task"),
            Message::system("History summary (auto):\nx"),
            new.clone(),
            Message::assistant("ok"),
        ];
        let deduped = dedup_system_prompts(&history);
        assert_eq!(deduped.len(), 4);
        assert_eq!(deduped[0], new);
        assert_eq!(deduped[1].content, "task");
        assert_eq!(deduped[2].content, "History summary (auto):\nx");
    }
}
