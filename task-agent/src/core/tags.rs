//! Tool-tag parser for model replies.
//!
//! A reply is free text that may embed tagged blocks:
//!
//! ```text
//! <bash_call timeout="30">ls -la</bash_call>
//! <ps_call>Get-ChildItem</ps_call>
//! <builtin>builtin.read_file
//! path: src/main.rs</builtin>
//! <create_agent name="tests">write the tests</create_agent>
//! <completion>done</completion>
//! ```
//!
//! Parsing is total: unknown tags stay in the surrounding text and an opener
//! without its closing tag is treated as text.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{CommandSpec, SubTaskRequest, ToolKind};

static OPEN_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)<(bash_call|ps_call|builtin|create_agent|completion|return)((?:\s+[A-Za-z_][\w-]*\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"'>]+))*)\s*>"#,
    )
    .expect("open tag regex")
});

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("attribute regex")
});

static BARE_BUILTIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\s*)(read_file|smart_edit|get_job_log)\b").expect("bare builtin regex")
});

/// One typed region of a model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Text(String),
    Shell(CommandSpec),
    Builtin(CommandSpec),
    SubTask(SubTaskRequest),
    Completion(String),
}

impl Block {
    /// True for every block that asks the runtime to do something.
    pub fn is_action(&self) -> bool {
        !matches!(self, Block::Text(_))
    }

    /// Re-render the block in tag form.
    pub fn to_tag_text(&self) -> String {
        match self {
            Block::Text(text) => text.clone(),
            Block::Shell(spec) => {
                let mut attrs = String::new();
                if let Some(timeout) = spec.timeout {
                    let _ = write!(attrs, " timeout=\"{timeout}\"");
                }
                if spec.background {
                    attrs.push_str(" background=\"true\"");
                }
                let tag = spec.tool.tag();
                format!("<{tag}{attrs}>{}</{tag}>", spec.command)
            }
            Block::Builtin(spec) => format!("<builtin>{}</builtin>", spec.command),
            Block::SubTask(request) => match &request.name {
                Some(name) => format!("<create_agent name=\"{name}\">{}</create_agent>", request.task),
                None => format!("<create_agent>{}</create_agent>", request.task),
            },
            Block::Completion(body) => format!("<completion>{body}</completion>"),
        }
    }
}

/// Split `text` into ordered blocks.
pub fn parse_blocks(text: &str) -> Vec<Block> {
    // ASCII lowercasing keeps byte offsets aligned with `text`.
    let lower = text.to_ascii_lowercase();
    let mut blocks = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while let Some(caps) = OPEN_TAG_RE.captures_at(text, cursor) {
        let Some(open) = caps.get(0) else { break };
        let name = caps
            .get(1)
            .map(|m| m.as_str().to_ascii_lowercase())
            .unwrap_or_default();
        let attrs = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let close = format!("</{name}>");

        let Some(rel_end) = lower[open.end()..].find(&close) else {
            cursor = open.end();
            continue;
        };
        let body_end = open.end() + rel_end;

        push_text(&mut blocks, &text[text_start..open.start()]);
        blocks.push(make_block(&name, attrs, &text[open.end()..body_end]));

        text_start = body_end + close.len();
        cursor = text_start;
    }

    push_text(&mut blocks, &text[text_start..]);
    blocks
}

/// Degraded parse: the whole reply is one text block.
pub fn parse_plain(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    push_text(&mut blocks, text);
    blocks
}

/// Render only the action blocks, one per paragraph.
pub fn render_action_blocks(blocks: &[Block]) -> String {
    blocks
        .iter()
        .filter(|block| block.is_action())
        .map(Block::to_tag_text)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Prefix a bare builtin tool name on the first non-empty line with `builtin.`.
pub fn normalize_builtin_command(body: &str) -> String {
    let mut lines: Vec<String> = body.lines().map(str::to_string).collect();
    if let Some(first) = lines.iter_mut().find(|line| !line.trim().is_empty())
        && !first.trim_start().to_ascii_lowercase().starts_with("builtin.")
    {
        *first = BARE_BUILTIN_RE
            .replace(first, "${1}builtin.${2}")
            .into_owned();
    }
    lines.join("\n").trim().to_string()
}

fn push_text(blocks: &mut Vec<Block>, text: &str) {
    if !text.trim().is_empty() {
        blocks.push(Block::Text(text.to_string()));
    }
}

fn make_block(name: &str, attrs: &str, body: &str) -> Block {
    let attrs = parse_attrs(attrs);
    let attr = |key: &str| {
        attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };

    match name {
        "bash_call" | "ps_call" => {
            let tool = if name == "bash_call" {
                ToolKind::Bash
            } else {
                ToolKind::PowerShell
            };
            Block::Shell(CommandSpec {
                tool,
                command: body.trim().to_string(),
                timeout: attr("timeout").and_then(|v| v.trim().parse::<u64>().ok()),
                background: attr("background")
                    .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")),
            })
        }
        "builtin" => Block::Builtin(CommandSpec::new(
            ToolKind::Builtin,
            normalize_builtin_command(body),
        )),
        "create_agent" => Block::SubTask(SubTaskRequest {
            name: attr("name")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            task: body.trim().to_string(),
        }),
        _ => Block::Completion(body.trim().to_string()),
    }
}

fn parse_attrs(raw: &str) -> Vec<(String, String)> {
    ATTR_RE
        .captures_iter(raw)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            Some((key, value))
        })
        .collect()
}
