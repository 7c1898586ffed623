//! Argument schema for builtin tool calls.
//!
//! A call is written as `builtin.<tool>` on the first line followed by
//! `key: value` lines. Multi-line values put `key:` on its own line and wrap
//! the payload in `<<<` / `>>>` lines. A single-line JSON object after the
//! tool name is accepted too: `builtin.read_file {"path": "a.txt"}`.

use std::collections::BTreeMap;
use std::fmt;

/// Tools that can be invoked through `<builtin>` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinTool {
    ReadFile,
    SmartEdit,
    GetJobLog,
}

struct FieldSpec {
    name: &'static str,
    required: bool,
    default: Option<&'static str>,
    aliases: &'static [&'static str],
}

const fn field(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        required: false,
        default: None,
        aliases: &[],
    }
}

const READ_FILE_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        required: true,
        aliases: &["file", "filepath"],
        ..field("path")
    },
    FieldSpec {
        default: Some("1"),
        ..field("start_line")
    },
    FieldSpec {
        default: Some("200"),
        ..field("max_lines")
    },
];

const SMART_EDIT_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        required: true,
        aliases: &["file", "filepath"],
        ..field("path")
    },
    FieldSpec {
        default: Some("Patch"),
        ..field("mode")
    },
    field("old_text"),
    FieldSpec {
        required: true,
        ..field("new_text")
    },
];

const GET_JOB_LOG_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        required: true,
        aliases: &["id"],
        ..field("job_id")
    },
    FieldSpec {
        default: Some("1"),
        ..field("start_line")
    },
    FieldSpec {
        default: Some("200"),
        ..field("max_lines")
    },
];

impl BuiltinTool {
    pub const ALL: [BuiltinTool; 3] = [
        BuiltinTool::ReadFile,
        BuiltinTool::SmartEdit,
        BuiltinTool::GetJobLog,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuiltinTool::ReadFile => "read_file",
            BuiltinTool::SmartEdit => "smart_edit",
            BuiltinTool::GetJobLog => "get_job_log",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    fn fields(self) -> &'static [FieldSpec] {
        match self {
            BuiltinTool::ReadFile => READ_FILE_FIELDS,
            BuiltinTool::SmartEdit => SMART_EDIT_FIELDS,
            BuiltinTool::GetJobLog => GET_JOB_LOG_FIELDS,
        }
    }
}

/// A schema-validated builtin call with defaults filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinCall {
    pub tool: BuiltinTool,
    pub args: BTreeMap<String, String>,
}

impl BuiltinCall {
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(String::as_str)
    }

    pub fn number(&self, name: &str) -> Result<usize, BuiltinParseError> {
        let value = self.arg(name).unwrap_or_default();
        value
            .trim()
            .parse::<usize>()
            .map_err(|_| BuiltinParseError::InvalidNumber {
                field: name.to_string(),
                value: value.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltinParseError {
    Empty,
    UnknownTool(String),
    InvalidLine(String),
    UnterminatedBlock(String),
    UnknownField(String),
    EmptyValue(String),
    MissingRequired(String),
    InvalidNumber { field: String, value: String },
}

impl fmt::Display for BuiltinParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuiltinParseError::Empty => write!(f, "empty builtin command"),
            BuiltinParseError::UnknownTool(name) => write!(f, "unknown builtin tool: {name}"),
            BuiltinParseError::InvalidLine(line) => {
                write!(f, "cannot parse line (expected `key: value`): {line}")
            }
            BuiltinParseError::UnterminatedBlock(key) => {
                write!(f, "{key} block is missing its closing >>> line")
            }
            BuiltinParseError::UnknownField(key) => write!(f, "unknown field: {key}"),
            BuiltinParseError::EmptyValue(key) => write!(f, "field {key} must not be empty"),
            BuiltinParseError::MissingRequired(key) => write!(f, "missing required field: {key}"),
            BuiltinParseError::InvalidNumber { field, value } => {
                write!(f, "field {field} must be a non-negative integer, got {value:?}")
            }
        }
    }
}

impl std::error::Error for BuiltinParseError {}

/// Tool name from the first line (`builtin.read_file ...` → `read_file`).
pub fn tool_name(command: &str) -> String {
    let first = command.trim().lines().next().unwrap_or_default().trim();
    let tail = match first.get(..8) {
        Some(prefix) if prefix.eq_ignore_ascii_case("builtin.") => &first[8..],
        _ => first,
    };
    tail.split(|c: char| c.is_whitespace() || c == '{')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Parse and validate a builtin command against its tool schema.
pub fn parse_builtin(command: &str) -> Result<BuiltinCall, BuiltinParseError> {
    let text = command.trim();
    if text.is_empty() {
        return Err(BuiltinParseError::Empty);
    }
    let name = tool_name(text);
    let tool = BuiltinTool::from_name(&name).ok_or(BuiltinParseError::UnknownTool(name))?;

    let raw = match inline_json_args(text) {
        Some(args) => args,
        None => kv_args(text)?,
    };
    normalize(tool, raw)
}

fn inline_json_args(text: &str) -> Option<Vec<(String, String)>> {
    let first = text.lines().next()?;
    let start = first.find('{')?;
    let rest = &text[start..];
    let serde_json::Value::Object(map) = serde_json::from_str(rest).ok()? else {
        return None;
    };
    Some(
        map.into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect(),
    )
}

fn kv_args(text: &str) -> Result<Vec<(String, String)>, BuiltinParseError> {
    let lines: Vec<&str> = text.lines().skip(1).collect();
    let mut args = Vec::new();
    let mut idx = 0;
    while idx < lines.len() {
        let line = lines[idx].trim();
        idx += 1;
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(BuiltinParseError::InvalidLine(line.to_string()));
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        let next_is_block = lines[idx..]
            .iter()
            .find(|l| !l.trim().is_empty())
            .is_some_and(|l| l.trim() == "<<<");
        if value.is_empty() && next_is_block {
            while lines[idx].trim() != "<<<" {
                idx += 1;
            }
            idx += 1;
            let mut block = Vec::new();
            loop {
                let Some(line) = lines.get(idx) else {
                    return Err(BuiltinParseError::UnterminatedBlock(key));
                };
                idx += 1;
                if line.trim() == ">>>" {
                    break;
                }
                block.push(*line);
            }
            args.push((key, block.join("\n")));
            continue;
        }

        args.push((key, unquote(value).to_string()));
    }
    Ok(args)
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && bytes[0] == bytes[bytes.len() - 1]
        && (bytes[0] == b'"' || bytes[0] == b'\'')
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn normalize(
    tool: BuiltinTool,
    raw: Vec<(String, String)>,
) -> Result<BuiltinCall, BuiltinParseError> {
    let fields = tool.fields();
    let mut args = BTreeMap::new();
    for (key, value) in raw {
        let key = key.trim().to_ascii_lowercase();
        let spec = fields
            .iter()
            .find(|spec| spec.name == key || spec.aliases.contains(&key.as_str()))
            .ok_or_else(|| BuiltinParseError::UnknownField(key.clone()))?;
        if value.trim().is_empty() {
            return Err(BuiltinParseError::EmptyValue(spec.name.to_string()));
        }
        args.insert(spec.name.to_string(), value);
    }
    for spec in fields {
        if !args.contains_key(spec.name) {
            if let Some(default) = spec.default {
                args.insert(spec.name.to_string(), default.to_string());
            } else if spec.required {
                return Err(BuiltinParseError::MissingRequired(spec.name.to_string()));
            }
        }
    }
    Ok(BuiltinCall { tool, args })
}
