//! Model client abstraction.
//!
//! [`ModelClient`] decouples the agents from the chat backend. The shipped
//! [`CommandModelClient`] talks to an external command over stdin/stdout so
//! any HTTP client can be plugged in without this crate knowing about it.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::types::Message;
use crate::io::config::ModelConfig;
use crate::io::process::run_command_with_timeout;

/// One chat completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelReply {
    pub content: String,
    #[serde(default)]
    pub reasoning: String,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reasoning: String::new(),
        }
    }
}

/// Chat backend used by agents and compaction.
pub trait ModelClient {
    /// Complete `history`. Errors are retryable by the caller.
    fn chat(&self, history: &[Message], max_tokens: u32) -> Result<ModelReply>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: &'a [Message],
    max_tokens: u32,
}

/// Client that pipes `{"messages", "max_tokens"}` JSON to a command and
/// reads `{"content", "reasoning"}` JSON from its stdout.
#[derive(Debug, Clone)]
pub struct CommandModelClient {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandModelClient {
    pub fn new(config: &ModelConfig, output_limit_bytes: usize) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes,
        }
    }
}

impl ModelClient for CommandModelClient {
    #[instrument(skip_all, fields(messages = history.len(), max_tokens = max_tokens))]
    fn chat(&self, history: &[Message], max_tokens: u32) -> Result<ModelReply> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("model.command is empty"))?;
        let request = serde_json::to_vec(&ChatRequest {
            messages: history,
            max_tokens,
        })
        .context("serialize chat request")?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        let output =
            run_command_with_timeout(cmd, Some(&request), self.timeout, self.output_limit_bytes)
                .with_context(|| format!("run model command {program}"))?;

        if output.timed_out {
            bail!("model command timed out after {}s", self.timeout.as_secs());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "model command failed");
            bail!(
                "model command failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            );
        }
        if output.stdout_truncated > 0 {
            bail!(
                "model reply exceeded {} bytes",
                self.output_limit_bytes
            );
        }
        let reply: ModelReply =
            serde_json::from_slice(&output.stdout).context("parse model reply json")?;
        debug!(
            content_len = reply.content.len(),
            reasoning_len = reply.reasoning.len(),
            "model replied"
        );
        Ok(reply)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn client(script: &str) -> CommandModelClient {
        let config = ModelConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs: 10,
        };
        CommandModelClient::new(&config, 64 * 1024)
    }

    #[test]
    fn parses_reply_from_command_stdout() {
        let reply = client(r#"cat >/dev/null; printf '{"content":"<completion>ok</completion>"}'"#)
            .chat(&[Message::user("hi")], 100)
            .expect("chat");
        assert_eq!(reply, ModelReply::text("<completion>ok</completion>"));
    }

    #[test]
    fn request_is_written_to_stdin() {
        let reply = client(
            r#"printf '{"content":"%s"}' "$(grep -o 'max_tokens.:[0-9]*' | tr -d '"')""#,
        )
        .chat(&[Message::user("hi")], 100)
        .expect("chat");
        assert_eq!(reply.content, "max_tokens:100");
    }

    #[test]
    fn failures_are_errors() {
        let err = client("cat >/dev/null; echo boom >&2; exit 2")
            .chat(&[Message::user("hi")], 10)
            .expect_err("non-zero exit");
        assert!(format!("{err:#}").contains("boom"));

        let err = client("cat >/dev/null; echo not-json")
            .chat(&[Message::user("hi")], 10)
            .expect_err("bad json");
        assert!(format!("{err:#}").contains("parse model reply json"));
    }
}
