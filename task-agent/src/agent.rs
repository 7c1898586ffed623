//! One node of the task tree and its step state machine.
//!
//! An [`Agent`] owns a conversation history. Each [`Agent::step`] makes one
//! model call, records the reply and turns its tags into a [`StepResult`]:
//! commands become pending (the scheduler decides whether to run them),
//! sub-task tags are admitted against the depth and quota limits, and a
//! completion marker ends the node.

use std::collections::VecDeque;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::compaction::{self, CompactionPolicy, SUMMARY_SYSTEM_PROMPT};
use crate::core::quota::SubTaskQuota;
use crate::core::tags::{Block, parse_blocks, parse_plain, render_action_blocks};
use crate::core::types::{Action, Message, StepResult, SubTaskRequest};
use crate::io::agents::AgentCatalog;
use crate::io::model::{ModelClient, ModelReply};
use crate::io::new_short_id;
use crate::io::prompt::is_system_prompt;

/// Completion body used when the model sends an empty marker.
pub const DEFAULT_COMPLETION: &str = "task complete";
pub const WAITING_MARKER: &str = "[waiting for input]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    /// 0 for the root task.
    pub depth: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub history: Vec<Message>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_reasoning: String,
    /// Admitted sub-tasks not started yet, in tag order.
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub queued_sub_tasks: VecDeque<SubTaskRequest>,
    /// History length right after the last compaction.
    #[serde(default)]
    pub last_compacted_len: usize,
}

/// Collaborators and run-wide counters for one step.
pub struct StepContext<'a, M: ModelClient + ?Sized> {
    pub model: &'a M,
    pub quota: SubTaskQuota,
    /// Sub-tasks created so far in the run; bumped on admission.
    pub sub_task_count: &'a mut u32,
    pub agents: &'a AgentCatalog,
    /// Reason text when this step must not parse tags.
    pub skip_parse: Option<String>,
    pub max_output_tokens: u32,
    /// Extra attempts after a failed model call.
    pub model_retries: u32,
}

impl Agent {
    pub fn new(depth: u32, name: Option<String>, system_prompt: String, task: &str) -> Self {
        Self {
            id: new_short_id(),
            depth,
            name,
            history: vec![Message::system(system_prompt), Message::user(task)],
            last_reasoning: String::new(),
            queued_sub_tasks: VecDeque::new(),
            last_compacted_len: 0,
        }
    }

    pub fn add_user_input(&mut self, text: impl Into<String>) {
        self.history.push(Message::user(text));
    }

    /// Append `prompt` unless it equals the most recent system prompt.
    pub fn refresh_system_prompt(&mut self, prompt: String) {
        let latest = self.history.iter().rev().find(|msg| is_system_prompt(msg));
        if latest.is_some_and(|msg| msg.content == prompt) {
            return;
        }
        self.history.push(Message::system(prompt));
    }

    /// Fold a finished child's summary into this agent's history.
    pub fn on_child_completed(&mut self, summary: &str) {
        self.history.push(Message::assistant(format!(
            "<child_summary>\n{}\n</child_summary>",
            summary.trim()
        )));
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Run one model call and classify the reply.
    #[instrument(skip_all, fields(agent = %self.label(), depth = self.depth))]
    pub fn step<M: ModelClient + ?Sized>(&mut self, ctx: StepContext<'_, M>) -> StepResult {
        let reply = match self.call_model(ctx.model, ctx.max_output_tokens, ctx.model_retries) {
            Ok(reply) => reply,
            Err(err) => {
                let text = format!("[model error] {err:#}");
                warn!(error = %text, "model call failed");
                self.history.push(Message::system(text.clone()));
                let mut result = StepResult::new(Action::Wait);
                result.outputs.push(text);
                return result;
            }
        };
        self.last_reasoning = reply.reasoning.clone();
        let reasoning = Some(reply.reasoning.clone());

        if let Some(reason) = ctx.skip_parse {
            info!(%reason, "tag parsing skipped for this reply");
            self.history
                .push(Message::assistant(reply.content.clone()).with_reasoning(reasoning));
            let mut result = StepResult::new(Action::Wait);
            result.outputs.extend(text_outputs(parse_plain(&reply.content)));
            result.outputs.push(format!("[parse skipped] {reason}"));
            result.outputs.push(WAITING_MARKER.to_string());
            return result;
        }

        let blocks = parse_blocks(&reply.content);
        let has_actions = blocks.iter().any(Block::is_action);
        let stored = if has_actions {
            render_action_blocks(&blocks)
        } else {
            reply.content.clone()
        };
        self.history
            .push(Message::assistant(stored).with_reasoning(reasoning));

        let mut result = StepResult::new(Action::Continue);
        let mut completion: Option<String> = None;
        let mut work_tags = 0usize;
        for block in blocks {
            match block {
                Block::Text(text) => {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        result.outputs.push(trimmed.to_string());
                    }
                }
                Block::Shell(spec) | Block::Builtin(spec) => {
                    work_tags += 1;
                    result.pending_commands.push(spec);
                }
                Block::SubTask(request) => {
                    work_tags += 1;
                    if let Some(definition) = request.name.as_deref().and_then(|n| ctx.agents.find(n))
                        && !definition.allows(self.name.as_deref())
                    {
                        let text = format!(
                            "[agent unavailable] agent \"{}\" cannot be started by \"{}\"\ntask: {}",
                            definition.name,
                            self.label(),
                            request.task.trim()
                        );
                        info!(agent = %definition.name, "forbidden sub-agent refused");
                        self.history.push(Message::system(text.clone()));
                        result.outputs.push(text);
                        continue;
                    }
                    match ctx.quota.admit(self.depth, ctx.sub_task_count) {
                        Ok(()) => {
                            debug!(used = *ctx.sub_task_count, "sub-task admitted");
                            result.sub_tasks.push(request);
                        }
                        Err(notice) => {
                            let text = format!("{notice}\ntask: {}", request.task.trim());
                            info!(%notice, "sub-task refused");
                            self.history.push(Message::system(text.clone()));
                            result.outputs.push(text);
                        }
                    }
                }
                Block::Completion(body) => {
                    completion.get_or_insert(body);
                }
            }
        }

        match completion {
            Some(body) if work_tags == 0 => {
                let summary = match body.trim() {
                    "" => DEFAULT_COMPLETION.to_string(),
                    text => text.to_string(),
                };
                result.action = Action::Complete;
                result.outputs.push(summary.clone());
                result.summary = Some(summary);
            }
            Some(_) => {
                let text = "[completion deferred] finish the requested commands and sub-tasks, then send the completion again";
                self.history.push(Message::system(text));
                result.outputs.push(text.to_string());
            }
            None if work_tags == 0 => {
                result.action = Action::Wait;
                result.outputs.push(WAITING_MARKER.to_string());
            }
            None => {}
        }
        result
    }

    fn call_model<M: ModelClient + ?Sized>(
        &self,
        model: &M,
        max_tokens: u32,
        retries: u32,
    ) -> Result<ModelReply> {
        let mut attempt = 0;
        loop {
            match model.chat(&self.history, max_tokens) {
                Ok(reply) => return Ok(reply),
                Err(err) if attempt < retries => {
                    attempt += 1;
                    warn!(attempt, error = %format!("{err:#}"), "retrying model call");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Summarize the middle of the history when it outgrows the policy.
    /// Returns whether the history was rewritten.
    #[instrument(skip_all, fields(agent = %self.label(), messages = self.history.len()))]
    pub fn compact<M: ModelClient + ?Sized>(
        &mut self,
        model: &M,
        policy: &CompactionPolicy,
        max_tokens: u32,
    ) -> Result<bool> {
        let Some(plan) = policy.plan(&self.history) else {
            self.last_compacted_len = self.history.len();
            return Ok(false);
        };
        let total = plan.chunks.len();
        let mut summaries = Vec::with_capacity(total);
        for (idx, chunk) in plan.chunks.iter().enumerate() {
            summaries.push(summarize(model, &compaction::chunk_prompt(idx, total, chunk), max_tokens)?);
        }
        let summary = if summaries.len() == 1 {
            summaries.remove(0)
        } else {
            summarize(model, &compaction::combine_prompt(&summaries), max_tokens)?
        };

        let before = self.history.len();
        self.history = compaction::apply(&self.history, &plan, &summary, "auto");
        self.last_compacted_len = self.history.len();
        info!(before, after = self.history.len(), "history compacted");
        Ok(true)
    }
}

fn summarize<M: ModelClient + ?Sized>(model: &M, prompt: &str, max_tokens: u32) -> Result<String> {
    let request = [Message::system(SUMMARY_SYSTEM_PROMPT), Message::user(prompt)];
    Ok(model.chat(&request, max_tokens)?.content.trim().to_string())
}

fn text_outputs(blocks: Vec<Block>) -> impl Iterator<Item = String> {
    blocks.into_iter().filter_map(|block| match block {
        Block::Text(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    })
}
