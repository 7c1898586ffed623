//! History compaction planning.
//!
//! The model calls that produce summaries live with the scheduler; this
//! module only decides when to compact, what to summarize and how the new
//! history is assembled.

use serde::{Deserialize, Serialize};

use crate::core::types::{Message, Role};

/// Chunks are never smaller than this many characters.
pub const MIN_CHUNK_CHARS: usize = 2000;

/// System prompt for summarization calls.
pub const SUMMARY_SYSTEM_PROMPT: &str = "\
You compress a conversation into a working summary that lets the task continue.
Keep the task goal, key decisions and what has been completed.
Keep concrete context: file paths, commands, configuration, parameters, interfaces.
List unfinished work and known risks.
Do not invent anything. Prefer short bullet points.
Do not output any tool tags or XML tags.";

/// `[compaction]` settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionPolicy {
    pub enabled: bool,
    /// Context window of the model, in tokens.
    pub context_window_tokens: usize,
    /// Fraction of the window that triggers compaction.
    pub threshold: f64,
    /// Most recent messages kept verbatim.
    pub keep_messages: usize,
    pub chunk_chars: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            context_window_tokens: 16_384,
            threshold: 0.8,
            keep_messages: 8,
            chunk_chars: 8000,
        }
    }
}

/// What a compaction pass will summarize.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPlan {
    /// Whether `history[0]` is a system prompt that survives.
    pub keep_head: bool,
    /// First index of the verbatim tail.
    pub tail_start: usize,
    /// Transcript chunks to summarize, in order.
    pub chunks: Vec<String>,
}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(history: &[Message]) -> usize {
    history
        .iter()
        .map(|msg| msg.content.chars().count())
        .sum::<usize>()
        / 4
}

impl CompactionPolicy {
    pub fn trigger_tokens(&self) -> usize {
        (self.context_window_tokens as f64 * self.threshold) as usize
    }

    /// True when the history is large enough and has changed since the last
    /// compaction (`last_compacted_len` is the history length right after it).
    pub fn should_compact(&self, history: &[Message], last_compacted_len: usize) -> bool {
        self.enabled
            && estimate_tokens(history) >= self.trigger_tokens()
            && history.len() > self.keep_messages + 2
            && history.len() != last_compacted_len
    }

    /// Plan a compaction; `None` when there is nothing worth summarizing.
    pub fn plan(&self, history: &[Message]) -> Option<CompactionPlan> {
        let total = history.len();
        if total <= self.keep_messages + 2 {
            return None;
        }
        let keep_head = history.first().is_some_and(|msg| msg.role == Role::System);
        let tail_start = total.saturating_sub(self.keep_messages);
        let head_len = usize::from(keep_head);
        if tail_start <= head_len {
            return None;
        }

        let transcript = format_transcript(&history[head_len..tail_start]);
        if transcript.trim().is_empty() {
            return None;
        }
        Some(CompactionPlan {
            keep_head,
            tail_start,
            chunks: split_chunks(&transcript, self.chunk_chars),
        })
    }
}

/// Render messages as `[role] content` lines, skipping empty ones.
pub fn format_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|msg| !msg.content.trim().is_empty())
        .map(|msg| format!("[{}] {}", msg.role.as_str(), msg.content.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split on line boundaries into chunks of at most `chunk_chars` characters
/// (a single longer line becomes its own chunk).
pub fn split_chunks(text: &str, chunk_chars: usize) -> Vec<String> {
    let limit = chunk_chars.max(MIN_CHUNK_CHARS);
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0;
    for line in text.lines() {
        let line_len = line.chars().count() + 1;
        if !current.is_empty() && current_len + line_len > limit {
            chunks.push(current.join("\n"));
            current.clear();
            current_len = 0;
        }
        current.push(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current.join("\n"));
    }
    chunks
}

/// User prompt for one chunk of a multi-chunk transcript.
pub fn chunk_prompt(index: usize, total: usize, chunk: &str) -> String {
    if total == 1 {
        chunk.to_string()
    } else {
        format!("Part {}/{}:\n{}", index + 1, total, chunk)
    }
}

/// User prompt that merges per-chunk summaries.
pub fn combine_prompt(summaries: &[String]) -> String {
    summaries
        .iter()
        .enumerate()
        .map(|(idx, summary)| format!("[Part summary {}]\n{}", idx + 1, summary))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Assemble the compacted history: head, summary message, verbatim tail.
pub fn apply(history: &[Message], plan: &CompactionPlan, summary: &str, reason: &str) -> Vec<Message> {
    let summary = match summary.trim() {
        "" => "(empty summary)",
        text => text,
    };
    let mut compacted = Vec::with_capacity(history.len() - plan.tail_start + 2);
    if plan.keep_head {
        compacted.push(history[0].clone());
    }
    compacted.push(Message::system(format!("History summary ({reason}):\n{summary}")));
    compacted.extend(history[plan.tail_start..].iter().cloned());
    compacted
}
