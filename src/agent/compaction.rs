//! Conversation compaction: fit long histories into the context window.
//!
//! The most recent messages within the recent-tail budget are kept verbatim.
//! Everything older is split into chunks, each chunk is summarized by the
//! model, and the chunk summaries are merged into one system message placed
//! in front of the tail. Any summarization failure degrades to a fixed
//! non-AI summary; compaction never fails the job.

use std::sync::Arc;

use futures::future::join_all;
use uuid::Uuid;

use crate::agent::context_monitor::{ContextMonitor, estimate_message_tokens, estimate_tokens};
use crate::config::CompactionConfig;
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, Role};
use crate::store::{MemoryStore, SUMMARY_MEMORY_KIND};

pub const SUMMARY_PREFIX: &str = "[Conversation Summary]";

const SUMMARIZER_PROMPT: &str = "You are a conversation summarizer. Summarize the conversation \
    excerpt below so an assistant can continue it without the original messages. Keep names, \
    dates, numbers, decisions, open questions and anything the user asked to remember. Write \
    plain prose, no preamble.";

const MERGE_PROMPT: &str = "You are a conversation summarizer. Merge the partial summaries \
    below, which cover consecutive parts of one conversation in order, into a single summary. \
    Keep every concrete fact; drop repetition. Write plain prose, no preamble.";

const SUMMARY_MAX_TOKENS: u32 = 1024;

/// Deterministic summary used when the model cannot produce one.
pub fn fallback_summary(message_count: usize) -> String {
    format!(
        "{SUMMARY_PREFIX} Previous conversation contained {message_count} messages. \
         Context was truncated for continuity."
    )
}

/// Fallback covering `old`. An earlier summary in the span is not counted as a
/// message and its text is carried forward.
fn fallback_for(old: &[ChatMessage]) -> String {
    let (prior, messages): (Vec<&ChatMessage>, Vec<&ChatMessage>) =
        old.iter().partition(|m| is_summary(m));
    let mut text = fallback_summary(messages.len());
    for summary in prior {
        let body = summary.content.trim_start_matches(SUMMARY_PREFIX).trim();
        if !body.is_empty() {
            text.push('\n');
            text.push_str(body);
        }
    }
    text
}

fn is_summary(message: &ChatMessage) -> bool {
    message.role == Role::System && message.content.starts_with(SUMMARY_PREFIX)
}

/// System message carrying a summary. Text already in summary form is kept as is.
pub fn summary_message(summary: &str) -> ChatMessage {
    if summary.starts_with(SUMMARY_PREFIX) {
        ChatMessage::system(summary)
    } else {
        ChatMessage::system(format!("{SUMMARY_PREFIX}\n{summary}"))
    }
}

#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub messages: Vec<ChatMessage>,
    /// Summary text, when compaction ran.
    pub summary: Option<String>,
    /// Number of input messages the summary replaced.
    pub summarized: usize,
    /// False when the fallback summary was used.
    pub ai_summary: bool,
}

impl CompactionResult {
    fn unchanged(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            summary: None,
            summarized: 0,
            ai_summary: false,
        }
    }

    pub fn compacted(&self) -> bool {
        self.summary.is_some()
    }
}

/// Summarizes old history with a model.
pub struct ContextCompactor {
    llm: Arc<dyn LlmProvider>,
    model: String,
    config: CompactionConfig,
    memory: Option<Arc<dyn MemoryStore>>,
}

impl ContextCompactor {
    pub fn new(llm: Arc<dyn LlmProvider>, model: impl Into<String>, config: CompactionConfig) -> Self {
        Self {
            llm,
            model: model.into(),
            config,
            memory: None,
        }
    }

    /// Also record AI summaries as memories, best effort.
    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    fn budget(&self, ratio: f64) -> usize {
        (self.config.context_window as f64 * ratio).floor() as usize
    }

    pub fn should_compact(&self, messages: &[ChatMessage]) -> bool {
        ContextMonitor::from_config(&self.config).needs_compaction(messages)
    }

    /// Compact `messages` if they trip the count or token threshold.
    pub async fn compact(
        &self,
        messages: Vec<ChatMessage>,
        conversation_id: Option<Uuid>,
    ) -> CompactionResult {
        if !self.should_compact(&messages) {
            return CompactionResult::unchanged(messages);
        }

        let split = recent_split(&messages, self.budget(self.config.recent_ratio));
        if split == 0 {
            tracing::debug!(messages = messages.len(), "Nothing old enough to summarize");
            return CompactionResult::unchanged(messages);
        }

        let mut messages = messages;
        let recent = messages.split_off(split);
        let old = messages;
        let chunks = chunk_messages(&old, self.budget(self.config.chunk_ratio));

        let (summary, ai_summary) = match self.summarize(&chunks).await {
            Ok(text) => (format!("{SUMMARY_PREFIX}\n{text}"), true),
            Err(e) => {
                tracing::warn!(error = %e, old = old.len(), "Summarization failed, using fallback summary");
                (fallback_for(&old), false)
            }
        };

        if ai_summary && let (Some(memory), Some(conversation_id)) = (&self.memory, conversation_id) {
            if let Err(e) = memory
                .store_memory(Some(conversation_id), SUMMARY_MEMORY_KIND, &summary)
                .await
            {
                tracing::warn!(%conversation_id, error = %e, "Failed to store summary memory");
            }
        }

        let summary_msg = ChatMessage::system(summary.clone());
        let recent = fit_recent(
            recent,
            estimate_message_tokens(&summary_msg),
            self.budget(self.config.target_ratio),
        );

        tracing::info!(
            summarized = old.len(),
            kept = recent.len(),
            chunks = chunks.len(),
            ai_summary,
            "Conversation compacted"
        );

        let mut out = Vec::with_capacity(recent.len() + 1);
        out.push(summary_msg);
        out.extend(recent);
        CompactionResult {
            messages: out,
            summary: Some(summary),
            summarized: old.len(),
            ai_summary,
        }
    }

    async fn summarize(&self, chunks: &[Vec<ChatMessage>]) -> Result<String, LlmError> {
        let partials = join_all(
            chunks
                .iter()
                .map(|chunk| self.ask(SUMMARIZER_PROMPT, transcript(chunk))),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

        if partials.len() == 1 {
            return partials.into_iter().next().ok_or_else(|| empty_summary(&self.model));
        }

        let joined = partials
            .iter()
            .enumerate()
            .map(|(i, s)| format!("Part {}:\n{s}", i + 1))
            .collect::<Vec<_>>()
            .join("\n\n");
        self.ask(MERGE_PROMPT, joined).await
    }

    async fn ask(&self, prompt: &str, content: String) -> Result<String, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(prompt),
            ChatMessage::user(content),
        ])
        .with_model(self.model.clone())
        .with_max_tokens(SUMMARY_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        let text = response.content.trim();
        if text.is_empty() {
            return Err(empty_summary(&self.model));
        }
        Ok(text.to_string())
    }
}

fn empty_summary(model: &str) -> LlmError {
    LlmError::InvalidResponse {
        provider: model.to_string(),
        reason: "empty summary".into(),
    }
}

/// Index where the recent tail starts.
///
/// Scans backward while the tail fits in `budget`. The final message always
/// belongs to the tail.
fn recent_split(messages: &[ChatMessage], budget: usize) -> usize {
    let mut used = 0;
    let mut split = messages.len();
    for (i, message) in messages.iter().enumerate().rev() {
        let tokens = estimate_message_tokens(message);
        if used + tokens > budget && split < messages.len() {
            break;
        }
        used += tokens;
        split = i;
    }
    split
}

/// Greedily pack messages into chunks of at most `budget` tokens.
///
/// A message larger than the budget gets a chunk of its own.
fn chunk_messages(messages: &[ChatMessage], budget: usize) -> Vec<Vec<ChatMessage>> {
    let mut chunks = Vec::new();
    let mut current: Vec<ChatMessage> = Vec::new();
    let mut used = 0;
    for message in messages {
        let tokens = estimate_message_tokens(message);
        if !current.is_empty() && used + tokens > budget {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        used += tokens;
        current.push(message.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Drop the oldest recent messages until summary plus tail fit in `budget`.
fn fit_recent(mut recent: Vec<ChatMessage>, summary_tokens: usize, budget: usize) -> Vec<ChatMessage> {
    let mut total = summary_tokens + estimate_tokens(&recent);
    let mut dropped = 0;
    while total > budget && recent.len() - dropped > 1 {
        total -= estimate_message_tokens(&recent[dropped]);
        dropped += 1;
    }
    recent.drain(..dropped);
    recent
}

fn transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
