//! Token estimation and the last-resort context guard.
//!
//! Estimates are deliberately crude: four characters per token plus a fixed
//! per-message overhead. They only need to be consistent between the
//! compactor and the guard.

use crate::config::CompactionConfig;
use crate::llm::ChatMessage;

const CHARS_PER_TOKEN: usize = 4;
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Estimated tokens for one piece of message text.
pub fn estimate_text_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) + MESSAGE_OVERHEAD_TOKENS
}

pub fn estimate_message_tokens(message: &ChatMessage) -> usize {
    estimate_text_tokens(&message.content)
}

pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Result of [`ContextMonitor::guard`].
#[derive(Debug, Clone)]
pub struct GuardOutcome {
    pub messages: Vec<ChatMessage>,
    /// Oldest messages dropped to fit.
    pub dropped: usize,
}

/// Watches a message list against the model's context window.
#[derive(Debug, Clone)]
pub struct ContextMonitor {
    context_window: usize,
    message_threshold: usize,
}

impl ContextMonitor {
    pub fn new(context_window: usize) -> Self {
        Self {
            context_window,
            message_threshold: CompactionConfig::default().message_threshold,
        }
    }

    pub fn from_config(config: &CompactionConfig) -> Self {
        Self {
            context_window: config.context_window,
            message_threshold: config.message_threshold,
        }
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }

    pub fn usage_percent(&self, messages: &[ChatMessage]) -> f64 {
        if self.context_window == 0 {
            return 100.0;
        }
        estimate_tokens(messages) as f64 / self.context_window as f64 * 100.0
    }

    pub fn is_over_budget(&self, messages: &[ChatMessage]) -> bool {
        estimate_tokens(messages) > self.context_window
    }

    /// Over budget, or simply too many messages.
    pub fn needs_compaction(&self, messages: &[ChatMessage]) -> bool {
        messages.len() > self.message_threshold || self.is_over_budget(messages)
    }

    /// Drop the oldest messages until the rest fit, never going below one.
    pub fn guard(&self, mut messages: Vec<ChatMessage>) -> GuardOutcome {
        let mut total = estimate_tokens(&messages);
        let mut dropped = 0;
        while total > self.context_window && messages.len() - dropped > 1 {
            total -= estimate_message_tokens(&messages[dropped]);
            dropped += 1;
        }
        if dropped > 0 {
            tracing::warn!(
                dropped,
                remaining_tokens = total,
                context_window = self.context_window,
                "Context guard trimmed oldest messages"
            );
            messages.drain(..dropped);
        }
        GuardOutcome { messages, dropped }
    }
}
