//! Reasoning layer: one model turn with tool calling support.
//!
//! The orchestrator drives one `respond_with_tools` (or `stream_with_tools`)
//! call per turn of its tool loop, naming the model explicitly so the call can
//! sit inside the fallback cascade.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::{
    ChatMessage, FinishReason, LlmProvider, StreamChunk, ToolCall, ToolCompletionRequest,
    ToolDefinition,
};

/// Context for a reasoning operation.
#[derive(Debug, Clone, Default)]
pub struct ReasoningContext {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub metadata: HashMap<String, String>,
}

impl ReasoningContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Token usage from one or more LLM calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    /// Cost under (input, output) per-token prices.
    pub fn cost(&self, prices: (Decimal, Decimal)) -> Decimal {
        prices.0 * Decimal::from(self.input_tokens) + prices.1 * Decimal::from(self.output_tokens)
    }
}

/// Result of a reasoning call: either text or tool calls.
#[derive(Debug, Clone)]
pub enum RespondResult {
    /// The model responded with text.
    Text(String),
    /// The model wants to call tools.
    ToolCalls {
        tool_calls: Vec<ToolCall>,
        /// Optional text content alongside tool calls.
        content: Option<String>,
    },
}

/// Output from a respond_with_tools call.
#[derive(Debug, Clone)]
pub struct RespondOutput {
    pub result: RespondResult,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// Reasoning layer that wraps an LLM provider.
pub struct Reasoning {
    llm: Arc<dyn LlmProvider>,
    system_prompt: Option<String>,
    max_output_tokens: Option<u32>,
}

impl Reasoning {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            system_prompt: None,
            max_output_tokens: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.llm
    }

    fn request(&self, model: &str, context: &ReasoningContext) -> ToolCompletionRequest {
        let mut messages = Vec::with_capacity(context.messages.len() + 1);
        if let Some(ref prompt) = self.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.extend(context.messages.iter().cloned());

        let mut request = ToolCompletionRequest::new(messages, context.tools.clone()).with_model(model);
        request.max_tokens = self.max_output_tokens;
        request.metadata = context.metadata.clone();
        request
    }

    /// Call `model` with tool definitions, returning either text or tool calls.
    pub async fn respond_with_tools(
        &self,
        model: &str,
        context: &ReasoningContext,
    ) -> Result<RespondOutput, LlmError> {
        let response = self
            .llm
            .complete_with_tools(self.request(model, context))
            .await?;

        Ok(into_output(
            response.content,
            response.tool_calls,
            TokenUsage {
                input_tokens: response.input_tokens,
                output_tokens: response.output_tokens,
            },
            response.finish_reason,
        ))
    }

    /// Streamed variant. `on_delta` sees each text fragment as it arrives.
    pub async fn stream_with_tools<F>(
        &self,
        model: &str,
        context: &ReasoningContext,
        on_delta: F,
    ) -> Result<RespondOutput, LlmError>
    where
        F: Fn(&str),
    {
        let mut stream = self
            .llm
            .stream_with_tools(self.request(model, context))
            .await?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = TokenUsage::default();
        let mut finish_reason = FinishReason::Unknown;

        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Text(delta) => {
                    on_delta(&delta);
                    text.push_str(&delta);
                }
                StreamChunk::ToolCall(call) => tool_calls.push(call),
                StreamChunk::Done {
                    input_tokens,
                    output_tokens,
                    finish_reason: reason,
                } => {
                    usage = TokenUsage {
                        input_tokens,
                        output_tokens,
                    };
                    finish_reason = reason;
                }
            }
        }

        let content = (!text.is_empty()).then_some(text);
        Ok(into_output(content, tool_calls, usage, finish_reason))
    }
}

fn into_output(
    content: Option<String>,
    tool_calls: Vec<ToolCall>,
    usage: TokenUsage,
    finish_reason: FinishReason,
) -> RespondOutput {
    let result = if tool_calls.is_empty() {
        RespondResult::Text(content.unwrap_or_default())
    } else {
        RespondResult::ToolCalls {
            tool_calls,
            content,
        }
    };
    RespondOutput {
        result,
        usage,
        finish_reason,
    }
}
