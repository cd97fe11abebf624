//! Anthropic Messages API backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::LlmError;
use crate::llm::costs::model_cost;
use crate::llm::http::{SseBuffer, http_error, request_failed, retry_after};
use crate::llm::provider::{
    ChatMessage, ChunkStream, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
    Role, StreamChunk, ToolCall, ToolCompletionRequest, ToolCompletionResponse, ToolDefinition,
};

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn build_body(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        model: Option<&str>,
        max_tokens: Option<u32>,
        stream: bool,
    ) -> Value {
        let (system, turns) = to_claude_messages(messages);
        let mut body = json!({
            "model": model.unwrap_or(self.model.as_str()),
            "max_tokens": max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": turns,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| request_failed(PROVIDER, e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let hint = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(http_error(PROVIDER, status, hint, &text));
        }
        Ok(response)
    }

    async fn call(&self, body: Value) -> Result<ClaudeResponse, LlmError> {
        let response = self.send(&body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| request_failed(PROVIDER, e))?;
        serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("failed to parse response: {e}"),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self, model: &str) -> (Decimal, Decimal) {
        model_cost(model)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.build_body(
            &request.messages,
            &[],
            request.model.as_deref(),
            request.max_tokens,
            false,
        );
        let response = self.call(body).await?;
        let (content, _) = response.split_content();
        Ok(CompletionResponse {
            content: content.unwrap_or_default(),
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            finish_reason: finish_reason(response.stop_reason.as_deref()),
            response_id: Some(response.id),
        })
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let body = self.build_body(
            &request.messages,
            &request.tools,
            request.model.as_deref(),
            request.max_tokens,
            false,
        );
        let response = self.call(body).await?;
        let (content, tool_calls) = response.split_content();
        Ok(ToolCompletionResponse {
            content,
            tool_calls,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            finish_reason: finish_reason(response.stop_reason.as_deref()),
        })
    }

    async fn stream_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ChunkStream, LlmError> {
        let body = self.build_body(
            &request.messages,
            &request.tools,
            request.model.as_deref(),
            request.max_tokens,
            true,
        );
        let response = self.send(&body).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut sse = SseBuffer::default();
            let mut state = StreamState::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(request_failed(PROVIDER, e))).await;
                        return;
                    }
                };
                for payload in sse.push(&chunk) {
                    match state.on_event(&payload) {
                        Ok(out) => {
                            for item in out {
                                if tx.send(Ok(item)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Split out system text and convert the rest into Claude turns.
///
/// Consecutive tool results are folded into a single user turn.
fn to_claude_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));

    let mut turns: Vec<Value> = Vec::new();
    for message in messages.iter().filter(|m| m.role != Role::System) {
        match message.role {
            Role::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content,
                });
                let appended = turns
                    .last_mut()
                    .filter(|t| t["role"] == "user" && is_tool_result_turn(t))
                    .and_then(|t| t["content"].as_array_mut())
                    .map(|blocks| blocks.push(block.clone()))
                    .is_some();
                if !appended {
                    turns.push(json!({ "role": "user", "content": [block] }));
                }
            }
            Role::Assistant if !message.tool_calls.is_empty() => {
                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": message.content }));
                }
                for call in &message.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                turns.push(json!({ "role": "assistant", "content": blocks }));
            }
            role => {
                turns.push(json!({ "role": role.as_str(), "content": message.content }));
            }
        }
    }
    (system, turns)
}

fn is_tool_result_turn(turn: &Value) -> bool {
    turn["content"]
        .as_array()
        .is_some_and(|blocks| blocks.iter().all(|b| b["type"] == "tool_result"))
}

fn finish_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") | None => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolUse,
        Some("refusal") => FinishReason::ContentFilter,
        Some(_) => FinishReason::Unknown,
    }
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    id: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

impl ClaudeResponse {
    fn split_content(&self) -> (Option<String>, Vec<ToolCall>) {
        let mut text = String::new();
        let mut calls = Vec::new();
        for block in &self.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(t),
                ContentBlock::ToolUse { id, name, input } => calls.push(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                }),
                ContentBlock::Other => {}
            }
        }
        ((!text.is_empty()).then_some(text), calls)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Tool call being assembled from `input_json_delta` fragments.
#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    json: String,
}

/// Folds Messages API stream events into [`StreamChunk`]s.
#[derive(Debug, Default)]
struct StreamState {
    tools: BTreeMap<u64, PendingToolUse>,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
}

impl StreamState {
    fn on_event(&mut self, data: &str) -> Result<Vec<StreamChunk>, LlmError> {
        let event: Value = serde_json::from_str(data)?;
        let index = event["index"].as_u64().unwrap_or_default();
        let mut out = Vec::new();

        match event["type"].as_str().unwrap_or_default() {
            "message_start" => {
                self.input_tokens = event
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or_default() as u32;
            }
            "content_block_start" => {
                let block = &event["content_block"];
                if block["type"] == "tool_use" {
                    self.tools.insert(
                        index,
                        PendingToolUse {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            json: String::new(),
                        },
                    );
                }
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            out.push(StreamChunk::Text(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(tool) = self.tools.get_mut(&index) {
                            tool.json
                                .push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(tool) = self.tools.remove(&index) {
                    let arguments = if tool.json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&tool.json)?
                    };
                    out.push(StreamChunk::ToolCall(ToolCall {
                        id: tool.id,
                        name: tool.name,
                        arguments,
                    }));
                }
            }
            "message_delta" => {
                if let Some(reason) = event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(n) = event.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    self.output_tokens = n as u32;
                }
            }
            "message_stop" => out.push(StreamChunk::Done {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
                finish_reason: finish_reason(self.stop_reason.as_deref()),
            }),
            "error" => {
                let message = event
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream error")
                    .to_string();
                let status = match event.pointer("/error/type").and_then(Value::as_str) {
                    Some("overloaded_error") => 529,
                    Some("rate_limit_error") => 429,
                    Some("invalid_request_error") => 400,
                    _ => 500,
                };
                return Err(LlmError::Http {
                    provider: PROVIDER.to_string(),
                    status,
                    message,
                });
            }
            _ => {}
        }
        Ok(out)
    }
}
