//! LLM integration for the reply worker.
//!
//! Supports:
//! - **Anthropic**: Messages API over reqwest, with SSE streaming
//! - **OpenAI**: any chat-completions compatible endpoint
//!
//! Failure handling lives alongside the providers: [`classifier`] maps errors
//! to a closed set of reasons, [`retry`] backs off on transient ones, and
//! [`failover`] walks the primary and fallback models in order.

mod anthropic;
pub mod classifier;
mod costs;
pub mod failover;
mod http;
mod openai;
pub mod provider;
pub mod reasoning;
pub mod retry;

pub use anthropic::AnthropicProvider;
pub use classifier::{FailoverReason, FailureSignal, classify, is_retryable};
pub use costs::model_cost;
pub use failover::{CascadeEvent, FallbackOutcome, run_with_fallback};
pub use openai::OpenAiProvider;
pub use provider::*;
pub use reasoning::{Reasoning, ReasoningContext, RespondOutput, RespondResult, TokenUsage};
pub use retry::{RetryEvent, with_retry};

use std::sync::Arc;

use crate::error::ConfigError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl std::str::FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "open_ai" | "openai-compatible" => Ok(Self::OpenAi),
            other => Err(format!("unknown LLM backend: {other}")),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    /// Default model; requests inside the fallback cascade override it.
    pub model: String,
    pub base_url: Option<String>,
}

impl LlmConfig {
    /// Read `WORKER_LLM_BACKEND`, the backend's API key variable, and
    /// `WORKER_LLM_BASE_URL`. `model` is the configured primary model.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ConfigError> {
        let backend: LlmBackend = std::env::var("WORKER_LLM_BACKEND")
            .unwrap_or_else(|_| "anthropic".to_string())
            .parse()
            .map_err(|message| ConfigError::InvalidValue {
                key: "WORKER_LLM_BACKEND".to_string(),
                message,
            })?;

        let key_var = match backend {
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
            LlmBackend::OpenAi => "OPENAI_API_KEY",
        };
        let api_key = std::env::var("WORKER_LLM_API_KEY")
            .or_else(|_| std::env::var(key_var))
            .map_err(|_| ConfigError::MissingEnvVar(key_var.to_string()))?;

        Ok(Self {
            backend,
            api_key: secrecy::SecretString::from(api_key),
            model: model.into(),
            base_url: std::env::var("WORKER_LLM_BASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Arc<dyn LlmProvider> {
    match config.backend {
        LlmBackend::Anthropic => {
            tracing::info!(model = %config.model, "Using Anthropic");
            Arc::new(AnthropicProvider::new(
                config.api_key.clone(),
                &config.model,
                config.base_url.clone(),
            ))
        }
        LlmBackend::OpenAi => {
            tracing::info!(model = %config.model, "Using OpenAI-compatible endpoint");
            Arc::new(OpenAiProvider::new(
                config.api_key.clone(),
                &config.model,
                config.base_url.clone(),
            ))
        }
    }
}
