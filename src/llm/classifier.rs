//! Failure classification.
//!
//! Maps any failure into a closed set of [`FailoverReason`]s. The retry
//! executor, the fallback cascade, and the orchestrator's requeue decision all
//! speak this vocabulary. Classification is pure: an ordered rule table is
//! evaluated and the first rule whose status set contains the extracted status,
//! or whose regex matches the extracted message, wins.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, JobError, LlmError, ToolError};

/// Why an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    Auth,
    Billing,
    RateLimit,
    Timeout,
    ServerError,
    Network,
    ContentFilter,
    Format,
    ContextOverflow,
    Unknown,
}

impl FailoverReason {
    /// Transient failures worth retrying locally and escalating to fallbacks.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Timeout | Self::ServerError | Self::Network
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Billing => "billing",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::Network => "network",
            Self::ContentFilter => "content_filter",
            Self::Format => "format",
            Self::ContextOverflow => "context_overflow",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-function form of [`FailoverReason::is_retryable`].
pub fn is_retryable(reason: FailoverReason) -> bool {
    reason.is_retryable()
}

/// Anything the classifier can inspect: an optional numeric status plus a message.
pub trait FailureSignal {
    fn failure_status(&self) -> Option<u16> {
        None
    }

    fn failure_message(&self) -> String;

    /// Minimum wait requested by the remote side, if any.
    fn retry_after(&self) -> Option<std::time::Duration> {
        None
    }
}

impl FailureSignal for str {
    fn failure_message(&self) -> String {
        self.to_string()
    }
}

impl FailureSignal for String {
    fn failure_message(&self) -> String {
        self.clone()
    }
}

impl FailureSignal for anyhow::Error {
    fn failure_status(&self) -> Option<u16> {
        self.downcast_ref::<LlmError>().and_then(|e| e.failure_status())
    }

    fn failure_message(&self) -> String {
        format!("{self:#}")
    }
}

impl FailureSignal for LlmError {
    fn failure_status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::AuthFailed { .. } => Some(401),
            Self::Timeout(_) => Some(408),
            _ => None,
        }
    }

    fn failure_message(&self) -> String {
        self.to_string()
    }

    fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl FailureSignal for ToolError {
    fn failure_status(&self) -> Option<u16> {
        match self {
            Self::Timeout { .. } => Some(408),
            _ => None,
        }
    }

    fn failure_message(&self) -> String {
        self.to_string()
    }
}

impl FailureSignal for Error {
    fn failure_status(&self) -> Option<u16> {
        match self {
            Self::Llm(e) => e.failure_status(),
            Self::Tool(e) => e.failure_status(),
            _ => None,
        }
    }

    fn failure_message(&self) -> String {
        self.to_string()
    }

    fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::Llm(e) => e.retry_after(),
            _ => None,
        }
    }
}

impl FailureSignal for JobError {
    fn failure_message(&self) -> String {
        self.to_string()
    }
}

struct Rule {
    reason: FailoverReason,
    statuses: &'static [u16],
    pattern: Regex,
}

fn rule(reason: FailoverReason, statuses: &'static [u16], pattern: &str) -> Rule {
    Rule {
        reason,
        statuses,
        // Patterns are literals below; a bad one is a programming error caught by tests.
        pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("bad classifier pattern: {e}")),
    }
}

/// Ordered rule table. Earlier rules win.
static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    use FailoverReason::*;
    vec![
        rule(
            Auth,
            &[401, 403],
            r"(?i)(invalid[ _-]?api[ _-]?key|unauthori[sz]ed|authentication (failed|error)|permission denied|forbidden|invalid x-api-key)",
        ),
        rule(
            Billing,
            &[402],
            r"(?i)(billing|payment required|insufficient[ _-]?(credits?|quota|funds|balance)|credit balance)",
        ),
        rule(
            RateLimit,
            &[429],
            r"(?i)(rate[ _-]?limit|too many requests|quota exceeded|throttl)",
        ),
        rule(
            ContextOverflow,
            &[413],
            r"(?i)(context[ _-]?length|context window|maximum context|prompt is too long|too many tokens|request too large)",
        ),
        rule(
            ContentFilter,
            &[],
            r"(?i)(content[ _-]?filter|content policy|content management policy|safety system|flagged by moderation)",
        ),
        rule(
            Timeout,
            &[408, 504],
            r"(?i)(timed? ?out|timeout|deadline exceeded|etimedout)",
        ),
        rule(
            ServerError,
            &[500, 502, 503, 529],
            r"(?i)(internal server error|bad gateway|service unavailable|overloaded|server error)",
        ),
        rule(
            Network,
            &[],
            r"(?i)(econnreset|econnrefused|enotfound|eai_again|connection (reset|refused|closed|aborted)|socket hang up|network|dns error|error sending request)",
        ),
        rule(
            Format,
            &[400, 422],
            r"(?i)(invalid request|malformed|invalid json|json schema|bad request|unexpected token|failed to parse)",
        ),
    ]
});

/// Classify from an extracted message and optional status.
pub fn classify_parts(message: &str, status: Option<u16>) -> FailoverReason {
    RULES
        .iter()
        .find(|r| status.is_some_and(|s| r.statuses.contains(&s)) || r.pattern.is_match(message))
        .map(|r| r.reason)
        .unwrap_or(FailoverReason::Unknown)
}

/// Classify any failure signal.
pub fn classify<E: FailureSignal + ?Sized>(err: &E) -> FailoverReason {
    classify_parts(&err.failure_message(), err.failure_status())
}
