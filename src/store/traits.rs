//! Persistence collaborators used by the worker.
//!
//! The job queue, conversation history, approval records and summary memory
//! are separate capabilities so tests can fake only what they touch.
//! [`Database`] bundles all four for backends that provide everything.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channels::ChannelKind;
use crate::error::DatabaseError;
use crate::llm::Role;
use crate::tools::policy::ToolPolicy;

// ── Jobs ────────────────────────────────────────────────────────────

/// Lifecycle status of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Check if a transition to `target` is allowed.
    ///
    /// `Processing -> Pending` is the requeue path.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A queued reply job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Message that triggered the job.
    pub message_id: Option<Uuid>,
    pub status: JobStatus,
    /// Lease expiry. `None` on jobs claimed before leases existed.
    pub locked_until: Option<DateTime<Utc>>,
    pub processor_id: Option<String>,
    pub attempt_count: u32,
    pub is_internal: bool,
    pub parent_job_id: Option<Uuid>,
    pub delegation_depth: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_reason: Option<String>,
    pub error_message: Option<String>,
    pub outcome: Option<JobOutcome>,
}

impl Job {
    /// Build a fresh pending job.
    pub fn from_new(new: NewJob) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            message_id: new.message_id,
            status: JobStatus::Pending,
            locked_until: None,
            processor_id: None,
            attempt_count: 0,
            is_internal: new.is_internal,
            parent_job_id: new.parent_job_id,
            delegation_depth: new.delegation_depth,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_reason: None,
            error_message: None,
            outcome: None,
        }
    }

    /// Whether a `processing` job has outlived its lease.
    ///
    /// Legacy jobs without `locked_until` are stale once `started_at` is older
    /// than `legacy_threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, legacy_threshold: Duration) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        match (self.locked_until, self.started_at) {
            (Some(until), _) => now > until,
            (None, Some(started)) => {
                let threshold = chrono::Duration::from_std(legacy_threshold)
                    .unwrap_or(chrono::Duration::MAX);
                now.signed_duration_since(started) > threshold
            }
            (None, None) => true,
        }
    }
}

/// Producer-side description of a job to enqueue.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub conversation_id: Uuid,
    pub message_id: Option<Uuid>,
    pub is_internal: bool,
    pub parent_job_id: Option<Uuid>,
    pub delegation_depth: u32,
}

impl NewJob {
    pub fn for_message(conversation_id: Uuid, message_id: Uuid) -> Self {
        Self {
            conversation_id,
            message_id: Some(message_id),
            ..Self::default()
        }
    }
}

/// A tool invocation made while producing a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: serde_json::Value,
    pub output: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// What a completed job produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub reply: String,
    pub model_used: String,
    /// 0 when the primary model answered.
    pub fallback_attempt: usize,
    pub attempted_models: Vec<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<Job, DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Oldest pending jobs first.
    async fn pending_jobs(&self, limit: usize) -> Result<Vec<Job>, DatabaseError>;

    async fn processing_jobs(&self) -> Result<Vec<Job>, DatabaseError>;

    /// Atomically move a pending job to `processing` under `processor_id`.
    ///
    /// Returns `false` when the job is not pending (someone else has it).
    async fn claim(&self, id: Uuid, processor_id: &str, lock: Duration)
    -> Result<bool, DatabaseError>;

    /// Extend the lease. Returns `false` when `processor_id` no longer holds it.
    async fn heartbeat(
        &self,
        id: Uuid,
        processor_id: &str,
        lock: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Mark completed. Fenced on `processor_id`.
    async fn complete(
        &self,
        id: Uuid,
        processor_id: &str,
        outcome: &JobOutcome,
    ) -> Result<bool, DatabaseError>;

    /// Mark failed. When `processor_id` is given the update is fenced on it.
    async fn fail(
        &self,
        id: Uuid,
        processor_id: Option<&str>,
        reason: &str,
        message: &str,
    ) -> Result<bool, DatabaseError>;

    /// Hand a processing job back to the queue and bump its attempt count.
    async fn requeue(&self, id: Uuid, processor_id: Option<&str>) -> Result<bool, DatabaseError>;
}

// ── Conversations ───────────────────────────────────────────────────

/// Conversation metadata the worker needs to build context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub channel: ChannelKind,
    pub user_id: String,
    /// Durable compaction summary covering the first `summarized_count` messages.
    pub summary: Option<String>,
    pub summarized_count: usize,
    pub active_skills: Vec<String>,
    pub agent_policy: Option<ToolPolicy>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(channel: ChannelKind, user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel,
            user_id: user_id.into(),
            summary: None,
            summarized_count: 0,
            active_skills: Vec::new(),
            agent_policy: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.active_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_agent_policy(mut self, policy: ToolPolicy) -> Self {
        self.agent_policy = Some(policy);
        self
    }
}

/// A persisted conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, conversation: Conversation)
    -> Result<Conversation, DatabaseError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    /// All messages in insertion order.
    async fn list_messages(&self, conversation_id: Uuid)
    -> Result<Vec<StoredMessage>, DatabaseError>;

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage, DatabaseError>;

    /// Record that `summary` now covers the first `summarized_count` messages.
    async fn save_summary(
        &self,
        conversation_id: Uuid,
        summary: &str,
        summarized_count: usize,
    ) -> Result<(), DatabaseError>;
}

// ── Approvals ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown approval status: {other}")),
        }
    }
}

/// A request for a human to approve one high-risk tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub job_id: Uuid,
    pub conversation_id: Uuid,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub channel: ChannelKind,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<Uuid, DatabaseError>;

    async fn approval_status(&self, id: Uuid) -> Result<Option<ApprovalStatus>, DatabaseError>;

    /// Record a human decision. Only pending requests can be resolved.
    async fn resolve_approval(&self, id: Uuid, status: ApprovalStatus)
    -> Result<bool, DatabaseError>;
}

// ── Memory ──────────────────────────────────────────────────────────

/// Memory kind used for compaction summaries.
pub const SUMMARY_MEMORY_KIND: &str = "conversation_summary";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub kind: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn store_memory(
        &self,
        conversation_id: Option<Uuid>,
        kind: &str,
        content: &str,
    ) -> Result<Uuid, DatabaseError>;

    /// Case-insensitive substring search, newest first.
    async fn search_memories(
        &self,
        conversation_id: Option<Uuid>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Memory>, DatabaseError>;
}

// ── Everything ──────────────────────────────────────────────────────

/// A backend providing every collaborator.
#[async_trait]
pub trait Database: JobStore + ConversationStore + ApprovalStore + MemoryStore {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}
