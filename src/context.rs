//! Job context: what a tool knows about the job that invoked it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::channels::ChannelKind;
use crate::store::{Conversation, Job};

/// Shared lease-lost flag. The heartbeat sets it; tools read it before
/// doing anything irreversible. Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct LeaseSignal(Arc<AtomicBool>);

impl LeaseSignal {
    pub fn is_lost(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set the flag. Returns true if it was already set.
    pub fn mark_lost(&self) -> bool {
        self.0.swap(true, Ordering::SeqCst)
    }
}

/// Context for a running job.
#[derive(Debug, Clone, Serialize)]
pub struct JobContext {
    /// Unique job ID.
    pub job_id: Uuid,
    pub conversation_id: Uuid,
    /// Message that triggered the job, if any.
    pub message_id: Option<Uuid>,
    pub channel: ChannelKind,
    /// User ID that owns the conversation.
    pub user_id: String,
    /// 0 for jobs created from inbound messages.
    pub delegation_depth: u32,
    /// Delegated sub-job created by the worker itself.
    pub is_internal: bool,
    /// Attempt number, starting at 0.
    pub attempt: u32,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// Metadata.
    pub metadata: serde_json::Value,
    /// Lease state of the job, shared with the heartbeat.
    #[serde(skip)]
    pub lease: LeaseSignal,
}

impl Default for JobContext {
    fn default() -> Self {
        Self {
            job_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            message_id: None,
            channel: ChannelKind::Internal,
            user_id: "default".to_string(),
            delegation_depth: 0,
            is_internal: false,
            attempt: 0,
            created_at: Utc::now(),
            metadata: serde_json::Value::Null,
            lease: LeaseSignal::default(),
        }
    }
}

impl JobContext {
    /// Build the context for a claimed job.
    pub fn for_job(job: &Job, conversation: &Conversation) -> Self {
        Self {
            job_id: job.id,
            conversation_id: conversation.id,
            message_id: job.message_id,
            channel: conversation.channel,
            user_id: conversation.user_id.clone(),
            delegation_depth: job.delegation_depth,
            is_internal: job.is_internal,
            attempt: job.attempt_count,
            created_at: job.created_at,
            metadata: serde_json::Value::Null,
            lease: LeaseSignal::default(),
        }
    }

    pub fn with_lease(mut self, lease: LeaseSignal) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_channel(mut self, channel: ChannelKind) -> Self {
        self.channel = channel;
        self
    }
}
