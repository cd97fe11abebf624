//! Activity stream for job processing: structured events for observers.
//!
//! Events are broadcast from the orchestrator. Nobody has to listen: a send
//! with no subscribers is dropped silently and never affects the job.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::llm::FailoverReason;

/// Buffered events per subscriber before it starts lagging.
pub const ACTIVITY_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerActivity {
    /// A job lease was acquired.
    Claimed {
        job_id: Uuid,
        processor_id: String,
        attempt: u32,
    },
    /// Conversation history was compacted before generation.
    Compacted {
        job_id: Uuid,
        before: usize,
        after: usize,
        /// False when the deterministic fallback summary was used.
        ai_summary: bool,
    },
    /// A transient model failure will be retried.
    RetryScheduled {
        job_id: Uuid,
        model: String,
        attempt: u32,
        reason: FailoverReason,
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
    /// A fallback model is about to be tried.
    FallbackAttempted {
        job_id: Uuid,
        model: String,
        fallback_attempt: usize,
    },
    /// A high-risk tool call is waiting on a human.
    ApprovalRequested {
        job_id: Uuid,
        approval_id: Uuid,
        tool_name: String,
    },
    /// Incremental reply text while streaming.
    ReplyDelta { job_id: Uuid, text: String },
    /// The lease was found lost at a checkpoint; the job was abandoned.
    LeaseLost { job_id: Uuid, phase: String },
    Completed {
        job_id: Uuid,
        model_used: String,
        fallback_attempt: usize,
    },
    Requeued {
        job_id: Uuid,
        reason: FailoverReason,
        attempt: u32,
    },
    Failed {
        job_id: Uuid,
        reason: String,
        message: String,
    },
}

impl WorkerActivity {
    /// Get the job ID from any variant.
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Claimed { job_id, .. }
            | Self::Compacted { job_id, .. }
            | Self::RetryScheduled { job_id, .. }
            | Self::FallbackAttempted { job_id, .. }
            | Self::ApprovalRequested { job_id, .. }
            | Self::ReplyDelta { job_id, .. }
            | Self::LeaseLost { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Requeued { job_id, .. }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Publisher handle. Clones share one channel.
#[derive(Debug, Clone)]
pub struct ActivityFeed {
    tx: broadcast::Sender<WorkerActivity>,
}

impl ActivityFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ACTIVITY_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerActivity> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: WorkerActivity) {
        // Err only means there are no receivers.
        let _ = self.tx.send(event);
    }
}

impl Default for ActivityFeed {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
