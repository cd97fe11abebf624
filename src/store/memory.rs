//! In-process store for tests and `--in-memory` runs.
//!
//! Each map sits behind its own async mutex; every trait method takes the
//! lock once, so claim and heartbeat are atomic with respect to each other.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::llm::Role;
use crate::store::traits::{
    ApprovalRequest, ApprovalStatus, ApprovalStore, Conversation, ConversationStore, Database, Job,
    JobOutcome, JobStatus, JobStore, Memory, MemoryStore, NewJob, StoredMessage,
};

#[derive(Default)]
pub struct InMemoryStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    conversations: Mutex<HashMap<Uuid, Conversation>>,
    messages: Mutex<HashMap<Uuid, Vec<StoredMessage>>>,
    approvals: Mutex<HashMap<Uuid, ApprovalRequest>>,
    memories: Mutex<Vec<Memory>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a job as-is.
    pub async fn put_job(&self, job: Job) {
        self.jobs.lock().await.insert(job.id, job);
    }

    pub async fn all_approvals(&self) -> Vec<ApprovalRequest> {
        self.approvals.lock().await.values().cloned().collect()
    }

    pub async fn all_memories(&self) -> Vec<Memory> {
        self.memories.lock().await.clone()
    }
}

fn lease_expiry(lock: Duration) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lock).unwrap_or(chrono::Duration::MAX)
}

fn holds(job: &Job, processor_id: Option<&str>) -> bool {
    processor_id.is_none_or(|pid| job.processor_id.as_deref() == Some(pid))
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn enqueue(&self, new: NewJob) -> Result<Job, DatabaseError> {
        let job = Job::from_new(new);
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn pending_jobs(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        let jobs = self.jobs.lock().await;
        let mut pending: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn processing_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .cloned()
            .collect())
    }

    async fn claim(&self, id: Uuid, processor_id: &str, lock: Duration) -> Result<bool, DatabaseError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Pending {
            return Ok(false);
        }
        job.status = JobStatus::Processing;
        job.processor_id = Some(processor_id.to_string());
        job.locked_until = Some(lease_expiry(lock));
        job.started_at = Some(Utc::now());
        Ok(true)
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        processor_id: &str,
        lock: Duration,
    ) -> Result<bool, DatabaseError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Processing && holds(job, Some(processor_id)) =>
            {
                job.locked_until = Some(lease_expiry(lock));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        id: Uuid,
        processor_id: &str,
        outcome: &JobOutcome,
    ) -> Result<bool, DatabaseError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Processing && holds(job, Some(processor_id)) =>
            {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                job.locked_until = None;
                job.outcome = Some(outcome.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        id: Uuid,
        processor_id: Option<&str>,
        reason: &str,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing && holds(job, processor_id) => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(Utc::now());
                job.locked_until = None;
                job.error_reason = Some(reason.to_string());
                job.error_message = Some(message.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue(&self, id: Uuid, processor_id: Option<&str>) -> Result<bool, DatabaseError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing && holds(job, processor_id) => {
                job.status = JobStatus::Pending;
                job.attempt_count += 1;
                job.processor_id = None;
                job.locked_until = None;
                job.started_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_conversation(
        &self,
        conversation: Conversation,
    ) -> Result<Conversation, DatabaseError> {
        self.conversations
            .lock()
            .await
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        Ok(self.conversations.lock().await.get(&id).cloned())
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        Ok(self
            .messages
            .lock()
            .await
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage, DatabaseError> {
        if !self.conversations.lock().await.contains_key(&conversation_id) {
            return Err(DatabaseError::NotFound {
                entity: "conversation".to_string(),
                id: conversation_id.to_string(),
            });
        }
        let message = StoredMessage {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.messages
            .lock()
            .await
            .entry(conversation_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn save_summary(
        &self,
        conversation_id: Uuid,
        summary: &str,
        summarized_count: usize,
    ) -> Result<(), DatabaseError> {
        let mut conversations = self.conversations.lock().await;
        let conversation =
            conversations
                .get_mut(&conversation_id)
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "conversation".to_string(),
                    id: conversation_id.to_string(),
                })?;
        conversation.summary = Some(summary.to_string());
        conversation.summarized_count = summarized_count;
        Ok(())
    }
}

#[async_trait]
impl ApprovalStore for InMemoryStore {
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<Uuid, DatabaseError> {
        self.approvals
            .lock()
            .await
            .insert(request.id, request.clone());
        Ok(request.id)
    }

    async fn approval_status(&self, id: Uuid) -> Result<Option<ApprovalStatus>, DatabaseError> {
        Ok(self.approvals.lock().await.get(&id).map(|a| a.status))
    }

    async fn resolve_approval(
        &self,
        id: Uuid,
        status: ApprovalStatus,
    ) -> Result<bool, DatabaseError> {
        let mut approvals = self.approvals.lock().await;
        match approvals.get_mut(&id) {
            Some(request) if request.status == ApprovalStatus::Pending => {
                request.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn store_memory(
        &self,
        conversation_id: Option<Uuid>,
        kind: &str,
        content: &str,
    ) -> Result<Uuid, DatabaseError> {
        let memory = Memory {
            id: Uuid::new_v4(),
            conversation_id,
            kind: kind.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let id = memory.id;
        self.memories.lock().await.push(memory);
        Ok(id)
    }

    async fn search_memories(
        &self,
        conversation_id: Option<Uuid>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Memory>, DatabaseError> {
        let needle = query.to_lowercase();
        let memories = self.memories.lock().await;
        Ok(memories
            .iter()
            .rev()
            .filter(|m| conversation_id.is_none() || m.conversation_id == conversation_id)
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Database for InMemoryStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}
