//! libSQL backend: async implementation of every store trait.
//!
//! Supports local file and in-memory databases. Lease fencing is done in the
//! `WHERE` clause of each update so two workers sharing one file can never
//! both win a claim.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::channels::ChannelKind;
use crate::error::DatabaseError;
use crate::llm::Role;
use crate::store::migrations;
use crate::store::traits::{
    ApprovalRequest, ApprovalStatus, ApprovalStore, Conversation, ConversationStore, Database, Job,
    JobOutcome, JobStatus, JobStore, Memory, MemoryStore, NewJob, StoredMessage,
};
use crate::tools::policy::ToolPolicy;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and `--in-memory` runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn lease_expiry_millis(lock: Duration) -> i64 {
    let lock = chrono::Duration::from_std(lock).unwrap_or(chrono::Duration::MAX);
    to_millis(Utc::now() + lock)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn parse_opt_uuid(s: Option<String>, column: &str) -> Result<Option<Uuid>, DatabaseError> {
    s.map(|s| parse_uuid(&s, column)).transpose()
}

fn text(row: &libsql::Row, idx: i32, name: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

fn int(row: &libsql::Row, idx: i32, name: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

const JOB_COLUMNS: &str = "id, conversation_id, message_id, status, locked_until, processor_id, \
     attempt_count, is_internal, parent_job_id, delegation_depth, created_at, started_at, \
     completed_at, error_reason, error_message, outcome";

/// Map a row selected with [`JOB_COLUMNS`] to a [`Job`].
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id: String = text(row, 0, "jobs.id")?;
    let conversation_id: String = text(row, 1, "jobs.conversation_id")?;
    let status: String = text(row, 3, "jobs.status")?;
    let outcome: Option<String> = row.get(15).ok();

    let outcome = outcome
        .map(|s| serde_json::from_str::<JobOutcome>(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("jobs.outcome: {e}")))?;

    Ok(Job {
        id: parse_uuid(&id, "jobs.id")?,
        conversation_id: parse_uuid(&conversation_id, "jobs.conversation_id")?,
        message_id: parse_opt_uuid(row.get(2).ok(), "jobs.message_id")?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        locked_until: row.get::<i64>(4).ok().map(from_millis),
        processor_id: row.get(5).ok(),
        attempt_count: int(row, 6, "jobs.attempt_count")? as u32,
        is_internal: int(row, 7, "jobs.is_internal")? != 0,
        parent_job_id: parse_opt_uuid(row.get(8).ok(), "jobs.parent_job_id")?,
        delegation_depth: int(row, 9, "jobs.delegation_depth")? as u32,
        created_at: from_millis(int(row, 10, "jobs.created_at")?),
        started_at: row.get::<i64>(11).ok().map(from_millis),
        completed_at: row.get::<i64>(12).ok().map(from_millis),
        error_reason: row.get(13).ok(),
        error_message: row.get(14).ok(),
        outcome,
    })
}

const CONVERSATION_COLUMNS: &str =
    "id, channel, user_id, summary, summarized_count, active_skills, agent_policy, created_at";

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let id: String = text(row, 0, "conversations.id")?;
    let channel: String = text(row, 1, "conversations.channel")?;
    let skills: String = text(row, 5, "conversations.active_skills")?;
    let policy: Option<String> = row.get(6).ok();

    let active_skills: Vec<String> = serde_json::from_str(&skills)
        .map_err(|e| DatabaseError::Serialization(format!("conversations.active_skills: {e}")))?;
    let agent_policy = policy
        .map(|s| serde_json::from_str::<ToolPolicy>(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("conversations.agent_policy: {e}")))?;

    Ok(Conversation {
        id: parse_uuid(&id, "conversations.id")?,
        channel: channel
            .parse::<ChannelKind>()
            .map_err(DatabaseError::Serialization)?,
        user_id: text(row, 2, "conversations.user_id")?,
        summary: row.get(3).ok(),
        summarized_count: int(row, 4, "conversations.summarized_count")? as usize,
        active_skills,
        agent_policy,
        created_at: from_millis(int(row, 7, "conversations.created_at")?),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, DatabaseError> {
    let id: String = text(row, 0, "conversation_messages.id")?;
    let conversation_id: String = text(row, 1, "conversation_messages.conversation_id")?;
    let role: String = text(row, 2, "conversation_messages.role")?;

    Ok(StoredMessage {
        id: parse_uuid(&id, "conversation_messages.id")?,
        conversation_id: parse_uuid(&conversation_id, "conversation_messages.conversation_id")?,
        role: role.parse::<Role>().map_err(DatabaseError::Serialization)?,
        content: text(row, 3, "conversation_messages.content")?,
        created_at: from_millis(int(row, 4, "conversation_messages.created_at")?),
    })
}

fn row_to_memory(row: &libsql::Row) -> Result<Memory, DatabaseError> {
    let id: String = text(row, 0, "memories.id")?;
    Ok(Memory {
        id: parse_uuid(&id, "memories.id")?,
        conversation_id: parse_opt_uuid(row.get(1).ok(), "memories.conversation_id")?,
        kind: text(row, 2, "memories.kind")?,
        content: text(row, 3, "memories.content")?,
        created_at: from_millis(int(row, 4, "memories.created_at")?),
    })
}

impl LibSqlBackend {
    async fn query_jobs(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => jobs.push(row_to_job(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(jobs)
    }
}

// ── Jobs ────────────────────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn enqueue(&self, new: NewJob) -> Result<Job, DatabaseError> {
        let job = Job::from_new(new);
        self.conn()
            .execute(
                "INSERT INTO jobs (id, conversation_id, message_id, status, attempt_count, is_internal, parent_job_id, delegation_depth, created_at) VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6, ?7)",
                params![
                    job.id.to_string(),
                    job.conversation_id.to_string(),
                    opt_uuid(job.message_id),
                    job.is_internal as i64,
                    opt_uuid(job.parent_job_id),
                    job.delegation_depth as i64,
                    to_millis(job.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        debug!(job_id = %job.id, conversation_id = %job.conversation_id, "Job enqueued");
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut jobs = self
            .query_jobs(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
                "get_job",
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn pending_jobs(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending' ORDER BY created_at ASC, rowid ASC LIMIT ?1"
            ),
            params![limit as i64],
            "pending_jobs",
        )
        .await
    }

    async fn processing_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'processing'"),
            (),
            "processing_jobs",
        )
        .await
    }

    async fn claim(
        &self,
        id: Uuid,
        processor_id: &str,
        lock: Duration,
    ) -> Result<bool, DatabaseError> {
        let now = to_millis(Utc::now());
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'processing', processor_id = ?2, locked_until = ?3, started_at = ?4 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), processor_id, lease_expiry_millis(lock), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim: {e}")))?;

        debug!(job_id = %id, processor_id, claimed = affected == 1, "Claim attempted");
        Ok(affected == 1)
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        processor_id: &str,
        lock: Duration,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET locked_until = ?3 WHERE id = ?1 AND status = 'processing' AND processor_id = ?2",
                params![id.to_string(), processor_id, lease_expiry_millis(lock)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("heartbeat: {e}")))?;
        Ok(affected == 1)
    }

    async fn complete(
        &self,
        id: Uuid,
        processor_id: &str,
        outcome: &JobOutcome,
    ) -> Result<bool, DatabaseError> {
        let outcome_json = serde_json::to_string(outcome)
            .map_err(|e| DatabaseError::Serialization(format!("complete: {e}")))?;
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'completed', completed_at = ?3, locked_until = NULL, outcome = ?4 WHERE id = ?1 AND status = 'processing' AND processor_id = ?2",
                params![
                    id.to_string(),
                    processor_id,
                    to_millis(Utc::now()),
                    outcome_json
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete: {e}")))?;
        Ok(affected == 1)
    }

    async fn fail(
        &self,
        id: Uuid,
        processor_id: Option<&str>,
        reason: &str,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'failed', completed_at = ?3, locked_until = NULL, error_reason = ?4, error_message = ?5 WHERE id = ?1 AND status = 'processing' AND (?2 IS NULL OR processor_id = ?2)",
                params![
                    id.to_string(),
                    opt_text(processor_id),
                    to_millis(Utc::now()),
                    reason,
                    message
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail: {e}")))?;
        Ok(affected == 1)
    }

    async fn requeue(&self, id: Uuid, processor_id: Option<&str>) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'pending', processor_id = NULL, locked_until = NULL, started_at = NULL, attempt_count = attempt_count + 1 WHERE id = ?1 AND status = 'processing' AND (?2 IS NULL OR processor_id = ?2)",
                params![id.to_string(), opt_text(processor_id)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue: {e}")))?;
        Ok(affected == 1)
    }
}

// ── Conversations ───────────────────────────────────────────────────

#[async_trait]
impl ConversationStore for LibSqlBackend {
    async fn create_conversation(
        &self,
        conversation: Conversation,
    ) -> Result<Conversation, DatabaseError> {
        let skills = serde_json::to_string(&conversation.active_skills)
            .map_err(|e| DatabaseError::Serialization(format!("create_conversation: {e}")))?;
        let policy = conversation
            .agent_policy
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("create_conversation: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO conversations (id, channel, user_id, summary, summarized_count, active_skills, agent_policy, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    conversation.id.to_string(),
                    conversation.channel.as_str(),
                    conversation.user_id.as_str(),
                    opt_text(conversation.summary.as_deref()),
                    conversation.summarized_count as i64,
                    skills,
                    opt_text(policy.as_deref()),
                    to_millis(conversation.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_conversation: {e}")))?;
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_conversation(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_conversation: {e}"))),
        }
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, conversation_id, role, content, created_at FROM conversation_messages WHERE conversation_id = ?1 ORDER BY seq ASC",
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => messages.push(row_to_message(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_messages: {e}"))),
            }
        }
        Ok(messages)
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage, DatabaseError> {
        if self.get_conversation(conversation_id).await?.is_none() {
            return Err(DatabaseError::NotFound {
                entity: "conversation".into(),
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
        self.conn()
            .execute(
                "INSERT INTO conversation_messages (id, conversation_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.id.to_string(),
                    conversation_id.to_string(),
                    role.as_str(),
                    content,
                    to_millis(message.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_message: {e}")))?;
        Ok(message)
    }

    async fn save_summary(
        &self,
        conversation_id: Uuid,
        summary: &str,
        summarized_count: usize,
    ) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE conversations SET summary = ?2, summarized_count = ?3 WHERE id = ?1",
                params![conversation_id.to_string(), summary, summarized_count as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_summary: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: conversation_id.to_string(),
            });
        }
        debug!(%conversation_id, summarized_count, "Conversation summary saved");
        Ok(())
    }
}

// ── Approvals ───────────────────────────────────────────────────────

#[async_trait]
impl ApprovalStore for LibSqlBackend {
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<Uuid, DatabaseError> {
        let input = serde_json::to_string(&request.input)
            .map_err(|e| DatabaseError::Serialization(format!("create_approval: {e}")))?;
        self.conn()
            .execute(
                "INSERT INTO approvals (id, job_id, conversation_id, tool_name, input, channel, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    request.id.to_string(),
                    request.job_id.to_string(),
                    request.conversation_id.to_string(),
                    request.tool_name.as_str(),
                    input,
                    request.channel.as_str(),
                    request.status.as_str(),
                    to_millis(request.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_approval: {e}")))?;
        Ok(request.id)
    }

    async fn approval_status(&self, id: Uuid) -> Result<Option<ApprovalStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM approvals WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("approval_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = text(&row, 0, "approvals.status")?;
                Ok(Some(status.parse().map_err(DatabaseError::Serialization)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("approval_status: {e}"))),
        }
    }

    async fn resolve_approval(
        &self,
        id: Uuid,
        status: ApprovalStatus,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE approvals SET status = ?2 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_approval: {e}")))?;
        Ok(affected == 1)
    }
}

// ── Memory ──────────────────────────────────────────────────────────

#[async_trait]
impl MemoryStore for LibSqlBackend {
    async fn store_memory(
        &self,
        conversation_id: Option<Uuid>,
        kind: &str,
        content: &str,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO memories (id, conversation_id, kind, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    opt_uuid(conversation_id),
                    kind,
                    content,
                    to_millis(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("store_memory: {e}")))?;
        Ok(id)
    }

    async fn search_memories(
        &self,
        conversation_id: Option<Uuid>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Memory>, DatabaseError> {
        // SQLite's lower() only folds ASCII, so matching happens here.
        let needle = query.to_lowercase();
        let mut rows = self
            .conn()
            .query(
                "SELECT id, conversation_id, kind, content, created_at FROM memories WHERE (?1 IS NULL OR conversation_id = ?1) ORDER BY created_at DESC, rowid DESC",
                params![opt_uuid(conversation_id)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("search_memories: {e}")))?;

        let mut memories = Vec::new();
        while memories.len() < limit {
            match rows.next().await {
                Ok(Some(row)) => {
                    let memory = row_to_memory(&row)?;
                    if memory.content.to_lowercase().contains(&needle) {
                        memories.push(memory);
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("search_memories: {e}"))),
            }
        }
        Ok(memories)
    }
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }
}
