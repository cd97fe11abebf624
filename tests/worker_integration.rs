//! End-to-end tests: orchestrator and worker loop against real stores.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use reply_worker::channels::ChannelKind;
use reply_worker::config::{ApprovalConfig, LeaseConfig, RetryConfig, WorkerConfig};
use reply_worker::context::JobContext;
use reply_worker::error::{DatabaseError, LlmError};
use reply_worker::extensions::{ExtensionRegistry, Plugin};
use reply_worker::llm::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Reasoning, Role, ToolCall,
    ToolCompletionRequest, ToolCompletionResponse,
};
use reply_worker::store::{
    ApprovalStatus, ApprovalStore, Conversation, ConversationStore, InMemoryStore, Job,
    JobOutcome, JobStatus, JobStore, LibSqlBackend, NewJob, StoredMessage,
};
use reply_worker::tools::approval::TIMEOUT_MESSAGE;
use reply_worker::tools::builtin::register_builtins;
use reply_worker::tools::{ApprovalGate, Tool, ToolError, ToolOutput, ToolPolicy, ToolRegistry};
use reply_worker::worker::{
    ActivityFeed, JobDisposition, Orchestrator, OrchestratorDeps, Worker, WorkerActivity,
};

// ── Fakes ───────────────────────────────────────────────────────────

type Step = Result<ToolCompletionResponse, LlmError>;

struct ScriptedLlm {
    steps: Mutex<VecDeque<Step>>,
    delay: Duration,
    calls: AtomicUsize,
    /// Answer for summarization requests; `None` makes them fail.
    summary: Option<&'static str>,
}

impl ScriptedLlm {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Self::slow(steps, Duration::ZERO)
    }

    fn slow(steps: Vec<Step>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            delay,
            calls: AtomicUsize::new(0),
            summary: None,
        })
    }

    fn summarizing(steps: Vec<Step>, summary: &'static str) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            summary: Some(summary),
        })
    }
}

fn reply(text: &str) -> Step {
    Ok(ToolCompletionResponse {
        content: Some(text.to_string()),
        tool_calls: Vec::new(),
        input_tokens: 12,
        output_tokens: 4,
        finish_reason: FinishReason::Stop,
    })
}

fn tool_call(name: &str, arguments: serde_json::Value) -> Step {
    Ok(ToolCompletionResponse {
        content: None,
        tool_calls: vec![ToolCall {
            id: format!("call_{name}"),
            name: name.to_string(),
            arguments,
        }],
        input_tokens: 12,
        output_tokens: 4,
        finish_reason: FinishReason::ToolUse,
    })
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        match self.summary {
            Some(text) => Ok(CompletionResponse {
                content: text.to_string(),
                input_tokens: 40,
                output_tokens: 8,
                finish_reason: FinishReason::Stop,
                response_id: None,
            }),
            None => Err(LlmError::Http {
                provider: "scripted".into(),
                status: 503,
                message: "summarizer unavailable".into(),
            }),
        }
    }

    async fn complete_with_tools(
        &self,
        _request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.steps
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| reply("(script exhausted)"))
    }
}

/// High-risk tool that counts how often its body actually ran.
struct TransferFunds {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for TransferFunds {
    fn name(&self) -> &str {
        "transfer_funds"
    }

    fn description(&self) -> &str {
        "Move money between accounts"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {"amount": {"type": "number"}}})
    }

    fn requires_approval(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        _ctx: &JobContext,
    ) -> Result<ToolOutput, ToolError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::text("transferred", Duration::ZERO))
    }
}

fn test_config() -> WorkerConfig {
    let mut config = WorkerConfig {
        processor_id: "it-worker".into(),
        poll_interval: Duration::from_millis(10),
        reconcile_interval: Duration::from_millis(50),
        retry: RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        },
        lease: LeaseConfig {
            lock: Duration::from_secs(5),
            heartbeat: Duration::from_millis(500),
            ..LeaseConfig::default()
        },
        approval: ApprovalConfig {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(60),
            ..ApprovalConfig::default()
        },
        ..WorkerConfig::default()
    };
    config.model.primary = "primary-model".into();
    config.model.fallbacks = vec!["backup-model".into()];
    config
}

async fn orchestrator_for(
    store: Arc<InMemoryStore>,
    llm: Arc<ScriptedLlm>,
    extensions: ExtensionRegistry,
    config: WorkerConfig,
) -> Orchestrator {
    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry, store.clone(), config.max_delegation_depth)
        .await
        .unwrap();
    Orchestrator::new(OrchestratorDeps::from_database(
        store,
        llm,
        registry,
        Arc::new(extensions),
        ActivityFeed::new(),
        Arc::new(config),
    ))
}

async fn seed_conversation(
    store: &InMemoryStore,
    conversation: Conversation,
    user_turns: &[&str],
) -> Job {
    let conversation = store.create_conversation(conversation).await.unwrap();
    let mut last = None;
    for (i, text) in user_turns.iter().enumerate() {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        last = Some(store.append_message(conversation.id, role, text).await.unwrap());
    }
    let message_id = last.map(|m| m.id).unwrap_or_else(Uuid::new_v4);
    store
        .enqueue(NewJob::for_message(conversation.id, message_id))
        .await
        .unwrap()
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn short_conversation_completes_on_primary_without_retries() {
    let store = Arc::new(InMemoryStore::new());
    let job = seed_conversation(
        &store,
        Conversation::new(ChannelKind::Telegram, "alice"),
        &["hi", "hello!", "can you help?", "sure", "what is 2+2?"],
    )
    .await;
    let llm = ScriptedLlm::new(vec![reply("4")]);
    let orchestrator = orchestrator_for(store.clone(), llm.clone(), ExtensionRegistry::new(), test_config()).await;
    let mut events = orchestrator.activity().subscribe();

    let disposition = orchestrator.process(&job).await.unwrap();

    assert_eq!(
        disposition,
        JobDisposition::Completed {
            model_used: "primary-model".into(),
            fallback_attempt: 0
        }
    );
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

    let mut retries = 0;
    let mut fallbacks = 0;
    let mut compactions = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            WorkerActivity::RetryScheduled { .. } => retries += 1,
            WorkerActivity::FallbackAttempted { .. } => fallbacks += 1,
            WorkerActivity::Compacted { .. } => compactions += 1,
            _ => {}
        }
    }
    assert_eq!((retries, fallbacks, compactions), (0, 0, 0));

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    let outcome = stored.outcome.unwrap();
    assert_eq!(outcome.model_used, "primary-model");
    assert_eq!(outcome.attempted_models, vec!["primary-model".to_string()]);
    assert_eq!(outcome.reply, "4");
}

#[tokio::test]
async fn long_history_is_compacted_and_summary_persisted() {
    let store = Arc::new(InMemoryStore::new());
    let turns: Vec<String> = (0..60).map(|i| format!("message number {i}")).collect();
    let turn_refs: Vec<&str> = turns.iter().map(String::as_str).collect();
    let job = seed_conversation(&store, Conversation::new(ChannelKind::Web, "bob"), &turn_refs).await;

    let mut config = test_config();
    config.compaction.context_window = 400;
    let llm = ScriptedLlm::summarizing(vec![reply("caught up")], "Bob counted upward from zero.");
    let orchestrator = orchestrator_for(store.clone(), llm, ExtensionRegistry::new(), config).await;

    let disposition = orchestrator.process(&job).await.unwrap();
    assert!(matches!(disposition, JobDisposition::Completed { .. }));

    let conversation = store.get_conversation(job.conversation_id).await.unwrap().unwrap();
    let summary = conversation.summary.unwrap();
    assert!(summary.starts_with("[Conversation Summary]"));
    assert!(summary.contains("Bob counted upward from zero."));
    assert!(conversation.summarized_count > 0);
    assert!(conversation.summarized_count < 60);
}

#[tokio::test]
async fn summarizer_outage_keeps_the_stored_summary() {
    let store = Arc::new(InMemoryStore::new());
    let turns: Vec<String> = (0..60).map(|i| format!("message number {i}")).collect();
    let turn_refs: Vec<&str> = turns.iter().map(String::as_str).collect();
    let job = seed_conversation(&store, Conversation::new(ChannelKind::Web, "nia"), &turn_refs).await;
    let earlier = "Nia is planning a move to Porto in June.";
    store.save_summary(job.conversation_id, earlier, 10).await.unwrap();

    let mut config = test_config();
    config.compaction.context_window = 400;
    let llm = ScriptedLlm::new(vec![reply("still here")]);
    let orchestrator = orchestrator_for(store.clone(), llm, ExtensionRegistry::new(), config).await;
    let mut events = orchestrator.activity().subscribe();

    let disposition = orchestrator.process(&job).await.unwrap();
    assert!(matches!(disposition, JobDisposition::Completed { .. }));

    let mut fallback_compactions = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, WorkerActivity::Compacted { ai_summary: false, .. }) {
            fallback_compactions += 1;
        }
    }
    assert_eq!(fallback_compactions, 1);

    let conversation = store.get_conversation(job.conversation_id).await.unwrap().unwrap();
    assert_eq!(conversation.summary.as_deref(), Some(earlier));
    assert_eq!(conversation.summarized_count, 10);
}

#[tokio::test]
async fn unapproved_high_risk_tool_never_runs() {
    let store = Arc::new(InMemoryStore::new());
    let job = seed_conversation(
        &store,
        Conversation::new(ChannelKind::Web, "carol"),
        &["send 100 to dave"],
    )
    .await;

    let runs = Arc::new(AtomicUsize::new(0));
    let extensions = ExtensionRegistry::new().with_plugin(
        Plugin::new("banking")
            .with_tool(Arc::new(TransferFunds { runs: runs.clone() }))
            .with_policy(ToolPolicy::default().with_also_allow(["transfer_funds"])),
    );
    let llm = ScriptedLlm::new(vec![
        tool_call("transfer_funds", json!({"amount": 100})),
        reply("I could not complete the transfer."),
    ]);
    let orchestrator = orchestrator_for(store.clone(), llm, extensions, test_config()).await;

    orchestrator.process(&job).await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let outcome = store.get_job(job.id).await.unwrap().unwrap().outcome.unwrap();
    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(outcome.tool_calls[0].output, TIMEOUT_MESSAGE);

    let approvals = store.all_approvals().await;
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].tool_name, "transfer_funds");
    assert_eq!(
        store.approval_status(approvals[0].id).await.unwrap(),
        Some(ApprovalStatus::Pending)
    );

    // Web can prompt in-line, so the request was posted to the conversation.
    let messages = store.list_messages(job.conversation_id).await.unwrap();
    assert!(messages.iter().any(|m| m.content.contains("I need your approval")));
}

#[tokio::test]
async fn approved_high_risk_tool_runs_once() {
    let store = Arc::new(InMemoryStore::new());
    let job = seed_conversation(&store, Conversation::new(ChannelKind::Sms, "erin"), &["pay rent"]).await;

    let runs = Arc::new(AtomicUsize::new(0));
    let extensions = ExtensionRegistry::new().with_plugin(
        Plugin::new("banking")
            .with_tool(Arc::new(TransferFunds { runs: runs.clone() }))
            .with_policy(ToolPolicy::default().with_also_allow(["transfer_funds"])),
    );
    let llm = ScriptedLlm::new(vec![tool_call("transfer_funds", json!({"amount": 900})), reply("Paid.")]);
    let mut config = test_config();
    config.approval.timeout = Duration::from_secs(5);
    let orchestrator = orchestrator_for(store.clone(), llm, extensions, config).await;

    // Approve as soon as the request shows up.
    let approver = {
        let store = store.clone();
        tokio::spawn(async move {
            loop {
                if let Some(request) = store.all_approvals().await.first() {
                    store
                        .resolve_approval(request.id, ApprovalStatus::Approved)
                        .await
                        .unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    orchestrator.process(&job).await.unwrap();
    approver.await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let outcome = store.get_job(job.id).await.unwrap().unwrap().outcome.unwrap();
    assert_eq!(outcome.tool_calls[0].output, "transferred");
}

#[tokio::test]
async fn delegation_past_max_depth_enqueues_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let conversation = store
        .create_conversation(Conversation::new(ChannelKind::Internal, "frank"))
        .await
        .unwrap();
    store
        .append_message(conversation.id, Role::User, "research hotels")
        .await
        .unwrap();
    let config = test_config();
    let job = store
        .enqueue(NewJob {
            conversation_id: conversation.id,
            is_internal: true,
            delegation_depth: config.max_delegation_depth,
            ..NewJob::default()
        })
        .await
        .unwrap();

    let llm = ScriptedLlm::new(vec![
        tool_call("delegate_task", json!({"task": "compare hotel prices"})),
        reply("I will do it myself."),
    ]);
    let orchestrator = orchestrator_for(store.clone(), llm, ExtensionRegistry::new(), config).await;

    orchestrator.process(&job).await.unwrap();

    let outcome = store.get_job(job.id).await.unwrap().unwrap().outcome.unwrap();
    assert!(!outcome.tool_calls[0].success);
    assert!(outcome.tool_calls[0].output.contains("exceeds the limit"));
    assert!(store.pending_jobs(10).await.unwrap().is_empty());
}

// ── Lease loss ──────────────────────────────────────────────────────

/// Refuses every heartbeat and counts store mutations made after the claim.
struct FlakyLeaseStore {
    inner: Arc<InMemoryStore>,
    mutations: AtomicUsize,
}

#[async_trait]
impl JobStore for FlakyLeaseStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job, DatabaseError> {
        self.inner.enqueue(job).await
    }
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        self.inner.get_job(id).await
    }
    async fn pending_jobs(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        self.inner.pending_jobs(limit).await
    }
    async fn processing_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        self.inner.processing_jobs().await
    }
    async fn claim(&self, id: Uuid, processor_id: &str, lock: Duration) -> Result<bool, DatabaseError> {
        self.inner.claim(id, processor_id, lock).await
    }
    async fn heartbeat(&self, _id: Uuid, _pid: &str, _lock: Duration) -> Result<bool, DatabaseError> {
        Err(DatabaseError::Query("connection dropped".into()))
    }
    async fn complete(&self, id: Uuid, pid: &str, outcome: &JobOutcome) -> Result<bool, DatabaseError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.inner.complete(id, pid, outcome).await
    }
    async fn fail(
        &self,
        id: Uuid,
        pid: Option<&str>,
        reason: &str,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.inner.fail(id, pid, reason, message).await
    }
    async fn requeue(&self, id: Uuid, pid: Option<&str>) -> Result<bool, DatabaseError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.inner.requeue(id, pid).await
    }
}

#[async_trait]
impl ConversationStore for FlakyLeaseStore {
    async fn create_conversation(&self, c: Conversation) -> Result<Conversation, DatabaseError> {
        self.inner.create_conversation(c).await
    }
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        self.inner.get_conversation(id).await
    }
    async fn list_messages(&self, id: Uuid) -> Result<Vec<StoredMessage>, DatabaseError> {
        self.inner.list_messages(id).await
    }
    async fn append_message(
        &self,
        id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage, DatabaseError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.inner.append_message(id, role, content).await
    }
    async fn save_summary(&self, id: Uuid, summary: &str, count: usize) -> Result<(), DatabaseError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.inner.save_summary(id, summary, count).await
    }
}

#[tokio::test]
async fn lost_lease_aborts_without_committing() {
    let inner = Arc::new(InMemoryStore::new());
    let job = seed_conversation(&inner, Conversation::new(ChannelKind::Web, "gina"), &["hello"]).await;
    let flaky = Arc::new(FlakyLeaseStore {
        inner: inner.clone(),
        mutations: AtomicUsize::new(0),
    });

    let mut config = test_config();
    config.lease.heartbeat = Duration::from_millis(20);
    let config = Arc::new(config);
    let activity = ActivityFeed::new();
    let mut events = activity.subscribe();

    // The model answers after several heartbeat periods have failed.
    let llm = ScriptedLlm::slow(vec![reply("too late")], Duration::from_millis(150));
    let deps = OrchestratorDeps {
        jobs: flaky.clone(),
        conversations: flaky.clone(),
        memory: inner.clone(),
        reasoning: Arc::new(Reasoning::new(llm)),
        tools: Arc::new(ToolRegistry::new()),
        extensions: Arc::new(ExtensionRegistry::new()),
        approval_gate: Arc::new(ApprovalGate::new(inner.clone(), &config.approval)),
        activity,
        config,
    };
    let orchestrator = Orchestrator::new(deps);

    let disposition = orchestrator.process(&job).await.unwrap();

    assert_eq!(
        disposition,
        JobDisposition::Aborted {
            phase: "pre-finalize".into()
        }
    );
    assert_eq!(flaky.mutations.load(Ordering::SeqCst), 0);
    let stored = inner.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Processing);
    assert!(stored.outcome.is_none());
    let messages = inner.list_messages(job.conversation_id).await.unwrap();
    assert_eq!(messages.len(), 1);

    let mut saw_lost = false;
    while let Ok(event) = events.try_recv() {
        saw_lost |= matches!(event, WorkerActivity::LeaseLost { .. });
    }
    assert!(saw_lost);
}

#[tokio::test]
async fn approval_granted_after_lease_loss_does_not_run_the_tool() {
    let inner = Arc::new(InMemoryStore::new());
    let job = seed_conversation(&inner, Conversation::new(ChannelKind::Web, "hal"), &["wire 500 to ida"]).await;
    let flaky = Arc::new(FlakyLeaseStore {
        inner: inner.clone(),
        mutations: AtomicUsize::new(0),
    });

    let mut config = test_config();
    config.lease.heartbeat = Duration::from_millis(20);
    config.approval.timeout = Duration::from_secs(5);
    let config = Arc::new(config);

    let runs = Arc::new(AtomicUsize::new(0));
    let extensions = ExtensionRegistry::new().with_plugin(
        Plugin::new("banking")
            .with_tool(Arc::new(TransferFunds { runs: runs.clone() }))
            .with_policy(ToolPolicy::default().with_also_allow(["transfer_funds"])),
    );
    let llm = ScriptedLlm::new(vec![
        tool_call("transfer_funds", json!({"amount": 500})),
        reply("Sent."),
    ]);
    let deps = OrchestratorDeps {
        jobs: flaky.clone(),
        conversations: flaky.clone(),
        memory: inner.clone(),
        reasoning: Arc::new(Reasoning::new(llm.clone())),
        tools: Arc::new(ToolRegistry::new()),
        extensions: Arc::new(extensions),
        approval_gate: Arc::new(ApprovalGate::new(inner.clone(), &config.approval)),
        activity: ActivityFeed::new(),
        config,
    };
    let orchestrator = Orchestrator::new(deps);

    // The user approves well after the heartbeat has started failing.
    let approver = {
        let store = inner.clone();
        tokio::spawn(async move {
            loop {
                if let Some(request) = store.all_approvals().await.first() {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    store
                        .resolve_approval(request.id, ApprovalStatus::Approved)
                        .await
                        .unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let disposition = orchestrator.process(&job).await.unwrap();
    approver.await.unwrap();

    assert!(matches!(disposition, JobDisposition::Aborted { .. }));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(flaky.mutations.load(Ordering::SeqCst), 0);
    assert_eq!(
        inner.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Processing
    );
}

// ── libSQL ──────────────────────────────────────────────────────────

#[tokio::test]
async fn libsql_claim_is_exclusive_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let a = LibSqlBackend::new_local(&path).await.unwrap();
    let b = LibSqlBackend::new_local(&path).await.unwrap();

    let conversation = a
        .create_conversation(Conversation::new(ChannelKind::Email, "hank"))
        .await
        .unwrap();
    let message = a
        .append_message(conversation.id, Role::User, "status?")
        .await
        .unwrap();
    let job = a
        .enqueue(NewJob::for_message(conversation.id, message.id))
        .await
        .unwrap();

    let lock = Duration::from_secs(60);
    assert!(a.claim(job.id, "worker-a", lock).await.unwrap());
    assert!(!b.claim(job.id, "worker-b", lock).await.unwrap());

    // Only the holder can renew or finish.
    assert!(!b.heartbeat(job.id, "worker-b", lock).await.unwrap());
    assert!(a.heartbeat(job.id, "worker-a", lock).await.unwrap());
    assert!(!b.requeue(job.id, Some("worker-b")).await.unwrap());

    let seen_by_b = b.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(seen_by_b.status, JobStatus::Processing);
    assert_eq!(seen_by_b.processor_id.as_deref(), Some("worker-a"));

    assert!(a.requeue(job.id, Some("worker-a")).await.unwrap());
    assert!(b.claim(job.id, "worker-b", lock).await.unwrap());
    assert_eq!(b.get_job(job.id).await.unwrap().unwrap().attempt_count, 1);
}

#[tokio::test]
async fn libsql_backend_drives_a_full_job() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(LibSqlBackend::new_local(&dir.path().join("worker.db")).await.unwrap());

    let conversation = db
        .create_conversation(Conversation::new(ChannelKind::WhatsApp, "ivy"))
        .await
        .unwrap();
    let message = db
        .append_message(conversation.id, Role::User, "what time is it?")
        .await
        .unwrap();
    let job = db
        .enqueue(NewJob::for_message(conversation.id, message.id))
        .await
        .unwrap();

    let config = test_config();
    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry, db.clone(), config.max_delegation_depth)
        .await
        .unwrap();
    let llm = ScriptedLlm::new(vec![tool_call("current_time", json!({})), reply("It is late.")]);
    let orchestrator = Orchestrator::new(OrchestratorDeps::from_database(
        db.clone(),
        llm,
        registry,
        Arc::new(ExtensionRegistry::new()),
        ActivityFeed::new(),
        Arc::new(config),
    ));

    let disposition = orchestrator.process(&job).await.unwrap();
    assert!(matches!(disposition, JobDisposition::Completed { .. }));

    let stored = db.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    let outcome = stored.outcome.unwrap();
    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(outcome.tool_calls[0].name, "current_time");
    assert_eq!(outcome.input_tokens, 24);
}

// ── Worker loop ─────────────────────────────────────────────────────

#[tokio::test]
async fn worker_drains_queue_and_stops_on_shutdown() {
    let store = Arc::new(InMemoryStore::new());
    let first = seed_conversation(&store, Conversation::new(ChannelKind::Web, "jo"), &["one"]).await;
    let second = seed_conversation(&store, Conversation::new(ChannelKind::Web, "kim"), &["two"]).await;

    let config = test_config();
    let llm = ScriptedLlm::new(vec![reply("first"), reply("second")]);
    let orchestrator = orchestrator_for(store.clone(), llm, ExtensionRegistry::new(), config.clone()).await;
    let worker = Arc::new(Worker::new(orchestrator, store.clone(), Arc::new(config)));

    let (tx, rx) = watch::channel(false);
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(rx).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let a = store.get_job(first.id).await.unwrap().unwrap().status;
        let b = store.get_job(second.id).await.unwrap().unwrap().status;
        if a == JobStatus::Completed && b == JobStatus::Completed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs did not complete");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}

#[tokio::test]
async fn worker_reconciles_abandoned_jobs() {
    let store = Arc::new(InMemoryStore::new());
    let job = seed_conversation(&store, Conversation::new(ChannelKind::Web, "lee"), &["hello?"]).await;
    // A worker claimed the job and died; its lease has already run out.
    assert!(store.claim(job.id, "dead-worker", Duration::ZERO).await.unwrap());
    tokio::time::sleep(Duration::from_millis(5)).await;

    let config = test_config();
    let llm = ScriptedLlm::new(vec![reply("sorry for the wait")]);
    let orchestrator = orchestrator_for(store.clone(), llm, ExtensionRegistry::new(), config.clone()).await;
    let worker = Worker::new(orchestrator, store.clone(), Arc::new(config));

    let (tx, rx) = watch::channel(false);
    let run = worker.run(rx);
    let stop = async {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get_job(job.id).await.unwrap().unwrap().status != JobStatus::Completed {
            assert!(tokio::time::Instant::now() < deadline, "job was not recovered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
    };
    tokio::join!(run, stop);

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.processor_id.as_deref(), Some("it-worker"));
}

/// Lists pending jobs normally but every claim fails.
struct LockedClaimStore {
    inner: Arc<InMemoryStore>,
    polls: AtomicUsize,
}

#[async_trait]
impl JobStore for LockedClaimStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job, DatabaseError> {
        self.inner.enqueue(job).await
    }
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        self.inner.get_job(id).await
    }
    async fn pending_jobs(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.inner.pending_jobs(limit).await
    }
    async fn processing_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        self.inner.processing_jobs().await
    }
    async fn claim(&self, _id: Uuid, _pid: &str, _lock: Duration) -> Result<bool, DatabaseError> {
        Err(DatabaseError::Query("database is locked".into()))
    }
    async fn heartbeat(&self, id: Uuid, pid: &str, lock: Duration) -> Result<bool, DatabaseError> {
        self.inner.heartbeat(id, pid, lock).await
    }
    async fn complete(&self, id: Uuid, pid: &str, outcome: &JobOutcome) -> Result<bool, DatabaseError> {
        self.inner.complete(id, pid, outcome).await
    }
    async fn fail(
        &self,
        id: Uuid,
        pid: Option<&str>,
        reason: &str,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        self.inner.fail(id, pid, reason, message).await
    }
    async fn requeue(&self, id: Uuid, pid: Option<&str>) -> Result<bool, DatabaseError> {
        self.inner.requeue(id, pid).await
    }
}

#[tokio::test]
async fn worker_backs_off_when_claims_keep_failing() {
    let inner = Arc::new(InMemoryStore::new());
    seed_conversation(&inner, Conversation::new(ChannelKind::Web, "max"), &["anyone there?"]).await;
    let locked = Arc::new(LockedClaimStore {
        inner: inner.clone(),
        polls: AtomicUsize::new(0),
    });

    let mut config = test_config();
    config.poll_interval = Duration::from_millis(100);
    config.reconcile_interval = Duration::from_secs(60);
    let config = Arc::new(config);
    let deps = OrchestratorDeps {
        jobs: locked.clone(),
        conversations: inner.clone(),
        memory: inner.clone(),
        reasoning: Arc::new(Reasoning::new(ScriptedLlm::new(Vec::new()))),
        tools: Arc::new(ToolRegistry::new()),
        extensions: Arc::new(ExtensionRegistry::new()),
        approval_gate: Arc::new(ApprovalGate::new(inner.clone(), &config.approval)),
        activity: ActivityFeed::new(),
        config: config.clone(),
    };
    let worker = Worker::new(Orchestrator::new(deps), locked.clone(), config);

    let (tx, rx) = watch::channel(false);
    let stop = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();
    };
    tokio::join!(worker.run(rx), stop);

    let polls = locked.polls.load(Ordering::SeqCst);
    assert!((1..=5).contains(&polls), "polled {polls} times");
}
