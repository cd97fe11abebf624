//! Job orchestrator: the per-job pipeline.
//!
//! claim → load history → compact → guard → resolve tools → tool loop
//! (fallback cascade per turn) → persist reply → complete → release.
//!
//! The lease is checked before every model turn, before every tool call and
//! before each terminal write. Gated tools re-check it once approval arrives. Once it is lost the job is abandoned without touching the store
//! again; reconciliation hands it to whoever claims it next.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::agent::{ContextCompactor, ContextMonitor, summary_message};
use crate::channels::ConversationNotifier;
use crate::config::WorkerConfig;
use crate::context::JobContext;
use crate::error::{DatabaseError, Error, JobError};
use crate::extensions::ExtensionRegistry;
use crate::llm::{
    CascadeEvent, ChatMessage, FailoverReason, FallbackOutcome, LlmProvider, Reasoning,
    ReasoningContext, RespondOutput, RespondResult, Role, TokenUsage, ToolCall, classify,
    model_cost, run_with_fallback,
};
use crate::store::{
    Conversation, ConversationStore, Database, Job, JobOutcome, JobStore, MemoryStore,
    ToolCallRecord,
};
use crate::tools::{ApprovalGate, Tool, ToolRegistry, filter_tools, resolve_effective_policy};
use crate::worker::activity::{ActivityFeed, WorkerActivity};
use crate::worker::lease::LeaseCoordinator;

/// Prefix of a delegated job's reply when it is copied to the parent conversation.
pub const DELEGATED_RESULT_PREFIX: &str = "[Delegated task result]";

/// Longest error message stored on a failed job.
const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Shared dependencies for the orchestrator.
pub struct OrchestratorDeps {
    pub jobs: Arc<dyn JobStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub memory: Arc<dyn MemoryStore>,
    pub reasoning: Arc<Reasoning>,
    pub tools: Arc<ToolRegistry>,
    pub extensions: Arc<ExtensionRegistry>,
    pub approval_gate: Arc<ApprovalGate>,
    pub activity: ActivityFeed,
    pub config: Arc<WorkerConfig>,
}

impl OrchestratorDeps {
    /// Wire every collaborator to one backend.
    pub fn from_database<D>(
        db: Arc<D>,
        llm: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        extensions: Arc<ExtensionRegistry>,
        activity: ActivityFeed,
        config: Arc<WorkerConfig>,
    ) -> Self
    where
        D: Database + 'static,
    {
        let reasoning = Reasoning::new(llm)
            .with_system_prompt(config.model.system_prompt.clone())
            .with_max_output_tokens(config.model.max_output_tokens);
        let approval_gate = ApprovalGate::new(db.clone(), &config.approval)
            .with_notifier(Arc::new(ConversationNotifier::new(db.clone())))
            .with_activity(activity.clone());

        Self {
            jobs: db.clone(),
            conversations: db.clone(),
            memory: db,
            reasoning: Arc::new(reasoning),
            tools,
            extensions,
            approval_gate: Arc::new(approval_gate),
            activity,
            config,
        }
    }
}

/// How a job left the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    /// Another processor holds the job.
    NotClaimed,
    Completed {
        model_used: String,
        fallback_attempt: usize,
    },
    /// Handed back to the queue after a transient failure.
    Requeued { reason: FailoverReason },
    Failed { reason: String },
    /// The lease was lost; nothing was committed.
    Aborted { phase: String },
}

pub struct Orchestrator {
    deps: OrchestratorDeps,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self { deps }
    }

    pub fn activity(&self) -> &ActivityFeed {
        &self.deps.activity
    }

    fn processor_id(&self) -> &str {
        &self.deps.config.processor_id
    }

    /// Claim and run one job to a terminal disposition.
    ///
    /// Only store failures while claiming or while recording the outcome of a
    /// failed run are returned as errors.
    pub async fn process(&self, job: &Job) -> Result<JobDisposition, DatabaseError> {
        let mut lease = LeaseCoordinator::new(
            Arc::clone(&self.deps.jobs),
            job.id,
            self.processor_id(),
            &self.deps.config.lease,
        );
        if !lease.claim().await? {
            return Ok(JobDisposition::NotClaimed);
        }
        self.deps.activity.publish(WorkerActivity::Claimed {
            job_id: job.id,
            processor_id: self.processor_id().to_string(),
            attempt: job.attempt_count,
        });

        let result = self.run(job, &lease).await;
        let disposition = self.settle(job, &lease, result).await;
        lease.stop();
        disposition
    }

    async fn run(&self, job: &Job, lease: &LeaseCoordinator) -> Result<JobOutcome, Error> {
        let conversation = self
            .deps
            .conversations
            .get_conversation(job.conversation_id)
            .await?
            .ok_or(JobError::ConversationNotFound {
                id: job.conversation_id,
            })?;

        let messages = self.prepare_context(job, &conversation, lease).await?;
        let tools = self.resolve_tools(&conversation).await;
        let ctx = JobContext::for_job(job, &conversation).with_lease(lease.signal());

        let mut outcome = self.generate(job, lease, messages, &tools, &ctx).await?;

        lease.check("pre-finalize")?;
        self.deps
            .conversations
            .append_message(conversation.id, Role::Assistant, &outcome.reply)
            .await?;
        if job.is_internal {
            self.report_to_parent(job, &outcome.reply).await?;
        }

        lease.check("pre-complete")?;
        outcome.attempted_models.dedup();
        if !self
            .deps
            .jobs
            .complete(job.id, self.processor_id(), &outcome)
            .await?
        {
            lease.mark_lost();
            return Err(JobError::LeaseLost {
                id: job.id,
                phase: "complete".to_string(),
            }
            .into());
        }
        Ok(outcome)
    }

    /// History as `[summary, ...uncovered messages]`, compacted and guarded.
    async fn prepare_context(
        &self,
        job: &Job,
        conversation: &Conversation,
        lease: &LeaseCoordinator,
    ) -> Result<Vec<ChatMessage>, Error> {
        let stored = self.deps.conversations.list_messages(conversation.id).await?;
        let had_summary = conversation.summary.is_some();

        let mut history = Vec::with_capacity(stored.len() + 1);
        if let Some(summary) = &conversation.summary {
            history.push(summary_message(summary));
        }
        history.extend(
            stored
                .iter()
                .skip(conversation.summarized_count)
                .map(|m| match m.role {
                    Role::User => ChatMessage::user(m.content.clone()),
                    Role::System => ChatMessage::system(m.content.clone()),
                    _ => ChatMessage::assistant(m.content.clone()),
                }),
        );

        let compaction = &self.deps.config.compaction;
        let compactor = ContextCompactor::new(
            Arc::clone(self.deps.reasoning.provider()),
            self.deps.config.model.primary.clone(),
            compaction.clone(),
        )
        .with_memory(Arc::clone(&self.deps.memory));

        let before = history.len();
        let result = compactor.compact(history, Some(conversation.id)).await;

        if let Some(summary) = &result.summary {
            self.deps.activity.publish(WorkerActivity::Compacted {
                job_id: job.id,
                before,
                after: result.messages.len(),
                ai_summary: result.ai_summary,
            });

            // A fallback summary only stands in for this job. Persisting it
            // would replace the stored summary and mark its messages covered.
            if result.ai_summary {
                lease.check("pre-summary")?;
                // The old summary message was part of what got summarized.
                let newly_covered = result.summarized.saturating_sub(usize::from(had_summary));
                let covered = conversation.summarized_count + newly_covered;
                if let Err(e) = self
                    .deps
                    .conversations
                    .save_summary(conversation.id, summary, covered)
                    .await
                {
                    tracing::warn!(conversation_id = %conversation.id, error = %e, "Failed to persist summary");
                }
            } else {
                tracing::debug!(conversation_id = %conversation.id, "Fallback summary not persisted");
            }
        }

        let guarded = ContextMonitor::from_config(compaction).guard(result.messages);
        Ok(guarded.messages)
    }

    /// Registry and plugin tools, filtered by the merged policy, high-risk ones gated.
    async fn resolve_tools(&self, conversation: &Conversation) -> HashMap<String, Arc<dyn Tool>> {
        let mut candidates = self.deps.tools.all().await;
        for tool in self.deps.extensions.plugin_tools() {
            if candidates.iter().any(|t| t.name() == tool.name()) {
                tracing::warn!(tool = %tool.name(), "Plugin tool shadows an existing tool, skipping");
                continue;
            }
            candidates.push(tool);
        }

        let layers = self.deps.extensions.policy_layers(conversation);
        let policy = resolve_effective_policy(conversation.channel, &layers);
        let permitted = filter_tools(candidates, &policy);
        let tools = self.deps.approval_gate.wrap_all(permitted);

        tracing::debug!(
            conversation_id = %conversation.id,
            channel = %conversation.channel,
            tools = tools.len(),
            "Resolved tool set"
        );
        tools
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect()
    }

    /// The agentic loop: model turns until a text reply or the iteration cap.
    async fn generate(
        &self,
        job: &Job,
        lease: &LeaseCoordinator,
        mut messages: Vec<ChatMessage>,
        tools: &HashMap<String, Arc<dyn Tool>>,
        ctx: &JobContext,
    ) -> Result<JobOutcome, Error> {
        let model = &self.deps.config.model;
        let mut definitions: Vec<_> = tools.values().map(|t| t.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));

        let mut usage = TokenUsage::default();
        let mut cost = Decimal::ZERO;
        let mut attempted_models = Vec::new();
        let mut records = Vec::new();

        for iteration in 0..model.max_tool_iterations {
            lease.check("pre-generation")?;

            let reasoning_ctx = ReasoningContext::new()
                .with_messages(messages.clone())
                .with_tools(definitions.clone());
            let turn = self.run_turn(job.id, &reasoning_ctx).await?;

            usage.add(turn.result.usage);
            cost += turn.result.usage.cost(model_cost(&turn.model_used));
            attempted_models.extend(turn.attempted_models.iter().cloned());

            match turn.result.result {
                RespondResult::Text(reply) => {
                    tracing::info!(
                        job_id = %job.id,
                        model = %turn.model_used,
                        iterations = iteration + 1,
                        tool_calls = records.len(),
                        "Reply generated"
                    );
                    return Ok(JobOutcome {
                        reply,
                        model_used: turn.model_used,
                        fallback_attempt: turn.fallback_attempt,
                        attempted_models,
                        tool_calls: records,
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        cost,
                    });
                }
                RespondResult::ToolCalls {
                    tool_calls,
                    content,
                } => {
                    messages.push(ChatMessage::assistant_with_tool_calls(
                        content,
                        tool_calls.clone(),
                    ));
                    for call in &tool_calls {
                        lease.check("pre-tool")?;
                        let record = self.execute_tool(tools, call, ctx).await;
                        messages.push(ChatMessage::tool_result(
                            call.id.clone(),
                            call.name.clone(),
                            record.output.clone(),
                        ));
                        records.push(record);
                    }
                }
            }
        }

        Err(JobError::IterationLimit {
            id: job.id,
            max: model.max_tool_iterations,
        }
        .into())
    }

    async fn run_turn(
        &self,
        job_id: Uuid,
        ctx: &ReasoningContext,
    ) -> Result<FallbackOutcome<RespondOutput>, Error> {
        let model = &self.deps.config.model;
        let reasoning = &self.deps.reasoning;
        let feed = &self.deps.activity;
        let stream = model.stream;

        let on_event = |event: CascadeEvent| match event {
            CascadeEvent::Retry { model, event } => feed.publish(WorkerActivity::RetryScheduled {
                job_id,
                model,
                attempt: event.attempt,
                reason: event.reason,
                delay: event.delay,
            }),
            CascadeEvent::Fallback {
                to,
                fallback_attempt,
                ..
            } => feed.publish(WorkerActivity::FallbackAttempted {
                job_id,
                model: to,
                fallback_attempt,
            }),
        };

        let outcome = run_with_fallback(
            &model.primary,
            &model.fallbacks,
            &self.deps.config.retry,
            on_event,
            |name: String| async move {
                if stream {
                    reasoning
                        .stream_with_tools(&name, ctx, |delta| {
                            feed.publish(WorkerActivity::ReplyDelta {
                                job_id,
                                text: delta.to_string(),
                            })
                        })
                        .await
                } else {
                    reasoning.respond_with_tools(&name, ctx).await
                }
            },
        )
        .await?;
        Ok(outcome)
    }

    async fn execute_tool(
        &self,
        tools: &HashMap<String, Arc<dyn Tool>>,
        call: &ToolCall,
        ctx: &JobContext,
    ) -> ToolCallRecord {
        let Some(tool) = tools.get(&call.name) else {
            tracing::warn!(job_id = %ctx.job_id, tool = %call.name, "Model called an unavailable tool");
            return ToolCallRecord {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                output: format!("Error: tool '{}' is not available for this job", call.name),
                success: false,
                duration_ms: 0,
            };
        };

        // Gated tools budget for the approval wait on top of their own run time.
        let timeout = if self.deps.approval_gate.is_high_risk(tool.as_ref()) {
            tool.execution_timeout()
        } else {
            tool.execution_timeout().min(self.deps.config.model.tool_timeout)
        };

        let start = Instant::now();
        let result =
            tokio::time::timeout(timeout, tool.execute(call.arguments.clone(), ctx)).await;
        let elapsed = start.elapsed();

        let (output, success) = match result {
            Ok(Ok(output)) => {
                tracing::debug!(
                    tool = %call.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Tool call succeeded"
                );
                (output.as_text(), true)
            }
            Ok(Err(e)) => {
                tracing::debug!(
                    tool = %call.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Tool call failed"
                );
                (format!("Error: {e}"), false)
            }
            Err(_) => {
                tracing::debug!(
                    tool = %call.name,
                    timeout_secs = timeout.as_secs(),
                    "Tool call timed out"
                );
                (format!("Error: tool '{}' timed out after {timeout:?}", call.name), false)
            }
        };

        ToolCallRecord {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            output,
            success,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    /// Copy a delegated job's reply into its parent's conversation.
    async fn report_to_parent(&self, job: &Job, reply: &str) -> Result<(), Error> {
        let Some(parent_id) = job.parent_job_id else {
            return Ok(());
        };
        match self.deps.jobs.get_job(parent_id).await? {
            Some(parent) => {
                self.deps
                    .conversations
                    .append_message(
                        parent.conversation_id,
                        Role::Assistant,
                        &format!("{DELEGATED_RESULT_PREFIX}\n{reply}"),
                    )
                    .await?;
                tracing::info!(job_id = %job.id, parent_job_id = %parent_id, "Delegated result delivered");
            }
            None => {
                tracing::warn!(job_id = %job.id, parent_job_id = %parent_id, "Parent job missing, result not delivered");
            }
        }
        Ok(())
    }

    /// Turn the run result into a store mutation and a disposition.
    async fn settle(
        &self,
        job: &Job,
        lease: &LeaseCoordinator,
        result: Result<JobOutcome, Error>,
    ) -> Result<JobDisposition, DatabaseError> {
        let err = match result {
            Ok(outcome) => {
                tracing::info!(
                    job_id = %job.id,
                    model = %outcome.model_used,
                    fallback_attempt = outcome.fallback_attempt,
                    input_tokens = outcome.input_tokens,
                    output_tokens = outcome.output_tokens,
                    cost = %outcome.cost,
                    "Job completed"
                );
                self.deps.activity.publish(WorkerActivity::Completed {
                    job_id: job.id,
                    model_used: outcome.model_used.clone(),
                    fallback_attempt: outcome.fallback_attempt,
                });
                return Ok(JobDisposition::Completed {
                    model_used: outcome.model_used,
                    fallback_attempt: outcome.fallback_attempt,
                });
            }
            Err(err) => err,
        };

        if let Some(phase) = lost_phase(&err, lease) {
            return Ok(self.abort(job, phase));
        }

        let reason = classify(&err);
        let message = truncate(&err.to_string(), MAX_ERROR_MESSAGE_CHARS);
        let next_attempt = job.attempt_count + 1;

        if reason.is_retryable() && next_attempt < self.deps.config.lease.max_attempts {
            if !self.deps.jobs.requeue(job.id, Some(self.processor_id())).await? {
                return Ok(self.abort(job, "requeue".to_string()));
            }
            tracing::warn!(job_id = %job.id, %reason, attempt = next_attempt, error = %message, "Job requeued");
            self.deps.activity.publish(WorkerActivity::Requeued {
                job_id: job.id,
                reason,
                attempt: next_attempt,
            });
            return Ok(JobDisposition::Requeued { reason });
        }

        let failure = failure_reason(&err, reason);
        if !self
            .deps
            .jobs
            .fail(job.id, Some(self.processor_id()), &failure, &message)
            .await?
        {
            return Ok(self.abort(job, "fail".to_string()));
        }
        tracing::error!(job_id = %job.id, reason = %failure, error = %message, "Job failed");
        self.deps.activity.publish(WorkerActivity::Failed {
            job_id: job.id,
            reason: failure.clone(),
            message,
        });
        Ok(JobDisposition::Failed { reason: failure })
    }

    fn abort(&self, job: &Job, phase: String) -> JobDisposition {
        tracing::warn!(job_id = %job.id, phase = %phase, "Lease lost, abandoning job");
        self.deps.activity.publish(WorkerActivity::LeaseLost {
            job_id: job.id,
            phase: phase.clone(),
        });
        JobDisposition::Aborted { phase }
    }
}

fn lost_phase(err: &Error, lease: &LeaseCoordinator) -> Option<String> {
    match err {
        Error::Job(JobError::LeaseLost { phase, .. }) => Some(phase.clone()),
        _ if lease.is_lost() => Some("error".to_string()),
        _ => None,
    }
}

/// Reason recorded on a failed job.
fn failure_reason(err: &Error, reason: FailoverReason) -> String {
    match err {
        Error::Job(JobError::ConversationNotFound { .. }) => "conversation_not_found".to_string(),
        Error::Job(JobError::IterationLimit { .. }) => "iteration_limit".to_string(),
        _ => reason.as_str().to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    use crate::channels::ChannelKind;
    use crate::config::{ApprovalConfig, LeaseConfig, RetryConfig};
    use crate::error::LlmError;
    use crate::llm::{
        CompletionRequest, CompletionResponse, FinishReason, ToolCompletionRequest,
        ToolCompletionResponse,
    };
    use crate::store::{InMemoryStore, JobStatus, NewJob};
    use crate::tools::builtin::register_builtins;

    type Step = Result<ToolCompletionResponse, LlmError>;

    /// Replays scripted responses and records which model each call named.
    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        models: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                models: Mutex::new(Vec::new()),
            })
        }
    }

    fn text(reply: &str) -> Step {
        Ok(ToolCompletionResponse {
            content: Some(reply.to_string()),
            tool_calls: Vec::new(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: FinishReason::Stop,
        })
    }

    fn call(name: &str, args: serde_json::Value) -> Step {
        Ok(ToolCompletionResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id: format!("call_{name}"),
                name: name.to_string(),
                arguments: args,
            }],
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: FinishReason::ToolUse,
        })
    }

    fn server_error() -> Step {
        Err(LlmError::Http {
            provider: "scripted".into(),
            status: 503,
            message: "overloaded".into(),
        })
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _r: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Err(LlmError::RequestFailed {
                provider: "scripted".into(),
                reason: "summaries not scripted".into(),
            })
        }

        async fn complete_with_tools(
            &self,
            request: ToolCompletionRequest,
        ) -> Result<ToolCompletionResponse, LlmError> {
            self.models
                .lock()
                .await
                .push(request.model.unwrap_or_default());
            self.steps
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| text("out of script"))
        }
    }

    fn config(fallbacks: &[&str]) -> WorkerConfig {
        let mut config = WorkerConfig {
            processor_id: "test-worker".into(),
            retry: RetryConfig {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: false,
            },
            lease: LeaseConfig {
                lock: Duration::from_secs(5),
                heartbeat: Duration::from_secs(1),
                ..LeaseConfig::default()
            },
            approval: ApprovalConfig {
                poll_interval: Duration::from_millis(5),
                timeout: Duration::from_millis(30),
                ..ApprovalConfig::default()
            },
            ..WorkerConfig::default()
        };
        config.model.primary = "primary".into();
        config.model.fallbacks = fallbacks.iter().map(|s| s.to_string()).collect();
        config.model.max_tool_iterations = 3;
        config
    }

    async fn setup(
        llm: Arc<Scripted>,
        config: WorkerConfig,
    ) -> (Orchestrator, Arc<InMemoryStore>, Job) {
        let store = Arc::new(InMemoryStore::new());
        let conversation = store
            .create_conversation(Conversation::new(ChannelKind::Web, "user-1"))
            .await
            .unwrap();
        let message = store
            .append_message(conversation.id, Role::User, "What time is it?")
            .await
            .unwrap();
        let job = store
            .enqueue(NewJob::for_message(conversation.id, message.id))
            .await
            .unwrap();

        let registry = Arc::new(ToolRegistry::new());
        register_builtins(&registry, store.clone(), config.max_delegation_depth)
            .await
            .unwrap();
        let deps = OrchestratorDeps::from_database(
            store.clone(),
            llm,
            registry,
            Arc::new(ExtensionRegistry::new()),
            ActivityFeed::new(),
            Arc::new(config),
        );
        (Orchestrator::new(deps), store, job)
    }

    #[tokio::test]
    async fn text_reply_completes_job() {
        let llm = Scripted::new(vec![text("Hello there")]);
        let (orchestrator, store, job) = setup(llm, config(&[])).await;

        let disposition = orchestrator.process(&job).await.unwrap();
        assert_eq!(
            disposition,
            JobDisposition::Completed {
                model_used: "primary".into(),
                fallback_attempt: 0
            }
        );

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        let outcome = stored.outcome.unwrap();
        assert_eq!(outcome.reply, "Hello there");
        assert_eq!(outcome.input_tokens, 10);

        let messages = store.list_messages(job.conversation_id).await.unwrap();
        assert_eq!(messages.last().unwrap().role, Role::Assistant);
        assert_eq!(messages.last().unwrap().content, "Hello there");
    }

    #[tokio::test]
    async fn tool_results_feed_the_next_turn() {
        let llm = Scripted::new(vec![call("current_time", json!({})), text("It is noon")]);
        let (orchestrator, store, job) = setup(llm, config(&[])).await;

        orchestrator.process(&job).await.unwrap();
        let outcome = store.get_job(job.id).await.unwrap().unwrap().outcome.unwrap();
        assert_eq!(outcome.tool_calls.len(), 1);
        assert!(outcome.tool_calls[0].success);
        assert_eq!(outcome.input_tokens, 20);
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result() {
        let llm = Scripted::new(vec![call("rm_rf", json!({})), text("Sorry")]);
        let (orchestrator, store, job) = setup(llm, config(&[])).await;

        orchestrator.process(&job).await.unwrap();
        let outcome = store.get_job(job.id).await.unwrap().unwrap().outcome.unwrap();
        assert!(!outcome.tool_calls[0].success);
        assert!(outcome.tool_calls[0].output.contains("not available"));
    }

    #[tokio::test]
    async fn falls_back_after_primary_exhausts_retries() {
        let llm = Scripted::new(vec![server_error(), server_error(), text("from backup")]);
        let (orchestrator, _store, job) = setup(llm.clone(), config(&["backup"])).await;
        let mut events = orchestrator.activity().subscribe();

        let disposition = orchestrator.process(&job).await.unwrap();
        assert_eq!(
            disposition,
            JobDisposition::Completed {
                model_used: "backup".into(),
                fallback_attempt: 1
            }
        );
        assert_eq!(*llm.models.lock().await, vec!["primary", "primary", "backup"]);

        let mut saw_fallback = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, WorkerActivity::FallbackAttempted { ref model, .. } if model == "backup") {
                saw_fallback = true;
            }
        }
        assert!(saw_fallback);
    }

    #[tokio::test]
    async fn retryable_failure_requeues() {
        let llm = Scripted::new(vec![server_error(), server_error()]);
        let (orchestrator, store, job) = setup(llm, config(&[])).await;

        let disposition = orchestrator.process(&job).await.unwrap();
        assert_eq!(
            disposition,
            JobDisposition::Requeued {
                reason: FailoverReason::ServerError
            }
        );
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn auth_failure_fails_without_requeue() {
        let llm = Scripted::new(vec![Err(LlmError::AuthFailed {
            provider: "scripted".into(),
        })]);
        let (orchestrator, store, job) = setup(llm, config(&[])).await;

        let disposition = orchestrator.process(&job).await.unwrap();
        assert_eq!(disposition, JobDisposition::Failed { reason: "auth".into() });
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempt_count, 0);
    }

    #[tokio::test]
    async fn iteration_cap_fails_job() {
        let llm = Scripted::new(vec![
            call("current_time", json!({})),
            call("current_time", json!({})),
            call("current_time", json!({})),
        ]);
        let (orchestrator, store, job) = setup(llm, config(&[])).await;

        let disposition = orchestrator.process(&job).await.unwrap();
        assert_eq!(
            disposition,
            JobDisposition::Failed {
                reason: "iteration_limit".into()
            }
        );
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn claimed_job_is_not_processed_twice() {
        let llm = Scripted::new(vec![text("once")]);
        let (orchestrator, store, job) = setup(llm, config(&[])).await;
        assert!(store.claim(job.id, "other", Duration::from_secs(60)).await.unwrap());

        assert_eq!(orchestrator.process(&job).await.unwrap(), JobDisposition::NotClaimed);
    }

    #[tokio::test]
    async fn delegated_reply_reaches_parent_conversation() {
        let llm = Scripted::new(vec![text("flights found")]);
        let (orchestrator, store, parent) = setup(llm, config(&[])).await;

        let child_conversation = store
            .create_conversation(Conversation::new(ChannelKind::Internal, "user-1"))
            .await
            .unwrap();
        store
            .append_message(child_conversation.id, Role::User, "find flights")
            .await
            .unwrap();
        let child = store
            .enqueue(NewJob {
                conversation_id: child_conversation.id,
                is_internal: true,
                parent_job_id: Some(parent.id),
                delegation_depth: 1,
                ..NewJob::default()
            })
            .await
            .unwrap();

        orchestrator.process(&child).await.unwrap();
        let parent_messages = store.list_messages(parent.conversation_id).await.unwrap();
        let last = parent_messages.last().unwrap();
        assert!(last.content.starts_with(DELEGATED_RESULT_PREFIX));
        assert!(last.content.ends_with("flights found"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 10), "short");
    }
}
