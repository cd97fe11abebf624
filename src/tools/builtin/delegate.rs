//! `delegate_task`: hand a self-contained task to an internal sub-job.
//!
//! The sub-job gets a fresh internal conversation seeded with the task. When
//! it completes, the orchestrator appends its reply to the parent's
//! conversation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::channels::ChannelKind;
use crate::context::JobContext;
use crate::llm::Role;
use crate::store::{Conversation, ConversationStore, JobStore, NewJob};
use crate::tools::tool::{Tool, ToolError, ToolOutput, require_str};

pub struct DelegateTaskTool {
    jobs: Arc<dyn JobStore>,
    conversations: Arc<dyn ConversationStore>,
    max_depth: u32,
}

impl DelegateTaskTool {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        conversations: Arc<dyn ConversationStore>,
        max_depth: u32,
    ) -> Self {
        Self {
            jobs,
            conversations,
            max_depth,
        }
    }
}

#[async_trait]
impl Tool for DelegateTaskTool {
    fn name(&self) -> &str {
        "delegate_task"
    }

    fn description(&self) -> &str {
        "Delegate a self-contained task to a background helper. The result is \
         posted to this conversation when it is done; do not wait for it."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Complete instructions for the helper"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &JobContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let task = require_str(&params, "task")?.trim();
        if task.is_empty() {
            return Err(ToolError::InvalidParameters("task must not be empty".into()));
        }

        let depth = ctx.delegation_depth + 1;
        if depth > self.max_depth {
            return Err(ToolError::NotAuthorized(format!(
                "delegation depth {depth} exceeds the limit of {}",
                self.max_depth
            )));
        }

        let conversation = self
            .conversations
            .create_conversation(Conversation::new(ChannelKind::Internal, ctx.user_id.clone()))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("could not create conversation: {e}")))?;
        let message = self
            .conversations
            .append_message(conversation.id, Role::User, task)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("could not record task: {e}")))?;

        let job = self
            .jobs
            .enqueue(NewJob {
                conversation_id: conversation.id,
                message_id: Some(message.id),
                is_internal: true,
                parent_job_id: Some(ctx.job_id),
                delegation_depth: depth,
            })
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("could not enqueue sub-job: {e}")))?;

        tracing::info!(
            parent_job_id = %ctx.job_id,
            job_id = %job.id,
            depth,
            "Delegated sub-job enqueued"
        );

        Ok(ToolOutput::success(
            serde_json::json!({
                "job_id": job.id.to_string(),
                "status": "queued",
            }),
            start.elapsed(),
        ))
    }
}
