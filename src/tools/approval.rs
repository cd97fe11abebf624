//! Human approval gate for high-risk tools.
//!
//! A gated tool records an [`ApprovalRequest`], optionally notifies the user,
//! then polls the record until it leaves `pending` or the deadline passes.
//! The wrapped tool runs only after an explicit approval. Rejection and
//! timeout are ordinary tool results, not errors.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::channels::ApprovalNotifier;
use crate::config::ApprovalConfig;
use crate::context::JobContext;
use crate::store::{ApprovalRequest, ApprovalStatus, ApprovalStore};
use crate::tools::tool::{Tool, ToolError, ToolOutput};
use crate::worker::activity::{ActivityFeed, WorkerActivity};

pub const REJECTED_MESSAGE: &str = "The user rejected this action. It was not performed.";
pub const TIMEOUT_MESSAGE: &str =
    "Approval was not given in time. The action was not performed.";

/// Shared state for every gated tool of one worker.
pub struct ApprovalGate {
    approvals: Arc<dyn ApprovalStore>,
    notifier: Option<Arc<dyn ApprovalNotifier>>,
    activity: Option<ActivityFeed>,
    poll_interval: Duration,
    timeout: Duration,
    high_risk_tools: BTreeSet<String>,
}

impl ApprovalGate {
    pub fn new(approvals: Arc<dyn ApprovalStore>, config: &ApprovalConfig) -> Self {
        Self {
            approvals,
            notifier: None,
            activity: None,
            poll_interval: config.poll_interval,
            timeout: config.timeout,
            high_risk_tools: config.high_risk_tools.clone(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_activity(mut self, activity: ActivityFeed) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Whether `tool` must be approved before it runs.
    pub fn is_high_risk(&self, tool: &dyn Tool) -> bool {
        tool.requires_approval() || self.high_risk_tools.contains(tool.name())
    }

    /// Wrap high-risk tools; pass the rest through untouched.
    pub fn wrap_all(self: &Arc<Self>, tools: Vec<Arc<dyn Tool>>) -> Vec<Arc<dyn Tool>> {
        tools
            .into_iter()
            .map(|tool| {
                if self.is_high_risk(tool.as_ref()) {
                    Arc::new(ApprovalGatedTool {
                        inner: tool,
                        gate: Arc::clone(self),
                    }) as Arc<dyn Tool>
                } else {
                    tool
                }
            })
            .collect()
    }

    /// Poll until the request is decided or the deadline passes.
    ///
    /// Returns `None` on timeout. A record that disappears counts as a rejection.
    async fn wait_for_decision(&self, id: Uuid) -> Option<ApprovalStatus> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match self.approvals.approval_status(id).await {
                Ok(Some(ApprovalStatus::Pending)) => {}
                Ok(Some(decided)) => return Some(decided),
                Ok(None) => {
                    tracing::warn!(approval_id = %id, "Approval record vanished, treating as rejected");
                    return Some(ApprovalStatus::Rejected);
                }
                Err(e) => {
                    tracing::warn!(approval_id = %id, error = %e, "Approval poll failed");
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

/// A tool that needs a human decision before it runs.
pub struct ApprovalGatedTool {
    inner: Arc<dyn Tool>,
    gate: Arc<ApprovalGate>,
}

#[async_trait]
impl Tool for ApprovalGatedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.inner.parameters_schema()
    }

    fn requires_approval(&self) -> bool {
        true
    }

    /// Covers the wait for a decision plus the wrapped tool's own budget.
    fn execution_timeout(&self) -> Duration {
        self.gate.timeout + self.gate.poll_interval + self.inner.execution_timeout()
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &JobContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            job_id: ctx.job_id,
            conversation_id: ctx.conversation_id,
            tool_name: self.inner.name().to_string(),
            input: params.clone(),
            channel: ctx.channel,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
        };

        let approval_id = self
            .gate
            .approvals
            .create_approval(&request)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("could not request approval: {e}")))?;

        tracing::info!(
            job_id = %ctx.job_id,
            approval_id = %approval_id,
            tool = %request.tool_name,
            "Approval requested"
        );
        if let Some(activity) = &self.gate.activity {
            activity.publish(WorkerActivity::ApprovalRequested {
                job_id: ctx.job_id,
                approval_id,
                tool_name: request.tool_name.clone(),
            });
        }
        if let Some(notifier) = &self.gate.notifier
            && let Err(e) = notifier.notify(&request).await
        {
            tracing::warn!(approval_id = %approval_id, error = %e, "Approval notification failed");
        }

        match self.gate.wait_for_decision(approval_id).await {
            Some(ApprovalStatus::Approved) if ctx.lease.is_lost() => {
                tracing::warn!(
                    approval_id = %approval_id,
                    tool = %request.tool_name,
                    "Approved after the lease was lost, not running"
                );
                Err(ToolError::ExecutionFailed(format!(
                    "job {} no longer holds its lease",
                    ctx.job_id
                )))
            }
            Some(ApprovalStatus::Approved) => {
                tracing::info!(approval_id = %approval_id, tool = %request.tool_name, "Approved");
                self.inner.execute(params, ctx).await
            }
            Some(_) => {
                tracing::info!(approval_id = %approval_id, tool = %request.tool_name, "Rejected");
                Ok(ToolOutput::text(REJECTED_MESSAGE, start.elapsed()))
            }
            None => {
                tracing::warn!(
                    approval_id = %approval_id,
                    tool = %request.tool_name,
                    "Approval timed out"
                );
                Ok(ToolOutput::text(TIMEOUT_MESSAGE, start.elapsed()))
            }
        }
    }
}
