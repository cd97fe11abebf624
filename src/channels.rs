//! Chat channels a job can originate from.
//!
//! The worker never talks to a chat platform directly. A channel only decides
//! which tools a job starts out with and whether the user can be prompted for
//! approvals in-line.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::llm::Role;
use crate::store::{ApprovalRequest, ConversationStore};
use crate::tools::policy::ToolPolicy;

/// Note tools, granted on channels that do not opt out of them.
pub const NOTE_TOOLS: &[&str] = &["create_note", "search_notes", "update_note"];

const MESSAGING_TOOLS: &[&str] = &["current_time", "memory_search", "delegate_task"];
const EMAIL_TOOLS: &[&str] = &["current_time", "memory_search"];
const INTERNAL_TOOLS: &[&str] = &["current_time", "memory_search", "delegate_task"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Telegram,
    WhatsApp,
    Web,
    Email,
    Sms,
    /// Delegated sub-jobs created by the worker itself.
    Internal,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::WhatsApp => "whatsapp",
            Self::Web => "web",
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Internal => "internal",
        }
    }

    /// Whether an approval prompt can be posted into the conversation.
    pub fn supports_interactive_prompts(&self) -> bool {
        matches!(self, Self::Telegram | Self::WhatsApp | Self::Web | Self::Sms)
    }

    pub fn includes_note_tools(&self) -> bool {
        !matches!(self, Self::Email | Self::Internal)
    }

    fn baseline_tools(&self) -> &'static [&'static str] {
        match self {
            Self::Email => EMAIL_TOOLS,
            Self::Internal => INTERNAL_TOOLS,
            _ => MESSAGING_TOOLS,
        }
    }

    /// Fixed allow-list for this channel, optionally widened by [`NOTE_TOOLS`].
    pub fn baseline_policy(&self, with_notes: bool) -> ToolPolicy {
        let notes: &[&str] = if with_notes { NOTE_TOOLS } else { &[] };
        ToolPolicy::allow(self.baseline_tools().iter().chain(notes).copied())
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(Self::Telegram),
            "whatsapp" => Ok(Self::WhatsApp),
            "web" => Ok(Self::Web),
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Out-of-band notification that an approval is waiting.
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn notify(&self, request: &ApprovalRequest) -> Result<(), DatabaseError>;
}

/// Posts the approval prompt into the job's conversation as an assistant turn.
pub struct ConversationNotifier {
    conversations: Arc<dyn ConversationStore>,
}

impl ConversationNotifier {
    pub fn new(conversations: Arc<dyn ConversationStore>) -> Self {
        Self { conversations }
    }
}

/// Text shown to the user for a pending approval.
pub fn approval_prompt(request: &ApprovalRequest) -> String {
    let input = serde_json::to_string(&request.input).unwrap_or_default();
    let input: String = input.chars().take(300).collect();
    format!(
        "I need your approval to run `{}` with {}. Reply \"approve {}\" or \"reject {}\".",
        request.tool_name, input, request.id, request.id
    )
}

#[async_trait]
impl ApprovalNotifier for ConversationNotifier {
    async fn notify(&self, request: &ApprovalRequest) -> Result<(), DatabaseError> {
        if !request.channel.supports_interactive_prompts() {
            tracing::debug!(channel = %request.channel, "Channel cannot prompt, skipping notification");
            return Ok(());
        }
        self.conversations
            .append_message(request.conversation_id, Role::Assistant, &approval_prompt(request))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ApprovalStatus, Conversation, InMemoryStore};
    use chrono::Utc;
    use uuid::Uuid;

    fn request(conversation_id: Uuid, channel: ChannelKind) -> ApprovalRequest {
        ApprovalRequest {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            conversation_id,
            tool_name: "send_payment".into(),
            input: serde_json::json!({"amount": 10}),
            channel,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn channel_names_round_trip() {
        for kind in [
            ChannelKind::Telegram,
            ChannelKind::WhatsApp,
            ChannelKind::Web,
            ChannelKind::Email,
            ChannelKind::Sms,
            ChannelKind::Internal,
        ] {
            assert_eq!(kind.as_str().parse::<ChannelKind>().unwrap(), kind);
        }
    }

    #[test]
    fn baseline_includes_notes_only_on_request() {
        assert!(ChannelKind::Sms.baseline_policy(true).permits("create_note"));
        assert!(!ChannelKind::Sms.baseline_policy(false).permits("create_note"));
        assert!(!ChannelKind::Email.baseline_policy(false).permits("delegate_task"));
    }

    #[tokio::test]
    async fn notifier_posts_prompt_for_interactive_channels() {
        let store = Arc::new(InMemoryStore::new());
        let conv = store
            .create_conversation(Conversation::new(ChannelKind::Telegram, "u1"))
            .await
            .unwrap();
        let notifier = ConversationNotifier::new(store.clone());

        notifier.notify(&request(conv.id, ChannelKind::Telegram)).await.unwrap();
        notifier.notify(&request(conv.id, ChannelKind::Email)).await.unwrap();

        let messages = store.list_messages(conv.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("send_payment"));
        assert_eq!(messages[0].role, Role::Assistant);
    }
}
