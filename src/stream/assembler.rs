use super::ProtocolEvent;
use crate::conversation::{ChatMessage, Conversation, Role};
use serde::{Deserialize, Serialize};

/// What to do with a content delta when no assistant message is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanDeltaPolicy {
    /// Start an assistant message holding the delta.
    #[default]
    Synthesize,
    Drop,
}

/// Applies decoded stream events to a conversation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationAssembler {
    policy: OrphanDeltaPolicy,
}

impl ConversationAssembler {
    pub fn new(policy: OrphanDeltaPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> OrphanDeltaPolicy {
        self.policy
    }

    pub fn apply(&self, mut conversation: Conversation, event: &ProtocolEvent) -> Conversation {
        match event {
            ProtocolEvent::RoleAnnounce(role) => {
                conversation.push(ChatMessage::new(*role, String::new()));
            }
            ProtocolEvent::ContentDelta(text) => match conversation.last_mut() {
                Some(last) if last.role == Role::Assistant => last.content.push_str(text),
                _ => match self.policy {
                    OrphanDeltaPolicy::Synthesize => {
                        conversation.push(ChatMessage::assistant(text.as_str()));
                    }
                    OrphanDeltaPolicy::Drop => {
                        tracing::debug!(len = text.len(), "dropping delta without open assistant message");
                    }
                },
            },
            ProtocolEvent::StreamEnd => {}
        }
        conversation
    }

    pub fn apply_all<'a>(
        &self,
        conversation: Conversation,
        events: impl IntoIterator<Item = &'a ProtocolEvent>,
    ) -> Conversation {
        events
            .into_iter()
            .fold(conversation, |conv, event| self.apply(conv, event))
    }
}
