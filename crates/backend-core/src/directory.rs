use crate::{
    error::BackendError,
    types::{Conversation, ConversationRecord, PushEvent},
};

/// What the runtime must do after the directory handled a push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryPushOutcome {
    /// The local list changed and must be re-emitted.
    pub changed: bool,
    /// A full `GET /conversations` refresh is needed.
    pub refresh: bool,
}

/// Conversation list as last fetched, plus local patches from push events.
#[derive(Debug, Clone, Default)]
pub struct ConversationDirectory {
    conversations: Vec<Conversation>,
}

impl ConversationDirectory {
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, conversation_id: i64) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| conversation.id == conversation_id)
    }

    pub fn find_by_peer(&self, peer_id: i64) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| conversation.peer.id == peer_id)
    }

    pub fn replace(&mut self, records: Vec<ConversationRecord>) {
        self.conversations = records.into_iter().map(Conversation::from).collect();
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
    }

    pub fn set_unread_zero(&mut self, conversation_id: i64) -> bool {
        self.patch_unread(conversation_id, 0)
    }

    pub fn patch_unread(&mut self, conversation_id: i64, unread_count: u64) -> bool {
        match self
            .conversations
            .iter_mut()
            .find(|conversation| conversation.id == conversation_id)
        {
            Some(conversation) if conversation.unread_count != unread_count => {
                conversation.unread_count = unread_count;
                true
            }
            _ => false,
        }
    }

    /// Null the last-message fields when `message_id` was the conversation's
    /// last message.
    pub fn clear_last_message_if(&mut self, conversation_id: i64, message_id: i64) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|conversation| conversation.id == conversation_id)
        else {
            return false;
        };
        if conversation.last_message_id != Some(message_id) {
            return false;
        }
        conversation.last_message_id = None;
        conversation.last_message_preview = None;
        conversation.last_message_at = None;
        true
    }

    /// Apply a push event. `active` is the open conversation, if any.
    pub fn on_push(&mut self, event: &PushEvent, active: Option<i64>) -> DirectoryPushOutcome {
        match event {
            PushEvent::ConversationUpdated {
                conversation_id,
                unread_count,
            } => {
                if active == Some(*conversation_id) {
                    DirectoryPushOutcome {
                        changed: self.patch_unread(*conversation_id, unread_count.unwrap_or(0)),
                        refresh: false,
                    }
                } else {
                    DirectoryPushOutcome {
                        changed: false,
                        refresh: true,
                    }
                }
            }
            PushEvent::MessageDeleted {
                conversation_id,
                message_id,
                deleted_for_all,
            } => {
                if !deleted_for_all {
                    return DirectoryPushOutcome::default();
                }
                let changed = self.clear_last_message_if(*conversation_id, *message_id);
                DirectoryPushOutcome {
                    changed,
                    refresh: changed,
                }
            }
            PushEvent::NewMessage { message } => DirectoryPushOutcome {
                changed: false,
                refresh: active != Some(message.conversation_id),
            },
            PushEvent::MessageEdited { .. } => DirectoryPushOutcome {
                changed: false,
                refresh: true,
            },
        }
    }
}

/// Reject peer ids that cannot name a user before any request is issued.
pub fn validate_peer_id(peer_id: i64) -> Result<i64, BackendError> {
    if peer_id > 0 {
        Ok(peer_id)
    } else {
        Err(BackendError::validation(
            "invalid_peer_id",
            format!("peer id must be a positive number, got {peer_id}"),
        ))
    }
}
