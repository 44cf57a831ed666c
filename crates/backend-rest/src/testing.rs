//! In-memory fakes for the REST and push seams.

use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use backend_core::{
    AccessToken, Attachment, BackendError, ConversationRecord, DeleteScope, Gender, Message,
    MessagePage, OutgoingMessage, PageRequest, PasswordChange, ProfileUpdate, RegistrationForm,
    UserProfile, UserSearchItem,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    api::{AttachmentBody, ChatApi},
    push::{PushConnector, PushTransport},
};

pub const TOKEN: &str = "token-olena";

#[derive(Default)]
struct FakeState {
    token: Option<String>,
    conversations: Vec<ConversationRecord>,
    messages: Vec<Message>,
    next_message_id: i64,
    reject_pages_with: Option<u16>,
    read_reports: Vec<(i64, Option<i64>)>,
}

/// Single-user backend holding conversations and messages in memory.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
    pub send_calls: AtomicUsize,
}

impl FakeApi {
    pub fn with_messages(conversation_id: i64, peer_id: i64, ids: &[i64]) -> Self {
        let api = Self::default();
        {
            let mut state = api.state.lock().expect("lock");
            state.conversations.push(record(conversation_id, peer_id));
            state.messages = ids
                .iter()
                .map(|id| message(*id, conversation_id, &format!("message {id}")))
                .collect();
            state.next_message_id = ids.iter().copied().max().unwrap_or(0) + 1;
        }
        api
    }

    pub fn reject_pages_with(&self, status: u16) {
        self.state.lock().expect("lock").reject_pages_with = Some(status);
    }

    pub fn read_reports(&self) -> Vec<(i64, Option<i64>)> {
        self.state.lock().expect("lock").read_reports.clone()
    }

    fn authorized(&self) -> Result<(), BackendError> {
        match self.state.lock().expect("lock").token.as_deref() {
            Some(TOKEN) => Ok(()),
            _ => Err(BackendError::from_status(401, "Not authenticated")),
        }
    }
}

pub fn record(conversation_id: i64, peer_id: i64) -> ConversationRecord {
    ConversationRecord {
        conversation_id,
        peer_id,
        peer_username: format!("peer-{peer_id}"),
        peer_gender: None,
        last_message_id: None,
        last_message_preview: None,
        last_message_at: None,
        unread_count: 0,
    }
}

pub fn message(id: i64, conversation_id: i64, content: &str) -> Message {
    Message {
        id,
        conversation_id,
        sender_id: 1,
        content: Some(content.to_owned()),
        created_at: "2024-05-01T10:00:00".to_owned(),
        edited_at: None,
        updated_at: None,
        attachments: None,
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    fn set_access_token(&self, token: Option<String>) {
        self.state.lock().expect("lock").token = token;
    }

    async fn login(&self, login: &str, password: &str) -> Result<AccessToken, BackendError> {
        if login == "olena" && password == "secret1" {
            Ok(AccessToken {
                access_token: TOKEN.to_owned(),
                token_type: "bearer".to_owned(),
            })
        } else {
            Err(BackendError::from_status(401, "Invalid credentials"))
        }
    }

    async fn register(&self, _form: &RegistrationForm) -> Result<(), BackendError> {
        Ok(())
    }

    async fn current_user(&self) -> Result<UserProfile, BackendError> {
        self.authorized()?;
        Ok(UserProfile {
            id: 1,
            username: "olena".to_owned(),
            email: "olena@example.org".to_owned(),
            gender: Gender::Female,
        })
    }

    async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, BackendError> {
        let mut profile = self.current_user().await?;
        if let Some(username) = &update.username {
            profile.username = username.clone();
        }
        if let Some(gender) = update.gender {
            profile.gender = gender;
        }
        Ok(profile)
    }

    async fn change_password(&self, _change: &PasswordChange) -> Result<(), BackendError> {
        self.authorized()
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>, BackendError> {
        self.authorized()?;
        Ok(self.state.lock().expect("lock").conversations.clone())
    }

    async fn start_conversation(&self, peer_id: i64) -> Result<i64, BackendError> {
        self.authorized()?;
        let mut state = self.state.lock().expect("lock");
        if let Some(existing) = state.conversations.iter().find(|c| c.peer_id == peer_id) {
            return Ok(existing.conversation_id);
        }
        let id = state.conversations.len() as i64 + 100;
        state.conversations.push(record(id, peer_id));
        Ok(id)
    }

    async fn hide_conversation(&self, conversation_id: i64) -> Result<(), BackendError> {
        self.authorized()?;
        self.state
            .lock()
            .expect("lock")
            .conversations
            .retain(|c| c.conversation_id != conversation_id);
        Ok(())
    }

    async fn clear_conversation(&self, conversation_id: i64) -> Result<(), BackendError> {
        self.authorized()?;
        self.state
            .lock()
            .expect("lock")
            .messages
            .retain(|m| m.conversation_id != conversation_id);
        Ok(())
    }

    async fn mark_read(
        &self,
        conversation_id: i64,
        up_to_message_id: Option<i64>,
    ) -> Result<(), BackendError> {
        self.authorized()?;
        self.state
            .lock()
            .expect("lock")
            .read_reports
            .push((conversation_id, up_to_message_id));
        Ok(())
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSearchItem>, BackendError> {
        self.authorized()?;
        Ok(vec![UserSearchItem {
            id: 42,
            username: Some(format!("{query}-match")),
            email: None,
            gender: None,
        }])
    }

    async fn message_page(&self, request: PageRequest) -> Result<MessagePage, BackendError> {
        self.authorized()?;
        let state = self.state.lock().expect("lock");
        if let Some(status) = state.reject_pages_with {
            return Err(BackendError::from_status(status, "rejected"));
        }
        let mut items: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == request.conversation_id)
            .filter(|m| request.before_id.is_none_or(|before| m.id < before))
            .cloned()
            .collect();
        items.sort_by_key(|m| std::cmp::Reverse(m.id));
        let has_more = items.len() > usize::from(request.limit);
        items.truncate(usize::from(request.limit));
        items.reverse();
        let next_before_id = items.first().map(|m| m.id);
        Ok(MessagePage {
            items,
            has_more,
            next_before_id,
        })
    }

    async fn send_message(&self, outgoing: OutgoingMessage) -> Result<Message, BackendError> {
        self.authorized()?;
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("lock");
        let id = state.next_message_id.max(1);
        state.next_message_id = id + 1;
        let mut stored = message(id, outgoing.conversation_id, &outgoing.content);
        if !outgoing.files.is_empty() {
            stored.attachments = Some(
                outgoing
                    .files
                    .iter()
                    .enumerate()
                    .map(|(idx, file)| Attachment {
                        id: id * 10 + idx as i64,
                        filename: file.filename.clone(),
                        content_type: file.content_type.clone(),
                        size: Some(file.data.len() as u64),
                    })
                    .collect(),
            );
        }
        state.messages.push(stored.clone());
        Ok(stored)
    }

    async fn edit_message(&self, message_id: i64, content: &str) -> Result<(), BackendError> {
        self.authorized()?;
        let mut state = self.state.lock().expect("lock");
        let stored = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| BackendError::from_status(404, "Message not found"))?;
        stored.content = Some(content.to_owned());
        Ok(())
    }

    async fn delete_message(
        &self,
        message_id: i64,
        _scope: DeleteScope,
    ) -> Result<(), BackendError> {
        self.authorized()?;
        self.state
            .lock()
            .expect("lock")
            .messages
            .retain(|m| m.id != message_id);
        Ok(())
    }

    async fn delete_attachment(
        &self,
        _attachment_id: i64,
        _scope: DeleteScope,
    ) -> Result<(), BackendError> {
        self.authorized()
    }

    async fn download_attachment(
        &self,
        attachment_id: i64,
    ) -> Result<AttachmentBody, BackendError> {
        self.authorized()?;
        Ok(AttachmentBody {
            data: format!("attachment {attachment_id}").into_bytes(),
            content_type: Some("text/plain".to_owned()),
            filename: None,
        })
    }
}

/// Hands out in-memory transports and keeps the far ends for the test.
#[derive(Default)]
pub struct LoopbackConnector {
    pub connects: AtomicUsize,
    ends: Mutex<Vec<(mpsc::Sender<String>, mpsc::Receiver<String>)>>,
}

impl LoopbackConnector {
    /// Server side of the oldest unclaimed connection.
    pub fn take_end(&self) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        self.ends.lock().expect("lock").remove(0)
    }
}

#[async_trait]
impl PushConnector for LoopbackConnector {
    async fn connect(&self, _user_id: i64) -> Result<PushTransport, BackendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        self.ends
            .lock()
            .expect("lock")
            .push((inbound_tx, outbound_rx));
        Ok(PushTransport {
            inbound: inbound_rx,
            outbound: outbound_tx,
            shutdown: CancellationToken::new(),
        })
    }
}
