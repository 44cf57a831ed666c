use serde::{Deserialize, Deserializer, Serialize};

use crate::error::BackendError;

/// High-level session lifecycle state reported to the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendLifecycleState {
    /// Backend has not been initialized yet.
    Cold,
    /// Backend has accepted `Init` and runtime tuning is loaded.
    Configured,
    /// A login or session restore flow is currently running.
    Authenticating,
    /// A credential is held and the current user profile is known.
    Authenticated,
    /// Session ended (explicit logout or credential rejected).
    LoggedOut,
}

/// Account gender as accepted by the registration and profile endpoints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
        }
    }
}

/// Visibility of a deletion: the requester's view only, or every participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeleteScope {
    Me,
    All,
}

impl DeleteScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Me => "me",
            Self::All => "all",
        }
    }
}

/// Optional runtime tuning values supplied with `BackendCommand::Init`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BackendInitConfig {
    /// Page size used for the initial load and for older pages.
    pub page_size: Option<u16>,
    /// Page size used by the background refresh.
    pub refresh_page_size: Option<u16>,
    /// Background refresh period in milliseconds.
    pub refresh_interval_ms: Option<u64>,
    /// Minimum interval between repeated read reports in milliseconds.
    pub read_min_interval_ms: Option<u64>,
    /// Cap on pending outgoing attachments.
    pub max_pending_files: Option<usize>,
    /// Minimum trimmed query length before user search hits the backend.
    pub search_min_length: Option<usize>,
}

/// File attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    #[serde(deserialize_with = "flexible_id")]
    pub id: i64,
    #[serde(default, alias = "name")]
    pub filename: String,
    #[serde(default, alias = "mimetype", alias = "mime_type")]
    pub content_type: Option<String>,
    #[serde(default, alias = "size_bytes")]
    pub size: Option<u64>,
}

/// One chat message as delivered by the page endpoint or the push channel.
///
/// `Option` fields that are `None` were absent from the payload; merges keep
/// the locally held value for them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    #[serde(deserialize_with = "flexible_id")]
    pub id: i64,
    #[serde(default, deserialize_with = "flexible_id")]
    pub conversation_id: i64,
    #[serde(default, deserialize_with = "flexible_id")]
    pub sender_id: i64,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

impl Message {
    /// Attachments in display order (empty when none were delivered).
    pub fn attachments(&self) -> &[Attachment] {
        self.attachments.as_deref().unwrap_or(&[])
    }

    /// Whether `other` carries a different content/edit/update state.
    pub fn differs_from(&self, other: &Message) -> bool {
        self.content != other.content
            || self.updated_at != other.updated_at
            || self.edited_at != other.edited_at
    }

    /// Merge fields present in `incoming` into `self`. Returns `true` when
    /// anything changed.
    pub fn merge_from(&mut self, incoming: &Message) -> bool {
        let before = self.clone();

        if incoming.conversation_id != 0 {
            self.conversation_id = incoming.conversation_id;
        }
        if incoming.sender_id != 0 {
            self.sender_id = incoming.sender_id;
        }
        if incoming.content.is_some() {
            self.content = incoming.content.clone();
        }
        if !incoming.created_at.is_empty() {
            self.created_at = incoming.created_at.clone();
        }
        if incoming.edited_at.is_some() {
            self.edited_at = incoming.edited_at.clone();
        }
        if incoming.updated_at.is_some() {
            self.updated_at = incoming.updated_at.clone();
        }
        if incoming.attachments.is_some() {
            self.attachments = incoming.attachments.clone();
        }

        *self != before
    }
}

/// Response of `GET /messages/page`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePage {
    pub items: Vec<Message>,
    pub has_more: bool,
    #[serde(default)]
    pub next_before_id: Option<i64>,
}

/// Parameters for one page request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRequest {
    pub conversation_id: i64,
    pub limit: u16,
    /// Request messages strictly older than this id.
    pub before_id: Option<i64>,
}

/// Peer shown for a conversation row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerSummary {
    pub id: i64,
    pub username: String,
    pub gender: Option<String>,
}

/// Local conversation row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: i64,
    pub peer: PeerSummary,
    pub unread_count: u64,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<String>,
    pub last_message_id: Option<i64>,
}

/// Conversation record as returned by `GET /conversations`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationRecord {
    pub conversation_id: i64,
    pub peer_id: i64,
    #[serde(default)]
    pub peer_username: String,
    #[serde(default)]
    pub peer_gender: Option<String>,
    #[serde(default)]
    pub last_message_id: Option<i64>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<String>,
    #[serde(default)]
    pub unread_count: u64,
}

impl From<ConversationRecord> for Conversation {
    fn from(record: ConversationRecord) -> Self {
        Self {
            id: record.conversation_id,
            peer: PeerSummary {
                id: record.peer_id,
                username: record.peer_username,
                gender: record.peer_gender,
            },
            unread_count: record.unread_count,
            last_message_preview: record.last_message_preview,
            last_message_at: record.last_message_at,
            last_message_id: record.last_message_id,
        }
    }
}

/// Authenticated user profile (`GET /users/me`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    pub gender: Gender,
}

/// Row returned by user search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSearchItem {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
}

/// Bearer credential issued by `POST /auth/login`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_owned()
}

/// Body of `POST /auth/register`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationForm {
    pub username: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub gender: Gender,
}

/// Body of `PATCH /users/me`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
}

/// Body of `POST /users/me/change-password`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PasswordChange {
    pub old_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

/// File staged in the composer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Validated message ready for `POST /messages/send`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub conversation_id: i64,
    pub content: String,
    pub files: Vec<OutgoingFile>,
}

/// Attachment bytes fetched for download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadedAttachment {
    pub attachment_id: i64,
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Scroll geometry of the message list, as measured by the UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollMetrics {
    pub fn new(scroll_top: f64, scroll_height: f64, client_height: f64) -> Self {
        Self {
            scroll_top,
            scroll_height,
            client_height,
        }
    }

    /// Pixels between the visible end and the content end.
    pub fn distance_from_bottom(&self) -> f64 {
        self.scroll_height - self.scroll_top - self.client_height
    }
}

/// Scroll instruction the UI must apply to the message list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ScrollDirective {
    /// Restore a scroll offset after older messages were prepended.
    SetScrollTop { offset: f64 },
    /// Scroll to the end of the list, then report `ScrollSettled`.
    ScrollToBottom { smooth: bool },
    /// Toggle the "scroll to bottom" affordance.
    ShowScrollToBottom { visible: bool },
}

/// Loaded message window of the open conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineSnapshot {
    pub conversation_id: i64,
    pub messages: Vec<Message>,
    pub initial_loading: bool,
    pub loading_more: bool,
    pub has_more: bool,
}

/// Composer and edit state of the open conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ComposerSnapshot {
    pub text: String,
    pub pending_files: Vec<String>,
    pub max_pending_files: usize,
    pub sending: bool,
    pub editing_message_id: Option<i64>,
    pub editing_text: String,
}

/// Acknowledgement for `SendMessage`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Original frontend transaction ID.
    pub client_txn_id: String,
    /// Id of the stored message on success.
    pub message_id: Option<i64>,
    /// Stable backend error code on failure.
    pub error_code: Option<String>,
}

/// Recognized push event kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    NewMessage {
        message: Message,
    },
    ConversationUpdated {
        #[serde(deserialize_with = "flexible_id")]
        conversation_id: i64,
        #[serde(default)]
        unread_count: Option<u64>,
    },
    MessageDeleted {
        #[serde(deserialize_with = "flexible_id")]
        conversation_id: i64,
        #[serde(deserialize_with = "flexible_id")]
        message_id: i64,
        #[serde(default = "default_deleted_for_all")]
        deleted_for_all: bool,
    },
    MessageEdited {
        #[serde(deserialize_with = "flexible_id")]
        conversation_id: i64,
        message: Message,
    },
}

fn default_deleted_for_all() -> bool {
    true
}

/// One inbound push frame after decoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PushFrame {
    /// A recognized event.
    Event(PushEvent),
    /// Structured JSON with an unknown or malformed `type`.
    Json(serde_json::Value),
    /// Payload that is not JSON at all.
    Raw(String),
}

/// Command channel input accepted by the backend runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BackendCommand {
    /// Apply runtime tuning and leave the `Cold` state.
    Init { config: Option<BackendInitConfig> },
    /// Login with username or email and password.
    Login { login: String, password: String },
    /// Create an account. Does not log in.
    Register(RegistrationForm),
    /// Resume a session from the persisted credential.
    RestoreSession,
    /// End the session and forget the persisted credential.
    Logout,
    UpdateProfile(ProfileUpdate),
    ChangePassword(PasswordChange),
    RefreshConversations,
    StartConversation { peer_id: i64 },
    HideConversation { conversation_id: i64 },
    ClearConversation { conversation_id: i64 },
    SearchUsers { query: String },
    /// Make a conversation the open one and load its newest page.
    OpenConversation { conversation_id: i64 },
    CloseConversation,
    LoadOlderMessages,
    ReloadMessages,
    SetComposerText { text: String },
    AddPendingFiles { files: Vec<OutgoingFile> },
    RemovePendingFile { index: usize },
    ClearPendingFiles,
    /// Send composer text and pending files to the open conversation.
    SendMessage { client_txn_id: String },
    StartEdit { message_id: i64 },
    SetEditText { text: String },
    CancelEdit,
    SaveEdit,
    DeleteMessage { message_id: i64, scope: DeleteScope },
    DeleteAttachment {
        message_id: i64,
        attachment_id: i64,
        scope: DeleteScope,
    },
    DownloadAttachment { attachment_id: i64 },
    /// Report reading up to a message (or up to now when `None`).
    MarkRead { up_to_message_id: Option<i64> },
    /// The user scrolled the message list.
    ViewportScrolled { metrics: ScrollMetrics },
    /// The UI rendered the latest timeline snapshot.
    ViewportRendered { metrics: ScrollMetrics },
    ScrollToBottom { smooth: bool },
    /// A `ScrollToBottom` directive finished.
    ScrollSettled { metrics: ScrollMetrics },
    /// Best-effort publish on the push channel.
    PublishPush { payload: serde_json::Value },
}

/// Event channel output emitted by the backend runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BackendEvent {
    /// Session lifecycle transition.
    StateChanged { state: BackendLifecycleState },
    /// Result of a login/session-restore flow.
    AuthResult {
        success: bool,
        error_code: Option<String>,
    },
    ProfileLoaded(UserProfile),
    PasswordChanged,
    Registered { username: String },
    /// Full conversation list replacement.
    ConversationsUpdated { conversations: Vec<Conversation> },
    ConversationStarted { peer_id: i64, conversation_id: i64 },
    ActiveConversationChanged { conversation_id: Option<i64> },
    TimelineUpdated(TimelineSnapshot),
    Viewport(ScrollDirective),
    ComposerUpdated(ComposerSnapshot),
    SendAck(SendAck),
    UserSearchResults {
        query: String,
        results: Vec<UserSearchItem>,
    },
    AttachmentDownloaded(DownloadedAttachment),
    PushStatus { connected: bool },
    /// A user-visible operation failed; prior state is retained.
    OperationFailed {
        operation: String,
        error: BackendError,
    },
}

/// Accept ids encoded either as JSON numbers or as numeric strings.
pub(crate) fn flexible_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(i64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(value) => Ok(value),
        RawId::Text(value) => value
            .trim()
            .parse::<i64>()
            .map_err(|err| serde::de::Error::custom(format!("invalid id '{value}': {err}"))),
    }
}
