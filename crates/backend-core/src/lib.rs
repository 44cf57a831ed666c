//! Core client contract shared between the runtime and frontend consumers.
//!
//! This crate defines the command/event protocol, the session lifecycle, and
//! the synchronous state machines for the message window, viewport, read
//! reports, conversation list and composer.

/// Local validation for account forms and user search.
pub mod account;
/// Async command/event channel primitives and listener registries.
pub mod channel;
/// Composer, pending attachments and edit session.
pub mod composer;
/// Conversation list and push-driven patches.
pub mod directory;
/// Stable backend error types and HTTP classification helpers.
pub mod error;
/// Loaded message window with paging and refresh reconciliation.
pub mod message_store;
/// Event normalization helpers (send acknowledgements, push frames).
pub mod normalization;
/// Read-report throttling.
pub mod read_tracker;
/// Session lifecycle state machine.
pub mod state_machine;
/// Frontend-facing protocol types (commands, events, payloads).
pub mod types;
/// Scroll position state machine.
pub mod viewport;

pub use channel::{
    BackendChannelError, BackendChannels, EventStream, Listener, ListenerRegistry, ListenerToken,
};
pub use composer::{Composer, EditSession, PendingAttachments};
pub use directory::{ConversationDirectory, DirectoryPushOutcome, validate_peer_id};
pub use error::{BackendError, BackendErrorCategory, classify_http_status};
pub use message_store::{MessageWindow, bounded_page_limit};
pub use normalization::{
    SendOutcome, decode_push_frame, normalize_operation_failure, normalize_send_outcome,
};
pub use read_tracker::{ReadReport, ReadTracker};
pub use state_machine::BackendStateMachine;
pub use types::{
    AccessToken, Attachment, BackendCommand, BackendEvent, BackendInitConfig,
    BackendLifecycleState, ComposerSnapshot, Conversation, ConversationRecord, DeleteScope,
    DownloadedAttachment, Gender, Message, MessagePage, OutgoingFile, OutgoingMessage,
    PageRequest, PasswordChange, PeerSummary, ProfileUpdate, PushEvent, PushFrame,
    RegistrationForm, ScrollDirective, ScrollMetrics, SendAck, TimelineSnapshot, UserProfile,
    UserSearchItem,
};
pub use viewport::{LoadGate, RenderOutcome, ScrollOutcome, ViewportController};
