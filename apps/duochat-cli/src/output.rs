//! Text rendering of backend events for the terminal.

use backend_core::{BackendEvent, Conversation, Message, ScrollDirective, TimelineSnapshot};

/// Render one event as printable lines. Events with no user-facing content
/// render to nothing.
pub fn render_event(event: &BackendEvent, self_id: Option<i64>) -> Vec<String> {
    match event {
        BackendEvent::StateChanged { state } => vec![format!("* session: {state:?}")],
        BackendEvent::AuthResult {
            success: true,
            ..
        } => vec!["* signed in".to_owned()],
        BackendEvent::AuthResult {
            success: false,
            error_code,
        } => vec![format!(
            "! sign-in failed ({})",
            error_code.as_deref().unwrap_or("unknown")
        )],
        BackendEvent::ProfileLoaded(profile) => vec![format!(
            "* you are {} (#{}, {})",
            profile.username,
            profile.id,
            profile.gender.as_str()
        )],
        BackendEvent::PasswordChanged => vec!["* password changed".to_owned()],
        BackendEvent::Registered { username } => {
            vec![format!("* account '{username}' created, use /login to sign in")]
        }
        BackendEvent::ConversationsUpdated { conversations } => render_conversations(conversations),
        BackendEvent::ConversationStarted {
            peer_id,
            conversation_id,
        } => vec![format!(
            "* conversation #{conversation_id} with user #{peer_id}, /open {conversation_id}"
        )],
        BackendEvent::ActiveConversationChanged {
            conversation_id: Some(id),
        } => vec![format!("* opened conversation #{id}")],
        BackendEvent::ActiveConversationChanged {
            conversation_id: None,
        } => Vec::new(),
        BackendEvent::TimelineUpdated(snapshot) => render_timeline(snapshot, self_id),
        BackendEvent::Viewport(ScrollDirective::ShowScrollToBottom { visible: true }) => {
            vec!["* newer messages below".to_owned()]
        }
        BackendEvent::Viewport(_) => Vec::new(),
        BackendEvent::ComposerUpdated(composer) => {
            let mut lines = Vec::new();
            if !composer.pending_files.is_empty() {
                lines.push(format!(
                    "* staged {}/{}: {}",
                    composer.pending_files.len(),
                    composer.max_pending_files,
                    composer.pending_files.join(", ")
                ));
            }
            if let Some(id) = composer.editing_message_id {
                lines.push(format!("* editing #{id}: {}", composer.editing_text));
            }
            lines
        }
        BackendEvent::SendAck(ack) => match (&ack.message_id, &ack.error_code) {
            (_, Some(code)) => vec![format!("! message not sent ({code})")],
            (Some(id), None) => vec![format!("* sent #{id}")],
            (None, None) => Vec::new(),
        },
        BackendEvent::UserSearchResults { query, results } if results.is_empty() => {
            vec![format!("* no users match '{}'", query.trim())]
        }
        BackendEvent::UserSearchResults { results, .. } => results
            .iter()
            .map(|user| {
                format!(
                    "  user #{} {}",
                    user.id,
                    user.username
                        .as_deref()
                        .or(user.email.as_deref())
                        .unwrap_or("(unnamed)")
                )
            })
            .collect(),
        BackendEvent::AttachmentDownloaded(_) => Vec::new(),
        BackendEvent::PushStatus { connected } => vec![format!(
            "* live updates {}",
            if *connected { "on" } else { "off" }
        )],
        BackendEvent::OperationFailed { operation, error } => {
            vec![format!("! {operation}: {}", error.inline_message())]
        }
    }
}

fn render_conversations(conversations: &[Conversation]) -> Vec<String> {
    if conversations.is_empty() {
        return vec!["* no conversations".to_owned()];
    }
    conversations
        .iter()
        .map(|conversation| {
            let unread = if conversation.unread_count > 0 {
                format!(" [{} unread]", conversation.unread_count)
            } else {
                String::new()
            };
            let preview = conversation
                .last_message_preview
                .as_deref()
                .map(|text| format!(": {}", truncate(text, 40)))
                .unwrap_or_default();
            format!(
                "  #{} {}{unread}{preview}",
                conversation.id, conversation.peer.username
            )
        })
        .collect()
}

fn render_timeline(snapshot: &TimelineSnapshot, self_id: Option<i64>) -> Vec<String> {
    if snapshot.initial_loading {
        return vec![format!("* loading #{}...", snapshot.conversation_id)];
    }
    if snapshot.loading_more {
        return Vec::new();
    }

    let mut lines = Vec::with_capacity(snapshot.messages.len() + 1);
    lines.push(format!(
        "--- #{} ({} messages{}) ---",
        snapshot.conversation_id,
        snapshot.messages.len(),
        if snapshot.has_more { ", /older for more" } else { "" }
    ));
    lines.extend(
        snapshot
            .messages
            .iter()
            .map(|message| render_message(message, self_id)),
    );
    lines
}

fn render_message(message: &Message, self_id: Option<i64>) -> String {
    let author = if Some(message.sender_id) == self_id {
        "you".to_owned()
    } else {
        format!("#{}", message.sender_id)
    };
    let mut line = format!(
        "[{}] {author}: {}",
        message.id,
        message.content.as_deref().unwrap_or("")
    );
    if message.edited_at.is_some() {
        line.push_str(" (edited)");
    }
    for attachment in message.attachments() {
        line.push_str(&format!(" [file {} {}]", attachment.id, attachment.filename));
    }
    line
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
