use crate::{
    error::{BackendError, BackendErrorCategory},
    types::{ComposerSnapshot, OutgoingFile, OutgoingMessage},
};

pub const DEFAULT_MAX_PENDING_FILES: usize = 10;

/// Files staged for the next message, capped at `max` entries.
#[derive(Debug, Clone)]
pub struct PendingAttachments {
    files: Vec<OutgoingFile>,
    max: usize,
}

impl Default for PendingAttachments {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_FILES)
    }
}

impl PendingAttachments {
    pub fn new(max: usize) -> Self {
        Self {
            files: Vec::new(),
            max: max.max(1),
        }
    }

    pub fn files(&self) -> &[OutgoingFile] {
        &self.files
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Stage files until the cap is reached. Returns how many were dropped.
    pub fn add(&mut self, files: Vec<OutgoingFile>) -> usize {
        let room = self.max.saturating_sub(self.files.len());
        let offered = files.len();
        self.files.extend(files.into_iter().take(room));
        offered.saturating_sub(room)
    }

    pub fn remove(&mut self, index: usize) -> Option<OutgoingFile> {
        (index < self.files.len()).then(|| self.files.remove(index))
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    fn take(&mut self) -> Vec<OutgoingFile> {
        std::mem::take(&mut self.files)
    }
}

/// Text and staged files of the open conversation.
#[derive(Debug, Clone, Default)]
pub struct Composer {
    text: String,
    pending: PendingAttachments,
    sending: bool,
    in_flight: Option<InFlightSend>,
}

#[derive(Debug, Clone)]
struct InFlightSend {
    conversation_id: i64,
    text: String,
    files: Vec<OutgoingFile>,
}

impl Composer {
    pub fn new(max_pending_files: usize) -> Self {
        Self {
            pending: PendingAttachments::new(max_pending_files),
            ..Self::default()
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn pending(&self) -> &PendingAttachments {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut PendingAttachments {
        &mut self.pending
    }

    pub fn sending(&self) -> bool {
        self.sending
    }

    /// Keep the text, drop staged files.
    pub fn on_conversation_switch(&mut self) {
        self.pending.clear();
        self.sending = false;
        self.in_flight = None;
    }

    /// Validate and build the outgoing message. No request may be issued on
    /// error.
    pub fn begin_send(&mut self, conversation_id: i64) -> Result<OutgoingMessage, BackendError> {
        if self.sending {
            return Err(BackendError::new(
                BackendErrorCategory::Validation,
                "send_in_progress",
                "A message is already being sent",
            ));
        }
        let content = self.text.trim().to_owned();
        if content.is_empty() && self.pending.is_empty() {
            return Err(BackendError::validation(
                "empty_message",
                "Type a message or attach a file",
            ));
        }

        let files = self.pending.files().to_vec();
        self.sending = true;
        self.in_flight = Some(InFlightSend {
            conversation_id,
            text: self.text.clone(),
            files: files.clone(),
        });

        Ok(OutgoingMessage {
            conversation_id,
            content,
            files,
        })
    }

    /// Finish the send issued for `conversation_id`. On success the sent
    /// text and files are cleared unless the user already replaced them.
    ///
    /// A completion for any other conversation is stale and leaves the
    /// composer untouched. Returns `false` in that case.
    pub fn finish_send(&mut self, conversation_id: i64, success: bool) -> bool {
        if self
            .in_flight
            .as_ref()
            .is_none_or(|sent| sent.conversation_id != conversation_id)
        {
            return false;
        }
        self.sending = false;
        let Some(sent) = self.in_flight.take() else {
            return false;
        };
        if !success {
            return true;
        }
        if self.text == sent.text {
            self.text.clear();
        }
        if self.pending.files() == sent.files.as_slice() {
            self.pending.take();
        }
        true
    }

    pub fn snapshot(&self, edit: &EditSession) -> ComposerSnapshot {
        ComposerSnapshot {
            text: self.text.clone(),
            pending_files: self
                .pending
                .files()
                .iter()
                .map(|file| file.filename.clone())
                .collect(),
            max_pending_files: self.pending.max(),
            sending: self.sending,
            editing_message_id: edit.message_id(),
            editing_text: edit.text().to_owned(),
        }
    }
}

/// In-place edit of one sent message.
#[derive(Debug, Clone, Default)]
pub struct EditSession {
    message_id: Option<i64>,
    text: String,
    saving: bool,
}

impl EditSession {
    pub fn message_id(&self) -> Option<i64> {
        self.message_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_active(&self) -> bool {
        self.message_id.is_some()
    }

    pub fn start(&mut self, message_id: i64, current_content: &str) {
        self.message_id = Some(message_id);
        self.text = current_content.to_owned();
        self.saving = false;
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        if self.is_active() {
            self.text = text.into();
        }
    }

    pub fn cancel(&mut self) {
        *self = Self::default();
    }

    /// Trimmed content to save for the edited message.
    pub fn consume(&mut self) -> Result<(i64, String), BackendError> {
        let Some(message_id) = self.message_id else {
            return Err(BackendError::validation(
                "no_active_edit",
                "No message is being edited",
            ));
        };
        if self.saving {
            return Err(BackendError::validation(
                "edit_in_progress",
                "The edit is already being saved",
            ));
        }
        let content = self.text.trim();
        if content.is_empty() {
            return Err(BackendError::validation(
                "empty_message",
                "Message cannot be empty",
            ));
        }
        self.saving = true;
        Ok((message_id, content.to_owned()))
    }

    /// Close the session after a successful save, or allow another attempt.
    pub fn finish(&mut self, message_id: i64, success: bool) {
        if self.message_id != Some(message_id) {
            return;
        }
        if success {
            self.cancel();
        } else {
            self.saving = false;
        }
    }
}
