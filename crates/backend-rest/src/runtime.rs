use std::{future::Future, sync::Arc, time::Duration};

use backend_core::{
    BackendChannelError, BackendChannels, BackendCommand, BackendError, BackendErrorCategory,
    BackendEvent, BackendInitConfig, BackendStateMachine, Composer, ConversationDirectory,
    ConversationRecord, DeleteScope, DownloadedAttachment, EditSession, EventStream, LoadGate,
    Message, MessagePage, MessageWindow, OutgoingFile, PageRequest, PushEvent, PushFrame,
    ReadReport, ReadTracker, ScrollDirective, ScrollMetrics, SendOutcome, UserProfile,
    UserSearchItem, ViewportController,
    account::{
        DEFAULT_SEARCH_MIN_LENGTH, normalize_search_query, validate_password_change,
        validate_profile_update, validate_registration,
    },
    composer::DEFAULT_MAX_PENDING_FILES,
    message_store::{DEFAULT_PAGE_SIZE, DEFAULT_REFRESH_PAGE_SIZE},
    normalize_operation_failure, normalize_send_outcome,
    read_tracker::DEFAULT_READ_MIN_INTERVAL_MS,
    validate_peer_id,
};
use backend_platform::{CredentialVault, SecretStoreError, StoredCredential};
use tokio::{
    sync::mpsc,
    time::{Instant, Interval, MissedTickBehavior, interval_at},
};
use tracing::{debug, info, trace, warn};

use crate::{
    api::{AttachmentBody, ChatApi},
    push::{PushChannel, PushConnector},
};

pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 6_000;

/// External collaborators of the runtime.
pub struct ChatServices {
    pub api: Arc<dyn ChatApi>,
    pub push: Arc<dyn PushConnector>,
    pub credentials: CredentialVault,
}

#[derive(Clone)]
pub struct RuntimeHandle {
    channels: BackendChannels,
    push: PushChannel,
}

impl RuntimeHandle {
    pub async fn send(&self, command: BackendCommand) -> Result<(), BackendChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Push channel of the session, for extra frame listeners.
    pub fn push(&self) -> &PushChannel {
        &self.push
    }
}

pub fn spawn_runtime(services: ChatServices) -> RuntimeHandle {
    let (channels, command_rx) = BackendChannels::new(128, 512);
    let push = PushChannel::new(services.push);
    let runtime = ChatRuntime::new(
        channels.clone(),
        command_rx,
        services.api,
        push.clone(),
        services.credentials,
    );
    tokio::spawn(async move {
        runtime.run().await;
    });

    RuntimeHandle { channels, push }
}

/// Tuning resolved from `BackendInitConfig` against defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RuntimeSettings {
    page_size: u16,
    refresh_page_size: u16,
    refresh_interval: Duration,
    read_min_interval_ms: u64,
    max_pending_files: usize,
    search_min_length: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_init(None)
    }
}

impl RuntimeSettings {
    fn from_init(config: Option<&BackendInitConfig>) -> Self {
        let config = config.cloned().unwrap_or_default();
        Self {
            page_size: config.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            refresh_page_size: config.refresh_page_size.unwrap_or(DEFAULT_REFRESH_PAGE_SIZE),
            refresh_interval: Duration::from_millis(
                config
                    .refresh_interval_ms
                    .unwrap_or(DEFAULT_REFRESH_INTERVAL_MS)
                    .max(1),
            ),
            read_min_interval_ms: config
                .read_min_interval_ms
                .unwrap_or(DEFAULT_READ_MIN_INTERVAL_MS),
            max_pending_files: config.max_pending_files.unwrap_or(DEFAULT_MAX_PENDING_FILES),
            search_min_length: config.search_min_length.unwrap_or(DEFAULT_SEARCH_MIN_LENGTH),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthFlow {
    Login,
    Restore,
}

/// Result of a spawned request, delivered back to the runtime loop.
enum Completion {
    Authenticated {
        flow: AuthFlow,
        result: Result<(Option<StoredCredential>, UserProfile), BackendError>,
    },
    Registered {
        username: String,
        result: Result<(), BackendError>,
    },
    ProfileUpdated(Result<UserProfile, BackendError>),
    PasswordChanged(Result<(), BackendError>),
    PushOpened(Result<(), BackendError>),
    Conversations {
        user_initiated: bool,
        result: Result<Vec<ConversationRecord>, BackendError>,
    },
    ConversationStarted {
        peer_id: i64,
        result: Result<i64, BackendError>,
    },
    ConversationAction {
        operation: &'static str,
        conversation_id: i64,
        result: Result<(), BackendError>,
    },
    SearchResults {
        query: String,
        result: Result<Vec<UserSearchItem>, BackendError>,
    },
    InitialPage {
        conversation_id: i64,
        result: Result<MessagePage, BackendError>,
    },
    OlderPage {
        conversation_id: i64,
        result: Result<MessagePage, BackendError>,
    },
    RefreshPage {
        conversation_id: i64,
        result: Result<MessagePage, BackendError>,
    },
    ReadReported {
        report: ReadReport,
        result: Result<(), BackendError>,
    },
    Sent {
        client_txn_id: String,
        conversation_id: i64,
        result: Result<Message, BackendError>,
    },
    Edited {
        conversation_id: i64,
        message_id: i64,
        content: String,
        result: Result<(), BackendError>,
    },
    MessageDeleted {
        conversation_id: i64,
        message_id: i64,
        result: Result<(), BackendError>,
    },
    AttachmentDeleted {
        conversation_id: i64,
        message_id: i64,
        attachment_id: i64,
        result: Result<(), BackendError>,
    },
    Downloaded {
        attachment_id: i64,
        filename_hint: Option<String>,
        result: Result<AttachmentBody, BackendError>,
    },
}

enum Internal {
    /// Request completion tagged with the session it was issued in.
    Completion { session: u64, completion: Completion },
    Push(PushFrame),
}

struct ChatRuntime {
    channels: BackendChannels,
    command_rx: mpsc::Receiver<BackendCommand>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    state_machine: BackendStateMachine,
    settings: RuntimeSettings,
    refresh: Interval,
    api: Arc<dyn ChatApi>,
    push: PushChannel,
    credentials: CredentialVault,
    session: u64,
    user: Option<UserProfile>,
    directory: ConversationDirectory,
    window: MessageWindow,
    viewport: ViewportController,
    reader: ReadTracker,
    composer: Composer,
    edit: EditSession,
    refresh_in_flight: bool,
    latest_search: Option<String>,
    started_at: Instant,
}

impl ChatRuntime {
    fn new(
        channels: BackendChannels,
        command_rx: mpsc::Receiver<BackendCommand>,
        api: Arc<dyn ChatApi>,
        push: PushChannel,
        credentials: CredentialVault,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let frames_tx = internal_tx.clone();
        push.add_listener(Arc::new(move |frame: &PushFrame| {
            let _ = frames_tx.send(Internal::Push(frame.clone()));
        }));

        let settings = RuntimeSettings::default();
        Self {
            channels,
            command_rx,
            internal_tx,
            internal_rx,
            state_machine: BackendStateMachine::default(),
            settings,
            refresh: refresh_interval(settings.refresh_interval),
            api,
            push,
            credentials,
            session: 0,
            user: None,
            directory: ConversationDirectory::default(),
            window: MessageWindow::new(settings.page_size, settings.refresh_page_size),
            viewport: ViewportController::default(),
            reader: ReadTracker::new(settings.read_min_interval_ms),
            composer: Composer::new(settings.max_pending_files),
            edit: EditSession::default(),
            refresh_in_flight: false,
            latest_search: None,
            started_at: Instant::now(),
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    self.dispatch_command(command);
                }
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                _ = self.refresh.tick() => self.handle_refresh_tick(),
            }
        }
        self.push.close();
        debug!("runtime stopped");
    }

    fn dispatch_command(&mut self, command: BackendCommand) {
        let operation = operation_name(&command);
        trace!(operation, "handling command");
        if let Err(err) = self.handle_command(command) {
            self.fail(operation, err);
        }
    }

    fn handle_command(&mut self, command: BackendCommand) -> Result<(), BackendError> {
        use BackendCommand::*;

        if let SendMessage { client_txn_id } = &command {
            self.handle_send_message(client_txn_id.clone());
            return Ok(());
        }

        let (candidate, transition_events) = self.validate_transition(&command)?;

        match command {
            Init { config } => {
                self.handle_init(config.as_ref());
                self.commit_transition(candidate, transition_events);
                Ok(())
            }
            Login { login, password } => {
                self.commit_transition(candidate, transition_events);
                self.handle_login(login, password);
                Ok(())
            }
            RestoreSession => {
                self.commit_transition(candidate, transition_events);
                self.handle_restore_session();
                Ok(())
            }
            Logout => {
                self.reset_session();
                self.commit_transition(candidate, transition_events);
                info!("logged out");
                Ok(())
            }
            Register(form) => self.handle_register(form),
            UpdateProfile(update) => {
                validate_profile_update(&update)?;
                let api = Arc::clone(&self.api);
                self.spawn_request(async move {
                    Completion::ProfileUpdated(api.update_profile(&update).await)
                });
                Ok(())
            }
            ChangePassword(change) => {
                validate_password_change(&change)?;
                let api = Arc::clone(&self.api);
                self.spawn_request(async move {
                    Completion::PasswordChanged(api.change_password(&change).await)
                });
                Ok(())
            }
            RefreshConversations => {
                self.spawn_directory_refresh(true);
                Ok(())
            }
            StartConversation { peer_id } => {
                let peer_id = validate_peer_id(peer_id)?;
                let api = Arc::clone(&self.api);
                self.spawn_request(async move {
                    Completion::ConversationStarted {
                        peer_id,
                        result: api.start_conversation(peer_id).await,
                    }
                });
                Ok(())
            }
            HideConversation { conversation_id } => {
                let api = Arc::clone(&self.api);
                self.spawn_request(async move {
                    Completion::ConversationAction {
                        operation: "hide_conversation",
                        conversation_id,
                        result: api.hide_conversation(conversation_id).await,
                    }
                });
                Ok(())
            }
            ClearConversation { conversation_id } => {
                let api = Arc::clone(&self.api);
                self.spawn_request(async move {
                    Completion::ConversationAction {
                        operation: "clear_conversation",
                        conversation_id,
                        result: api.clear_conversation(conversation_id).await,
                    }
                });
                Ok(())
            }
            SearchUsers { query } => {
                self.handle_search_users(query);
                Ok(())
            }
            OpenConversation { conversation_id } => {
                self.open_conversation(Some(conversation_id));
                Ok(())
            }
            CloseConversation => {
                self.open_conversation(None);
                Ok(())
            }
            LoadOlderMessages => {
                self.load_older_messages();
                Ok(())
            }
            ReloadMessages => {
                self.start_initial_load();
                Ok(())
            }
            SetComposerText { text } => {
                self.composer.set_text(text);
                self.emit_composer();
                Ok(())
            }
            AddPendingFiles { files } => {
                self.add_pending_files(files);
                Ok(())
            }
            RemovePendingFile { index } => {
                self.composer.pending_mut().remove(index);
                self.emit_composer();
                Ok(())
            }
            ClearPendingFiles => {
                self.composer.pending_mut().clear();
                self.emit_composer();
                Ok(())
            }
            SendMessage { .. } => Ok(()),
            StartEdit { message_id } => self.handle_start_edit(message_id),
            SetEditText { text } => {
                self.edit.set_text(text);
                self.emit_composer();
                Ok(())
            }
            CancelEdit => {
                self.edit.cancel();
                self.emit_composer();
                Ok(())
            }
            SaveEdit => self.handle_save_edit(),
            DeleteMessage { message_id, scope } => self.handle_delete_message(message_id, scope),
            DeleteAttachment {
                message_id,
                attachment_id,
                scope,
            } => self.handle_delete_attachment(message_id, attachment_id, scope),
            DownloadAttachment { attachment_id } => {
                self.handle_download_attachment(attachment_id);
                Ok(())
            }
            MarkRead { up_to_message_id } => {
                self.begin_read(up_to_message_id);
                Ok(())
            }
            ViewportScrolled { metrics } => {
                self.handle_viewport_scrolled(metrics);
                Ok(())
            }
            ViewportRendered { metrics } => {
                self.handle_viewport_rendered(metrics);
                Ok(())
            }
            ScrollToBottom { smooth } => {
                let directive = self.viewport.scroll_to_bottom(smooth);
                self.channels.emit(BackendEvent::Viewport(directive));
                Ok(())
            }
            ScrollSettled { metrics } => {
                let (read_check, show) = self.viewport.on_scroll_settled(metrics);
                self.emit_scroll_button(show);
                if read_check {
                    self.begin_read(self.window.last_message_id());
                }
                Ok(())
            }
            PublishPush { payload } => {
                self.push.send(&payload);
                Ok(())
            }
        }
    }

    fn handle_init(&mut self, config: Option<&BackendInitConfig>) {
        self.settings = RuntimeSettings::from_init(config);
        self.refresh = refresh_interval(self.settings.refresh_interval);
        self.window = MessageWindow::new(self.settings.page_size, self.settings.refresh_page_size);
        self.reader = ReadTracker::new(self.settings.read_min_interval_ms);
        self.composer = Composer::new(self.settings.max_pending_files);
        debug!(settings = ?self.settings, "runtime configured");
    }

    fn handle_login(&mut self, login: String, password: String) {
        let api = Arc::clone(&self.api);
        self.spawn_request(async move {
            let result = async {
                let token = api.login(&login, &password).await?;
                api.set_access_token(Some(token.access_token.clone()));
                let profile = api.current_user().await?;
                Ok((
                    Some(StoredCredential {
                        access_token: token.access_token,
                        token_type: token.token_type,
                    }),
                    profile,
                ))
            }
            .await;
            Completion::Authenticated {
                flow: AuthFlow::Login,
                result,
            }
        });
    }

    fn handle_restore_session(&mut self) {
        let stored = match self.credentials.load() {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                self.finish_auth(Err(BackendError::new(
                    BackendErrorCategory::Auth,
                    "session_not_found",
                    "no persisted session was found for restore",
                )));
                return;
            }
            Err(err) => {
                self.finish_auth(Err(map_secret_store_error("load_credential", err)));
                return;
            }
        };

        self.api.set_access_token(Some(stored.access_token));
        let api = Arc::clone(&self.api);
        self.spawn_request(async move {
            Completion::Authenticated {
                flow: AuthFlow::Restore,
                result: api.current_user().await.map(|profile| (None, profile)),
            }
        });
    }

    fn handle_register(
        &mut self,
        form: backend_core::RegistrationForm,
    ) -> Result<(), BackendError> {
        validate_registration(&form)?;
        let api = Arc::clone(&self.api);
        self.spawn_request(async move {
            let result = api.register(&form).await;
            Completion::Registered {
                username: form.username,
                result,
            }
        });
        Ok(())
    }

    fn handle_search_users(&mut self, query: String) {
        let Some(trimmed) = normalize_search_query(&query, self.settings.search_min_length)
            .map(str::to_owned)
        else {
            self.latest_search = None;
            self.channels.emit(BackendEvent::UserSearchResults {
                query,
                results: Vec::new(),
            });
            return;
        };

        self.latest_search = Some(query.clone());
        let api = Arc::clone(&self.api);
        self.spawn_request(async move {
            Completion::SearchResults {
                result: api.search_users(&trimmed).await,
                query,
            }
        });
    }

    fn open_conversation(&mut self, conversation_id: Option<i64>) {
        if conversation_id.is_some() && self.window.conversation_id() == conversation_id {
            return;
        }

        self.window.switch_to(conversation_id);
        self.viewport.reset();
        self.reader.reset(conversation_id);
        self.composer.on_conversation_switch();
        self.edit.cancel();
        self.refresh_in_flight = false;

        debug!(?conversation_id, "active conversation changed");
        self.channels
            .emit(BackendEvent::ActiveConversationChanged { conversation_id });
        self.emit_composer();

        if conversation_id.is_some() {
            self.start_initial_load();
        }
    }

    fn start_initial_load(&mut self) {
        let Some(request) = self.window.begin_initial_load() else {
            return;
        };
        self.emit_timeline();
        self.spawn_page(request, |conversation_id, result| Completion::InitialPage {
            conversation_id,
            result,
        });
    }

    fn load_older_messages(&mut self) -> bool {
        let Some(request) = self.window.begin_load_more() else {
            return false;
        };
        self.emit_timeline();
        self.spawn_page(request, |conversation_id, result| Completion::OlderPage {
            conversation_id,
            result,
        });
        true
    }

    fn add_pending_files(&mut self, files: Vec<OutgoingFile>) {
        let dropped = self.composer.pending_mut().add(files);
        if dropped > 0 {
            warn!(
                dropped,
                max = self.composer.pending().max(),
                "pending attachment limit reached"
            );
        }
        self.emit_composer();
    }

    fn handle_send_message(&mut self, client_txn_id: String) {
        let outcome = self
            .state_machine
            .apply(&BackendCommand::SendMessage {
                client_txn_id: client_txn_id.clone(),
            })
            .and_then(|_| self.require_active_conversation())
            .and_then(|conversation_id| self.composer.begin_send(conversation_id));

        let outgoing = match outcome {
            Ok(outgoing) => outgoing,
            Err(error) => {
                debug!(%client_txn_id, code = %error.code, "send rejected locally");
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Failure { error },
                ));
                return;
            }
        };

        self.emit_composer();
        let conversation_id = outgoing.conversation_id;
        let api = Arc::clone(&self.api);
        self.spawn_request(async move {
            Completion::Sent {
                client_txn_id,
                conversation_id,
                result: api.send_message(outgoing).await,
            }
        });
    }

    fn handle_start_edit(&mut self, message_id: i64) -> Result<(), BackendError> {
        let message = self.window.get(message_id).ok_or_else(|| {
            BackendError::validation(
                "unknown_message",
                format!("message {message_id} is not loaded"),
            )
        })?;
        let content = message.content.clone().unwrap_or_default();
        self.edit.start(message_id, &content);
        self.emit_composer();
        Ok(())
    }

    fn handle_save_edit(&mut self) -> Result<(), BackendError> {
        let conversation_id = self.require_active_conversation()?;
        let (message_id, content) = self.edit.consume()?;
        let api = Arc::clone(&self.api);
        self.spawn_request(async move {
            let result = api.edit_message(message_id, &content).await;
            Completion::Edited {
                conversation_id,
                message_id,
                content,
                result,
            }
        });
        Ok(())
    }

    fn handle_delete_message(
        &mut self,
        message_id: i64,
        scope: DeleteScope,
    ) -> Result<(), BackendError> {
        let conversation_id = self.require_active_conversation()?;
        let api = Arc::clone(&self.api);
        self.spawn_request(async move {
            Completion::MessageDeleted {
                conversation_id,
                message_id,
                result: api.delete_message(message_id, scope).await,
            }
        });
        Ok(())
    }

    fn handle_delete_attachment(
        &mut self,
        message_id: i64,
        attachment_id: i64,
        scope: DeleteScope,
    ) -> Result<(), BackendError> {
        let conversation_id = self.require_active_conversation()?;
        let api = Arc::clone(&self.api);
        self.spawn_request(async move {
            Completion::AttachmentDeleted {
                conversation_id,
                message_id,
                attachment_id,
                result: api.delete_attachment(attachment_id, scope).await,
            }
        });
        Ok(())
    }

    fn handle_download_attachment(&mut self, attachment_id: i64) {
        let filename_hint = self
            .window
            .find_attachment(attachment_id)
            .map(|attachment| attachment.filename.clone())
            .filter(|name| !name.is_empty());
        let api = Arc::clone(&self.api);
        self.spawn_request(async move {
            Completion::Downloaded {
                attachment_id,
                filename_hint,
                result: api.download_attachment(attachment_id).await,
            }
        });
    }

    fn handle_viewport_scrolled(&mut self, metrics: ScrollMetrics) {
        let gate = LoadGate {
            initial_loading: self.window.initial_loading(),
            loading_more: self.window.loading_more(),
            has_more: self.window.has_more(),
        };
        let outcome = self.viewport.on_scroll(metrics, gate);
        self.emit_scroll_button(outcome.show_button);

        if outcome.load_more && !self.load_older_messages() {
            self.viewport.clear_anchor();
        }
        if outcome.read_check {
            self.begin_read(self.window.last_message_id());
        }
    }

    fn handle_viewport_rendered(&mut self, metrics: ScrollMetrics) {
        let first_message_id = self.window.messages().first().map(|message| message.id);
        let outcome = self.viewport.on_content_changed(first_message_id, metrics);
        if let Some(offset) = outcome.restore_scroll_top {
            self.channels
                .emit(BackendEvent::Viewport(ScrollDirective::SetScrollTop { offset }));
        }
        if outcome.scroll_to_bottom {
            self.channels
                .emit(BackendEvent::Viewport(self.viewport.scroll_to_bottom(false)));
        }
        if outcome.reached_bottom {
            self.begin_read(self.window.last_message_id());
        }
    }

    fn begin_read(&mut self, up_to_message_id: Option<i64>) {
        let now_ms = self.now_ms();
        let Some(report) = self.reader.begin(up_to_message_id, now_ms) else {
            return;
        };
        let api = Arc::clone(&self.api);
        self.spawn_request(async move {
            Completion::ReadReported {
                result: api
                    .mark_read(report.conversation_id, report.up_to_message_id)
                    .await,
                report,
            }
        });
    }

    fn handle_refresh_tick(&mut self) {
        if !self.state_machine.is_authenticated() || self.refresh_in_flight {
            return;
        }
        let Some(request) = self.window.refresh_request() else {
            return;
        };
        self.refresh_in_flight = true;
        self.spawn_page(request, |conversation_id, result| Completion::RefreshPage {
            conversation_id,
            result,
        });
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Completion {
                session,
                completion,
            } => {
                if session != self.session {
                    trace!(session, current = self.session, "dropping stale completion");
                    return;
                }
                self.handle_completion(completion);
            }
            Internal::Push(frame) => self.handle_push_frame(frame),
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Authenticated { flow, result } => self.on_authenticated(flow, result),
            Completion::Registered { username, result } => match result {
                Ok(()) => {
                    info!(%username, "account registered");
                    self.channels.emit(BackendEvent::Registered { username });
                }
                Err(err) => self.fail("register", err),
            },
            Completion::ProfileUpdated(result) => match result {
                Ok(profile) => {
                    self.user = Some(profile.clone());
                    self.channels.emit(BackendEvent::ProfileLoaded(profile));
                }
                Err(err) => self.fail("update_profile", err),
            },
            Completion::PasswordChanged(result) => match result {
                Ok(()) => self.channels.emit(BackendEvent::PasswordChanged),
                Err(err) => self.fail("change_password", err),
            },
            Completion::PushOpened(result) => {
                let connected = match result {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(error = %err, "push channel unavailable");
                        false
                    }
                };
                self.channels.emit(BackendEvent::PushStatus { connected });
            }
            Completion::Conversations {
                user_initiated,
                result,
            } => match result {
                Ok(records) => {
                    self.directory.replace(records);
                    self.emit_conversations();
                }
                Err(err) if user_initiated || err.is_auth() => {
                    self.fail("refresh_conversations", err)
                }
                Err(err) => warn!(error = %err, "background conversation refresh failed"),
            },
            Completion::ConversationStarted { peer_id, result } => match result {
                Ok(conversation_id) => {
                    self.channels.emit(BackendEvent::ConversationStarted {
                        peer_id,
                        conversation_id,
                    });
                    self.spawn_directory_refresh(false);
                }
                Err(err) => self.fail("start_conversation", err),
            },
            Completion::ConversationAction {
                operation,
                conversation_id,
                result,
            } => self.on_conversation_action(operation, conversation_id, result),
            Completion::SearchResults { query, result } => {
                if self.latest_search.as_deref() != Some(query.as_str()) {
                    trace!(%query, "dropping superseded search results");
                    return;
                }
                match result {
                    Ok(results) => self
                        .channels
                        .emit(BackendEvent::UserSearchResults { query, results }),
                    Err(err) => self.fail("search_users", err),
                }
            }
            Completion::InitialPage {
                conversation_id,
                result,
            } => {
                let (page, error) = split_result(result);
                if self.window.finish_initial_load(conversation_id, page) {
                    self.emit_timeline();
                    if let Some(err) = error {
                        self.fail("load_messages", err);
                    }
                }
            }
            Completion::OlderPage {
                conversation_id,
                result,
            } => {
                let (page, error) = split_result(result);
                let oldest_before = self.window.messages().first().map(|message| message.id);
                if self.window.finish_load_more(conversation_id, page) {
                    let oldest_after = self.window.messages().first().map(|message| message.id);
                    if oldest_after == oldest_before {
                        self.viewport.clear_anchor();
                    }
                    if let Some(err) = error {
                        self.fail("load_older_messages", err);
                    }
                    self.emit_timeline();
                }
            }
            Completion::RefreshPage {
                conversation_id,
                result,
            } => self.on_refresh_page(conversation_id, result),
            Completion::ReadReported { report, result } => {
                let success = match result {
                    Ok(()) => true,
                    Err(err) => {
                        if err.is_auth() {
                            self.fail("mark_read", err);
                        } else {
                            debug!(error = %err, "read report failed");
                        }
                        false
                    }
                };
                if self.reader.complete(report, success)
                    && success
                    && self.directory.set_unread_zero(report.conversation_id)
                {
                    self.emit_conversations();
                }
            }
            Completion::Sent {
                client_txn_id,
                conversation_id,
                result,
            } => self.on_sent(client_txn_id, conversation_id, result),
            Completion::Edited {
                conversation_id,
                message_id,
                content,
                result,
            } => {
                let success = result.is_ok();
                self.edit.finish(message_id, success);
                match result {
                    Ok(()) => {
                        let edited_at = chrono::Utc::now().to_rfc3339();
                        if self.window.conversation_id() == Some(conversation_id)
                            && self.window.apply_edit(message_id, &content, &edited_at)
                        {
                            self.emit_timeline();
                        }
                    }
                    Err(err) => self.fail("save_edit", err),
                }
                self.emit_composer();
            }
            Completion::MessageDeleted {
                conversation_id,
                message_id,
                result,
            } => match result {
                Ok(()) => {
                    if self.window.conversation_id() == Some(conversation_id)
                        && self.window.remove(message_id).is_some()
                    {
                        self.emit_timeline();
                    }
                    if self
                        .directory
                        .get(conversation_id)
                        .is_some_and(|c| c.last_message_id == Some(message_id))
                    {
                        self.spawn_directory_refresh(false);
                    }
                }
                Err(err) => self.fail("delete_message", err),
            },
            Completion::AttachmentDeleted {
                conversation_id,
                message_id,
                attachment_id,
                result,
            } => match result {
                Ok(()) => {
                    if self.window.conversation_id() == Some(conversation_id)
                        && self.window.remove_attachment(message_id, attachment_id)
                    {
                        self.emit_timeline();
                    }
                }
                Err(err) => self.fail("delete_attachment", err),
            },
            Completion::Downloaded {
                attachment_id,
                filename_hint,
                result,
            } => match result {
                Ok(body) => {
                    let filename = filename_hint
                        .or(body.filename)
                        .unwrap_or_else(|| format!("file-{attachment_id}"));
                    self.channels
                        .emit(BackendEvent::AttachmentDownloaded(DownloadedAttachment {
                            attachment_id,
                            filename,
                            content_type: body.content_type,
                            data: body.data,
                        }));
                }
                Err(err) => self.fail("download_attachment", err),
            },
        }
    }

    fn on_authenticated(
        &mut self,
        flow: AuthFlow,
        result: Result<(Option<StoredCredential>, UserProfile), BackendError>,
    ) {
        let (credential, profile) = match result {
            Ok(value) => value,
            Err(err) => {
                self.api.set_access_token(None);
                if flow == AuthFlow::Restore
                    && err.is_auth()
                    && let Err(clear_err) = self.credentials.clear()
                {
                    warn!(error = %clear_err, "failed to forget rejected credential");
                }
                self.finish_auth(Err(err));
                return;
            }
        };

        if let Some(credential) = credential
            && let Err(err) = self.credentials.save(&credential)
        {
            warn!(error = %err, "failed to persist access token");
            self.channels.emit(normalize_operation_failure(
                "store_credential",
                map_secret_store_error("store_credential", err),
            ));
        }

        info!(user_id = profile.id, username = %profile.username, ?flow, "authenticated");
        let user_id = profile.id;
        self.user = Some(profile.clone());
        self.finish_auth(Ok(()));
        self.channels.emit(BackendEvent::ProfileLoaded(profile));

        let push = self.push.clone();
        self.spawn_request(async move { Completion::PushOpened(push.open(user_id).await) });
        self.spawn_directory_refresh(false);
    }

    fn on_conversation_action(
        &mut self,
        operation: &'static str,
        conversation_id: i64,
        result: Result<(), BackendError>,
    ) {
        if let Err(err) = result {
            self.fail(operation, err);
            return;
        }
        if self.window.conversation_id() == Some(conversation_id) {
            if operation == "hide_conversation" {
                self.open_conversation(None);
            } else {
                self.start_initial_load();
            }
        }
        self.spawn_directory_refresh(false);
    }

    fn on_refresh_page(&mut self, conversation_id: i64, result: Result<MessagePage, BackendError>) {
        if self.window.conversation_id() != Some(conversation_id) {
            return;
        }
        self.refresh_in_flight = false;
        match result {
            Ok(page) => {
                if self.window.reconcile(conversation_id, &page.items) {
                    trace!(conversation_id, "refresh reconciled changes");
                    self.emit_timeline();
                }
            }
            Err(err) if err.is_auth() => self.fail("refresh_messages", err),
            Err(err) => debug!(error = %err, "background message refresh failed"),
        }
    }

    fn on_sent(
        &mut self,
        client_txn_id: String,
        conversation_id: i64,
        result: Result<Message, BackendError>,
    ) {
        if !self.composer.finish_send(conversation_id, result.is_ok()) {
            trace!(conversation_id, "send completed after conversation switch");
        }
        match result {
            Ok(message) => {
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Success {
                        message_id: message.id,
                    },
                ));
                if self.window.conversation_id() == Some(conversation_id) {
                    if self.window.append(message) {
                        self.emit_timeline();
                    }
                    self.channels
                        .emit(BackendEvent::Viewport(self.viewport.scroll_to_bottom(true)));
                }
            }
            Err(error) => {
                warn!(%client_txn_id, error = %error, "send failed");
                let auth = error.is_auth();
                self.channels.emit(normalize_send_outcome(
                    client_txn_id,
                    SendOutcome::Failure {
                        error: error.clone(),
                    },
                ));
                if auth {
                    self.fail("send_message", error);
                }
            }
        }
        self.emit_composer();
    }

    fn handle_push_frame(&mut self, frame: PushFrame) {
        if !self.state_machine.is_authenticated() {
            return;
        }
        let event = match frame {
            PushFrame::Event(event) => event,
            PushFrame::Json(value) => {
                trace!(%value, "ignoring unrecognized push frame");
                return;
            }
            PushFrame::Raw(raw) => {
                trace!(bytes = raw.len(), "ignoring non-json push frame");
                return;
            }
        };

        let active = self.window.conversation_id();
        let outcome = self.directory.on_push(&event, active);
        if outcome.changed {
            self.emit_conversations();
        }
        if outcome.refresh {
            self.spawn_directory_refresh(false);
        }

        let timeline_changed = match event {
            PushEvent::NewMessage { message } if active == Some(message.conversation_id) => {
                self.window.append(message)
            }
            PushEvent::MessageEdited {
                conversation_id,
                message,
            } if active == Some(conversation_id) => self.window.append(message),
            PushEvent::MessageDeleted {
                conversation_id,
                message_id,
                ..
            } if active == Some(conversation_id) => self.window.remove(message_id).is_some(),
            _ => false,
        };
        if timeline_changed {
            self.emit_timeline();
        }
    }

    fn finish_auth(&mut self, result: Result<(), BackendError>) {
        let success = result.is_ok();
        if let Ok(state_event) = self.state_machine.on_auth_result(success) {
            self.channels.emit(state_event);
        }

        let error_code = result.err().map(|err| {
            warn!(code = %err.code, message = %err.message, "authentication failed");
            err.code
        });
        self.channels
            .emit(BackendEvent::AuthResult { success, error_code });
    }

    /// Report a failed operation. Authentication failures end the session.
    fn fail(&mut self, operation: &str, error: BackendError) {
        if error.is_auth()
            && let Some(state_event) = self.state_machine.on_session_lost()
        {
            warn!(operation, "credential rejected, ending session");
            self.reset_session();
            self.channels.emit(state_event);
        }
        self.channels
            .emit(normalize_operation_failure(operation, error));
    }

    /// Drop everything tied to the current session.
    fn reset_session(&mut self) {
        let push_was_open = self.push.is_open();
        self.push.close();
        if let Err(err) = self.credentials.clear() {
            warn!(error = %err, "failed to forget credential");
        }
        self.api.set_access_token(None);
        self.session = self.session.wrapping_add(1);
        self.user = None;
        self.latest_search = None;
        self.directory.clear();
        self.open_conversation(None);
        self.composer = Composer::new(self.settings.max_pending_files);
        self.edit.cancel();

        if push_was_open {
            self.channels
                .emit(BackendEvent::PushStatus { connected: false });
        }
        self.emit_conversations();
    }

    fn spawn_directory_refresh(&self, user_initiated: bool) {
        let api = Arc::clone(&self.api);
        self.spawn_request(async move {
            Completion::Conversations {
                user_initiated,
                result: api.list_conversations().await,
            }
        });
    }

    fn spawn_page<F>(&self, request: PageRequest, wrap: F)
    where
        F: FnOnce(i64, Result<MessagePage, BackendError>) -> Completion + Send + 'static,
    {
        let api = Arc::clone(&self.api);
        self.spawn_request(async move {
            let result = api.message_page(request).await;
            wrap(request.conversation_id, result)
        });
    }

    fn spawn_request<F>(&self, request: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let internal_tx = self.internal_tx.clone();
        let session = self.session;
        tokio::spawn(async move {
            let completion = request.await;
            let _ = internal_tx.send(Internal::Completion {
                session,
                completion,
            });
        });
    }

    fn validate_transition(
        &self,
        command: &BackendCommand,
    ) -> Result<(BackendStateMachine, Vec<BackendEvent>), BackendError> {
        let mut candidate = self.state_machine.clone();
        let events = candidate.apply(command)?;
        Ok((candidate, events))
    }

    fn commit_transition(&mut self, candidate: BackendStateMachine, events: Vec<BackendEvent>) {
        self.state_machine = candidate;
        for event in events {
            self.channels.emit(event);
        }
    }

    fn require_active_conversation(&self) -> Result<i64, BackendError> {
        self.window.conversation_id().ok_or_else(|| {
            BackendError::validation("no_active_conversation", "Open a conversation first")
        })
    }

    fn emit_timeline(&self) {
        if let Some(snapshot) = self.window.snapshot() {
            self.channels.emit(BackendEvent::TimelineUpdated(snapshot));
        }
    }

    fn emit_composer(&self) {
        self.channels
            .emit(BackendEvent::ComposerUpdated(self.composer.snapshot(&self.edit)));
    }

    fn emit_conversations(&self) {
        self.channels.emit(BackendEvent::ConversationsUpdated {
            conversations: self.directory.conversations().to_vec(),
        });
    }

    fn emit_scroll_button(&self, visible: Option<bool>) {
        if let Some(visible) = visible {
            self.channels
                .emit(BackendEvent::Viewport(ScrollDirective::ShowScrollToBottom { visible }));
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

fn refresh_interval(period: Duration) -> Interval {
    let mut refresh = interval_at(Instant::now() + period, period);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    refresh
}

fn split_result<T>(result: Result<T, BackendError>) -> (Option<T>, Option<BackendError>) {
    match result {
        Ok(value) => (Some(value), None),
        Err(err) => (None, Some(err)),
    }
}

fn operation_name(command: &BackendCommand) -> &'static str {
    use BackendCommand::*;

    match command {
        Init { .. } => "init",
        Login { .. } => "login",
        Register(_) => "register",
        RestoreSession => "restore_session",
        Logout => "logout",
        UpdateProfile(_) => "update_profile",
        ChangePassword(_) => "change_password",
        RefreshConversations => "refresh_conversations",
        StartConversation { .. } => "start_conversation",
        HideConversation { .. } => "hide_conversation",
        ClearConversation { .. } => "clear_conversation",
        SearchUsers { .. } => "search_users",
        OpenConversation { .. } => "open_conversation",
        CloseConversation => "close_conversation",
        LoadOlderMessages => "load_older_messages",
        ReloadMessages => "reload_messages",
        SetComposerText { .. } => "set_composer_text",
        AddPendingFiles { .. } => "add_pending_files",
        RemovePendingFile { .. } => "remove_pending_file",
        ClearPendingFiles => "clear_pending_files",
        SendMessage { .. } => "send_message",
        StartEdit { .. } => "start_edit",
        SetEditText { .. } => "set_edit_text",
        CancelEdit => "cancel_edit",
        SaveEdit => "save_edit",
        DeleteMessage { .. } => "delete_message",
        DeleteAttachment { .. } => "delete_attachment",
        DownloadAttachment { .. } => "download_attachment",
        MarkRead { .. } => "mark_read",
        ViewportScrolled { .. } => "viewport_scrolled",
        ViewportRendered { .. } => "viewport_rendered",
        ScrollToBottom { .. } => "scroll_to_bottom",
        ScrollSettled { .. } => "scroll_settled",
        PublishPush { .. } => "publish_push",
    }
}

fn map_secret_store_error(operation: &str, err: SecretStoreError) -> BackendError {
    match err {
        SecretStoreError::NotFound => BackendError::new(
            BackendErrorCategory::Auth,
            "session_not_found",
            format!("no stored credential during {operation}"),
        ),
        SecretStoreError::Unavailable(message) => BackendError::new(
            BackendErrorCategory::Storage,
            "secret_store_unavailable",
            format!("secret store unavailable during {operation}: {message}"),
        ),
        SecretStoreError::Backend(message) => BackendError::new(
            BackendErrorCategory::Storage,
            "secret_store_error",
            format!("secret store backend error during {operation}: {message}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::{env, sync::atomic::Ordering};

    use backend_core::{BackendLifecycleState, SendAck, TimelineSnapshot};
    use backend_platform::InMemorySecretStore;
    use tokio::{sync::broadcast, time::timeout};

    use super::*;
    use crate::{
        api::RestApi,
        testing::{FakeApi, LoopbackConnector},
    };

    struct Harness {
        handle: RuntimeHandle,
        events: broadcast::Receiver<BackendEvent>,
        api: Arc<FakeApi>,
        connector: Arc<LoopbackConnector>,
    }

    impl Harness {
        fn new(api: FakeApi) -> Self {
            let api = Arc::new(api);
            let connector = Arc::new(LoopbackConnector::default());
            let credentials = CredentialVault::new(
                Arc::new(InMemorySecretStore::default()),
                "http://localhost:8000/",
            );
            let handle = spawn_runtime(ChatServices {
                api: api.clone(),
                push: connector.clone(),
                credentials,
            });
            let events = handle.subscribe();
            Self {
                handle,
                events,
                api,
                connector,
            }
        }

        async fn send(&self, command: BackendCommand) {
            self.handle
                .send(command)
                .await
                .expect("command should enqueue");
        }

        async fn wait_for<T>(&mut self, mut pick: impl FnMut(BackendEvent) -> Option<T>) -> T {
            loop {
                let event = timeout(Duration::from_secs(2), self.events.recv())
                    .await
                    .expect("event timeout")
                    .expect("event receive");
                if let Some(value) = pick(event) {
                    return value;
                }
            }
        }

        async fn login(&mut self) {
            self.send(BackendCommand::Init { config: None }).await;
            self.send(BackendCommand::Login {
                login: "olena".into(),
                password: "secret1".into(),
            })
            .await;
            self.wait_for(|event| match event {
                BackendEvent::PushStatus { connected } => Some(connected),
                _ => None,
            })
            .await;
        }

        async fn open(&mut self, conversation_id: i64) -> TimelineSnapshot {
            self.send(BackendCommand::OpenConversation { conversation_id })
                .await;
            self.wait_for(|event| match event {
                BackendEvent::TimelineUpdated(snapshot) if !snapshot.initial_loading => {
                    Some(snapshot)
                }
                _ => None,
            })
            .await
        }

        async fn next_send_ack(&mut self) -> SendAck {
            self.wait_for(|event| match event {
                BackendEvent::SendAck(ack) => Some(ack),
                _ => None,
            })
            .await
        }
    }

    fn ids(snapshot: &TimelineSnapshot) -> Vec<i64> {
        snapshot.messages.iter().map(|m| m.id).collect()
    }

    #[tokio::test]
    async fn runtime_reports_invalid_transition() {
        let mut harness = Harness::new(FakeApi::default());
        harness
            .send(BackendCommand::OpenConversation { conversation_id: 1 })
            .await;

        let (operation, error) = harness
            .wait_for(|event| match event {
                BackendEvent::OperationFailed { operation, error } => Some((operation, error)),
                _ => None,
            })
            .await;
        assert_eq!(operation, "open_conversation");
        assert_eq!(error.code, "invalid_state_transition");
    }

    #[tokio::test]
    async fn login_authenticates_and_loads_directory() {
        let mut harness = Harness::new(FakeApi::with_messages(5, 42, &[1, 2]));
        harness.login().await;

        harness.send(BackendCommand::RefreshConversations).await;
        let conversations = harness
            .wait_for(|event| match event {
                BackendEvent::ConversationsUpdated { conversations }
                    if !conversations.is_empty() =>
                {
                    Some(conversations)
                }
                _ => None,
            })
            .await;
        assert_eq!(conversations[0].id, 5);
        assert_eq!(harness.connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restore_without_credential_ends_logged_out() {
        let mut harness = Harness::new(FakeApi::default());
        harness.send(BackendCommand::Init { config: None }).await;
        harness.send(BackendCommand::RestoreSession).await;

        let (success, error_code) = harness
            .wait_for(|event| match event {
                BackendEvent::AuthResult {
                    success,
                    error_code,
                } => Some((success, error_code)),
                _ => None,
            })
            .await;
        assert!(!success);
        assert_eq!(error_code.as_deref(), Some("session_not_found"));
    }

    #[tokio::test]
    async fn starting_same_peer_twice_yields_one_conversation() {
        let mut harness = Harness::new(FakeApi::default());
        harness.login().await;

        let mut started = Vec::new();
        for _ in 0..2 {
            harness
                .send(BackendCommand::StartConversation { peer_id: 42 })
                .await;
            started.push(
                harness
                    .wait_for(|event| match event {
                        BackendEvent::ConversationStarted {
                            conversation_id, ..
                        } => Some(conversation_id),
                        _ => None,
                    })
                    .await,
            );
        }
        assert_eq!(started[0], started[1]);

        let conversations = harness
            .wait_for(|event| match event {
                BackendEvent::ConversationsUpdated { conversations }
                    if !conversations.is_empty() =>
                {
                    Some(conversations)
                }
                _ => None,
            })
            .await;
        assert_eq!(
            conversations.iter().filter(|c| c.peer.id == 42).count(),
            1
        );
    }

    #[tokio::test]
    async fn start_conversation_rejects_invalid_peer_locally() {
        let mut harness = Harness::new(FakeApi::default());
        harness.login().await;
        harness
            .send(BackendCommand::StartConversation { peer_id: 0 })
            .await;

        let error = harness
            .wait_for(|event| match event {
                BackendEvent::OperationFailed { error, .. } => Some(error),
                _ => None,
            })
            .await;
        assert_eq!(error.code, "invalid_peer_id");
    }

    #[tokio::test]
    async fn blank_send_issues_no_request_and_text_send_clears_composer() {
        let mut harness = Harness::new(FakeApi::with_messages(5, 42, &[1, 2]));
        harness.login().await;
        harness.open(5).await;

        harness
            .send(BackendCommand::SendMessage {
                client_txn_id: "tx-blank".into(),
            })
            .await;
        let ack = harness.next_send_ack().await;
        assert_eq!(ack.client_txn_id, "tx-blank");
        assert_eq!(ack.error_code.as_deref(), Some("empty_message"));
        assert_eq!(harness.api.send_calls.load(Ordering::SeqCst), 0);

        harness
            .send(BackendCommand::SetComposerText { text: "hi".into() })
            .await;
        harness
            .send(BackendCommand::SendMessage {
                client_txn_id: "tx-hi".into(),
            })
            .await;
        let ack = harness.next_send_ack().await;
        assert_eq!(ack.client_txn_id, "tx-hi");
        assert_eq!(ack.message_id, Some(3));

        let snapshot = harness
            .wait_for(|event| match event {
                BackendEvent::TimelineUpdated(snapshot) => Some(snapshot),
                _ => None,
            })
            .await;
        assert_eq!(ids(&snapshot), vec![1, 2, 3]);

        let composer = harness
            .wait_for(|event| match event {
                BackendEvent::ComposerUpdated(composer) if !composer.sending => Some(composer),
                _ => None,
            })
            .await;
        assert_eq!(composer.text, "");
        assert_eq!(harness.api.send_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn message_deleted_push_removes_message_from_open_conversation() {
        let mut harness = Harness::new(FakeApi::with_messages(5, 42, &[1, 2, 3]));
        harness.login().await;
        let snapshot = harness.open(5).await;
        assert_eq!(ids(&snapshot), vec![1, 2, 3]);

        let (server_tx, _server_rx) = harness.connector.take_end();
        server_tx
            .send(r#"{"type":"message_deleted","conversation_id":5,"message_id":2}"#.to_owned())
            .await
            .expect("server send");

        let snapshot = harness
            .wait_for(|event| match event {
                BackendEvent::TimelineUpdated(snapshot) => Some(snapshot),
                _ => None,
            })
            .await;
        assert_eq!(ids(&snapshot), vec![1, 3]);
    }

    #[tokio::test]
    async fn edited_push_for_unloaded_message_is_inserted() {
        let mut harness = Harness::new(FakeApi::with_messages(5, 42, &[1, 2, 3]));
        harness.login().await;
        harness.open(5).await;

        let (server_tx, _server_rx) = harness.connector.take_end();
        server_tx
            .send(
                r#"{"type":"message_edited","conversation_id":5,"message":{"id":4,"content":"fixed"}}"#
                    .to_owned(),
            )
            .await
            .expect("server send");

        let snapshot = harness
            .wait_for(|event| match event {
                BackendEvent::TimelineUpdated(snapshot) => Some(snapshot),
                _ => None,
            })
            .await;
        assert_eq!(ids(&snapshot), vec![1, 2, 3, 4]);
        assert_eq!(
            snapshot.messages.last().and_then(|m| m.content.as_deref()),
            Some("fixed")
        );
    }

    #[tokio::test]
    async fn rejected_credential_ends_session() {
        let mut harness = Harness::new(FakeApi::with_messages(5, 42, &[1]));
        harness.login().await;
        harness.api.reject_pages_with(401);
        harness
            .send(BackendCommand::OpenConversation { conversation_id: 5 })
            .await;

        let state = harness
            .wait_for(|event| match event {
                BackendEvent::StateChanged { state } => Some(state),
                _ => None,
            })
            .await;
        assert_eq!(state, BackendLifecycleState::LoggedOut);

        harness.send(BackendCommand::RestoreSession).await;
        let success = harness
            .wait_for(|event| match event {
                BackendEvent::AuthResult { success, .. } => Some(success),
                _ => None,
            })
            .await;
        assert!(!success);
    }

    #[tokio::test]
    async fn forbidden_page_keeps_session() {
        let mut harness = Harness::new(FakeApi::with_messages(5, 42, &[1]));
        harness.login().await;
        harness.api.reject_pages_with(403);
        harness
            .send(BackendCommand::OpenConversation { conversation_id: 5 })
            .await;

        let error = harness
            .wait_for(|event| match event {
                BackendEvent::StateChanged { .. } => panic!("session must survive a 403"),
                BackendEvent::OperationFailed { error, .. } => Some(error),
                _ => None,
            })
            .await;
        assert_eq!(error.code, "forbidden");
    }

    #[tokio::test]
    async fn rendering_at_bottom_marks_conversation_read() {
        let mut harness = Harness::new(FakeApi::with_messages(5, 42, &[1, 2, 3]));
        harness.login().await;
        harness.open(5).await;

        harness
            .send(BackendCommand::ViewportRendered {
                metrics: ScrollMetrics::new(0.0, 400.0, 600.0),
            })
            .await;
        let directive = harness
            .wait_for(|event| match event {
                BackendEvent::Viewport(directive) => Some(directive),
                _ => None,
            })
            .await;
        assert_eq!(directive, ScrollDirective::ScrollToBottom { smooth: false });

        for _ in 0..50 {
            if !harness.api.read_reports().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(harness.api.read_reports(), vec![(5, Some(3))]);
    }

    #[tokio::test]
    async fn short_search_returns_empty_without_request() {
        let mut harness = Harness::new(FakeApi::default());
        harness.login().await;
        harness
            .send(BackendCommand::SearchUsers { query: " o ".into() })
            .await;
        let results = harness
            .wait_for(|event| match event {
                BackendEvent::UserSearchResults { results, .. } => Some(results),
                _ => None,
            })
            .await;
        assert!(results.is_empty());

        harness
            .send(BackendCommand::SearchUsers { query: "ole".into() })
            .await;
        let (query, results) = harness
            .wait_for(|event| match event {
                BackendEvent::UserSearchResults { query, results } => Some((query, results)),
                _ => None,
            })
            .await;
        assert_eq!(query, "ole");
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn settings_fall_back_to_defaults() {
        let settings = RuntimeSettings::from_init(Some(&BackendInitConfig {
            page_size: Some(50),
            ..BackendInitConfig::default()
        }));
        assert_eq!(settings.page_size, 50);
        assert_eq!(settings.refresh_page_size, DEFAULT_REFRESH_PAGE_SIZE);
        assert_eq!(settings.refresh_interval, Duration::from_millis(6_000));
        assert_eq!(settings.max_pending_files, 10);
    }

    #[tokio::test]
    #[ignore = "runs against live chat backend, requires env vars"]
    async fn live_login_and_list_conversations() {
        let api_base = env::var("DUOCHAT_API_BASE").expect("DUOCHAT_API_BASE must be set");
        let login = env::var("DUOCHAT_LOGIN").expect("DUOCHAT_LOGIN must be set");
        let password = env::var("DUOCHAT_PASSWORD").expect("DUOCHAT_PASSWORD must be set");

        let api = RestApi::new(&api_base).expect("api client");
        let token = api.login(&login, &password).await.expect("login");
        api.set_access_token(Some(token.access_token));
        let profile = api.current_user().await.expect("current user");
        assert!(profile.id > 0);
        api.list_conversations().await.expect("conversations");
    }
}
