mod auth_profile;
mod commands;
mod config;
mod logging;
mod output;

use std::{
    io,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex, PoisonError},
};

use auth_profile::{AuthProfile, clear_auth_profile, load_auth_profile, save_auth_profile};
use backend_core::{
    BackendCommand, BackendError, BackendEvent, BackendLifecycleState, DownloadedAttachment,
    OutgoingFile, ScrollDirective, ScrollMetrics,
};
use backend_platform::{
    CredentialVault, FileSecretStore, InMemorySecretStore, SecretStore, write_atomically,
};
use backend_rest::{ChatServices, RestApi, RuntimeHandle, WsPushConnector, spawn_runtime};
use commands::{CliAction, HELP, parse_line};
use config::{CliConfig, CredentialStoreKind};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DOWNLOADS_DIR: &str = "downloads";

#[derive(Debug, Error)]
enum StartupError {
    #[error("invalid API base: {0}")]
    ApiBase(BackendError),
    #[error("invalid push base: {0}")]
    PushBase(BackendError),
    #[cfg(not(feature = "os-keyring"))]
    #[error("keyring credential store requires the os-keyring feature")]
    KeyringDisabled,
    #[error("failed reading stdin: {0}")]
    Stdin(#[from] io::Error),
}

/// State shared between the prompt loop and the event printer.
#[derive(Debug, Default)]
struct CliSession {
    self_id: Option<i64>,
    /// Login name of an in-flight login, remembered once it succeeds.
    pending_login: Option<String>,
}

type SharedSession = Arc<Mutex<CliSession>>;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting duochat-cli");

    let config = match CliConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            eprintln!("duochat-cli: {err}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "duochat-cli stopped");
            eprintln!("duochat-cli: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: CliConfig) -> Result<(), StartupError> {
    info!(
        api_base = %config.api_base,
        push_base = %config.push_base,
        store = ?config.credential_store,
        "cli config loaded"
    );

    let api = RestApi::new(&config.api_base).map_err(StartupError::ApiBase)?;
    let push = WsPushConnector::new(&config.push_base).map_err(StartupError::PushBase)?;
    let credentials = CredentialVault::new(credential_store(&config)?, &config.api_base);
    let handle = spawn_runtime(ChatServices {
        api: Arc::new(api),
        push: Arc::new(push),
        credentials,
    });

    let session: SharedSession = Arc::default();
    let printer = tokio::spawn(print_events(
        handle.subscribe(),
        handle.clone(),
        Arc::clone(&session),
        config.clone(),
    ));

    let startup = startup_commands(&config, &session);
    for command in startup {
        if handle.send(command).await.is_err() {
            warn!("runtime stopped before startup completed");
            return Ok(());
        }
    }
    println!("type /help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let action = match parse_line(&line) {
            Ok(action) => action,
            Err(err) => {
                eprintln!("! {err}");
                continue;
            }
        };
        match action {
            CliAction::Quit => break,
            CliAction::Empty => {}
            CliAction::Help => println!("{HELP}"),
            other => {
                let commands = commands_for(other, &session);
                if !forward(&handle, commands).await {
                    break;
                }
            }
        }
    }

    printer.abort();
    info!("duochat-cli exiting");
    Ok(())
}

fn credential_store(config: &CliConfig) -> Result<Arc<dyn SecretStore>, StartupError> {
    match config.credential_store {
        CredentialStoreKind::File => Ok(Arc::new(FileSecretStore::new(config.credentials_path()))),
        CredentialStoreKind::Memory => Ok(Arc::new(InMemorySecretStore::default())),
        #[cfg(feature = "os-keyring")]
        CredentialStoreKind::Keyring => Ok(Arc::new(backend_platform::OsKeyringSecretStore)),
        #[cfg(not(feature = "os-keyring"))]
        CredentialStoreKind::Keyring => Err(StartupError::KeyringDisabled),
    }
}

/// `Init` followed by a session restore for a remembered login, or a login
/// from the configured credentials.
fn startup_commands(config: &CliConfig, session: &SharedSession) -> Vec<BackendCommand> {
    let mut commands = vec![BackendCommand::Init {
        config: config.init_config.clone(),
    }];

    let profile = match load_auth_profile(&config.auth_profile_path()) {
        Ok(profile) => profile,
        Err(err) => {
            warn!(error = %err, "failed loading auth profile; ignoring it");
            None
        }
    };

    if profile
        .as_ref()
        .is_some_and(|profile| profile.restores_for(&config.api_base))
    {
        debug!("restoring remembered session");
        commands.push(BackendCommand::RestoreSession);
    } else if let (Some(login), Some(password)) = (&config.login, &config.password) {
        lock(session).pending_login = Some(login.clone());
        commands.push(BackendCommand::Login {
            login: login.clone(),
            password: password.clone(),
        });
    }
    commands
}

fn commands_for(action: CliAction, session: &SharedSession) -> Vec<BackendCommand> {
    match action {
        CliAction::Backend(commands) => commands,
        CliAction::Send { text } => vec![
            BackendCommand::SetComposerText { text },
            BackendCommand::SendMessage {
                client_txn_id: Uuid::new_v4().to_string(),
            },
        ],
        CliAction::Login { login, password } => {
            lock(session).pending_login = Some(login.clone());
            vec![BackendCommand::Login { login, password }]
        }
        CliAction::Attach { path } => match read_outgoing_file(&path) {
            Ok(file) => vec![BackendCommand::AddPendingFiles { files: vec![file] }],
            Err(err) => {
                eprintln!("! {err}");
                Vec::new()
            }
        },
        CliAction::Help | CliAction::Quit | CliAction::Empty => Vec::new(),
    }
}

async fn forward(handle: &RuntimeHandle, commands: Vec<BackendCommand>) -> bool {
    for command in commands {
        if let Err(err) = handle.send(command).await {
            error!(error = %err, "runtime command channel closed");
            return false;
        }
    }
    true
}

async fn print_events(
    mut events: broadcast::Receiver<BackendEvent>,
    handle: RuntimeHandle,
    session: SharedSession,
    config: CliConfig,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let follow_up = observe_event(&event, &session, &config);
        let self_id = lock(&session).self_id;
        for line in output::render_event(&event, self_id) {
            println!("{line}");
        }
        if !forward(&handle, follow_up).await {
            break;
        }
    }
    debug!("event printer exiting");
}

/// Side effects of an event on the CLI: profile bookkeeping, downloads, and
/// viewport reports for the terminal's always-at-bottom "scroll" position.
fn observe_event(
    event: &BackendEvent,
    session: &SharedSession,
    config: &CliConfig,
) -> Vec<BackendCommand> {
    match event {
        BackendEvent::AuthResult { success: true, .. } => {
            let login = lock(session).pending_login.take();
            if let Some(login) = login {
                let profile = AuthProfile {
                    api_base: config.api_base.clone(),
                    login,
                    restore_on_start: true,
                };
                if let Err(err) = save_auth_profile(&config.auth_profile_path(), &profile) {
                    warn!(error = %err, "failed persisting auth profile after login");
                }
            }
            Vec::new()
        }
        BackendEvent::AuthResult { success: false, .. } => {
            lock(session).pending_login = None;
            Vec::new()
        }
        BackendEvent::StateChanged {
            state: BackendLifecycleState::LoggedOut,
        } => {
            *lock(session) = CliSession::default();
            if let Err(err) = clear_auth_profile(&config.auth_profile_path()) {
                warn!(error = %err, "failed clearing auth profile on logout");
            }
            Vec::new()
        }
        BackendEvent::ProfileLoaded(profile) => {
            lock(session).self_id = Some(profile.id);
            Vec::new()
        }
        BackendEvent::TimelineUpdated(snapshot)
            if !snapshot.initial_loading && !snapshot.loading_more =>
        {
            vec![BackendCommand::ViewportRendered {
                metrics: terminal_metrics(),
            }]
        }
        BackendEvent::Viewport(ScrollDirective::ScrollToBottom { .. }) => {
            vec![BackendCommand::ScrollSettled {
                metrics: terminal_metrics(),
            }]
        }
        BackendEvent::AttachmentDownloaded(download) => {
            match save_download(&config.data_dir, download) {
                Ok(path) => println!("* saved {}", path.display()),
                Err(err) => eprintln!("! {err}"),
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

/// A terminal always shows the newest lines, so it reports itself at bottom.
fn terminal_metrics() -> ScrollMetrics {
    ScrollMetrics::new(0.0, 0.0, 0.0)
}

fn read_outgoing_file(path: &Path) -> Result<OutgoingFile, String> {
    let data = std::fs::read(path)
        .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| format!("{} has no usable file name", path.display()))?;
    Ok(OutgoingFile {
        filename,
        content_type: None,
        data,
    })
}

fn save_download(data_dir: &Path, download: &DownloadedAttachment) -> Result<PathBuf, String> {
    let path = download_path(data_dir, download.attachment_id, &download.filename);
    write_atomically(&path, &download.data)?;
    Ok(path)
}

fn download_path(data_dir: &Path, attachment_id: i64, filename: &str) -> PathBuf {
    let name: String = filename
        .chars()
        .map(|ch| if matches!(ch, '/' | '\\' | ':') { '_' } else { ch })
        .collect();
    let name = name.trim_start_matches('.');
    let name = if name.is_empty() {
        format!("file-{attachment_id}")
    } else {
        name.to_owned()
    };
    data_dir.join(DOWNLOADS_DIR).join(name)
}

fn lock(session: &SharedSession) -> std::sync::MutexGuard<'_, CliSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}
