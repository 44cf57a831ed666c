//! Live push channel: one websocket per authenticated session.
//!
//! The transport ([`PushConnector`]) only moves text frames. [`PushChannel`]
//! decodes them and fans them out to registered listeners.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use backend_core::{
    BackendError, BackendErrorCategory, Listener, ListenerRegistry, ListenerToken, PushFrame,
    decode_push_frame,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

const INBOUND_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 64;

/// Raw text pipes of one live connection.
///
/// `inbound` ends when the remote side closes. Cancelling `shutdown` tears
/// the connection down.
pub struct PushTransport {
    pub inbound: mpsc::Receiver<String>,
    pub outbound: mpsc::Sender<String>,
    pub shutdown: CancellationToken,
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, user_id: i64) -> Result<PushTransport, BackendError>;
}

/// Websocket connector for `{push_base}/ws/{user_id}`.
#[derive(Debug, Clone)]
pub struct WsPushConnector {
    push_base: Url,
}

impl WsPushConnector {
    pub fn new(push_base: &str) -> Result<Self, BackendError> {
        Ok(Self {
            push_base: parse_push_base(push_base)?,
        })
    }

    pub fn endpoint(&self, user_id: i64) -> Result<Url, BackendError> {
        self.push_base
            .join(&format!("ws/{user_id}"))
            .map_err(|err| {
                BackendError::new(
                    BackendErrorCategory::Internal,
                    "invalid_endpoint",
                    err.to_string(),
                )
            })
    }
}

#[async_trait]
impl PushConnector for WsPushConnector {
    async fn connect(&self, user_id: i64) -> Result<PushTransport, BackendError> {
        let endpoint = self.endpoint(user_id)?;
        let (socket, _) = connect_async(endpoint.as_str()).await.map_err(|err| {
            BackendError::new(
                BackendErrorCategory::Network,
                "push_connect_failed",
                err.to_string(),
            )
        })?;
        debug!(%endpoint, "push channel connected");

        let (mut write_half, mut read_half) = socket.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let shutdown = CancellationToken::new();

        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    message = read_half.next() => message,
                };
                let payload = match message {
                    Some(Ok(WsMessage::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        String::from_utf8_lossy(&bytes).into_owned()
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(error = %err, "push channel read failed");
                        break;
                    }
                };
                if inbound_tx.send(payload).await.is_err() {
                    break;
                }
            }
            reader_shutdown.cancel();
        });

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        let _ = write_half.close().await;
                        break;
                    }
                    payload = outbound_rx.recv() => {
                        let Some(payload) = payload else { break };
                        if write_half.send(WsMessage::Text(payload.into())).await.is_err() {
                            writer_shutdown.cancel();
                            break;
                        }
                    }
                }
            }
        });

        Ok(PushTransport {
            inbound: inbound_rx,
            outbound: outbound_tx,
            shutdown,
        })
    }
}

struct ActiveConnection {
    generation: u64,
    user_id: i64,
    outbound: mpsc::Sender<String>,
    shutdown: CancellationToken,
    pump: JoinHandle<()>,
}

struct PushChannelInner {
    connector: Arc<dyn PushConnector>,
    listeners: Mutex<ListenerRegistry<PushFrame>>,
    connection: Mutex<Option<ActiveConnection>>,
    next_generation: AtomicU64,
}

/// Shared handle to the session's push connection and its listeners.
#[derive(Clone)]
pub struct PushChannel {
    inner: Arc<PushChannelInner>,
}

impl PushChannel {
    pub fn new(connector: Arc<dyn PushConnector>) -> Self {
        Self {
            inner: Arc::new(PushChannelInner {
                connector,
                listeners: Mutex::new(ListenerRegistry::default()),
                connection: Mutex::new(None),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn add_listener(&self, listener: Listener<PushFrame>) -> Option<ListenerToken> {
        self.inner
            .listeners
            .lock()
            .ok()
            .map(|mut registry| registry.add(listener))
    }

    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        self.inner
            .listeners
            .lock()
            .map(|mut registry| registry.remove(token))
            .unwrap_or(false)
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .connection
            .lock()
            .map(|connection| {
                connection
                    .as_ref()
                    .is_some_and(|active| !active.shutdown.is_cancelled())
            })
            .unwrap_or(false)
    }

    /// Open the connection for `user_id`. A live connection for the same user
    /// is kept; one for another user is replaced.
    pub async fn open(&self, user_id: i64) -> Result<(), BackendError> {
        {
            let connection = self.lock_connection()?;
            if let Some(active) = connection.as_ref()
                && active.user_id == user_id
                && !active.shutdown.is_cancelled()
            {
                return Ok(());
            }
        }
        self.close();

        let transport = self.inner.connector.connect(user_id).await?;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let pump = tokio::spawn(pump_frames(
            Arc::clone(&self.inner),
            generation,
            transport.inbound,
        ));

        let previous = self.lock_connection()?.replace(ActiveConnection {
            generation,
            user_id,
            outbound: transport.outbound,
            shutdown: transport.shutdown,
            pump,
        });
        if let Some(previous) = previous {
            shutdown_connection(previous);
        }
        Ok(())
    }

    pub fn close(&self) {
        let taken = self
            .inner
            .connection
            .lock()
            .ok()
            .and_then(|mut connection| connection.take());
        if let Some(active) = taken {
            debug!(user_id = active.user_id, "closing push channel");
            shutdown_connection(active);
        }
    }

    /// Fire-and-forget publish. Dropped silently while not open.
    pub fn send(&self, payload: &Value) {
        let Ok(connection) = self.inner.connection.lock() else {
            return;
        };
        match connection.as_ref() {
            Some(active) if !active.shutdown.is_cancelled() => {
                if active.outbound.try_send(payload.to_string()).is_err() {
                    trace!("push send dropped: outbound queue unavailable");
                }
            }
            _ => trace!("push send dropped: channel not open"),
        }
    }

    fn lock_connection(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Option<ActiveConnection>>, BackendError> {
        self.inner.connection.lock().map_err(|_| {
            BackendError::new(
                BackendErrorCategory::Internal,
                "poisoned_lock",
                "push connection lock poisoned",
            )
        })
    }
}

fn shutdown_connection(active: ActiveConnection) {
    active.shutdown.cancel();
    active.pump.abort();
}

async fn pump_frames(
    inner: Arc<PushChannelInner>,
    generation: u64,
    mut inbound: mpsc::Receiver<String>,
) {
    while let Some(payload) = inbound.recv().await {
        trace!(bytes = payload.len(), "push frame received");
        let frame = decode_push_frame(&payload);
        let listeners = match inner.listeners.lock() {
            Ok(registry) => registry.snapshot(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(&frame);
        }
    }

    if let Ok(mut connection) = inner.connection.lock()
        && connection
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    {
        warn!("push channel closed by remote");
        if let Some(active) = connection.take() {
            active.shutdown.cancel();
        }
    }
}

/// Normalize the push base so `ws/{user_id}` joins below its path.
pub fn parse_push_base(raw: &str) -> Result<Url, BackendError> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&with_slash).map_err(|err| {
        BackendError::validation(
            "invalid_push_base",
            format!("invalid push base '{raw}': {err}"),
        )
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(BackendError::validation(
            "invalid_push_base",
            format!("push base must use ws or wss, got '{other}'"),
        )),
    }
}

/// Push base for an API base: `http` becomes `ws`, `https` becomes `wss`.
pub fn push_base_for_api(api_base: &str) -> String {
    let trimmed = api_base.trim();
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_owned()
    }
}
