use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{BackendCommand, BackendEvent};

/// Broadcast event stream type used by frontend subscribers.
pub type EventStream = broadcast::Receiver<BackendEvent>;

/// Errors returned by backend channel operations.
#[derive(Debug, Error)]
pub enum BackendChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command/event channel pair used by the runtime and frontends.
#[derive(Clone, Debug)]
pub struct BackendChannels {
    command_tx: mpsc::Sender<BackendCommand>,
    event_tx: broadcast::Sender<BackendEvent>,
}

impl BackendChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<BackendCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Clone the command sender.
    pub fn command_sender(&self) -> mpsc::Sender<BackendCommand> {
        self.command_tx.clone()
    }

    /// Subscribe to emitted backend events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Send one command to the runtime.
    pub async fn send_command(&self, command: BackendCommand) -> Result<(), BackendChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| BackendChannelError::CommandChannelClosed)
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: BackendEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Callback registered with a [`ListenerRegistry`].
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

/// Handle returned by [`ListenerRegistry::add`]; owns nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerToken(u64);

/// Ordered set of callbacks with explicit add/remove.
///
/// Dispatch works on a snapshot, so a listener may add or remove
/// registrations (including its own) while being called.
pub struct ListenerRegistry<T> {
    next_token: u64,
    listeners: BTreeMap<ListenerToken, Listener<T>>,
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self {
            next_token: 0,
            listeners: BTreeMap::new(),
        }
    }
}

impl<T> std::fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<T> ListenerRegistry<T> {
    pub fn add(&mut self, listener: Listener<T>) -> ListenerToken {
        let token = ListenerToken(self.next_token);
        self.next_token = self.next_token.wrapping_add(1);
        self.listeners.insert(token, listener);
        token
    }

    /// Returns `false` when the token was not registered.
    pub fn remove(&mut self, token: ListenerToken) -> bool {
        self.listeners.remove(&token).is_some()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Current listeners in registration order.
    pub fn snapshot(&self) -> Vec<Listener<T>> {
        self.listeners.values().cloned().collect()
    }

    /// Call every registered listener with `item`.
    pub fn dispatch(&self, item: &T) {
        for listener in self.snapshot() {
            listener(item);
        }
    }
}
