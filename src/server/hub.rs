//! Connected-client bookkeeping
//!
//! Every frontend channel (the stdio channel, each HTTP session) registers
//! here under a generated client id. The hub owns the per-client outbound
//! notification queue, the per-client protocol state machine, and the
//! cancellation token that fans out to the client's in-flight requests.

use std::collections::HashMap;

use parking_lot::RwLock;
use telemetry_metrics::gauge;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protocol::JsonRpcNotification;

/// Per-channel protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected, initialize not yet completed
    PreInit,
    /// Initialize handshake done; all methods available
    Ready,
    /// Channel closed
    Closed,
}

struct ClientHandle {
    tx: mpsc::UnboundedSender<JsonRpcNotification>,
    state: ClientState,
    cancel: CancellationToken,
}

/// Registry of connected frontend clients
pub struct ClientHub {
    clients: RwLock<HashMap<String, ClientHandle>>,
}

impl ClientHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new client channel; the receiver drains its outbound
    /// notifications.
    pub fn register(&self, client_id: &str) -> mpsc::UnboundedReceiver<JsonRpcNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut clients = self.clients.write();
        clients.insert(
            client_id.to_string(),
            ClientHandle {
                tx,
                state: ClientState::PreInit,
                cancel: CancellationToken::new(),
            },
        );
        gauge!("goblin_connected_clients").set(clients.len() as f64);
        info!(client = %client_id, "Client channel registered");
        rx
    }

    /// Current protocol state, `Closed` for unknown clients.
    #[must_use]
    pub fn state(&self, client_id: &str) -> ClientState {
        self.clients
            .read()
            .get(client_id)
            .map_or(ClientState::Closed, |c| c.state)
    }

    /// Advance a client's protocol state.
    pub fn set_state(&self, client_id: &str, state: ClientState) {
        if let Some(client) = self.clients.write().get_mut(client_id) {
            client.state = state;
        }
    }

    /// The client's root cancellation token; per-request tokens are derived
    /// from it so closing the channel cancels everything in flight.
    #[must_use]
    pub fn cancel_token(&self, client_id: &str) -> CancellationToken {
        self.clients
            .read()
            .get(client_id)
            .map_or_else(CancellationToken::new, |c| c.cancel.clone())
    }

    /// Queue a notification for one client. Returns whether it was accepted.
    pub fn send_to(&self, client_id: &str, notification: JsonRpcNotification) -> bool {
        self.clients
            .read()
            .get(client_id)
            .is_some_and(|c| c.tx.send(notification).is_ok())
    }

    /// Queue a notification for every client in `Ready` state.
    pub fn broadcast(&self, notification: &JsonRpcNotification) {
        for (id, client) in self.clients.read().iter() {
            if client.state == ClientState::Ready && client.tx.send(notification.clone()).is_err()
            {
                debug!(client = %id, "Dropping notification for closed channel");
            }
        }
    }

    /// Remove a client, cancelling its in-flight requests.
    pub fn remove(&self, client_id: &str) {
        let mut clients = self.clients.write();
        if let Some(client) = clients.remove(client_id) {
            client.cancel.cancel();
            gauge!("goblin_connected_clients").set(clients.len() as f64);
            info!(client = %client_id, "Client channel removed");
        }
    }

    /// Ids of every registered client.
    #[must_use]
    pub fn client_ids(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether no clients are connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

impl Default for ClientHub {
    fn default() -> Self {
        Self::new()
    }
}
