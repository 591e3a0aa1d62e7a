//! Transport implementations for MCP backends
//!
//! One live transport per backend, owned by the pool. Both variants share a
//! contract: multiplexed concurrent requests, fire-and-forget notifications,
//! and a single-threaded notification dispatch sequence so list-changed and
//! updated events retain backend ordering.

mod http;
mod stdio;

pub use self::http::HttpTransport;
pub use self::stdio::StdioTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::{BackendConfig, TransportKind};
use crate::protocol::{JsonRpcNotification, JsonRpcResponse, ServerCapabilities};
use crate::{Error, Result};

/// Handler invoked for each server-sent notification.
pub type NotificationHandler = Box<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Establish the connection and run the initialize handshake.
    async fn connect(&self) -> Result<()>;

    /// Send a request and wait for the matched response.
    ///
    /// Safe to call concurrently; requests are multiplexed by id. Fails with
    /// `Connection` on transport closure, `RequestTimeout` when the deadline
    /// elapses, or `Cancelled` when the token fires. A peer-supplied error
    /// arrives as a response with `error` set, not as an `Err`.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Register the notification handler.
    ///
    /// Handlers run on a single dispatch task per transport, in arrival
    /// order. They must not block; hand heavy work to a channel.
    fn set_notification_handler(&self, handler: NotificationHandler);

    /// Capabilities the peer declared during initialize.
    fn capabilities(&self) -> Option<ServerCapabilities>;

    /// Whether the transport is connected.
    fn is_connected(&self) -> bool;

    /// Close the transport.
    async fn close(&self) -> Result<()>;
}

/// Creates transports from backend configuration.
///
/// The pool goes through this seam so tests can count and fake connections.
pub trait TransportFactory: Send + Sync {
    /// Build an unconnected transport for the given backend.
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn Transport>>;
}

/// Production factory: stdio child processes and HTTP clients.
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn Transport>> {
        match config.transport {
            TransportKind::Stdio => Ok(StdioTransport::new(config)?),
            TransportKind::Http | TransportKind::StreamableHttp => {
                Ok(HttpTransport::new(config)?)
            }
        }
    }
}

/// Serializes notification delivery for one transport.
///
/// Incoming notifications are queued and replayed to the registered handler
/// by a single consumer task, preserving arrival order regardless of which
/// reader produced them.
pub(crate) struct NotificationDispatcher {
    tx: mpsc::UnboundedSender<JsonRpcNotification>,
    handler: Arc<RwLock<Option<NotificationHandler>>>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher").finish_non_exhaustive()
    }
}

impl NotificationDispatcher {
    pub(crate) fn new(backend: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcNotification>();
        let handler: Arc<RwLock<Option<NotificationHandler>>> = Arc::new(RwLock::new(None));

        let consumer_handler = Arc::clone(&handler);
        let backend = backend.to_string();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let guard = consumer_handler.read();
                if let Some(h) = guard.as_ref() {
                    h(notification);
                } else {
                    trace!(backend = %backend, method = %notification.method, "Notification dropped (no handler)");
                }
            }
        });

        Self { tx, handler }
    }

    pub(crate) fn set_handler(&self, handler: NotificationHandler) {
        *self.handler.write() = Some(handler);
    }

    pub(crate) fn dispatch(&self, notification: JsonRpcNotification) {
        let _ = self.tx.send(notification);
    }
}

/// Build the standard initialize params the gateway presents to backends.
pub(crate) fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": crate::protocol::PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "goblin",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// Extract declared capabilities from an initialize response.
pub(crate) fn capabilities_from_initialize(response: &JsonRpcResponse) -> Result<ServerCapabilities> {
    if let Some(err) = &response.error {
        return Err(Error::Connection(format!(
            "initialize rejected by peer: {} ({})",
            err.message, err.code
        )));
    }
    let result = response
        .result
        .as_ref()
        .ok_or_else(|| Error::Connection("initialize returned no result".to_string()))?;
    let caps = result
        .get("capabilities")
        .cloned()
        .unwrap_or(Value::Object(serde_json::Map::new()));
    Ok(serde_json::from_value(caps)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn dispatcher_preserves_order() {
        let dispatcher = NotificationDispatcher::new("test");
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        dispatcher.set_handler(Box::new(move |n| {
            seen_clone.lock().push(n.method);
        }));

        for i in 0..10 {
            dispatcher.dispatch(JsonRpcNotification::new(format!("n/{i}"), None));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let observed = seen.lock().clone();
        let expected: Vec<String> = (0..10).map(|i| format!("n/{i}")).collect();
        assert_eq!(observed, expected);
    }

    #[tokio::test]
    async fn dispatcher_without_handler_drops_silently() {
        let dispatcher = NotificationDispatcher::new("test");
        dispatcher.dispatch(JsonRpcNotification::new("n/ignored", None));
        // Registering later must not replay dropped notifications.
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        dispatcher.set_handler(Box::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn capabilities_from_initialize_parses_declared() {
        let response = JsonRpcResponse::success(
            RequestId::Number(0),
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"resources": {"subscribe": true}},
                "serverInfo": {"name": "x", "version": "1"}
            }),
        );
        let caps = capabilities_from_initialize(&response).unwrap();
        assert!(caps.supports_resource_subscribe());
    }

    #[test]
    fn capabilities_from_initialize_rejects_peer_error() {
        let response = JsonRpcResponse::error(Some(RequestId::Number(0)), -32600, "nope");
        assert!(capabilities_from_initialize(&response).is_err());
    }
}
