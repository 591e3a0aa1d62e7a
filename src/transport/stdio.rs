//! Stdio transport implementation (child process)

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{NotificationDispatcher, NotificationHandler, Transport, capabilities_from_initialize, initialize_params};
use crate::config::BackendConfig;
use crate::protocol::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    ServerCapabilities, methods,
};
use crate::{Error, Result};

/// How long the initialize handshake may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// State shared with the reader tasks.
struct Shared {
    name: String,
    pending: DashMap<String, oneshot::Sender<JsonRpcResponse>>,
    connected: AtomicBool,
    dispatcher: NotificationDispatcher,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Shared {
    /// Handle one line from the child's stdout.
    fn handle_line(&self, line: &str) {
        let message: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                warn!(backend = %self.name, error = %e, "Discarding unparseable line from backend");
                return;
            }
        };

        match message {
            JsonRpcMessage::Response(response) => {
                if let Some(id) = &response.id {
                    if let Some((_, sender)) = self.pending.remove(&id.to_string()) {
                        let _ = sender.send(response);
                    } else {
                        debug!(backend = %self.name, id = %id, "Late response discarded");
                    }
                }
            }
            JsonRpcMessage::Notification(notification) => {
                self.dispatcher.dispatch(notification);
            }
            JsonRpcMessage::Request(request) => {
                // Server-to-client requests are not forwarded; peers that
                // need them get a method-not-found through the reverse path.
                debug!(backend = %self.name, method = %request.method, "Ignoring server-to-client request");
            }
        }
    }

    /// Mark disconnected and fail every in-flight request.
    fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        // Dropping the senders surfaces a Connection error to each waiter.
        self.pending.clear();
    }
}

/// Stdio transport for child-process MCP servers
pub struct StdioTransport {
    shared: Arc<Shared>,
    config: BackendConfig,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<tokio::process::ChildStdin>>,
    capabilities: parking_lot::RwLock<Option<ServerCapabilities>>,
    request_id: AtomicU64,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport").field("name", &self.config.name).finish_non_exhaustive()
    }
}

impl StdioTransport {
    /// Create an unconnected stdio transport.
    pub fn new(config: &BackendConfig) -> Result<Arc<Self>> {
        if config.command.as_deref().unwrap_or("").is_empty() {
            return Err(Error::Config(format!(
                "Backend '{}': stdio transport requires a command",
                config.name
            )));
        }
        Ok(Arc::new(Self {
            shared: Arc::new(Shared {
                name: config.name.clone(),
                pending: DashMap::new(),
                connected: AtomicBool::new(false),
                dispatcher: NotificationDispatcher::new(&config.name),
            }),
            config: config.clone(),
            child: Mutex::new(None),
            writer: Mutex::new(None),
            capabilities: parking_lot::RwLock::new(None),
            request_id: AtomicU64::new(1),
        }))
    }

    async fn spawn_child(&self) -> Result<()> {
        let command = self.config.command.as_deref().unwrap_or_default();
        let mut cmd = Command::new(command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Connection(format!("Failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Connection("Failed to capture child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Connection("Failed to capture child stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Connection("Failed to capture child stderr".to_string()))?;

        *self.writer.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        // Stdout reader: resolves pending requests and feeds the dispatcher.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => shared.handle_line(&line),
                    Ok(None) => {
                        debug!(backend = %shared.name, "Backend stdout EOF");
                        break;
                    }
                    Err(e) => {
                        error!(backend = %shared.name, error = %e, "Error reading backend stdout");
                        break;
                    }
                }
            }
            shared.disconnect();
        });

        // Stderr reader: captured to the log at debug level.
        let name = self.config.name.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(backend = %name, "stderr: {line}");
            }
        });

        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        let cancel = CancellationToken::new();
        let response = self
            .request_raw(
                methods::INITIALIZE,
                Some(initialize_params()),
                CONNECT_TIMEOUT,
                &cancel,
            )
            .await?;

        let capabilities = capabilities_from_initialize(&response)?;
        *self.capabilities.write() = Some(capabilities);

        self.notify(methods::NOTIF_INITIALIZED, None).await?;
        self.shared.connected.store(true, Ordering::Relaxed);
        debug!(backend = %self.config.name, "Stdio transport initialized");
        Ok(())
    }

    async fn write_message(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stdin) = writer.as_mut() else {
            return Err(Error::Connection("Transport not connected".to_string()));
        };
        stdin
            .write_all(message.as_bytes())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(())
    }

    fn next_id(&self) -> RequestId {
        #[allow(clippy::cast_possible_wrap)] // request ids never reach i64::MAX
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed) as i64)
    }

    async fn request_raw(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse> {
        let id = self.next_id();
        let key = id.to_string();
        let request = JsonRpcRequest::new(id.clone(), method, params);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(key.clone(), tx);

        let message = serde_json::to_string(&request)?;
        if let Err(e) = self.write_message(&message).await {
            self.shared.pending.remove(&key);
            return Err(e);
        }

        tokio::select! {
            () = cancel.cancelled() => {
                self.shared.pending.remove(&key);
                // Best-effort cancel notification; the response, if it ever
                // arrives, is discarded as a late response.
                let _ = self
                    .notify(methods::NOTIF_CANCELLED, Some(serde_json::json!({"requestId": key})))
                    .await;
                Err(Error::Cancelled)
            }
            outcome = tokio::time::timeout(timeout, rx) => match outcome {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(Error::Connection(format!(
                    "Backend '{}' closed while request was in flight",
                    self.config.name
                ))),
                Err(_) => {
                    self.shared.pending.remove(&key);
                    Err(Error::RequestTimeout {
                        backend: self.config.name.clone(),
                        timeout_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
                    })
                }
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<()> {
        self.spawn_child().await?;
        self.initialize().await
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(Error::Connection(format!(
                "Backend '{}' is not connected",
                self.config.name
            )));
        }
        self.request_raw(method, params, timeout, cancel).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let message = serde_json::to_string(&notification)?;
        self.write_message(&message).await
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        self.shared.dispatcher.set_handler(handler);
    }

    fn capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities.read().clone()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.shared.disconnect();
        *self.writer.lock().await = None;
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.kill().await;
        }
        Ok(())
    }
}
