//! HTTP / streamable-HTTP transport implementation
//!
//! Requests go out as JSON POSTs. A session id captured from the initialize
//! response headers is echoed on subsequent requests for stateful backends;
//! stateless backends never carry one. Server-sent notifications arrive on a
//! long-lived GET stream keyed by the same session id.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use reqwest::{Client, StatusCode, header};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{NotificationDispatcher, NotificationHandler, Transport, capabilities_from_initialize, initialize_params};
use crate::config::{BackendConfig, BackendMode};
use crate::protocol::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION,
    RequestId, ServerCapabilities, methods,
};
use crate::{Error, Result};

/// How long the initialize handshake may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Session id header used by streamable HTTP servers.
const SESSION_HEADER: &str = "mcp-session-id";

struct Shared {
    name: String,
    pending: DashMap<String, oneshot::Sender<JsonRpcResponse>>,
    connected: AtomicBool,
    dispatcher: NotificationDispatcher,
    session_id: parking_lot::RwLock<Option<String>>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Shared {
    fn handle_stream_message(&self, payload: &str) {
        let message: JsonRpcMessage = match serde_json::from_str(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(backend = %self.name, error = %e, "Discarding unparseable stream event");
                return;
            }
        };
        match message {
            JsonRpcMessage::Notification(notification) => self.dispatcher.dispatch(notification),
            JsonRpcMessage::Response(response) => {
                if let Some(id) = &response.id {
                    if let Some((_, sender)) = self.pending.remove(&id.to_string()) {
                        let _ = sender.send(response);
                    }
                }
            }
            JsonRpcMessage::Request(request) => {
                debug!(backend = %self.name, method = %request.method, "Ignoring server-to-client request");
            }
        }
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.pending.clear();
    }
}

/// HTTP transport for remote MCP servers
pub struct HttpTransport {
    shared: Arc<Shared>,
    config: BackendConfig,
    client: Client,
    url: String,
    capabilities: parking_lot::RwLock<Option<ServerCapabilities>>,
    request_id: AtomicU64,
    stream_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").field("url", &self.url).finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Create an unconnected HTTP transport.
    pub fn new(config: &BackendConfig) -> Result<Arc<Self>> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| Error::Config(format!("Backend '{}': missing url", config.name)))?;

        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;

        Ok(Arc::new(Self {
            shared: Arc::new(Shared {
                name: config.name.clone(),
                pending: DashMap::new(),
                connected: AtomicBool::new(false),
                dispatcher: NotificationDispatcher::new(&config.name),
                session_id: parking_lot::RwLock::new(None),
            }),
            config: config.clone(),
            client,
            url,
            capabilities: parking_lot::RwLock::new(None),
            request_id: AtomicU64::new(1),
            stream_task: parking_lot::Mutex::new(None),
        }))
    }

    fn build_headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(
            header::ACCEPT,
            "application/json, text/event-stream".parse().unwrap(),
        );
        headers.insert("MCP-Protocol-Version", PROTOCOL_VERSION.parse().unwrap());

        // Stateless backends expect each request to be self-contained.
        if self.config.mode == BackendMode::Stateful {
            if let Some(session_id) = self.shared.session_id.read().as_deref() {
                if let Ok(value) = session_id.parse() {
                    headers.insert(SESSION_HEADER, value);
                }
            }
        }

        for (key, value) in &self.config.headers {
            if let (Ok(k), Ok(v)) = (
                key.parse::<header::HeaderName>(),
                value.parse::<header::HeaderValue>(),
            ) {
                headers.insert(k, v);
            }
        }

        headers
    }

    fn next_id(&self) -> RequestId {
        #[allow(clippy::cast_possible_wrap)] // request ids never reach i64::MAX
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed) as i64)
    }

    /// Issue one POST and interpret the reply.
    async fn post_request(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let key = request.id.to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(key.clone(), tx);

        let send_result = self
            .client
            .post(&self.url)
            .headers(self.build_headers())
            .json(request)
            .send()
            .await;

        let response = match send_result {
            Ok(r) => r,
            Err(e) => {
                self.shared.pending.remove(&key);
                return Err(Error::Connection(e.to_string()));
            }
        };

        // Capture or refresh the session id for stateful backends.
        if self.config.mode == BackendMode::Stateful {
            if let Some(session_id) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                *self.shared.session_id.write() = Some(session_id.to_string());
            }
        }

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::NOT_FOUND {
            self.shared.pending.remove(&key);
            self.shared.disconnect();
            return Err(Error::Connection(format!(
                "Backend '{}' rejected request: {status}",
                self.config.name
            )));
        }
        if status == StatusCode::ACCEPTED {
            // The response will arrive on the notification stream.
            return match rx.await {
                Ok(response) => Ok(response),
                Err(_) => Err(Error::Connection(format!(
                    "Backend '{}' closed while request was in flight",
                    self.config.name
                ))),
            };
        }
        self.shared.pending.remove(&key);
        if !status.is_success() {
            return Err(Error::Connection(format!("HTTP error: {status}")));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            let body = response
                .text()
                .await
                .map_err(|e| Error::Connection(e.to_string()))?;
            for payload in parse_sse_payloads(&body) {
                if let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(&payload) {
                    return Ok(parsed);
                }
            }
            Err(Error::Connection("No response event in SSE body".to_string()))
        } else {
            response
                .json()
                .await
                .map_err(|e| Error::Connection(e.to_string()))
        }
    }

    /// Open the long-lived notification stream.
    ///
    /// The session id is already set by the time this runs, so the header
    /// snapshot taken here keys the stream to the right session.
    fn spawn_stream_listener(&self) {
        let client = self.client.clone();
        let url = self.url.clone();
        let mut headers = self.build_headers();
        headers.insert(header::ACCEPT, "text/event-stream".parse().unwrap());
        let shared = Arc::clone(&self.shared);

        let handle = tokio::spawn(async move {
            let result = client.get(&url).headers(headers).send().await;

            let response = match result {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    // Servers without a push channel answer 404/405 here;
                    // the transport stays usable for plain request/response.
                    debug!(backend = %shared.name, status = %r.status(), "No notification stream");
                    return;
                }
                Err(e) => {
                    debug!(backend = %shared.name, error = %e, "Failed to open notification stream");
                    return;
                }
            };

            let mut buffer = SseBuffer::default();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for payload in buffer.push(&String::from_utf8_lossy(&bytes)) {
                            shared.handle_stream_message(&payload);
                        }
                    }
                    Err(e) => {
                        warn!(backend = %shared.name, error = %e, "Notification stream error");
                        break;
                    }
                }
            }

            // An established stream ending means the peer went away.
            debug!(backend = %shared.name, "Notification stream closed");
            shared.disconnect();
        });
        *self.stream_task.lock() = Some(handle);
    }

    async fn connect_inner(&self) -> Result<()> {
        let request = JsonRpcRequest::new(self.next_id(), methods::INITIALIZE, Some(initialize_params()));

        let response = tokio::time::timeout(CONNECT_TIMEOUT, self.post_request(&request))
            .await
            .map_err(|_| Error::RequestTimeout {
                backend: self.config.name.clone(),
                timeout_ms: CONNECT_TIMEOUT.as_millis().min(u128::from(u64::MAX)) as u64,
            })??;

        let capabilities = capabilities_from_initialize(&response)?;
        *self.capabilities.write() = Some(capabilities);

        self.notify(methods::NOTIF_INITIALIZED, None).await?;
        self.shared.connected.store(true, Ordering::Relaxed);
        self.spawn_stream_listener();

        debug!(backend = %self.config.name, url = %self.url, "HTTP transport initialized");
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<()> {
        self.connect_inner().await
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
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        let key = request.id.to_string();

        tokio::select! {
            () = cancel.cancelled() => {
                self.shared.pending.remove(&key);
                Err(Error::Cancelled)
            }
            outcome = tokio::time::timeout(timeout, self.post_request(&request)) => match outcome {
                Ok(result) => result,
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

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let response = self
            .client
            .post(&self.url)
            .headers(self.build_headers())
            .json(&notification)
            .send()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        if !response.status().is_success() && response.status() != StatusCode::ACCEPTED {
            warn!(backend = %self.config.name, status = %response.status(), "Notification rejected");
        }
        Ok(())
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
        if let Some(task) = self.stream_task.lock().take() {
            task.abort();
        }

        // Best-effort session termination.
        let session_id = self.shared.session_id.read().clone();
        if let Some(id) = session_id {
            let _ = self
                .client
                .delete(&self.url)
                .header(SESSION_HEADER, id)
                .send()
                .await;
        }
        Ok(())
    }
}

/// Incremental parser for `text/event-stream` bodies.
///
/// Events are separated by a blank line; each event's payload is the
/// newline-joined concatenation of its `data:` fields.
#[derive(Default)]
struct SseBuffer {
    partial: String,
}

impl SseBuffer {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut payloads = Vec::new();

        while let Some(boundary) = self.partial.find("\n\n") {
            let event: String = self.partial.drain(..boundary + 2).collect();
            if let Some(payload) = extract_sse_data(&event) {
                payloads.push(payload);
            }
        }
        payloads
    }
}

fn extract_sse_data(event: &str) -> Option<String> {
    let data_lines: Vec<&str> = event
        .lines()
        .filter_map(|line| {
            line.strip_prefix("data:")
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        })
        .collect();
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

/// Collect the data payloads of every event in a complete SSE body.
fn parse_sse_payloads(body: &str) -> Vec<String> {
    let mut buffer = SseBuffer::default();
    let mut payloads = buffer.push(body);
    // A body without a trailing blank line still holds one final event.
    if let Some(payload) = extract_sse_data(&buffer.partial) {
        payloads.push(payload);
    }
    payloads
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── SSE parsing ───────────────────────────────────────────────────

    #[test]
    fn sse_buffer_extracts_single_event() {
        let mut buffer = SseBuffer::default();
        let payloads = buffer.push("data: {\"a\":1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}"]);
    }

    #[test]
    fn sse_buffer_handles_split_chunks() {
        let mut buffer = SseBuffer::default();
        assert!(buffer.push("data: {\"a\"").is_empty());
        let payloads = buffer.push(":1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}"]);
    }

    #[test]
    fn sse_buffer_joins_multiple_data_lines() {
        let mut buffer = SseBuffer::default();
        let payloads = buffer.push("data: line1\ndata: line2\n\n");
        assert_eq!(payloads, vec!["line1\nline2"]);
    }

    #[test]
    fn sse_buffer_ignores_comments_and_event_fields() {
        let mut buffer = SseBuffer::default();
        let payloads = buffer.push(": keep-alive\n\nevent: message\ndata: x\n\n");
        assert_eq!(payloads, vec!["x"]);
    }

    #[test]
    fn parse_sse_payloads_handles_unterminated_final_event() {
        let payloads = parse_sse_payloads("data: first\n\ndata: last");
        assert_eq!(payloads, vec!["first", "last"]);
    }

    // ── stream message routing ────────────────────────────────────────

    fn http_config(name: &str, mode: BackendMode) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            transport: crate::config::TransportKind::StreamableHttp,
            command: None,
            args: vec![],
            env: std::collections::HashMap::new(),
            url: Some("http://localhost:9999/mcp".to_string()),
            headers: std::collections::HashMap::new(),
            enabled: true,
            mode,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn stream_response_resolves_pending() {
        let transport = HttpTransport::new(&http_config("web", BackendMode::Stateful)).unwrap();
        let (tx, rx) = oneshot::channel();
        transport.shared.pending.insert("3".to_string(), tx);

        transport
            .shared
            .handle_stream_message(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#);

        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn stream_notification_reaches_handler() {
        let transport = HttpTransport::new(&http_config("web", BackendMode::Stateful)).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        transport.set_notification_handler(Box::new(move |n| {
            let _ = tx.send(n.method);
        }));

        transport
            .shared
            .handle_stream_message(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#);

        let method = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(method, methods::NOTIF_TOOLS_CHANGED);
    }

    #[tokio::test]
    async fn stateless_mode_omits_session_header() {
        let transport = HttpTransport::new(&http_config("web", BackendMode::Stateless)).unwrap();
        *transport.shared.session_id.write() = Some("sess-1".to_string());
        let headers = transport.build_headers();
        assert!(headers.get(SESSION_HEADER).is_none());
    }

    #[tokio::test]
    async fn stateful_mode_echoes_session_header() {
        let transport = HttpTransport::new(&http_config("web", BackendMode::Stateful)).unwrap();
        *transport.shared.session_id.write() = Some("sess-1".to_string());
        let headers = transport.build_headers();
        assert_eq!(headers.get(SESSION_HEADER).unwrap(), "sess-1");
    }

    #[tokio::test]
    async fn custom_headers_are_applied() {
        let mut config = http_config("web", BackendMode::Stateful);
        config
            .headers
            .insert("Authorization".to_string(), "Bearer token".to_string());
        let transport = HttpTransport::new(&config).unwrap();
        let headers = transport.build_headers();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer token");
    }

    #[tokio::test]
    async fn unauthorized_response_disconnects() {
        let transport = HttpTransport::new(&http_config("web", BackendMode::Stateful)).unwrap();
        transport.shared.connected.store(true, Ordering::Relaxed);
        transport.shared.disconnect();
        assert!(!transport.is_connected());
        assert!(transport.shared.pending.is_empty());
    }
}
