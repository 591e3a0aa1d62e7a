//! Gateway frontend server
//!
//! Speaks MCP to frontend clients over any number of channels (stdio, HTTP
//! sessions). List requests are answered from the registry's flat lists;
//! call/get/read requests go through the router; subscribe requests are
//! coordinated so each resource reaches its backend exactly once regardless
//! of how many clients watch it.

mod hub;
mod http;
mod notifications;
mod stdio;

pub use hub::{ClientHub, ClientState};
pub use http::{HttpFrontend, HttpFrontendConfig, ReadyState};
pub use notifications::spawn_change_bridge;
pub use stdio::run_stdio_frontend;

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::rpc_codes;
use crate::protocol::{
    Info, InitializeResult, JsonRpcNotification, JsonRpcResponse, PROTOCOL_VERSION,
    PromptsCapability, RequestId, ResourcesCapability, ServerCapabilities, ToolsCapability,
    methods,
};
use crate::registry::Registry;
use crate::router::Router;
use crate::subscriptions::SubscriptionManager;
use crate::{Error, Result};

/// The frontend request handler, shared by every channel driver.
pub struct GatewayServer {
    registry: Arc<Registry>,
    router: Arc<Router>,
    subscriptions: Arc<SubscriptionManager>,
    hub: Arc<ClientHub>,
    /// Per-URI serialization of backend subscribe/unsubscribe, so an
    /// unsubscribe racing an in-flight subscribe waits its turn and no
    /// intermediate state leaks to other clients.
    subscribe_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// In-flight request tokens keyed by (client, request id).
    inflight: DashMap<(String, String), CancellationToken>,
}

impl GatewayServer {
    /// Create the server.
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<Router>,
        subscriptions: Arc<SubscriptionManager>,
        hub: Arc<ClientHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            router,
            subscriptions,
            hub,
            subscribe_locks: DashMap::new(),
            inflight: DashMap::new(),
        })
    }

    /// The client hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<ClientHub> {
        &self.hub
    }

    /// The subscription manager.
    #[must_use]
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Handle one incoming frontend message.
    ///
    /// Returns `None` for notifications (nothing goes back on the wire).
    pub async fn handle_value(&self, client_id: &str, message: &Value) -> Option<JsonRpcResponse> {
        let (id, method, params) = match parse_request(message) {
            Ok(parsed) => parsed,
            Err(response) => return Some(response),
        };

        if method.starts_with("notifications/") {
            self.handle_notification(client_id, &method, params.as_ref());
            return None;
        }

        // parse_request guarantees an id for non-notifications.
        let id = id?;

        // State machine: before initialize, only initialize and ping.
        let state = self.hub.state(client_id);
        if state == ClientState::PreInit
            && method != methods::INITIALIZE
            && method != methods::PING
        {
            return Some(JsonRpcResponse::error(
                Some(id),
                rpc_codes::INVALID_REQUEST,
                format!("'{method}' before initialize"),
            ));
        }
        if state == ClientState::Closed {
            return Some(JsonRpcResponse::error(
                Some(id),
                rpc_codes::INVALID_REQUEST,
                "channel is closed",
            ));
        }

        debug!(client = %client_id, method = %method, "Frontend request");

        let cancel = self.register_inflight(client_id, &id);
        let response = self
            .dispatch(client_id, id.clone(), &method, params, &cancel)
            .await;
        self.inflight.remove(&(client_id.to_string(), id.to_string()));
        Some(response)
    }

    fn register_inflight(&self, client_id: &str, id: &RequestId) -> CancellationToken {
        let token = self.hub.cancel_token(client_id).child_token();
        self.inflight
            .insert((client_id.to_string(), id.to_string()), token.clone());
        token
    }

    fn handle_notification(&self, client_id: &str, method: &str, params: Option<&Value>) {
        match method {
            methods::NOTIF_INITIALIZED => {}
            methods::NOTIF_CANCELLED => {
                let request_id = params
                    .and_then(|p| p.get("requestId"))
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();
                if let Some((_, token)) = self
                    .inflight
                    .remove(&(client_id.to_string(), request_id.clone()))
                {
                    debug!(client = %client_id, request = %request_id, "Cancelling request");
                    token.cancel();
                }
            }
            other => debug!(client = %client_id, method = %other, "Ignoring client notification"),
        }
    }

    async fn dispatch(
        &self,
        client_id: &str,
        id: RequestId,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> JsonRpcResponse {
        match method {
            methods::INITIALIZE => self.handle_initialize(client_id, id, params.as_ref()),
            methods::PING => JsonRpcResponse::success(id, json!({})),

            methods::TOOLS_LIST => {
                let excluded = self.router.open_circuit_backends();
                let tools = self.registry.list_tools(&excluded);
                JsonRpcResponse::success(id, json!({ "tools": tools }))
            }
            methods::PROMPTS_LIST => {
                let excluded = self.router.open_circuit_backends();
                let prompts = self.registry.list_prompts(&excluded);
                JsonRpcResponse::success(id, json!({ "prompts": prompts }))
            }
            methods::RESOURCES_LIST => {
                let excluded = self.router.open_circuit_backends();
                let resources = self.registry.list_resources(&excluded);
                JsonRpcResponse::success(id, json!({ "resources": resources }))
            }
            methods::RESOURCES_TEMPLATES_LIST => {
                let excluded = self.router.open_circuit_backends();
                let templates = self.registry.list_templates(&excluded);
                JsonRpcResponse::success(id, json!({ "resourceTemplates": templates }))
            }

            methods::TOOLS_CALL => {
                let name = params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let arguments = params
                    .as_ref()
                    .and_then(|p| p.get("arguments"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                match self.router.call_tool(name, arguments, cancel).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => JsonRpcResponse::from_error(Some(id), &e),
                }
            }
            methods::PROMPTS_GET => {
                let name = params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let arguments = params.as_ref().and_then(|p| p.get("arguments")).cloned();
                match self.router.get_prompt(name, arguments, cancel).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => JsonRpcResponse::from_error(Some(id), &e),
                }
            }
            methods::RESOURCES_READ => {
                let uri = params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match self.router.read_resource(uri, cancel).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => JsonRpcResponse::from_error(Some(id), &e),
                }
            }

            methods::RESOURCES_SUBSCRIBE => {
                let uri = params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match self.handle_subscribe(client_id, uri, cancel).await {
                    Ok(()) => JsonRpcResponse::success(id, json!({})),
                    Err(e) => JsonRpcResponse::from_error(Some(id), &e),
                }
            }
            methods::RESOURCES_UNSUBSCRIBE => {
                let uri = params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match self.handle_unsubscribe(client_id, uri, cancel).await {
                    Ok(()) => JsonRpcResponse::success(id, json!({})),
                    Err(e) => JsonRpcResponse::from_error(Some(id), &e),
                }
            }

            methods::LOGGING_SET_LEVEL => {
                // Acknowledged; the tracing filter is process-wide and set at
                // startup, so this is a per-client no-op.
                JsonRpcResponse::success(id, json!({}))
            }

            other => JsonRpcResponse::error(
                Some(id),
                rpc_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        }
    }

    fn handle_initialize(
        &self,
        client_id: &str,
        id: RequestId,
        params: Option<&Value>,
    ) -> JsonRpcResponse {
        let client_version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        // Single supported version: echo it when the client matches, else
        // offer ours and let the client decide.
        let negotiated = if client_version == PROTOCOL_VERSION {
            client_version
        } else {
            PROTOCOL_VERSION
        };

        let result = InitializeResult {
            protocol_version: negotiated.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: true }),
                prompts: Some(PromptsCapability { list_changed: true }),
                resources: Some(ResourcesCapability {
                    subscribe: true,
                    list_changed: true,
                }),
                ..Default::default()
            },
            server_info: Info {
                name: "goblin".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("Goblin Gateway".to_string()),
                description: Some(
                    "Aggregates multiple MCP backends behind one endpoint".to_string(),
                ),
            },
            instructions: Some(
                "Tools, prompts, and resources are namespaced by backend. \
                 Use catalog_list and catalog_search to discover tools, \
                 describe_tool for schemas, and health for backend status."
                    .to_string(),
            ),
        };

        self.hub.set_state(client_id, ClientState::Ready);
        JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
    }

    async fn handle_subscribe(
        &self,
        client_id: &str,
        namespaced_uri: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let resolution = self.router.resolve_resource(namespaced_uri)?;

        let supports = self
            .registry
            .backend_capabilities(&resolution.backend)
            .is_some_and(|caps| caps.supports_resource_subscribe());
        if !supports {
            return Err(Error::MethodNotSupported {
                backend: resolution.backend.clone(),
                method: methods::RESOURCES_SUBSCRIBE.to_string(),
            });
        }

        let lock = self.uri_lock(&resolution.namespaced_uri);
        let _guard = lock.lock().await;

        let first_subscriber = !self.subscriptions.has_subscribers(&resolution.namespaced_uri);
        if first_subscriber {
            // Only the first client's call reaches the backend.
            self.router.forward_subscribe(&resolution, cancel).await?;
        }

        match self
            .subscriptions
            .subscribe(client_id, &resolution.namespaced_uri, &resolution.backend)
        {
            Ok(_) => Ok(()),
            Err(e) => {
                // The backend call succeeded but the record was refused
                // (per-client limit): undo the backend state we just created.
                if first_subscriber {
                    let fresh = CancellationToken::new();
                    if let Err(undo) = self.router.forward_unsubscribe(&resolution, &fresh).await {
                        warn!(uri = %resolution.namespaced_uri, error = %undo, "Failed to undo backend subscribe");
                    }
                }
                Err(e)
            }
        }
    }

    async fn handle_unsubscribe(
        &self,
        client_id: &str,
        namespaced_uri: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let lock = self.uri_lock(namespaced_uri);
        let _guard = lock.lock().await;

        let existed = self.subscriptions.unsubscribe(client_id, namespaced_uri);
        if !existed {
            // Unsubscribing something never subscribed is a no-op success.
            return Ok(());
        }

        if !self.subscriptions.has_subscribers(namespaced_uri) {
            // Last client dropped: release the backend subscription.
            if let Ok(resolution) = self.router.resolve_resource(namespaced_uri) {
                self.router.forward_unsubscribe(&resolution, cancel).await?;
            }
        }
        Ok(())
    }

    fn uri_lock(&self, namespaced_uri: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            &self
                .subscribe_locks
                .entry(namespaced_uri.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Number of requests currently in flight across all clients.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Wait until every in-flight request completes. Callers bound this
    /// with a timeout (the shutdown grace period).
    pub async fn drain(&self) {
        while !self.inflight.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    /// Tear down a client channel: cancel in-flight requests, drop its
    /// subscriptions, and issue backend unsubscribes for URIs nobody else
    /// watches.
    pub async fn disconnect_client(&self, client_id: &str) {
        self.hub.remove(client_id);
        self.inflight
            .retain(|(owner, _), token| {
                if owner == client_id {
                    token.cancel();
                    false
                } else {
                    true
                }
            });

        let outcome = self.subscriptions.cleanup_client(client_id);
        for (namespaced_uri, _backend) in outcome.orphaned {
            let lock = self.uri_lock(&namespaced_uri);
            let _guard = lock.lock().await;
            if self.subscriptions.has_subscribers(&namespaced_uri) {
                continue;
            }
            if let Ok(resolution) = self.router.resolve_resource(&namespaced_uri) {
                let fresh = CancellationToken::new();
                if let Err(e) = self.router.forward_unsubscribe(&resolution, &fresh).await {
                    warn!(uri = %namespaced_uri, error = %e, "Backend unsubscribe on disconnect failed");
                }
            }
        }
    }

    /// Bridge a backend `notifications/resources/updated` to subscribers.
    ///
    /// Fan-out uses the subscriber snapshot taken here; clients subscribing
    /// after this instant are not notified for this event.
    pub fn notify_resource_updated(&self, backend: &str, original_uri: &str) {
        let Some(namespaced_uri) = self.registry.namespaced_uri_for(backend, original_uri) else {
            debug!(backend = %backend, uri = %original_uri, "Update for uncataloged resource dropped");
            return;
        };
        let subscribers = self.subscriptions.subscribers(&namespaced_uri);
        if subscribers.is_empty() {
            return;
        }
        let notification = JsonRpcNotification::new(
            methods::NOTIF_RESOURCE_UPDATED,
            Some(json!({ "uri": namespaced_uri })),
        );
        for client_id in subscribers {
            if !self.hub.send_to(&client_id, notification.clone()) {
                debug!(client = %client_id, "Subscriber channel gone, notification dropped");
            }
        }
    }
}

/// Parse a JSON-RPC request or notification.
///
/// Returns (id, method, params); id is `None` for notifications. Requests
/// without an id are rejected.
fn parse_request(
    value: &Value,
) -> std::result::Result<(Option<RequestId>, String, Option<Value>), JsonRpcResponse> {
    let jsonrpc = value.get("jsonrpc").and_then(Value::as_str);
    if jsonrpc != Some("2.0") {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let id = value.get("id").and_then(extract_request_id);

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            JsonRpcResponse::error(id.clone(), rpc_codes::INVALID_REQUEST, "Missing method")
        })?;

    let params = value.get("params").cloned();

    if !method.starts_with("notifications/") && id.is_none() {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Missing id",
        ));
    }

    Ok((id, method.to_string(), params))
}

/// Extract a `RequestId` from a JSON value (string or integer per spec).
fn extract_request_id(value: &Value) -> Option<RequestId> {
    if let Some(s) = value.as_str() {
        Some(RequestId::String(s.to_string()))
    } else if let Some(n) = value.as_i64() {
        Some(RequestId::Number(n))
    } else {
        value.as_u64().map(|n| {
            #[allow(clippy::cast_possible_wrap)]
            RequestId::Number(n as i64)
        })
    }
}
