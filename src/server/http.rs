//! HTTP frontend
//!
//! `POST /mcp` carries JSON-RPC requests; the response echoes a session id
//! header minted at initialize. `GET /mcp` attaches a text/event-stream
//! channel for server-pushed notifications, keyed by the same session id.
//! Health, readiness, and metrics endpoints ride the same listener; only
//! `/metrics` sits behind the API-key check, and `/health` is always exempt.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::get,
};
use dashmap::DashMap;
use futures::Stream;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::GatewayServer;
use crate::config::{AuthConfig, AuthMode, StreamableHttpConfig};
use crate::error::rpc_codes;
use crate::meta::MetaTools;
use crate::protocol::JsonRpcNotification;

/// Session id header shared with clients.
const SESSION_HEADER: &str = "mcp-session-id";

/// Tracks which backends have completed their first successful sync.
pub struct ReadyState {
    synced: DashMap<String, bool>,
}

impl ReadyState {
    /// Create with every backend unsynced.
    #[must_use]
    pub fn new(backends: &[String]) -> Arc<Self> {
        let synced = DashMap::new();
        for name in backends {
            synced.insert(name.clone(), false);
        }
        Arc::new(Self { synced })
    }

    /// Record a backend's first successful sync.
    pub fn mark_synced(&self, backend: &str) {
        self.synced.insert(backend.to_string(), true);
    }

    /// Start tracking a backend added at runtime (unsynced until its first
    /// successful sync).
    pub fn track(&self, backend: &str) {
        self.synced.entry(backend.to_string()).or_insert(false);
    }

    /// Drop a removed backend from the readiness set.
    pub fn forget(&self, backend: &str) {
        self.synced.remove(backend);
    }

    /// Whether every tracked backend has synced at least once.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.synced.iter().all(|entry| *entry.value())
    }

    /// Per-backend readiness snapshot.
    #[must_use]
    pub fn backends(&self) -> Vec<Value> {
        let mut entries: Vec<Value> = self
            .synced
            .iter()
            .map(|entry| json!({"name": entry.key(), "ready": *entry.value()}))
            .collect();
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        entries
    }
}

/// Frontend HTTP configuration
#[derive(Clone)]
pub struct HttpFrontendConfig {
    /// Auth settings for administrative endpoints
    pub auth: AuthConfig,
    /// Session behavior
    pub streamable: StreamableHttpConfig,
}

struct Session {
    notifications: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<JsonRpcNotification>>>,
    last_active: parking_lot::RwLock<Instant>,
}

/// The HTTP frontend
pub struct HttpFrontend {
    server: Arc<GatewayServer>,
    meta: Arc<MetaTools>,
    config: HttpFrontendConfig,
    sessions: DashMap<String, Arc<Session>>,
    metrics: Option<PrometheusHandle>,
    ready: Arc<ReadyState>,
    started_at: Instant,
}

impl HttpFrontend {
    /// Create the frontend.
    pub fn new(
        server: Arc<GatewayServer>,
        meta: Arc<MetaTools>,
        config: HttpFrontendConfig,
        metrics: Option<PrometheusHandle>,
        ready: Arc<ReadyState>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            meta,
            config,
            sessions: DashMap::new(),
            metrics,
            ready,
            started_at: Instant::now(),
        })
    }

    /// Build the axum router for this frontend.
    pub fn router(self: &Arc<Self>) -> Router {
        use tower_http::{
            catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer,
        };

        Router::new()
            .route(
                "/mcp",
                get(mcp_sse_handler)
                    .post(mcp_post_handler)
                    .delete(mcp_delete_handler),
            )
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/metrics", get(metrics_handler))
            .layer(CatchPanicLayer::new())
            .layer(CompressionLayer::new())
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(self))
    }

    /// Periodically expire idle sessions.
    pub fn spawn_session_reaper(self: &Arc<Self>, shutdown: CancellationToken) {
        let frontend = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let timeout = frontend.config.streamable.session_timeout();
                        let expired: Vec<String> = frontend
                            .sessions
                            .iter()
                            .filter(|entry| entry.value().last_active.read().elapsed() > timeout)
                            .map(|entry| entry.key().clone())
                            .collect();
                        for session_id in expired {
                            info!(session = %session_id, "Expiring idle session");
                            frontend.drop_session(&session_id).await;
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Close every session (shutdown path).
    pub async fn close_all_sessions(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for session_id in ids {
            self.drop_session(&session_id).await;
        }
    }

    async fn drop_session(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            self.server.disconnect_client(session_id).await;
        }
    }

    /// Get an existing session or mint a new one; `None` when the session
    /// cap is reached.
    fn get_or_create_session(&self, existing: Option<&str>) -> Option<String> {
        if let Some(id) = existing {
            if let Some(session) = self.sessions.get(id) {
                *session.last_active.write() = Instant::now();
                return Some(id.to_string());
            }
        }

        if self.sessions.len() >= self.config.streamable.max_sessions {
            return None;
        }

        let session_id = format!("http-{}", Uuid::new_v4());
        let receiver = self.server.hub().register(&session_id);
        self.sessions.insert(
            session_id.clone(),
            Arc::new(Session {
                notifications: tokio::sync::Mutex::new(Some(receiver)),
                last_active: parking_lot::RwLock::new(Instant::now()),
            }),
        );
        debug!(session = %session_id, "HTTP session created");
        Some(session_id)
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        match self.config.auth.mode {
            AuthMode::Dev => true,
            AuthMode::ApiKey => {
                let expected = self.config.auth.api_key.as_deref().unwrap_or("");
                headers
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|presented| !expected.is_empty() && presented == expected)
            }
        }
    }
}

fn session_header_value(session_id: &str) -> (header::HeaderName, String) {
    (
        header::HeaderName::from_static(SESSION_HEADER),
        session_id.to_string(),
    )
}

async fn mcp_post_handler(
    State(frontend): State<Arc<HttpFrontend>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let existing = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok());

    let Some(session_id) = frontend.get_or_create_session(existing) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "jsonrpc": "2.0",
                "error": {"code": rpc_codes::INVALID_REQUEST, "message": "Session limit reached"},
                "id": null
            })),
        )
            .into_response();
    };

    let message: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                [session_header_value(&session_id)],
                Json(json!({
                    "jsonrpc": "2.0",
                    "error": {"code": rpc_codes::PARSE_ERROR, "message": format!("Invalid JSON: {e}")},
                    "id": null
                })),
            )
                .into_response();
        }
    };

    match frontend.server.handle_value(&session_id, &message).await {
        Some(response) => (
            StatusCode::OK,
            [session_header_value(&session_id)],
            Json(serde_json::to_value(response).unwrap_or_default()),
        )
            .into_response(),
        // Notifications get 202 Accepted with an empty body.
        None => (
            StatusCode::ACCEPTED,
            [session_header_value(&session_id)],
            Json(json!({})),
        )
            .into_response(),
    }
}

async fn mcp_sse_handler(
    State(frontend): State<Arc<HttpFrontend>>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !frontend.config.streamable.sse_enabled {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": rpc_codes::INVALID_REQUEST,
                    "message": "Streaming disabled; POST JSON-RPC requests to /mcp"
                },
                "id": null
            })),
        )
            .into_response();
    }

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !accept.contains("text/event-stream") && !accept.contains("*/*") {
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(json!({"error": "Accept must include text/event-stream"})),
        )
            .into_response();
    }

    let existing = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok());
    let Some(session_id) = frontend.get_or_create_session(existing) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Session limit reached"})),
        )
            .into_response();
    };

    let Some(session) = frontend.sessions.get(&session_id).map(|s| Arc::clone(&s)) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let Some(receiver) = session.notifications.lock().await.take() else {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "Notification stream already attached for this session"})),
        )
            .into_response();
    };

    info!(session = %session_id, "Client attached notification stream");

    let stream = notification_stream(session_id.clone(), receiver);
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    );

    let mut response = sse.into_response();
    if let Ok(value) = session_id.parse::<axum::http::HeaderValue>() {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn notification_stream(
    session_id: String,
    mut receiver: mpsc::UnboundedReceiver<JsonRpcNotification>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream! {
        yield Ok(Event::default()
            .event("connected")
            .data(json!({"sessionId": session_id}).to_string()));

        while let Some(notification) = receiver.recv().await {
            let Ok(serialized) = serde_json::to_string(&notification) else { continue };
            yield Ok(Event::default().event("message").data(serialized));
        }
    }
}

async fn mcp_delete_handler(
    State(frontend): State<Arc<HttpFrontend>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    match session_id {
        Some(id) if frontend.sessions.contains_key(&id) => {
            frontend.drop_session(&id).await;
            info!(session = %id, "Session terminated by client");
            StatusCode::NO_CONTENT
        }
        Some(_) => StatusCode::NOT_FOUND,
        None => StatusCode::BAD_REQUEST,
    }
}

/// `GET /health` - 200 always once the daemon is up.
async fn health_handler(State(frontend): State<Arc<HttpFrontend>>) -> impl IntoResponse {
    let detail = frontend
        .meta
        .call("health", &json!({}))
        .await
        .unwrap_or_else(|_| json!({"servers": []}));

    let unhealthy = detail["servers"]
        .as_array()
        .is_some_and(|servers| {
            servers
                .iter()
                .any(|s| s["circuitState"] == "open" && s["enabled"] == true)
        });

    Json(json!({
        "status": if unhealthy { "unhealthy" } else { "healthy" },
        "servers": detail["servers"],
        "uptime": frontend.started_at.elapsed().as_secs(),
    }))
}

/// `GET /ready` - 200 when every required backend has synced, else 503.
async fn ready_handler(State(frontend): State<Arc<HttpFrontend>>) -> impl IntoResponse {
    let ready = frontend.ready.all_ready();
    let body = Json(json!({
        "ready": ready,
        "backends": frontend.ready.backends(),
    }));
    if ready {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body)
    }
}

/// `GET /metrics` - Prometheus text exposition, behind the API-key check.
async fn metrics_handler(
    State(frontend): State<Arc<HttpFrontend>>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !frontend.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized\n").into_response();
    }
    match &frontend.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics disabled\n").into_response(),
    }
}
