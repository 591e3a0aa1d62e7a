//! Lock-port control surface
//!
//! A small loopback HTTP listener owned by the daemon. Binding it is the
//! single-instance guard; its endpoints give the CLI status, catalog, and
//! stop control without speaking MCP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::FrontendTransport;
use crate::failsafe::CircuitState;
use crate::meta::MetaTools;
use crate::pool::TransportPool;
use crate::registry::Registry;
use crate::router::BackendDirectory;

struct LockState {
    registry: Arc<Registry>,
    pool: Arc<TransportPool>,
    meta: Arc<MetaTools>,
    backends: BackendDirectory,
    mode: FrontendTransport,
    shutdown: CancellationToken,
    started_at: Instant,
}

/// Build the lock-port router.
pub fn lock_router(
    registry: Arc<Registry>,
    pool: Arc<TransportPool>,
    meta: Arc<MetaTools>,
    backends: BackendDirectory,
    mode: FrontendTransport,
    shutdown: CancellationToken,
    started_at: Instant,
) -> Router {
    let state = Arc::new(LockState {
        registry,
        pool,
        meta,
        backends,
        mode,
        shutdown,
        started_at,
    });

    Router::new()
        .route("/status", get(status_handler))
        .route("/ping", get(ping_handler))
        .route("/health", get(health_handler))
        .route("/tools", get(tools_handler))
        .route("/servers", get(servers_handler))
        .route("/stop", post(stop_handler))
        .with_state(state)
}

async fn status_handler(State(state): State<Arc<LockState>>) -> impl IntoResponse {
    let names: Vec<String> = state.backends.read().keys().cloned().collect();
    let online = names
        .iter()
        .filter(|name| state.pool.is_connected(name))
        .count();
    let (tools, _, _, _) = state.registry.counts();

    let mode = match state.mode {
        FrontendTransport::Stdio => "stdio",
        FrontendTransport::Http => "http",
        FrontendTransport::Both => "both",
    };

    Json(json!({
        "status": "running",
        "mode": mode,
        "pid": std::process::id(),
        "uptime": state.started_at.elapsed().as_secs(),
        "servers": {
            "total": names.len(),
            "online": online,
            "offline": names.len() - online,
        },
        "tools": tools,
    }))
}

async fn ping_handler() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn health_handler(State(state): State<Arc<LockState>>) -> impl IntoResponse {
    let detail = state
        .meta
        .call("health", &json!({}))
        .await
        .unwrap_or_else(|_| json!({"servers": []}));

    let unhealthy = detail["servers"].as_array().is_some_and(|servers| {
        servers
            .iter()
            .any(|s| s["circuitState"] == "open" && s["enabled"] == true)
    });

    Json(json!({
        "status": if unhealthy { "unhealthy" } else { "healthy" },
        "servers": detail["servers"],
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

async fn tools_handler(
    State(state): State<Arc<LockState>>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    match params.get("server") {
        Some(server) => {
            if !state.backends.read().contains_key(server)
                && server != state.registry.local_name()
            {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({"error": format!("Unknown server: {server}")})),
                )
                    .into_response();
            }
            let tools: Vec<Value> = state
                .registry
                .tools_for_server(server)
                .into_iter()
                .map(|t| json!({"name": t.name, "description": t.description}))
                .collect();
            Json(json!({"server": server, "tools": tools})).into_response()
        }
        None => {
            let tools: Vec<Value> = state
                .registry
                .tool_entries()
                .into_iter()
                .map(|entry| {
                    json!({
                        "name": entry.namespaced_id,
                        "server": entry.backend,
                        "description": entry.tool.description,
                    })
                })
                .collect();
            Json(json!({"tools": tools})).into_response()
        }
    }
}

async fn servers_handler(State(state): State<Arc<LockState>>) -> impl IntoResponse {
    let mut servers: Vec<Value> = state
        .backends
        .read()
        .values()
        .map(|config| {
            let status = state.pool.status(&config.name);
            json!({
                "name": config.name,
                "transport": config.transport.as_str(),
                "enabled": config.enabled,
                "connected": status.connected,
                "circuitState": status.circuit.state.as_str(),
                "circuitOpen": status.circuit.state == CircuitState::Open,
            })
        })
        .collect();
    servers.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

    Json(json!({"servers": servers}))
}

async fn stop_handler(State(state): State<Arc<LockState>>) -> impl IntoResponse {
    info!("Stop requested via lock port");
    state.shutdown.cancel();
    Json(json!({"status": "ok"}))
}
