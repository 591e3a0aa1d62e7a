//! Request router
//!
//! The unified path for `tools/call`, `prompts/get`, `resources/read`, and
//! subscribe/unsubscribe forwarding: resolve the namespaced identifier in
//! the registry, dispatch meta-tools in-process, otherwise acquire the
//! owning backend's transport under its circuit breaker, substitute the
//! original identifier, and issue the request with a deadline and the
//! caller's cancellation token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::{Value, json};
use telemetry_metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{BackendConfig, PoliciesConfig};
use crate::meta::MetaTools;
use crate::naming;
use crate::normalize::normalize_path_arguments;
use crate::pool::TransportPool;
use crate::protocol::{JsonRpcResponse, methods};
use crate::registry::{Registry, ResourceResolution};
use crate::{Error, Result};

/// Live directory of backend configurations, shared with the daemon so
/// explicit reloads take effect without rebuilding the router.
pub type BackendDirectory = Arc<RwLock<HashMap<String, BackendConfig>>>;

/// Build a directory from a config snapshot.
#[must_use]
pub fn backend_directory(servers: &[BackendConfig]) -> BackendDirectory {
    Arc::new(RwLock::new(
        servers
            .iter()
            .filter(|s| s.enabled)
            .map(|s| (s.name.clone(), s.clone()))
            .collect(),
    ))
}

/// The router proper
pub struct Router {
    registry: Arc<Registry>,
    pool: Arc<TransportPool>,
    meta: Arc<MetaTools>,
    backends: BackendDirectory,
    policies: PoliciesConfig,
}

impl Router {
    /// Create a router.
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<TransportPool>,
        meta: Arc<MetaTools>,
        backends: BackendDirectory,
        policies: PoliciesConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            meta,
            backends,
            policies,
        }
    }

    /// Backends whose circuit is currently open, for the listing policy.
    #[must_use]
    pub fn open_circuit_backends(&self) -> Vec<String> {
        if self.policies.list_open_circuits {
            return Vec::new();
        }
        self.backends
            .read()
            .keys()
            .filter(|name| {
                self.pool.breaker(name).state() == crate::failsafe::CircuitState::Open
            })
            .cloned()
            .collect()
    }

    /// Execute `tools/call` for a namespaced tool id.
    pub async fn call_tool(
        &self,
        namespaced_id: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let entry = self.registry.find_tool(namespaced_id).ok_or_else(|| {
            let catalog: Vec<String> = self
                .registry
                .tool_entries()
                .into_iter()
                .map(|e| e.namespaced_id)
                .collect();
            Error::ToolNotFound {
                name: namespaced_id.to_string(),
                suggestions: naming::suggestions(
                    namespaced_id,
                    catalog.iter().map(String::as_str),
                    3,
                ),
            }
        })?;

        // Meta-tools run in-process; no transport, no breaker.
        if entry.is_local {
            let result = self.meta.call(&entry.tool.name, &arguments).await?;
            return Ok(json!({
                "content": [{
                    "type": "text",
                    "text": serde_json::to_string_pretty(&result).unwrap_or_default(),
                }],
                "isError": false
            }));
        }

        let arguments = normalize_path_arguments(&arguments);
        let payload = json!({
            "name": entry.tool.name,
            "arguments": arguments,
        });

        let result = self
            .forward(&entry.backend, methods::TOOLS_CALL, Some(payload), cancel)
            .await?;
        Ok(enforce_output_limit(
            result,
            self.policies.output_size_limit_bytes,
            namespaced_id,
        ))
    }

    /// Execute `prompts/get` for a namespaced prompt id.
    pub async fn get_prompt(
        &self,
        namespaced_id: &str,
        arguments: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let entry = self.registry.find_prompt(namespaced_id).ok_or_else(|| {
            let catalog: Vec<String> = self
                .registry
                .prompt_entries()
                .into_iter()
                .map(|e| e.namespaced_id)
                .collect();
            Error::PromptNotFound {
                name: namespaced_id.to_string(),
                suggestions: naming::suggestions(
                    namespaced_id,
                    catalog.iter().map(String::as_str),
                    3,
                ),
            }
        })?;

        let mut payload = json!({ "name": entry.prompt.name });
        if let Some(arguments) = arguments {
            payload["arguments"] = arguments;
        }

        self.forward(&entry.backend, methods::PROMPTS_GET, Some(payload), cancel)
            .await
    }

    /// Execute `resources/read` for a namespaced resource URI.
    ///
    /// The returned contents keep their original URIs; only catalog listings
    /// and update notifications speak namespaced URIs.
    pub async fn read_resource(
        &self,
        namespaced_uri: &str,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let resolution = self.resolve_resource(namespaced_uri)?;
        self.forward(
            &resolution.backend,
            methods::RESOURCES_READ,
            Some(json!({ "uri": resolution.original_uri })),
            cancel,
        )
        .await
    }

    /// Resolve a namespaced resource URI, with suggestions on miss.
    pub fn resolve_resource(&self, namespaced_uri: &str) -> Result<ResourceResolution> {
        self.registry.resolve_resource(namespaced_uri).ok_or_else(|| {
            let catalog: Vec<String> = self
                .registry
                .resource_entries()
                .into_iter()
                .map(|e| e.namespaced_uri)
                .collect();
            Error::ResourceNotFound {
                uri: namespaced_uri.to_string(),
                suggestions: naming::suggestions(
                    namespaced_uri,
                    catalog.iter().map(String::as_str),
                    3,
                ),
            }
        })
    }

    /// Forward a `resources/subscribe` to the owning backend.
    pub async fn forward_subscribe(
        &self,
        resolution: &ResourceResolution,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.forward(
            &resolution.backend,
            methods::RESOURCES_SUBSCRIBE,
            Some(json!({ "uri": resolution.original_uri })),
            cancel,
        )
        .await
        .map(|_| ())
    }

    /// Forward a `resources/unsubscribe` to the owning backend.
    pub async fn forward_unsubscribe(
        &self,
        resolution: &ResourceResolution,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.forward(
            &resolution.backend,
            methods::RESOURCES_UNSUBSCRIBE,
            Some(json!({ "uri": resolution.original_uri })),
            cancel,
        )
        .await
        .map(|_| ())
    }

    /// Look up a backend's config in the live directory.
    pub fn backend_config(&self, backend: &str) -> Result<BackendConfig> {
        self.backends
            .read()
            .get(backend)
            .cloned()
            .ok_or_else(|| Error::ServerNotFound(backend.to_string()))
    }

    /// The deadline applied to requests for a backend:
    /// `min(backend.timeout, policies.defaultTimeout)`.
    fn deadline_for(&self, config: &BackendConfig) -> Duration {
        let default = self.policies.default_timeout();
        config
            .timeout()
            .map_or(default, |backend_timeout| backend_timeout.min(default))
    }

    /// The shared backend request path: breaker admission spanning connect
    /// and request, deadline, cancellation, and error mapping.
    async fn forward(
        &self,
        backend: &str,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let config = self.backend_config(backend)?;
        let deadline = self.deadline_for(&config);

        let breaker = self.pool.breaker(backend);
        let admission = breaker.admit()?;

        let started = Instant::now();
        let outcome = async {
            let transport = self.pool.acquire(&config).await?;
            transport.request(method, params, deadline, cancel).await
        }
        .await;

        histogram!("goblin_request_duration_seconds", "backend" => backend.to_string())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(response) => {
                breaker.record_success(admission);
                counter!("goblin_requests_total", "backend" => backend.to_string(), "method" => method.to_string(), "outcome" => "ok").increment(1);
                map_peer_response(response, backend, method)
            }
            Err(Error::Cancelled) => {
                breaker.discard(admission);
                counter!("goblin_requests_total", "backend" => backend.to_string(), "method" => method.to_string(), "outcome" => "cancelled").increment(1);
                Err(Error::Cancelled)
            }
            Err(e) => {
                if e.is_infrastructural() {
                    breaker.record_failure(admission, &e.to_string());
                } else {
                    breaker.record_success(admission);
                }
                counter!("goblin_requests_total", "backend" => backend.to_string(), "method" => method.to_string(), "outcome" => "error").increment(1);
                debug!(backend = %backend, method = %method, error = %e, "Backend request failed");
                Err(e)
            }
        }
    }
}

/// Turn a peer response into a result value or a preserved peer error.
fn map_peer_response(response: JsonRpcResponse, backend: &str, method: &str) -> Result<Value> {
    if let Some(err) = response.error {
        debug!(backend = %backend, method = %method, code = err.code, "Peer returned error");
        return Err(Error::Peer {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    Ok(response.result.unwrap_or(Value::Null))
}

/// Truncate oversized text contents of a `tools/call` result.
///
/// A chatty backend degrades instead of failing: text items are cut to fit
/// the byte budget and marked, binary items pass through untouched.
fn enforce_output_limit(mut result: Value, limit_bytes: usize, tool: &str) -> Value {
    if limit_bytes == 0 {
        return result;
    }
    let serialized = result.to_string();
    if serialized.len() <= limit_bytes {
        return result;
    }

    let over_by = serialized.len() - limit_bytes;
    warn!(tool = %tool, size = serialized.len(), limit = limit_bytes, "Tool result over size limit, truncating");

    if let Some(items) = result.get_mut("content").and_then(Value::as_array_mut) {
        let mut remaining_cut = over_by;
        for item in items.iter_mut() {
            if remaining_cut == 0 {
                break;
            }
            if let Some(text) = item.get("text").and_then(Value::as_str) {
                let keep = text.len().saturating_sub(remaining_cut);
                let boundary = floor_char_boundary(text, keep);
                let cut = text.len() - boundary;
                let truncated =
                    format!("{}… [truncated {} bytes]", &text[..boundary], cut);
                item["text"] = Value::String(truncated);
                remaining_cut = remaining_cut.saturating_sub(cut);
            }
        }
    }
    result
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_error_is_preserved() {
        let response = JsonRpcResponse::error_with_data(
            Some(crate::protocol::RequestId::Number(1)),
            -32050,
            "tool blew up",
            json!({"hint": "retry later"}),
        );
        let err = map_peer_response(response, "alpha", "tools/call").unwrap_err();
        match err {
            Error::Peer { code, message, data } => {
                assert_eq!(code, -32050);
                assert_eq!(message, "tool blew up");
                assert_eq!(data.unwrap()["hint"], "retry later");
            }
            other => panic!("expected Peer, got {other}"),
        }
    }

    #[test]
    fn success_result_passes_through_unchanged() {
        let response = JsonRpcResponse::success(
            crate::protocol::RequestId::Number(1),
            json!({"content": [{"type": "text", "text": "hi"}]}),
        );
        let value = map_peer_response(response, "alpha", "tools/call").unwrap();
        assert_eq!(value["content"][0]["text"], "hi");
    }

    #[test]
    fn small_results_are_not_truncated() {
        let result = json!({"content": [{"type": "text", "text": "short"}]});
        let out = enforce_output_limit(result.clone(), 1024, "alpha_echo");
        assert_eq!(out, result);
    }

    #[test]
    fn oversized_text_is_truncated_with_marker() {
        let big = "x".repeat(4096);
        let result = json!({"content": [{"type": "text", "text": big}]});
        let out = enforce_output_limit(result, 512, "alpha_echo");
        let text = out["content"][0]["text"].as_str().unwrap();
        assert!(text.len() < 4096);
        assert!(text.contains("[truncated"));
    }

    #[test]
    fn zero_limit_disables_truncation() {
        let big = "x".repeat(4096);
        let result = json!({"content": [{"type": "text", "text": big.clone()}]});
        let out = enforce_output_limit(result, 0, "alpha_echo");
        assert_eq!(out["content"][0]["text"], big);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo wörld ".repeat(100);
        let result = json!({"content": [{"type": "text", "text": text}]});
        // Any limit must produce valid UTF-8 output (serde would panic
        // otherwise when re-serializing).
        let out = enforce_output_limit(result, 300, "alpha_echo");
        assert!(out["content"][0]["text"].as_str().is_some());
    }

    #[test]
    fn directory_excludes_disabled_backends() {
        let enabled = BackendConfig {
            name: "alpha".to_string(),
            transport: crate::config::TransportKind::Stdio,
            command: Some("a".to_string()),
            args: vec![],
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            enabled: true,
            mode: crate::config::BackendMode::Stateful,
            timeout_ms: None,
        };
        let mut disabled = enabled.clone();
        disabled.name = "beta".to_string();
        disabled.enabled = false;

        let directory = backend_directory(&[enabled, disabled]);
        assert!(directory.read().contains_key("alpha"));
        assert!(!directory.read().contains_key("beta"));
    }
}
