//! Per-backend catalog synchronization
//!
//! Fetches a backend's full tool/prompt/resource/template lists, following
//! the peer's continuation cursor to exhaustion, then reconciles the result
//! with the registry in one transaction per category. A peer that answers
//! "method not found" for a category simply has none.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Category, Registry};
use crate::error::rpc_codes;
use crate::protocol::{
    Prompt, PromptsListResult, Resource, ResourceTemplate, ResourcesListResult,
    ResourcesTemplatesListResult, Tool, ToolsListResult, methods,
};
use crate::transport::Transport;
use crate::{Error, Result};

/// Complete listings gathered from one backend.
#[derive(Debug, Default, Clone)]
pub struct SyncLists {
    /// Every tool the backend reported
    pub tools: Vec<Tool>,
    /// Every prompt the backend reported
    pub prompts: Vec<Prompt>,
    /// Every resource the backend reported
    pub resources: Vec<Resource>,
    /// Every resource template the backend reported
    pub templates: Vec<ResourceTemplate>,
}

/// Fetch every category from the backend and reconcile the registry.
pub async fn sync_backend(
    registry: &Registry,
    backend: &str,
    transport: &Arc<dyn Transport>,
    timeout: Duration,
) -> Result<()> {
    if let Some(capabilities) = transport.capabilities() {
        registry.set_backend_capabilities(backend, capabilities);
    }

    let lists = SyncLists {
        tools: fetch_tools(transport, timeout).await?,
        prompts: fetch_prompts(transport, timeout).await?,
        resources: fetch_resources(transport, timeout).await?,
        templates: fetch_templates(transport, timeout).await?,
    };

    info!(
        backend = %backend,
        tools = lists.tools.len(),
        prompts = lists.prompts.len(),
        resources = lists.resources.len(),
        templates = lists.templates.len(),
        "Backend synced"
    );

    registry.apply_tools(backend, lists.tools);
    registry.apply_prompts(backend, lists.prompts);
    registry.apply_resources(backend, lists.resources);
    registry.apply_templates(backend, lists.templates);
    Ok(())
}

/// Re-fetch and reconcile a single category (list-changed handling).
pub async fn sync_category(
    registry: &Registry,
    backend: &str,
    transport: &Arc<dyn Transport>,
    timeout: Duration,
    category: Category,
) -> Result<()> {
    debug!(backend = %backend, category = ?category, "Re-syncing category");
    match category {
        Category::Tools => {
            let tools = fetch_tools(transport, timeout).await?;
            registry.apply_tools(backend, tools);
        }
        Category::Prompts => {
            let prompts = fetch_prompts(transport, timeout).await?;
            registry.apply_prompts(backend, prompts);
        }
        Category::Resources => {
            let resources = fetch_resources(transport, timeout).await?;
            registry.apply_resources(backend, resources);
        }
        Category::ResourceTemplates => {
            let templates = fetch_templates(transport, timeout).await?;
            registry.apply_templates(backend, templates);
        }
    }
    Ok(())
}

async fn fetch_tools(transport: &Arc<dyn Transport>, timeout: Duration) -> Result<Vec<Tool>> {
    fetch_pages(transport, methods::TOOLS_LIST, timeout, |result| {
        let page: ToolsListResult = serde_json::from_value(result)?;
        Ok((page.tools, page.next_cursor))
    })
    .await
}

async fn fetch_prompts(transport: &Arc<dyn Transport>, timeout: Duration) -> Result<Vec<Prompt>> {
    fetch_pages(transport, methods::PROMPTS_LIST, timeout, |result| {
        let page: PromptsListResult = serde_json::from_value(result)?;
        Ok((page.prompts, page.next_cursor))
    })
    .await
}

async fn fetch_resources(
    transport: &Arc<dyn Transport>,
    timeout: Duration,
) -> Result<Vec<Resource>> {
    fetch_pages(transport, methods::RESOURCES_LIST, timeout, |result| {
        let page: ResourcesListResult = serde_json::from_value(result)?;
        Ok((page.resources, page.next_cursor))
    })
    .await
}

async fn fetch_templates(
    transport: &Arc<dyn Transport>,
    timeout: Duration,
) -> Result<Vec<ResourceTemplate>> {
    fetch_pages(
        transport,
        methods::RESOURCES_TEMPLATES_LIST,
        timeout,
        |result| {
            let page: ResourcesTemplatesListResult = serde_json::from_value(result)?;
            Ok((page.resource_templates, page.next_cursor))
        },
    )
    .await
}

/// Follow the peer's continuation cursor until exhausted.
///
/// The cursor is opaque; the only interpretation applied is that an
/// unchanged cursor means the peer is stuck, which aborts rather than loops.
async fn fetch_pages<T, F>(
    transport: &Arc<dyn Transport>,
    method: &str,
    timeout: Duration,
    extract: F,
) -> Result<Vec<T>>
where
    F: Fn(Value) -> Result<(Vec<T>, Option<String>)>,
{
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let cancel = CancellationToken::new();
        let response = transport.request(method, params, timeout, &cancel).await?;

        if let Some(err) = response.error {
            if err.code == rpc_codes::METHOD_NOT_FOUND {
                // Category unsupported by this backend: treated as empty.
                return Ok(Vec::new());
            }
            return Err(Error::Peer {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }

        let result = response.result.unwrap_or_else(|| json!({}));
        let (page, next_cursor) = extract(result)?;
        items.extend(page);

        match next_cursor {
            None => return Ok(items),
            Some(next) if cursor.as_ref() == Some(&next) => {
                return Err(Error::Internal(format!(
                    "{method} pagination cursor did not advance"
                )));
            }
            Some(next) => cursor = Some(next),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcResponse, RequestId, ServerCapabilities};
    use crate::transport::NotificationHandler;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    /// Scripted transport: maps method (+cursor) to canned responses.
    #[derive(Debug)]
    struct ScriptedTransport {
        responses: Mutex<HashMap<String, Vec<Value>>>,
    }

    impl ScriptedTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(HashMap::new()),
            })
        }

        fn script(&self, method: &str, pages: Vec<Value>) {
            self.responses.lock().insert(method.to_string(), pages);
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn request(
            &self,
            method: &str,
            _params: Option<Value>,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<JsonRpcResponse> {
            let mut responses = self.responses.lock();
            match responses.get_mut(method) {
                Some(pages) if !pages.is_empty() => {
                    let page = pages.remove(0);
                    Ok(JsonRpcResponse::success(RequestId::Number(1), page))
                }
                _ => Ok(JsonRpcResponse::error(
                    Some(RequestId::Number(1)),
                    rpc_codes::METHOD_NOT_FOUND,
                    "Method not found",
                )),
            }
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
            Ok(())
        }

        fn set_notification_handler(&self, _handler: NotificationHandler) {}

        fn capabilities(&self) -> Option<ServerCapabilities> {
            Some(ServerCapabilities::default())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn tool_page(names: &[&str], next: Option<&str>) -> Value {
        let tools: Vec<Value> = names
            .iter()
            .map(|n| json!({"name": n, "inputSchema": {"type": "object"}}))
            .collect();
        match next {
            Some(cursor) => json!({"tools": tools, "nextCursor": cursor}),
            None => json!({"tools": tools}),
        }
    }

    #[tokio::test]
    async fn sync_follows_pagination_to_completion() {
        let transport = ScriptedTransport::new();
        transport.script(
            methods::TOOLS_LIST,
            vec![
                tool_page(&["one", "two"], Some("page2")),
                tool_page(&["three"], None),
            ],
        );

        let registry = Registry::new("goblin");
        let dyn_transport: Arc<dyn Transport> = transport;
        sync_backend(&registry, "alpha", &dyn_transport, Duration::from_secs(5))
            .await
            .unwrap();

        let names: Vec<String> = registry
            .list_tools(&[])
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["alpha_one", "alpha_three", "alpha_two"]);
    }

    #[tokio::test]
    async fn method_not_found_treated_as_empty_category() {
        let transport = ScriptedTransport::new();
        transport.script(methods::TOOLS_LIST, vec![tool_page(&["echo"], None)]);
        // prompts/resources/templates unscripted: peer answers -32601.

        let registry = Registry::new("goblin");
        let dyn_transport: Arc<dyn Transport> = transport;
        sync_backend(&registry, "alpha", &dyn_transport, Duration::from_secs(5))
            .await
            .unwrap();

        let (tools, prompts, resources, templates) = registry.counts();
        assert_eq!((tools, prompts, resources, templates), (1, 0, 0, 0));
    }

    #[tokio::test]
    async fn stuck_cursor_aborts_instead_of_looping() {
        let transport = ScriptedTransport::new();
        transport.script(
            methods::TOOLS_LIST,
            vec![
                tool_page(&["one"], Some("same")),
                tool_page(&["one"], Some("same")),
            ],
        );

        let registry = Registry::new("goblin");
        let dyn_transport: Arc<dyn Transport> = transport;
        let err = sync_backend(&registry, "alpha", &dyn_transport, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn sync_category_refreshes_only_that_category() {
        let transport = ScriptedTransport::new();
        transport.script(methods::TOOLS_LIST, vec![tool_page(&["echo"], None)]);

        let registry = Registry::new("goblin");
        registry.apply_prompts(
            "alpha",
            vec![Prompt {
                name: "greet".to_string(),
                title: None,
                description: None,
                arguments: vec![],
            }],
        );

        let dyn_transport: Arc<dyn Transport> = transport;
        sync_category(
            &registry,
            "alpha",
            &dyn_transport,
            Duration::from_secs(5),
            Category::Tools,
        )
        .await
        .unwrap();

        let (tools, prompts, _, _) = registry.counts();
        assert_eq!(tools, 1);
        assert_eq!(prompts, 1, "prompts untouched by a tools re-sync");
    }

    #[tokio::test]
    async fn peer_error_other_than_method_not_found_propagates() {
        let transport = ScriptedTransport::new();
        transport.responses.lock().insert(
            methods::TOOLS_LIST.to_string(),
            vec![],
        );
        // Empty scripted list yields method-not-found; script a real error instead.
        #[derive(Debug)]
        struct ErrTransport;
        #[async_trait]
        impl Transport for ErrTransport {
            async fn connect(&self) -> Result<()> {
                Ok(())
            }
            async fn request(
                &self,
                _method: &str,
                _params: Option<Value>,
                _timeout: Duration,
                _cancel: &CancellationToken,
            ) -> Result<JsonRpcResponse> {
                Ok(JsonRpcResponse::error(
                    Some(RequestId::Number(1)),
                    -32000,
                    "backend on fire",
                ))
            }
            async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
                Ok(())
            }
            fn set_notification_handler(&self, _handler: NotificationHandler) {}
            fn capabilities(&self) -> Option<ServerCapabilities> {
                None
            }
            fn is_connected(&self) -> bool {
                true
            }
            async fn close(&self) -> Result<()> {
                Ok(())
            }
        }

        let registry = Registry::new("goblin");
        let dyn_transport: Arc<dyn Transport> = Arc::new(ErrTransport);
        let err = sync_backend(&registry, "alpha", &dyn_transport, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Peer { code: -32000, .. }));
    }
}
