//! Catalog-change bridging
//!
//! Consumes registry change events and forwards `list_changed` notifications
//! to every ready client. Bursts are coalesced: a multi-step sync producing
//! several events per category results in one notification per category once
//! the burst settles.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ClientHub;
use crate::protocol::{JsonRpcNotification, methods};
use crate::registry::{Category, Registry};

/// Quiet window before coalesced notifications are flushed.
const DEBOUNCE: Duration = Duration::from_millis(150);

/// Spawn the bridge task. It runs until `shutdown` fires, flushing any
/// pending notifications on the way out.
pub fn spawn_change_bridge(
    registry: &Registry,
    hub: Arc<ClientHub>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut events = registry.subscribe_changes();

    tokio::spawn(async move {
        let mut pending: HashSet<Category> = HashSet::new();
        let mut deadline: Option<tokio::time::Instant> = None;

        loop {
            let flush_at = deadline.unwrap_or_else(|| {
                // No pending events; park far in the future.
                tokio::time::Instant::now() + Duration::from_secs(3600)
            });

            tokio::select! {
                event = events.recv() => match event {
                    Ok(change) => {
                        pending.insert(change.category);
                        deadline.get_or_insert_with(|| tokio::time::Instant::now() + DEBOUNCE);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // Overwhelmed: assume everything changed.
                        debug!(missed, "Change event stream lagged, flushing all categories");
                        pending.extend([
                            Category::Tools,
                            Category::Prompts,
                            Category::Resources,
                            Category::ResourceTemplates,
                        ]);
                        deadline.get_or_insert_with(|| tokio::time::Instant::now() + DEBOUNCE);
                    }
                    Err(RecvError::Closed) => {
                        flush(&hub, &mut pending);
                        return;
                    }
                },
                () = tokio::time::sleep_until(flush_at), if deadline.is_some() => {
                    flush(&hub, &mut pending);
                    deadline = None;
                }
                () = shutdown.cancelled() => {
                    flush(&hub, &mut pending);
                    return;
                }
            }
        }
    })
}

fn flush(hub: &ClientHub, pending: &mut HashSet<Category>) {
    if pending.is_empty() {
        return;
    }

    let mut wire_methods: Vec<&str> = Vec::new();
    if pending.contains(&Category::Tools) {
        wire_methods.push(methods::NOTIF_TOOLS_CHANGED);
    }
    if pending.contains(&Category::Prompts) {
        wire_methods.push(methods::NOTIF_PROMPTS_CHANGED);
    }
    // Template changes surface as resource list changes on the wire.
    if pending.contains(&Category::Resources) || pending.contains(&Category::ResourceTemplates) {
        wire_methods.push(methods::NOTIF_RESOURCES_CHANGED);
    }
    pending.clear();

    for method in wire_methods {
        debug!(method = %method, "Broadcasting list_changed");
        hub.broadcast(&JsonRpcNotification::new(method, None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Tool;
    use crate::server::ClientState;
    use serde_json::json;

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            title: None,
            description: None,
            input_schema: json!({"type": "object"}),
            output_schema: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_changes_coalesces_to_one_notification() {
        let registry = Registry::new("goblin");
        let hub = Arc::new(ClientHub::new());
        let mut rx = hub.register("client-a");
        hub.set_state("client-a", ClientState::Ready);

        let shutdown = CancellationToken::new();
        let _bridge = spawn_change_bridge(&registry, Arc::clone(&hub), shutdown.clone());
        tokio::task::yield_now().await;

        // Three mutations in quick succession.
        registry.apply_tools("alpha", vec![tool("one")]);
        registry.apply_tools("alpha", vec![tool("one"), tool("two")]);
        registry.apply_tools("alpha", vec![tool("two")]);

        tokio::time::sleep(Duration::from_millis(400)).await;

        let first = rx.try_recv().expect("one notification after the burst");
        assert_eq!(first.method, methods::NOTIF_TOOLS_CHANGED);
        assert!(rx.try_recv().is_err(), "burst must coalesce");

        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn template_changes_surface_as_resource_list_changed() {
        let registry = Registry::new("goblin");
        let hub = Arc::new(ClientHub::new());
        let mut rx = hub.register("client-a");
        hub.set_state("client-a", ClientState::Ready);

        let shutdown = CancellationToken::new();
        let _bridge = spawn_change_bridge(&registry, Arc::clone(&hub), shutdown.clone());
        tokio::task::yield_now().await;

        registry.apply_templates(
            "fs",
            vec![crate::protocol::ResourceTemplate {
                uri_template: "file:///{path}".to_string(),
                name: "files".to_string(),
                title: None,
                description: None,
                mime_type: None,
            }],
        );

        tokio::time::sleep(Duration::from_millis(400)).await;

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.method, methods::NOTIF_RESOURCES_CHANGED);

        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_categories_notify_separately() {
        let registry = Registry::new("goblin");
        let hub = Arc::new(ClientHub::new());
        let mut rx = hub.register("client-a");
        hub.set_state("client-a", ClientState::Ready);

        let shutdown = CancellationToken::new();
        let _bridge = spawn_change_bridge(&registry, Arc::clone(&hub), shutdown.clone());
        tokio::task::yield_now().await;

        registry.apply_tools("alpha", vec![tool("one")]);
        registry.apply_prompts(
            "alpha",
            vec![crate::protocol::Prompt {
                name: "greet".to_string(),
                title: None,
                description: None,
                arguments: vec![],
            }],
        );

        tokio::time::sleep(Duration::from_millis(400)).await;

        let methods_seen: HashSet<String> = [
            rx.try_recv().unwrap().method,
            rx.try_recv().unwrap().method,
        ]
        .into_iter()
        .collect();
        assert!(methods_seen.contains(methods::NOTIF_TOOLS_CHANGED));
        assert!(methods_seen.contains(methods::NOTIF_PROMPTS_CHANGED));

        shutdown.cancel();
    }
}
