//! Hot add/remove of backends while clients are connected.

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{Harness, MockBackend, backend_config, drain_notifications};
use goblin::error::rpc_codes;
use goblin::protocol::methods;

#[tokio::test]
async fn added_backend_appears_with_list_changed_notification() {
    let alpha = MockBackend::new();
    alpha.add_tool("echo", "Echo");

    let harness = Harness::build(vec![("alpha", alpha)]).await;
    let mut rx = harness.connect_client("client-a").await;
    // Absorb anything from startup.
    drain_notifications(&mut rx).await;

    // A new backend joins at runtime.
    let gamma = MockBackend::new();
    gamma.add_tool("shine", "Shine a light");
    harness.factory.insert("gamma", gamma);
    harness
        .directory
        .write()
        .insert("gamma".to_string(), backend_config("gamma"));
    harness.sync("gamma").await;

    let notifications = drain_notifications(&mut rx).await;
    assert!(
        notifications
            .iter()
            .any(|n| n.method == methods::NOTIF_TOOLS_CHANGED),
        "client must observe tools/list_changed after the add"
    );

    let response = harness
        .request("client-a", "1", methods::TOOLS_LIST, json!({}))
        .await;
    let tools = response.result.unwrap()["tools"].clone();
    assert!(
        tools
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t["name"] == "gamma_shine")
    );
}

#[tokio::test]
async fn removed_backend_disappears_and_calls_fail() {
    let alpha = MockBackend::new();
    alpha.add_tool("echo", "Echo");
    let gamma = MockBackend::new();
    gamma.add_tool("shine", "Shine a light");

    let harness = Harness::build(vec![("alpha", alpha), ("gamma", gamma)]).await;
    let mut rx = harness.connect_client("client-a").await;
    drain_notifications(&mut rx).await;

    // Remove gamma: directory, catalog, subscriptions, transport.
    harness.directory.write().remove("gamma");
    harness.registry.remove_backend("gamma");
    harness.subscriptions.remove_backend("gamma");
    harness.pool.release("gamma").await;

    let notifications = drain_notifications(&mut rx).await;
    assert!(
        notifications
            .iter()
            .any(|n| n.method == methods::NOTIF_TOOLS_CHANGED)
    );

    let response = harness
        .request("client-a", "1", methods::TOOLS_LIST, json!({}))
        .await;
    let tools = response.result.unwrap()["tools"].clone();
    assert!(
        !tools
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t["name"].as_str().unwrap().starts_with("gamma_"))
    );

    // Stale calls fail with a lookup error, never a hang.
    let response = harness
        .request(
            "client-a",
            "2",
            methods::TOOLS_CALL,
            json!({"name": "gamma_shine", "arguments": {}}),
        )
        .await;
    assert_eq!(response.error.unwrap().code, rpc_codes::TOOL_NOT_FOUND);
}

#[tokio::test]
async fn list_changed_from_backend_triggers_resync() {
    let alpha = MockBackend::with_full_capabilities();
    alpha.add_tool("echo", "Echo");

    let harness = Harness::build(vec![("alpha", alpha)]).await;
    let mut rx = harness.connect_client("client-a").await;
    drain_notifications(&mut rx).await;

    // Backend grows a tool and announces the change.
    harness.mocks["alpha"].add_tool("extra", "A new tool");
    harness.mocks["alpha"].emit(methods::NOTIF_TOOLS_CHANGED, json!({}));

    let notifications = drain_notifications(&mut rx).await;
    assert!(
        notifications
            .iter()
            .any(|n| n.method == methods::NOTIF_TOOLS_CHANGED),
        "re-sync must surface a client-facing list_changed"
    );

    let response = harness
        .request("client-a", "1", methods::TOOLS_LIST, json!({}))
        .await;
    let tools = response.result.unwrap()["tools"].clone();
    assert!(
        tools
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t["name"] == "alpha_extra")
    );
}
