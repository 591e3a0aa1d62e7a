//! End-to-end gateway behavior over mock backends: aggregation, forwarding,
//! meta-tool precedence, path normalization, and timeout handling.

mod common;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{Harness, MockBackend};
use goblin::config::{FailsafeConfig, PoliciesConfig};
use goblin::error::rpc_codes;
use goblin::protocol::methods;

#[tokio::test]
async fn aggregates_tools_from_multiple_backends() {
    let alpha = MockBackend::new();
    alpha.add_tool("echo", "Echo a message");
    let beta = MockBackend::new();
    beta.add_tool("echo", "Echo a message");

    let harness = Harness::build(vec![("alpha", alpha), ("beta", beta)]).await;
    harness.connect_client("client-a").await;

    let response = harness
        .request("client-a", "1", methods::TOOLS_LIST, json!({}))
        .await;
    let tools = response.result.unwrap()["tools"].clone();
    let names: Vec<&str> = tools
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .filter(|n| n.starts_with("alpha_") || n.starts_with("beta_"))
        .collect();

    assert_eq!(names, vec!["alpha_echo", "beta_echo"]);
}

#[tokio::test]
async fn tool_call_forwards_original_name_and_arguments() {
    let alpha = MockBackend::new();
    alpha.add_tool("echo", "Echo a message");

    let harness = Harness::build(vec![("alpha", alpha)]).await;
    harness.connect_client("client-a").await;

    let response = harness
        .request(
            "client-a",
            "2",
            methods::TOOLS_CALL,
            json!({"name": "alpha_echo", "arguments": {"message": "hi"}}),
        )
        .await;

    // The backend saw the un-namespaced name with arguments untouched.
    let requests = harness.mocks["alpha"].requests.lock().clone();
    let (method, params) = requests
        .iter()
        .find(|(m, _)| m == methods::TOOLS_CALL)
        .expect("call reached the backend");
    assert_eq!(method, methods::TOOLS_CALL);
    assert_eq!(params["name"], "echo");
    assert_eq!(params["arguments"], json!({"message": "hi"}));

    // The result came back unchanged.
    let result = response.result.unwrap();
    assert_eq!(result["content"][0]["text"], "hi");
}

#[tokio::test]
async fn unknown_tool_fails_with_suggestions() {
    let alpha = MockBackend::new();
    alpha.add_tool("echo", "Echo a message");

    let harness = Harness::build(vec![("alpha", alpha)]).await;
    harness.connect_client("client-a").await;

    let response = harness
        .request(
            "client-a",
            "3",
            methods::TOOLS_CALL,
            json!({"name": "alpha_ecko", "arguments": {}}),
        )
        .await;

    let error = response.error.unwrap();
    assert_eq!(error.code, rpc_codes::TOOL_NOT_FOUND);
    let suggestions = error.data.unwrap()["suggestions"].clone();
    assert!(
        suggestions
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s == "alpha_echo")
    );
}

#[tokio::test]
async fn meta_tools_never_touch_a_transport() {
    let alpha = MockBackend::new();
    alpha.add_tool("echo", "Echo a message");

    let harness = Harness::build(vec![("alpha", alpha)]).await;
    harness.connect_client("client-a").await;
    let calls_after_sync = harness.mocks["alpha"].requests.lock().len();

    for tool in ["health", "catalog_list", "describe_tool"] {
        let arguments = if tool == "describe_tool" {
            json!({"name": "alpha_echo"})
        } else {
            json!({})
        };
        let response = harness
            .request(
                "client-a",
                "4",
                methods::TOOLS_CALL,
                json!({"name": tool, "arguments": arguments}),
            )
            .await;
        assert!(response.error.is_none(), "{tool} failed: {response:?}");
    }

    // No backend request beyond the initial sync traffic.
    assert_eq!(harness.mocks["alpha"].requests.lock().len(), calls_after_sync);
}

#[tokio::test]
async fn windows_paths_are_normalized_and_urls_left_alone() {
    let alpha = MockBackend::new();
    alpha.add_tool("open", "Open a file");

    let harness = Harness::build(vec![("alpha", alpha)]).await;
    harness.connect_client("client-a").await;

    harness
        .request(
            "client-a",
            "5",
            methods::TOOLS_CALL,
            json!({
                "name": "alpha_open",
                "arguments": {"path": "C:\\Users\\name", "url": "http://example.com"}
            }),
        )
        .await;

    let requests = harness.mocks["alpha"].requests.lock().clone();
    let (_, params) = requests
        .iter()
        .find(|(m, _)| m == methods::TOOLS_CALL)
        .unwrap();
    assert_eq!(params["arguments"]["path"], "C:/Users/name");
    assert_eq!(params["arguments"]["url"], "http://example.com");
}

#[tokio::test]
async fn stalled_backend_surfaces_request_timeout() {
    let alpha = MockBackend::new();
    alpha.add_tool("echo", "Echo a message");

    let policies = PoliciesConfig {
        default_timeout_ms: 200,
        ..Default::default()
    };
    let harness =
        Harness::build_with(vec![("alpha", alpha)], FailsafeConfig::default(), policies).await;
    harness.connect_client("client-a").await;

    harness.mocks["alpha"].stall.store(true, Ordering::SeqCst);

    let started = Instant::now();
    let response = harness
        .request(
            "client-a",
            "6",
            methods::TOOLS_CALL,
            json!({"name": "alpha_echo", "arguments": {}}),
        )
        .await;
    let elapsed = started.elapsed();

    let error = response.error.unwrap();
    assert_eq!(error.code, rpc_codes::REQUEST_TIMEOUT);
    assert!(
        elapsed < Duration::from_millis(600),
        "timeout must fire near the deadline, took {elapsed:?}"
    );
    assert_eq!(error.data.unwrap()["timeoutMs"], 200);
}

#[tokio::test]
async fn requests_before_initialize_are_rejected() {
    let harness = Harness::build(vec![]).await;
    let _rx = harness.server.hub().register("client-a");

    let response = harness
        .request("client-a", "1", methods::TOOLS_LIST, json!({}))
        .await;
    assert_eq!(response.error.unwrap().code, rpc_codes::INVALID_REQUEST);

    // Ping is allowed pre-initialize.
    let response = harness
        .request("client-a", "2", methods::PING, json!({}))
        .await;
    assert!(response.error.is_none());
}

#[tokio::test]
async fn listings_are_idempotent_without_mutation() {
    let alpha = MockBackend::new();
    alpha.add_tool("echo", "Echo a message");
    alpha.add_tool("search", "Search things");

    let harness = Harness::build(vec![("alpha", alpha)]).await;
    harness.connect_client("client-a").await;

    let first = harness
        .request("client-a", "1", methods::TOOLS_LIST, json!({}))
        .await;
    let second = harness
        .request("client-a", "2", methods::TOOLS_LIST, json!({}))
        .await;

    assert_eq!(
        serde_json::to_string(&first.result).unwrap(),
        serde_json::to_string(&second.result).unwrap()
    );
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let harness = Harness::build(vec![]).await;
    harness.connect_client("client-a").await;

    let response = harness
        .request("client-a", "9", "tools/destroy", json!({}))
        .await;
    assert_eq!(response.error.unwrap().code, rpc_codes::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn resources_read_forwards_original_uri() {
    let fs = MockBackend::new();
    fs.add_resource("file:///a.txt", "a");

    let harness = Harness::build(vec![("fs", fs)]).await;
    harness.connect_client("client-a").await;

    let response = harness
        .request(
            "client-a",
            "10",
            methods::RESOURCES_READ,
            json!({"uri": "fs_file_a.txt"}),
        )
        .await;

    let requests = harness.mocks["fs"].requests.lock().clone();
    let (_, params) = requests
        .iter()
        .find(|(m, _)| m == methods::RESOURCES_READ)
        .unwrap();
    // The backend sees the original URI; contents keep it too.
    assert_eq!(params["uri"], "file:///a.txt");
    let result = response.result.unwrap();
    assert_eq!(result["contents"][0]["uri"], "file:///a.txt");
}
