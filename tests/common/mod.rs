//! Shared test harness: programmable in-process backends behind the real
//! pool, registry, router, and gateway server. No child processes, no
//! sockets.

// Each integration binary compiles this module separately and uses a
// different slice of it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use goblin::Error;
use goblin::config::{
    BackendConfig, BackendMode, Config, FailsafeConfig, PoliciesConfig, TransportKind,
};
use goblin::daemon::wire_backend_notifications;
use goblin::meta::MetaTools;
use goblin::pool::TransportPool;
use goblin::protocol::{
    JsonRpcNotification, JsonRpcResponse, Prompt, RequestId, Resource, ResourceTemplate,
    ServerCapabilities, Tool, methods,
};
use goblin::registry::{Registry, sync_backend};
use goblin::router::{BackendDirectory, Router, backend_directory};
use goblin::server::{ClientHub, GatewayServer, spawn_change_bridge};
use goblin::subscriptions::SubscriptionManager;
use goblin::transport::{NotificationHandler, Transport, TransportFactory};

/// Programmable backend state shared by every transport instance the
/// factory mints for it.
#[derive(Default)]
pub struct MockBackend {
    pub tools: Mutex<Vec<Tool>>,
    pub prompts: Mutex<Vec<Prompt>>,
    pub resources: Mutex<Vec<Resource>>,
    pub templates: Mutex<Vec<ResourceTemplate>>,
    pub capabilities: Mutex<ServerCapabilities>,
    handler: Mutex<Option<NotificationHandler>>,
    pub connect_count: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
    pub unsubscribe_calls: AtomicUsize,
    /// Recorded (method, params) of every request that reached the backend.
    pub requests: Mutex<Vec<(String, Value)>>,
    /// Never answer requests; callers hit their deadline.
    pub stall: AtomicBool,
    /// Fail every request with a transport error.
    pub fail_requests: AtomicBool,
    /// Fail connect attempts.
    pub fail_connect: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        let backend = Arc::new(Self::default());
        *backend.capabilities.lock() = ServerCapabilities::default();
        backend
    }

    /// A backend advertising full change-notification and subscribe support.
    pub fn with_full_capabilities() -> Arc<Self> {
        let backend = Self::new();
        *backend.capabilities.lock() = serde_json::from_value(json!({
            "tools": {"listChanged": true},
            "prompts": {"listChanged": true},
            "resources": {"subscribe": true, "listChanged": true}
        }))
        .unwrap();
        backend
    }

    pub fn add_tool(&self, name: &str, description: &str) {
        self.tools.lock().push(Tool {
            name: name.to_string(),
            title: None,
            description: Some(description.to_string()),
            input_schema: json!({"type": "object"}),
            output_schema: None,
        });
    }

    pub fn add_resource(&self, uri: &str, name: &str) {
        self.resources.lock().push(Resource {
            uri: uri.to_string(),
            name: name.to_string(),
            title: None,
            description: None,
            mime_type: Some("text/plain".to_string()),
            size: None,
        });
    }

    /// Push a notification into the gateway, as the live backend would.
    pub fn emit(&self, method: &str, params: Value) {
        let handler = self.handler.lock();
        if let Some(handler) = handler.as_ref() {
            handler(JsonRpcNotification::new(method, Some(params)));
        }
    }
}

struct MockTransport {
    name: String,
    backend: Arc<MockBackend>,
    connected: AtomicBool,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport").field("name", &self.name).finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> goblin::Result<()> {
        self.backend.connect_count.fetch_add(1, Ordering::SeqCst);
        if self.backend.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Connection("mock connect refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> goblin::Result<JsonRpcResponse> {
        if self.backend.stall.load(Ordering::SeqCst) {
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(timeout) => {
                    return Err(Error::RequestTimeout {
                        backend: self.name.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
        if self.backend.fail_requests.load(Ordering::SeqCst) {
            return Err(Error::Connection("mock transport failure".to_string()));
        }

        let params = params.unwrap_or_else(|| json!({}));
        self.backend
            .requests
            .lock()
            .push((method.to_string(), params.clone()));

        let id = RequestId::Number(1);
        let result = match method {
            methods::TOOLS_LIST => json!({"tools": self.backend.tools.lock().clone()}),
            methods::PROMPTS_LIST => json!({"prompts": self.backend.prompts.lock().clone()}),
            methods::RESOURCES_LIST => {
                json!({"resources": self.backend.resources.lock().clone()})
            }
            methods::RESOURCES_TEMPLATES_LIST => {
                json!({"resourceTemplates": self.backend.templates.lock().clone()})
            }
            methods::TOOLS_CALL => {
                let text = params["arguments"]["message"]
                    .as_str()
                    .unwrap_or("ok")
                    .to_string();
                json!({"content": [{"type": "text", "text": text}], "isError": false})
            }
            methods::PROMPTS_GET => json!({"messages": []}),
            methods::RESOURCES_READ => json!({
                "contents": [{"uri": params["uri"], "mimeType": "text/plain", "text": "data"}]
            }),
            methods::RESOURCES_SUBSCRIBE => {
                self.backend.subscribe_calls.fetch_add(1, Ordering::SeqCst);
                json!({})
            }
            methods::RESOURCES_UNSUBSCRIBE => {
                self.backend.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
                json!({})
            }
            _ => json!({}),
        };
        Ok(JsonRpcResponse::success(id, result))
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> goblin::Result<()> {
        Ok(())
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.backend.handler.lock() = Some(handler);
    }

    fn capabilities(&self) -> Option<ServerCapabilities> {
        Some(self.backend.capabilities.lock().clone())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> goblin::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockFactory {
    backends: Mutex<HashMap<String, Arc<MockBackend>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            backends: Mutex::new(HashMap::new()),
        })
    }

    pub fn insert(&self, name: &str, backend: Arc<MockBackend>) {
        self.backends.lock().insert(name.to_string(), backend);
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, config: &BackendConfig) -> goblin::Result<Arc<dyn Transport>> {
        let backend = self
            .backends
            .lock()
            .get(&config.name)
            .cloned()
            .ok_or_else(|| Error::ServerNotFound(config.name.clone()))?;
        Ok(Arc::new(MockTransport {
            name: config.name.clone(),
            backend,
            connected: AtomicBool::new(false),
        }))
    }
}

/// Config entry for a mock backend (transport kind is irrelevant to the
/// factory but must validate).
pub fn backend_config(name: &str) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        transport: TransportKind::Stdio,
        command: Some("mock".to_string()),
        args: vec![],
        env: HashMap::new(),
        url: None,
        headers: HashMap::new(),
        enabled: true,
        mode: BackendMode::Stateful,
        timeout_ms: None,
    }
}

/// Fully wired gateway over mock backends.
pub struct Harness {
    pub registry: Arc<Registry>,
    pub pool: Arc<TransportPool>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub router: Arc<Router>,
    pub server: Arc<GatewayServer>,
    pub directory: BackendDirectory,
    pub factory: Arc<MockFactory>,
    pub mocks: HashMap<String, Arc<MockBackend>>,
    pub shutdown: CancellationToken,
    timeout: Duration,
}

impl Harness {
    pub async fn build(backends: Vec<(&str, Arc<MockBackend>)>) -> Self {
        Self::build_with(backends, FailsafeConfig::default(), PoliciesConfig::default()).await
    }

    pub async fn build_with(
        backends: Vec<(&str, Arc<MockBackend>)>,
        failsafe: FailsafeConfig,
        policies: PoliciesConfig,
    ) -> Self {
        let factory = MockFactory::new();
        let mut mocks = HashMap::new();
        let mut configs = Vec::new();
        for (name, backend) in backends {
            factory.insert(name, Arc::clone(&backend));
            mocks.insert(name.to_string(), backend);
            configs.push(backend_config(name));
        }

        let registry = Arc::new(Registry::new("goblin"));
        let pool = Arc::new(TransportPool::new(
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            failsafe,
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            Config::default().subscriptions.max_per_client,
        ));
        let directory = backend_directory(&configs);
        let meta = MetaTools::new(Arc::clone(&registry), Arc::clone(&pool), configs.clone());
        let timeout = policies.default_timeout();
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            meta,
            Arc::clone(&directory),
            policies,
        ));
        let hub = Arc::new(ClientHub::new());
        let server = GatewayServer::new(
            Arc::clone(&registry),
            Arc::clone(&router),
            Arc::clone(&subscriptions),
            hub,
        );

        let shutdown = CancellationToken::new();
        spawn_change_bridge(&registry, Arc::clone(server.hub()), shutdown.clone());

        let harness = Self {
            registry,
            pool,
            subscriptions,
            router,
            server,
            directory,
            factory,
            mocks,
            shutdown,
            timeout,
        };

        for config in configs {
            harness.sync(&config.name).await;
        }
        harness
    }

    /// Connect, wire notifications, and sync one backend (the daemon's
    /// ensure-synced path).
    pub async fn sync(&self, name: &str) {
        let config = self
            .directory
            .read()
            .get(name)
            .cloned()
            .expect("backend in directory");
        let transport = self.pool.get(&config).await.expect("mock connect");
        wire_backend_notifications(
            Arc::clone(&self.registry),
            Arc::clone(&self.pool),
            Arc::clone(&self.server),
            name,
            &transport,
            self.timeout,
            self.shutdown.clone(),
        );
        sync_backend(&self.registry, name, &transport, self.timeout)
            .await
            .expect("sync");
    }

    /// Register a client channel and run the initialize handshake.
    pub async fn connect_client(
        &self,
        client_id: &str,
    ) -> tokio::sync::mpsc::UnboundedReceiver<JsonRpcNotification> {
        let rx = self.server.hub().register(client_id);
        let response = self
            .request(
                client_id,
                "init-1",
                methods::INITIALIZE,
                json!({
                    "protocolVersion": goblin::protocol::PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "test-client", "version": "0"}
                }),
            )
            .await;
        assert!(response.error.is_none(), "initialize failed: {response:?}");
        rx
    }

    /// Issue one request on a client channel and await its response.
    pub async fn request(
        &self,
        client_id: &str,
        id: &str,
        method: &str,
        params: Value,
    ) -> JsonRpcResponse {
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.server
            .handle_value(client_id, &message)
            .await
            .expect("request must produce a response")
    }
}

/// Drain everything currently queued on a notification receiver.
pub async fn drain_notifications(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<JsonRpcNotification>,
) -> Vec<JsonRpcNotification> {
    // Let bridge/debounce tasks run.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut drained = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        drained.push(notification);
    }
    drained
}
