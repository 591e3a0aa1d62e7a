//! Daemon controller
//!
//! One process instance owning the pool, registry, subscription manager,
//! router, and gateway server. Binds the loopback lock port (single-instance
//! guard plus CLI control surface), optionally the HTTP frontend, runs the
//! per-backend sync workers, and drives graceful shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, Config, FrontendTransport};
use crate::lock::lock_router;
use crate::meta::MetaTools;
use crate::pool::TransportPool;
use crate::protocol::{JsonRpcNotification, methods};
use crate::registry::{Category, Registry, sync_backend, sync_category};
use crate::router::{BackendDirectory, Router, backend_directory};
use crate::server::{
    ClientHub, GatewayServer, HttpFrontend, HttpFrontendConfig, ReadyState, spawn_change_bridge,
};
use crate::subscriptions::SubscriptionManager;
use crate::transport::{Transport, TransportFactory};
use crate::{Error, Result};

/// How often sync workers re-check their backend.
const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Ordered event stream from one backend's notification handler.
enum BackendEvent {
    ListChanged(Category),
    ResourceUpdated(String),
}

/// The daemon
pub struct Daemon {
    config: Config,
    registry: Arc<Registry>,
    pool: Arc<TransportPool>,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<Router>,
    meta: Arc<MetaTools>,
    server: Arc<GatewayServer>,
    backends: BackendDirectory,
    ready: Arc<ReadyState>,
    /// Transport pointer each backend's notifications are wired to, so a
    /// reconnect re-wires exactly once.
    wired: DashMap<String, usize>,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl Daemon {
    /// Assemble all components from a validated configuration snapshot.
    pub fn new(config: Config, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        let registry = Arc::new(Registry::new("goblin"));
        let pool = Arc::new(TransportPool::new(factory, config.failsafe.clone()));
        let subscriptions = Arc::new(SubscriptionManager::new(
            config.subscriptions.max_per_client,
        ));
        let backends = backend_directory(&config.servers);
        let meta = MetaTools::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            config.servers.clone(),
        );
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&meta),
            Arc::clone(&backends),
            config.policies.clone(),
        ));
        let hub = Arc::new(ClientHub::new());
        let server = GatewayServer::new(
            Arc::clone(&registry),
            Arc::clone(&router),
            Arc::clone(&subscriptions),
            hub,
        );

        let enabled: Vec<String> = config
            .enabled_servers()
            .map(|s| s.name.clone())
            .collect();
        let ready = ReadyState::new(&enabled);

        Arc::new(Self {
            config,
            registry,
            pool,
            subscriptions,
            router,
            meta,
            server,
            backends,
            ready,
            wired: DashMap::new(),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    /// The gateway server (for tests and embedding).
    #[must_use]
    pub fn server(&self) -> &Arc<GatewayServer> {
        &self.server
    }

    /// The shutdown token; cancelling it stops the daemon.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown. Returns once teardown completes.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        // The lock port doubles as the single-instance guard: a second bind
        // on the same port fails with "already running".
        let lock_addr: SocketAddr = ([127, 0, 0, 1], self.config.gateway.lock_port).into();
        let lock_listener = TcpListener::bind(lock_addr).await.map_err(|e| {
            Error::Config(format!(
                "Lock port {} unavailable (daemon already running?): {e}",
                self.config.gateway.lock_port
            ))
        })?;

        let metrics_handle = install_metrics_recorder();

        info!(
            version = env!("CARGO_PKG_VERSION"),
            backends = self.backends.read().len(),
            transport = ?self.config.gateway.transport,
            lock_port = self.config.gateway.lock_port,
            "Goblin daemon starting"
        );

        // Catalog change events -> debounced client list_changed.
        let _bridge = spawn_change_bridge(
            &self.registry,
            Arc::clone(self.server.hub()),
            self.shutdown.clone(),
        );

        // Per-backend sync workers.
        let initial: Vec<BackendConfig> =
            self.backends.read().values().cloned().collect();
        for backend in initial {
            self.spawn_sync_worker(backend);
        }

        // Lock-port control surface.
        let lock_app = lock_router(
            Arc::clone(&self.registry),
            Arc::clone(&self.pool),
            Arc::clone(&self.meta),
            Arc::clone(&self.backends),
            self.config.gateway.transport,
            self.shutdown.clone(),
            self.started_at,
        );
        let lock_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(lock_listener, lock_app)
                .with_graceful_shutdown(async move { lock_shutdown.cancelled().await })
                .await;
        });

        // Frontends.
        let http_frontend = if matches!(
            self.config.gateway.transport,
            FrontendTransport::Http | FrontendTransport::Both
        ) {
            Some(self.start_http_frontend(metrics_handle).await?)
        } else {
            None
        };

        let mut stdio_task = None;
        if matches!(
            self.config.gateway.transport,
            FrontendTransport::Stdio | FrontendTransport::Both
        ) {
            let server = Arc::clone(&self.server);
            let shutdown = self.shutdown.clone();
            stdio_task = Some(tokio::spawn(async move {
                if let Err(e) = crate::server::run_stdio_frontend(server, shutdown).await {
                    warn!(error = %e, "Stdio frontend ended with error");
                }
            }));
        }

        // Wait for a stop request or a termination signal.
        tokio::select! {
            () = self.shutdown.cancelled() => {
                info!("Stop requested");
            }
            () = termination_signal() => {
                info!("Termination signal received");
                self.shutdown.cancel();
            }
        }

        // Graceful drain: give in-flight requests the grace period.
        let grace = self.config.gateway.shutdown_grace();
        let drained = tokio::time::timeout(grace, self.server.drain()).await;
        if drained.is_err() {
            warn!(grace = ?grace, "Shutdown grace elapsed with requests still in flight");
        }

        // Close client channels.
        if let Some(frontend) = &http_frontend {
            frontend.close_all_sessions().await;
        }
        if let Some(task) = stdio_task {
            task.abort();
        }
        for client_id in self.server.hub().client_ids() {
            self.server.disconnect_client(&client_id).await;
        }

        info!("Closing backend transports");
        self.pool.release_all().await;

        info!("Daemon shutdown complete");
        Ok(())
    }

    async fn start_http_frontend(
        &self,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Arc<HttpFrontend>> {
        let frontend = HttpFrontend::new(
            Arc::clone(&self.server),
            Arc::clone(&self.meta),
            HttpFrontendConfig {
                auth: self.config.auth.clone(),
                streamable: self.config.streamable_http.clone(),
            },
            metrics,
            Arc::clone(&self.ready),
        );
        frontend.spawn_session_reaper(self.shutdown.clone());

        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.gateway.host, self.config.gateway.port
        )
        .parse()
        .map_err(|e| Error::Config(format!("Invalid gateway host/port: {e}")))?;

        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "HTTP frontend listening");

        let app = frontend.router();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });

        Ok(frontend)
    }

    /// Add a backend at runtime (explicit reload path).
    pub fn add_backend(self: &Arc<Self>, config: BackendConfig) {
        info!(backend = %config.name, "Adding backend");
        self.ready.track(&config.name);
        self.backends
            .write()
            .insert(config.name.clone(), config.clone());
        self.spawn_sync_worker(config);
    }

    /// Remove a backend at runtime: entries, subscriptions, and transport go
    /// in one pass. In-flight calls to its tools fail with ServerNotFound or
    /// CircuitOpen.
    pub async fn remove_backend(&self, name: &str) {
        info!(backend = %name, "Removing backend");
        self.backends.write().remove(name);
        self.wired.remove(name);
        self.registry.remove_backend(name);
        self.subscriptions.remove_backend(name);
        self.ready.forget(name);
        self.pool.release(name).await;
    }

    /// Reconcile the running daemon against a freshly loaded configuration.
    pub async fn reload(self: &Arc<Self>, fresh: &Config) {
        let current: Vec<String> = self.backends.read().keys().cloned().collect();
        let desired: HashMap<String, BackendConfig> = fresh
            .enabled_servers()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();

        for name in &current {
            if !desired.contains_key(name) {
                self.remove_backend(name).await;
            }
        }
        for (name, config) in desired {
            if !current.contains(&name) {
                self.add_backend(config);
            }
        }
    }

    fn spawn_sync_worker(self: &Arc<Self>, config: BackendConfig) {
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SYNC_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !daemon.backends.read().contains_key(&config.name) {
                            debug!(backend = %config.name, "Backend removed, sync worker exiting");
                            break;
                        }
                        daemon.ensure_synced(&config).await;
                    }
                    () = daemon.shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Connect (if needed), wire notifications, and sync one backend.
    async fn ensure_synced(&self, config: &BackendConfig) {
        // Healthy and already wired to the live transport: nothing to do.
        if let Some(transport) = self.pool.live(&config.name) {
            let ptr = Arc::as_ptr(&transport).cast::<()>() as usize;
            if self.wired.get(&config.name).is_some_and(|w| *w == ptr) {
                return;
            }
        }

        let transport = match self.pool.get(config).await {
            Ok(t) => t,
            Err(e) => {
                debug!(backend = %config.name, error = %e, "Backend unavailable for sync");
                return;
            }
        };

        self.wire_notifications(&config.name, &transport);

        let timeout = self.config.policies.default_timeout();
        match sync_backend(&self.registry, &config.name, &transport, timeout).await {
            Ok(()) => {
                self.ready.mark_synced(&config.name);
                let ptr = Arc::as_ptr(&transport).cast::<()>() as usize;
                self.wired.insert(config.name.clone(), ptr);
            }
            Err(e) => {
                warn!(backend = %config.name, error = %e, "Backend sync failed");
            }
        }
    }

    fn wire_notifications(&self, backend: &str, transport: &Arc<dyn Transport>) {
        wire_backend_notifications(
            Arc::clone(&self.registry),
            Arc::clone(&self.pool),
            Arc::clone(&self.server),
            backend,
            transport,
            self.config.policies.default_timeout(),
            self.shutdown.clone(),
        );
    }
}

/// Route a backend's notifications through an ordered per-backend queue:
/// list-changed events re-run the matching sync sub-step, updated events fan
/// out to subscribers. Only categories the backend declared list-changed
/// support for are honored.
pub fn wire_backend_notifications(
    registry: Arc<Registry>,
    pool: Arc<TransportPool>,
    server: Arc<GatewayServer>,
    backend: &str,
    transport: &Arc<dyn Transport>,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    let capabilities = transport.capabilities().unwrap_or_default();
    let (tx, mut rx) = mpsc::unbounded_channel::<BackendEvent>();

    let tools_changed = capabilities.tools_list_changed();
    let prompts_changed = capabilities.prompts_list_changed();
    let resources_changed = capabilities.resources_list_changed();

    transport.set_notification_handler(Box::new(move |n: JsonRpcNotification| {
        let event = match n.method.as_str() {
            methods::NOTIF_TOOLS_CHANGED if tools_changed => {
                Some(BackendEvent::ListChanged(Category::Tools))
            }
            methods::NOTIF_PROMPTS_CHANGED if prompts_changed => {
                Some(BackendEvent::ListChanged(Category::Prompts))
            }
            methods::NOTIF_RESOURCES_CHANGED if resources_changed => {
                Some(BackendEvent::ListChanged(Category::Resources))
            }
            methods::NOTIF_RESOURCE_UPDATED => n
                .params
                .as_ref()
                .and_then(|p| p.get("uri"))
                .and_then(serde_json::Value::as_str)
                .map(|uri| BackendEvent::ResourceUpdated(uri.to_string())),
            _ => None,
        };
        if let Some(event) = event {
            let _ = tx.send(event);
        }
    }));

    let backend = backend.to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(BackendEvent::ListChanged(category)) => {
                        let Some(transport) = pool.live(&backend) else { continue };
                        if let Err(e) =
                            sync_category(&registry, &backend, &transport, timeout, category)
                                .await
                        {
                            warn!(backend = %backend, error = %e, "Re-sync after list_changed failed");
                        }
                    }
                    Some(BackendEvent::ResourceUpdated(uri)) => {
                        server.notify_resource_updated(&backend, &uri);
                    }
                    None => break,
                },
                () = shutdown.cancelled() => break,
            }
        }
    });
}

/// Install the Prometheus recorder once per process.
fn install_metrics_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            // A second daemon instance in-process (tests) hits this; metrics
            // just stay disabled there.
            debug!(error = %e, "Metrics recorder not installed");
            None
        }
    }
}

async fn termination_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
