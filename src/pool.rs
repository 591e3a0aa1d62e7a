//! Transport pool
//!
//! Owns every live backend transport. At most one transport exists per
//! backend, and at most one connect attempt is in flight per backend: racing
//! callers coalesce onto a per-slot latch and share the winner's transport.
//! Connect attempts are gated by the backend's circuit breaker; the breakers
//! live here so the router can consult the same instances for requests.

use std::sync::Arc;

use dashmap::DashMap;
use telemetry_metrics::counter;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, FailsafeConfig};
use crate::failsafe::{CircuitBreaker, CircuitBreakerStats};
use crate::transport::{Transport, TransportFactory};
use crate::Result;

struct Slot {
    /// Single-flight latch: whoever holds it performs the connect.
    connect_latch: tokio::sync::Mutex<()>,
    transport: parking_lot::RwLock<Option<Arc<dyn Transport>>>,
    last_error: parking_lot::RwLock<Option<String>>,
}

impl Slot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connect_latch: tokio::sync::Mutex::new(()),
            transport: parking_lot::RwLock::new(None),
            last_error: parking_lot::RwLock::new(None),
        })
    }

    fn live_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .as_ref()
            .filter(|t| t.is_connected())
            .map(Arc::clone)
    }
}

/// Connection status of one pool slot, for health reporting.
#[derive(Debug, Clone)]
pub struct SlotStatus {
    /// Whether a connected transport currently exists
    pub connected: bool,
    /// Circuit breaker snapshot
    pub circuit: CircuitBreakerStats,
    /// Most recent connect error, if any
    pub last_error: Option<String>,
}

/// Pool of backend transports keyed by backend name
pub struct TransportPool {
    factory: Arc<dyn TransportFactory>,
    failsafe: FailsafeConfig,
    slots: DashMap<String, Arc<Slot>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl TransportPool {
    /// Create an empty pool.
    pub fn new(factory: Arc<dyn TransportFactory>, failsafe: FailsafeConfig) -> Self {
        Self {
            factory,
            failsafe,
            slots: DashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// The circuit breaker for a backend, created on first use.
    pub fn breaker(&self, backend: &str) -> Arc<CircuitBreaker> {
        Arc::clone(
            &self
                .breakers
                .entry(backend.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(backend, &self.failsafe))),
        )
    }

    /// Return a connected transport, creating and connecting one if absent
    /// or disconnected. The connect attempt is gated by the backend's
    /// circuit breaker.
    ///
    /// Concurrent calls for the same backend share a single connect attempt.
    pub async fn get(&self, config: &BackendConfig) -> Result<Arc<dyn Transport>> {
        if let Some(transport) = self.live(&config.name) {
            return Ok(transport);
        }

        let breaker = self.breaker(&config.name);
        let admission = breaker.admit()?;

        match self.acquire(config).await {
            Ok(transport) => {
                breaker.record_success(admission);
                Ok(transport)
            }
            Err(e) => {
                if e.is_infrastructural() {
                    breaker.record_failure(admission, &e.to_string());
                } else {
                    breaker.record_success(admission);
                }
                Err(e)
            }
        }
    }

    /// Return a connected transport without consulting the circuit breaker.
    ///
    /// For callers that already hold an admission spanning connect and
    /// request (the router); everyone else uses [`TransportPool::get`].
    pub async fn acquire(&self, config: &BackendConfig) -> Result<Arc<dyn Transport>> {
        let slot = Arc::clone(
            &self
                .slots
                .entry(config.name.clone())
                .or_insert_with(Slot::new),
        );

        if let Some(transport) = slot.live_transport() {
            return Ok(transport);
        }

        let _latch = slot.connect_latch.lock().await;

        // A racing caller may have connected while we waited on the latch.
        if let Some(transport) = slot.live_transport() {
            return Ok(transport);
        }

        debug!(backend = %config.name, "Connecting backend transport");
        let connect_result = async {
            let transport = self.factory.create(config)?;
            transport.connect().await?;
            Ok::<_, crate::Error>(transport)
        }
        .await;

        match connect_result {
            Ok(transport) => {
                *slot.transport.write() = Some(Arc::clone(&transport));
                *slot.last_error.write() = None;
                counter!("goblin_backend_connects_total", "backend" => config.name.clone()).increment(1);
                info!(backend = %config.name, transport = config.transport.as_str(), "Backend connected");
                Ok(transport)
            }
            Err(e) => {
                *slot.last_error.write() = Some(e.to_string());
                warn!(backend = %config.name, error = %e, "Backend connect failed");
                Err(e)
            }
        }
    }

    /// Whether a live transport currently exists for the backend.
    #[must_use]
    pub fn is_connected(&self, backend: &str) -> bool {
        self.slots
            .get(backend)
            .is_some_and(|slot| slot.live_transport().is_some())
    }

    /// The live transport for a backend, if one exists.
    #[must_use]
    pub fn live(&self, backend: &str) -> Option<Arc<dyn Transport>> {
        self.slots.get(backend).and_then(|slot| slot.live_transport())
    }

    /// Health snapshot for a backend.
    #[must_use]
    pub fn status(&self, backend: &str) -> SlotStatus {
        SlotStatus {
            connected: self.is_connected(backend),
            circuit: self.breaker(backend).stats(),
            last_error: self
                .slots
                .get(backend)
                .and_then(|slot| slot.last_error.read().clone()),
        }
    }

    /// Close and remove a backend's transport and breaker state.
    pub async fn release(&self, backend: &str) {
        let transport = self
            .slots
            .remove(backend)
            .and_then(|(_, slot)| slot.transport.write().take());
        self.breakers.remove(backend);
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                warn!(backend = %backend, error = %e, "Error closing transport");
            }
        }
        info!(backend = %backend, "Backend released");
    }

    /// Close every transport and empty the pool.
    pub async fn release_all(&self) {
        let names: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.release(&name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::protocol::{JsonRpcResponse, RequestId, ServerCapabilities};
    use crate::transport::NotificationHandler;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug)]
    struct MockTransport {
        connected: AtomicBool,
        fail_connect: bool,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self) -> Result<()> {
            // Simulate real connect latency so racing callers overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_connect {
                return Err(crate::Error::Connection("refused".to_string()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn request(
            &self,
            _method: &str,
            _params: Option<Value>,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<JsonRpcResponse> {
            Ok(JsonRpcResponse::success(RequestId::Number(1), Value::Null))
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
            Ok(())
        }

        fn set_notification_handler(&self, _handler: NotificationHandler) {}

        fn capabilities(&self) -> Option<ServerCapabilities> {
            Some(ServerCapabilities::default())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingFactory {
        creates: AtomicUsize,
        fail_connect: bool,
    }

    impl TransportFactory for CountingFactory {
        fn create(&self, _config: &BackendConfig) -> Result<Arc<dyn Transport>> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockTransport {
                connected: AtomicBool::new(false),
                fail_connect: self.fail_connect,
            }))
        }
    }

    fn backend(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            transport: TransportKind::Stdio,
            command: Some("mock".to_string()),
            args: vec![],
            env: std::collections::HashMap::new(),
            url: None,
            headers: std::collections::HashMap::new(),
            enabled: true,
            mode: crate::config::BackendMode::Stateful,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_connect() {
        let factory = Arc::new(CountingFactory {
            creates: AtomicUsize::new(0),
            fail_connect: false,
        });
        let pool = Arc::new(TransportPool::new(
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            FailsafeConfig::default(),
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move { pool.get(&backend("alpha")).await }));
        }

        let transports: Vec<Arc<dyn Transport>> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        // Exactly one underlying connect; every caller sees the same instance.
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);
        let first = Arc::as_ptr(&transports[0]);
        assert!(transports.iter().all(|t| std::ptr::eq(Arc::as_ptr(t), first)));
    }

    #[tokio::test]
    async fn reconnects_after_release() {
        let factory = Arc::new(CountingFactory {
            creates: AtomicUsize::new(0),
            fail_connect: false,
        });
        let pool = TransportPool::new(
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            FailsafeConfig::default(),
        );

        pool.get(&backend("alpha")).await.unwrap();
        assert!(pool.is_connected("alpha"));

        pool.release("alpha").await;
        assert!(!pool.is_connected("alpha"));

        pool.get(&backend("alpha")).await.unwrap();
        assert_eq!(factory.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connect_failures_trip_breaker() {
        let factory = Arc::new(CountingFactory {
            creates: AtomicUsize::new(0),
            fail_connect: true,
        });
        let failsafe = FailsafeConfig {
            failure_threshold: 2,
            success_threshold: 1,
            open_cooldown_ms: 60_000,
        };
        let pool = TransportPool::new(factory as Arc<dyn TransportFactory>, failsafe);

        assert!(pool.get(&backend("alpha")).await.is_err());
        assert!(pool.get(&backend("alpha")).await.is_err());

        // Third attempt is rejected by the breaker without touching the factory.
        let err = pool.get(&backend("alpha")).await.unwrap_err();
        assert!(matches!(err, crate::Error::CircuitOpen { .. }));

        let status = pool.status("alpha");
        assert!(!status.connected);
        assert_eq!(status.last_error.as_deref(), Some("Connection error: refused"));
    }

    #[tokio::test]
    async fn release_all_empties_pool() {
        let factory = Arc::new(CountingFactory {
            creates: AtomicUsize::new(0),
            fail_connect: false,
        });
        let pool = TransportPool::new(
            factory as Arc<dyn TransportFactory>,
            FailsafeConfig::default(),
        );

        pool.get(&backend("alpha")).await.unwrap();
        pool.get(&backend("beta")).await.unwrap();
        pool.release_all().await;

        assert!(!pool.is_connected("alpha"));
        assert!(!pool.is_connected("beta"));
    }
}
