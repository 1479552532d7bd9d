//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use outbox_core::{
    DeliveryResponse, QueueStore, QueuedRequest, Transport, TransportError, IDEMPOTENCY_HEADER,
};
use outbox_worker::server::build_router;
use outbox_worker::{AppState, ConnectivityMonitor, OutboxConfig, Worker, WorkerHandle};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

/// Stand-in for the order API: records every request it receives and
/// answers `201 {"id": "<n>"}` with increasing ids.
pub struct RecordingTransport {
    online: AtomicBool,
    rejecting: AtomicU16,
    next_id: AtomicU64,
    received: Mutex<Vec<QueuedRequest>>,
}

impl RecordingTransport {
    /// Online transport whose first assigned id is `first_id`.
    pub fn new(first_id: u64) -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            rejecting: AtomicU16::new(0),
            next_id: AtomicU64::new(first_id),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Answer every request with `status` instead of 201; `None` restores
    /// normal answers.
    pub fn set_rejecting(&self, status: Option<u16>) {
        self.rejecting.store(status.unwrap_or(0), Ordering::SeqCst);
    }

    /// Requests the server saw, in arrival order.
    pub fn received(&self) -> Vec<QueuedRequest> {
        self.received.lock().expect("lock").clone()
    }

    /// Idempotency-Key header of each received request, in arrival order.
    pub fn received_keys(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|r| r.header(IDEMPOTENCY_HEADER).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, request: &QueuedRequest) -> Result<DeliveryResponse, TransportError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::Offline);
        }
        self.received.lock().expect("lock").push(request.clone());
        let rejecting = self.rejecting.load(Ordering::SeqCst);
        if rejecting != 0 {
            return Ok(DeliveryResponse::new(rejecting, r#"{"error":"refused"}"#));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(DeliveryResponse::new(201, format!(r#"{{"id":"{id}"}}"#)))
    }
}

/// Config with test-friendly defaults.
pub fn test_config(data_dir: &std::path::Path) -> OutboxConfig {
    OutboxConfig::new(data_dir, Url::parse("http://localhost/").expect("url"))
}

/// Poll `check` until it holds or five seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// A worker plus its HTTP bridge on a random localhost port.
pub struct TestBridge {
    pub addr: SocketAddr,
    pub worker: WorkerHandle,
    pub store: Arc<dyn QueueStore>,
    pub connectivity: ConnectivityMonitor,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestBridge {
    /// Start a worker and serve its bridge.
    ///
    /// # Panics
    ///
    /// Panics if no port is available or the server fails to bind.
    pub async fn start(
        config: &OutboxConfig,
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        let port = portpicker::pick_unused_port().expect("no available port");
        let addr = SocketAddr::from(([127, 0, 0, 1], port));

        let worker = Worker::spawn(config, Arc::clone(&store), transport, connectivity.clone());
        let state = AppState::new(worker.clone(), Arc::clone(&store), connectivity.clone());
        let app = build_router(state, None);

        let listener = TcpListener::bind(addr).await.expect("bind");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("server error");
        });

        Self {
            addr,
            worker,
            store,
            connectivity,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop the server and the worker.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
        self.worker.shutdown();
        self.worker.stopped().await;
    }
}
