//! # Request Enqueuer
//!
//! Single entry point pages use to submit a mutating request.
//!
//! ## Flow
//!
//! ```text
//! submit(request)
//!   ├─ online and not deferred ─▶ deliver now
//!   │     ├─ 2xx      ─▶ Delivered
//!   │     ├─ error    ─▶ Err(Rejected)          (never queued)
//!   │     ├─ unsendable ─▶ Err(Undeliverable)   (never queued)
//!   │     └─ no reply ─▶ fall through
//!   └─ deferred path
//!         ├─ Worker ─▶ durable queue, sync intent registered
//!         └─ Local  ─▶ `queuedOrders`, local retry timer
//! ```
//!
//! The idempotency key is resolved once, before the first attempt, and the
//! same key rides on the immediate attempt and on every later retry.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use outbox_core::{
    current_timestamp_ms, DeliveryOutcome, DeliveryResponse, IdempotencyKey, KeyValueStorage,
    LocalFallbackQueue, MutatingRequest, Notification, OutboxError, QueueStatus, QueueStore,
    RequestError, RetryReport, StoreError, Transport, DEFAULT_SYNC_TAG, UNSENT_STATUS,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{OutboxConfig, RetryConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::error::WorkerError;
use crate::metrics;
use crate::notifier::Notifier;
use crate::worker::WorkerHandle;

/// Why a submission did not succeed.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The server answered with an error status. The request was not queued.
    #[error("request {key} rejected with status {status}")]
    Rejected {
        /// Key of the refused operation.
        key: IdempotencyKey,
        /// HTTP status returned.
        status: u16,
        /// Response body, for surfacing to the user.
        body: String,
    },
    /// The transport could not build the request. It was not queued.
    #[error("request {key} cannot be sent: {reason}")]
    Undeliverable {
        /// Key of the refused operation.
        key: IdempotencyKey,
        /// Transport message.
        reason: String,
    },
    /// The request could not be captured.
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),
    /// The deferred path could not persist the request.
    #[error("request could not be stored: {0}")]
    Storage(#[from] StoreError),
    /// The worker is no longer running.
    #[error("worker is not running")]
    WorkerGone,
    /// Any other worker failure.
    #[error("worker error: {0}")]
    Worker(WorkerError),
}

impl From<WorkerError> for SubmitError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::Stopped => Self::WorkerGone,
            WorkerError::Outbox(OutboxError::Store(e)) => Self::Storage(e),
            WorkerError::Outbox(OutboxError::Request(e)) => Self::Request(e),
            other => Self::Worker(other),
        }
    }
}

/// Result of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Delivered immediately.
    Delivered {
        /// Key the request was sent with.
        key: IdempotencyKey,
        /// Server-assigned id, when the response carried one.
        order_id: Option<String>,
        /// The server's response.
        response: DeliveryResponse,
    },
    /// Persisted for later delivery.
    Queued {
        /// Key the request will be retried with.
        key: IdempotencyKey,
    },
}

impl SubmitOutcome {
    /// Key of the submitted operation.
    #[must_use]
    pub fn key(&self) -> &IdempotencyKey {
        match self {
            Self::Delivered { key, .. } | Self::Queued { key } => key,
        }
    }

    /// Whether the request went to a queue.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

/// Per-submission options.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Skip the immediate attempt and queue straight away.
    pub defer: bool,
    /// Queue lane.
    pub tag: String,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            defer: false,
            tag: DEFAULT_SYNC_TAG.to_string(),
        }
    }
}

impl SubmitOptions {
    /// Options that always queue.
    #[must_use]
    pub fn deferred() -> Self {
        Self {
            defer: true,
            ..Self::default()
        }
    }

    /// Use lane `tag`.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }
}

/// Page-local fallback used when no worker is available.
#[derive(Clone)]
pub struct LocalDeferral {
    queue: LocalFallbackQueue<Arc<dyn KeyValueStorage>>,
    notifier: Notifier,
}

impl std::fmt::Debug for LocalDeferral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDeferral")
            .field("storage_key", &self.queue.store().storage_key())
            .finish_non_exhaustive()
    }
}

impl LocalDeferral {
    /// Fallback over `storage` under the default `queuedOrders` key.
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self::from_queue(LocalFallbackQueue::new(storage))
    }

    /// Fallback over `storage` using the configured storage key and
    /// retention window.
    pub fn from_config(storage: Arc<dyn KeyValueStorage>, config: &OutboxConfig) -> Self {
        Self::from_queue(
            LocalFallbackQueue::with_storage_key(storage, config.fallback_storage_key.clone())
                .with_retention(config.retention),
        )
    }

    /// Fallback over an already-configured queue.
    pub fn from_queue(queue: LocalFallbackQueue<Arc<dyn KeyValueStorage>>) -> Self {
        Self {
            queue,
            notifier: Notifier::default(),
        }
    }

    /// The underlying `queuedOrders` queue.
    #[must_use]
    pub fn queue(&self) -> &LocalFallbackQueue<Arc<dyn KeyValueStorage>> {
        &self.queue
    }

    fn status(&self, tag: &str) -> Result<QueueStatus, StoreError> {
        let items = self.queue.store().list_all()?;
        Ok(QueueStatus::from_items(tag, &items))
    }

    fn publish_status(&self, tag: &str) {
        match self.status(tag) {
            Ok(status) => self.notifier.notify(Notification::QueueStatus(status)),
            Err(e) => tracing::warn!(tag, "Could not snapshot local queue: {e}"),
        }
    }

    /// One retry pass, announcing confirmations on this page's notifier.
    async fn retry(&self, transport: &dyn Transport) -> Result<RetryReport, StoreError> {
        let notifier = &self.notifier;
        let report = self
            .queue
            .retry_queued_orders(transport, |key, order_id| {
                metrics::record_delivered("local_retry");
                notifier.notify(Notification::OrderSynced {
                    key: Some(key.clone()),
                    order_id: order_id.map(str::to_string),
                });
            })
            .await?;
        for _ in 0..report.network_failures {
            metrics::record_network_failure("local_retry");
        }
        if report.expired > 0 {
            metrics::record_expired(report.expired);
        }

        let mut tags: BTreeSet<String> = report
            .synced
            .iter()
            .map(|op| op.request.tag.clone())
            .collect();
        tags.extend(
            self.queue
                .queued_orders()?
                .into_iter()
                .map(|op| op.request.tag),
        );
        for tag in tags {
            self.publish_status(&tag);
        }
        Ok(report)
    }
}

/// Where requests go when they cannot be delivered right now.
#[derive(Debug, Clone)]
pub enum DeferredPath {
    /// A live worker owns a durable queue.
    Worker(WorkerHandle),
    /// No worker: the page's own `queuedOrders` queue.
    Local(LocalDeferral),
}

impl DeferredPath {
    /// Prefer a running worker; fall back to page-local storage set up
    /// from `config`.
    pub fn detect(
        worker: Option<WorkerHandle>,
        storage: Arc<dyn KeyValueStorage>,
        config: &OutboxConfig,
    ) -> Self {
        match worker {
            Some(worker) if worker.is_running() => Self::Worker(worker),
            _ => {
                tracing::info!(
                    storage_key = %config.fallback_storage_key,
                    "No worker available, using local fallback queue"
                );
                Self::Local(LocalDeferral::from_config(storage, config))
            }
        }
    }
}

/// Submits mutating requests, deferring them when they cannot go out now.
pub struct RequestEnqueuer {
    transport: Arc<dyn Transport>,
    connectivity: ConnectivityMonitor,
    deferred: DeferredPath,
    retry: RetryConfig,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RequestEnqueuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEnqueuer")
            .field("deferred", &self.deferred)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RequestEnqueuer {
    /// Create an enqueuer.
    pub fn new(
        transport: Arc<dyn Transport>,
        connectivity: ConnectivityMonitor,
        deferred: DeferredPath,
    ) -> Self {
        Self {
            transport,
            connectivity,
            deferred,
            retry: RetryConfig::default(),
            retry_task: Mutex::new(None),
        }
    }

    /// Create an enqueuer whose local retry timer uses `config.retry`.
    pub fn from_config(
        config: &OutboxConfig,
        transport: Arc<dyn Transport>,
        connectivity: ConnectivityMonitor,
        deferred: DeferredPath,
    ) -> Self {
        Self::new(transport, connectivity, deferred).with_retry(config.retry.clone())
    }

    /// Backoff for the local retry timer.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The deferred path in use.
    #[must_use]
    pub fn deferred(&self) -> &DeferredPath {
        &self.deferred
    }

    /// Submit `request`.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::Rejected`] if the immediate attempt got an error status
    /// - [`SubmitError::Undeliverable`] if the transport could not build it
    /// - [`SubmitError::Storage`] if the deferred path could not persist it
    /// - [`SubmitError::Request`] if the request is invalid
    /// - [`SubmitError::WorkerGone`] if the worker stopped
    pub async fn submit(
        &self,
        mut request: MutatingRequest,
        options: SubmitOptions,
    ) -> Result<SubmitOutcome, SubmitError> {
        let key = request.ensure_key();

        if !options.defer && self.connectivity.current().is_online() {
            let attempt = request
                .clone()
                .into_queued(&options.tag, current_timestamp_ms())?;
            match DeliveryOutcome::attempt(self.transport.as_ref(), &attempt).await {
                DeliveryOutcome::Delivered(response) => {
                    tracing::info!(key = %key, status = response.status, "Request delivered");
                    metrics::record_delivered("immediate");
                    return Ok(SubmitOutcome::Delivered {
                        key,
                        order_id: response.server_id(),
                        response,
                    });
                }
                DeliveryOutcome::Rejected(response) => {
                    tracing::warn!(key = %key, status = response.status, "Request rejected");
                    metrics::record_rejected("immediate", response.status);
                    return Err(SubmitError::Rejected {
                        key,
                        status: response.status,
                        body: response.body,
                    });
                }
                DeliveryOutcome::Undeliverable(reason) => {
                    tracing::warn!(key = %key, "Request cannot be sent: {reason}");
                    metrics::record_rejected("immediate", UNSENT_STATUS);
                    return Err(SubmitError::Undeliverable { key, reason });
                }
                DeliveryOutcome::NetworkFailure(e) => {
                    metrics::record_network_failure("immediate");
                    tracing::info!(key = %key, "Immediate delivery failed, deferring: {e}");
                }
            }
        }

        self.defer(request, &options.tag).await?;
        Ok(SubmitOutcome::Queued { key })
    }

    async fn defer(&self, request: MutatingRequest, tag: &str) -> Result<(), SubmitError> {
        match &self.deferred {
            DeferredPath::Worker(worker) => {
                let key = worker.enqueue(request, tag).await?;
                worker.register_sync(tag).await?;
                tracing::debug!(key = %key, tag, "Deferred to worker");
            }
            DeferredPath::Local(local) => {
                let item = request.into_queued(tag, current_timestamp_ms())?;
                let key = item.key.clone();
                match local.queue.add_queued_order(item) {
                    Ok(()) => metrics::record_enqueued("local"),
                    Err(StoreError::Duplicate(_)) => {
                        tracing::debug!(key = %key, "Request already in local queue");
                    }
                    Err(e) => return Err(SubmitError::Storage(e)),
                }
                tracing::debug!(key = %key, tag, "Deferred to local fallback queue");
                local.publish_status(tag);
                self.schedule_local_retry(local);
            }
        }
        Ok(())
    }

    /// Current snapshot of lane `tag` from whichever queue is in use.
    ///
    /// # Errors
    ///
    /// Returns the storage error, or [`SubmitError::WorkerGone`].
    pub async fn queue_status(&self, tag: &str) -> Result<QueueStatus, SubmitError> {
        match &self.deferred {
            DeferredPath::Worker(worker) => Ok(worker.status(Some(tag)).await?),
            DeferredPath::Local(local) => Ok(local.status(tag)?),
        }
    }

    /// Subscribe to confirmations from whichever queue is in use.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        match &self.deferred {
            DeferredPath::Worker(worker) => worker.subscribe(),
            DeferredPath::Local(local) => local.notifier.subscribe(),
        }
    }

    /// Run one pass over the local fallback queue now.
    ///
    /// Returns `None` when requests are deferred to a worker instead.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Storage`] if the queue cannot be read or written.
    pub async fn retry_local(&self) -> Result<Option<RetryReport>, SubmitError> {
        match &self.deferred {
            DeferredPath::Worker(_) => Ok(None),
            DeferredPath::Local(local) => Ok(Some(local.retry(self.transport.as_ref()).await?)),
        }
    }

    fn schedule_local_retry(&self, local: &LocalDeferral) {
        let mut slot = self
            .retry_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let local = local.clone();
        let transport = Arc::clone(&self.transport);
        let connectivity = self.connectivity.clone();
        let retry = self.retry.clone();
        let mut online = connectivity.subscribe();
        *slot = Some(tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let delay = retry.delay_for_attempt(attempt);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    changed = online.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                attempt = attempt.saturating_add(1);
                if !connectivity.current().is_online() {
                    continue;
                }
                match local.retry(transport.as_ref()).await {
                    Ok(report) if !report.awaits_network() => {
                        // Server-refused leftovers wait for an explicit retry_local
                        tracing::debug!(
                            remaining = report.remaining,
                            "Nothing left awaiting the network, retry timer stopped"
                        );
                        return;
                    }
                    Ok(report) => {
                        tracing::debug!(remaining = report.remaining, attempt, "Local retry pass left entries");
                    }
                    Err(e) => tracing::warn!("Local retry pass failed: {e}"),
                }
            }
        }));
    }
}

impl Drop for RequestEnqueuer {
    fn drop(&mut self) {
        let task = self
            .retry_task
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Worker;
    use async_trait::async_trait;
    use outbox_core::{
        ConnectionStatus, MemoryQueueStore, MemoryStorage, QueuedRequest, TransportError,
        QUEUED_ORDERS_KEY,
    };
    use std::collections::VecDeque;
    use url::Url;

    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<DeliveryResponse, TransportError>>>,
        keys: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<DeliveryResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            })
        }

        fn keys(&self) -> Vec<Option<String>> {
            self.keys.lock().expect("keys").clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn deliver(
            &self,
            request: &QueuedRequest,
        ) -> Result<DeliveryResponse, TransportError> {
            self.keys
                .lock()
                .expect("keys")
                .push(request.header("Idempotency-Key").map(str::to_string));
            self.script
                .lock()
                .expect("script")
                .pop_front()
                .unwrap_or(Err(TransportError::Offline))
        }
    }

    fn order() -> MutatingRequest {
        MutatingRequest::post_json("/api/orders", r#"{"items":[{"id":"1","qty":1}],"tip":0}"#)
    }

    fn local(storage: &MemoryStorage) -> DeferredPath {
        DeferredPath::Local(LocalDeferral::new(Arc::new(storage.clone())))
    }

    fn config() -> OutboxConfig {
        OutboxConfig::new("unused", Url::parse("http://localhost/").expect("url"))
    }

    #[tokio::test]
    async fn test_online_success_is_delivered() {
        let transport = ScriptedTransport::new(vec![Ok(DeliveryResponse::new(201, r#"{"id":"7"}"#))]);
        let storage = MemoryStorage::new();
        let enqueuer = RequestEnqueuer::new(transport.clone(), ConnectivityMonitor::default(), local(&storage));

        let outcome = enqueuer.submit(order().with_key("k1"), SubmitOptions::default()).await.expect("submit");

        assert_eq!(outcome.key().as_str(), "k1");
        assert!(matches!(outcome, SubmitOutcome::Delivered { ref order_id, .. } if order_id.as_deref() == Some("7")));
        assert_eq!(transport.keys(), [Some("k1".to_string())]);
        assert_eq!(storage.get_item(QUEUED_ORDERS_KEY).expect("get"), None);
    }

    #[tokio::test]
    async fn test_error_status_is_surfaced_not_queued() {
        let transport = ScriptedTransport::new(vec![Ok(DeliveryResponse::new(422, "bad tip"))]);
        let storage = MemoryStorage::new();
        let enqueuer = RequestEnqueuer::new(transport, ConnectivityMonitor::default(), local(&storage));

        let result = enqueuer.submit(order(), SubmitOptions::default()).await;

        assert!(matches!(result, Err(SubmitError::Rejected { status: 422, ref body, .. }) if body == "bad tip"));
        assert_eq!(storage.get_item(QUEUED_ORDERS_KEY).expect("get"), None);
    }

    #[tokio::test]
    async fn test_offline_goes_straight_to_local_queue() {
        let transport = ScriptedTransport::new(Vec::new());
        let storage = MemoryStorage::new();
        let enqueuer = RequestEnqueuer::new(
            transport.clone(),
            ConnectivityMonitor::new(ConnectionStatus::Offline),
            local(&storage),
        );

        let outcome = enqueuer.submit(order().with_key("abc"), SubmitOptions::default()).await.expect("submit");

        assert_eq!(outcome, SubmitOutcome::Queued { key: "abc".into() });
        assert!(transport.keys().is_empty());
        let DeferredPath::Local(local) = enqueuer.deferred() else {
            panic!("expected local path");
        };
        assert_eq!(local.queue().len().expect("len"), 1);
    }

    #[tokio::test]
    async fn test_network_failure_falls_through_with_same_key() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            Ok(DeliveryResponse::new(201, r#"{"id":"1"}"#)),
        ]);
        let storage = MemoryStorage::new();
        let enqueuer = RequestEnqueuer::new(transport.clone(), ConnectivityMonitor::default(), local(&storage));

        let outcome = enqueuer.submit(order(), SubmitOptions::default()).await.expect("submit");
        assert!(outcome.is_queued());

        let report = enqueuer.retry_local().await.expect("retry").expect("local path");
        assert_eq!(report.synced.len(), 1);

        let keys = transport.keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].as_deref(), Some(outcome.key().as_str()));
        assert_eq!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn test_deferred_to_worker_waits_for_storage_ack() {
        let store = Arc::new(MemoryQueueStore::new());
        let connectivity = ConnectivityMonitor::new(ConnectionStatus::Offline);
        let config = config();
        let transport = ScriptedTransport::new(Vec::new());
        let worker = Worker::spawn(&config, store.clone(), transport.clone(), connectivity.clone());
        let enqueuer = RequestEnqueuer::new(
            transport,
            connectivity,
            DeferredPath::detect(Some(worker), Arc::new(MemoryStorage::new()), &config),
        );
        assert!(matches!(enqueuer.deferred(), DeferredPath::Worker(_)));

        let outcome = enqueuer
            .submit(order().with_key("w1"), SubmitOptions::deferred())
            .await
            .expect("submit");

        assert_eq!(outcome, SubmitOutcome::Queued { key: "w1".into() });
        assert_eq!(store.count().expect("count"), 1);
        let status = enqueuer.queue_status(DEFAULT_SYNC_TAG).await.expect("status");
        assert_eq!(status.keys, vec![IdempotencyKey::from("w1")]);
    }

    #[tokio::test]
    async fn test_worker_storage_failure_is_not_silent() {
        let store = Arc::new(MemoryQueueStore::with_max_items(0));
        let connectivity = ConnectivityMonitor::new(ConnectionStatus::Offline);
        let config = config();
        let transport = ScriptedTransport::new(Vec::new());
        let worker = Worker::spawn(&config, store, transport.clone(), connectivity.clone());
        let enqueuer = RequestEnqueuer::new(transport, connectivity, DeferredPath::Worker(worker));

        let result = enqueuer.submit(order(), SubmitOptions::default()).await;
        assert!(matches!(result, Err(SubmitError::Storage(StoreError::QuotaExceeded { limit: 0 }))));
    }

    #[test]
    fn test_detect_without_worker_is_local() {
        let path = DeferredPath::detect(None, Arc::new(MemoryStorage::new()), &config());
        assert!(matches!(path, DeferredPath::Local(_)));
    }

    #[tokio::test]
    async fn test_unsendable_request_is_surfaced_not_queued() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Invalid("bad target".into()))]);
        let storage = MemoryStorage::new();
        let enqueuer = RequestEnqueuer::new(transport, ConnectivityMonitor::default(), local(&storage));

        let result = enqueuer.submit(order().with_key("u1"), SubmitOptions::default()).await;

        assert!(matches!(result, Err(SubmitError::Undeliverable { ref key, .. }) if key.as_str() == "u1"));
        assert_eq!(storage.get_item(QUEUED_ORDERS_KEY).expect("get"), None);
    }

    #[tokio::test]
    async fn test_invalid_header_refused_before_any_attempt() {
        let transport = ScriptedTransport::new(Vec::new());
        let storage = MemoryStorage::new();
        let enqueuer = RequestEnqueuer::new(transport.clone(), ConnectivityMonitor::default(), local(&storage));

        let result = enqueuer
            .submit(order().with_header("bad header", "x"), SubmitOptions::default())
            .await;

        assert!(matches!(result, Err(SubmitError::Request(RequestError::InvalidHeaderName(_)))));
        assert!(transport.keys().is_empty());
    }
}
