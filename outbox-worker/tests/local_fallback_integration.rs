//! Integration tests for the page-local `queuedOrders` fallback used when
//! no worker is available.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_config, RecordingTransport};
use outbox_core::{
    current_timestamp_ms, ConnectionStatus, FileStorage, HttpMethod, KeyValueStorage,
    LocalFallbackQueue, MemoryStorage, MutatingRequest, Notification, DEFAULT_SYNC_TAG,
    IDEMPOTENCY_HEADER, QUEUED_ORDERS_KEY,
};
use outbox_worker::{
    ConnectivityMonitor, DeferredPath, OutboxConfig, RequestEnqueuer, RetryConfig, SubmitOptions,
};

const ORDER_BODY: &str = r#"{"items":[{"id":"1","qty":1}],"tip":0}"#;

/// A retry timer slow enough that only explicit passes run during a test.
fn idle_retry() -> RetryConfig {
    RetryConfig::new(60_000, 60_000, 2.0)
}

fn page_config() -> OutboxConfig {
    let mut config = test_config(std::path::Path::new("unused"));
    config.retry = idle_retry();
    config
}

/// An enqueuer with no worker, deferring into `storage`.
fn local_enqueuer(
    config: &OutboxConfig,
    transport: Arc<RecordingTransport>,
    connectivity: ConnectivityMonitor,
    storage: Arc<dyn KeyValueStorage>,
) -> RequestEnqueuer {
    RequestEnqueuer::from_config(
        config,
        transport,
        connectivity,
        DeferredPath::detect(None, storage, config),
    )
}

#[tokio::test]
async fn test_offline_order_is_stored_then_delivered_on_retry() {
    let transport = RecordingTransport::new(1);
    transport.set_online(false);
    let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
    let enqueuer = local_enqueuer(
        &page_config(),
        transport.clone(),
        ConnectivityMonitor::new(ConnectionStatus::Offline),
        Arc::clone(&storage),
    );

    let outcome = enqueuer
        .submit(
            MutatingRequest::post_json("/api/orders", ORDER_BODY).with_key("abc"),
            SubmitOptions::default(),
        )
        .await
        .expect("submit");
    assert!(outcome.is_queued());
    assert_eq!(outcome.key().as_str(), "abc");

    let DeferredPath::Local(local) = enqueuer.deferred() else {
        panic!("expected the local fallback path");
    };
    let entries = local.queue().queued_orders().expect("entries");
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.request.key.as_str(), "abc");
    assert_eq!(entry.request.url, "/api/orders");
    assert_eq!(entry.request.method, HttpMethod::Post);
    assert_eq!(entry.request.body.as_bytes(), ORDER_BODY.as_bytes());
    assert!(!entry.synced);
    assert!(storage
        .get_item(QUEUED_ORDERS_KEY)
        .expect("read")
        .is_some_and(|raw| raw.contains("abc")));

    transport.set_online(true);
    let report = enqueuer
        .retry_local()
        .await
        .expect("retry")
        .expect("local path");
    assert_eq!(report.synced.len(), 1);
    assert_eq!(report.remaining, 0);
    assert!(local.queue().queued_orders().expect("entries").is_empty());

    let received = transport.received();
    let last = received.last().expect("delivered");
    assert_eq!(last.url, "/api/orders");
    assert_eq!(last.header(IDEMPOTENCY_HEADER), Some("abc"));
}

#[tokio::test]
async fn test_reconnect_triggers_background_retry() {
    let transport = RecordingTransport::new(7);
    transport.set_online(false);
    let connectivity = ConnectivityMonitor::new(ConnectionStatus::Offline);
    let enqueuer = local_enqueuer(
        &page_config(),
        transport.clone(),
        connectivity.clone(),
        Arc::new(MemoryStorage::new()),
    );
    let mut events = enqueuer.subscribe();

    enqueuer
        .submit(
            MutatingRequest::post_json("/api/orders", ORDER_BODY).with_key("late"),
            SubmitOptions::default(),
        )
        .await
        .expect("submit");

    transport.set_online(true);
    connectivity.set_online(true);

    let synced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("notification") {
                Notification::OrderSynced { key, order_id } => return (key, order_id),
                _ => continue,
            }
        }
    })
    .await
    .expect("order synced in time");
    assert_eq!(synced.0.map(|k| k.to_string()), Some("late".to_string()));
    assert_eq!(synced.1.as_deref(), Some("7"));
}

#[tokio::test]
async fn test_queued_orders_survive_page_reload() {
    let dir = tempfile::tempdir().expect("tempdir");

    // Phase 1: submit while offline, then drop the page
    {
        let storage: Arc<dyn KeyValueStorage> =
            Arc::new(FileStorage::open(dir.path()).expect("storage"));
        let enqueuer = local_enqueuer(
            &page_config(),
            RecordingTransport::new(1),
            ConnectivityMonitor::new(ConnectionStatus::Offline),
            storage,
        );
        enqueuer
            .submit(
                MutatingRequest::post_json("/api/orders", ORDER_BODY).with_key("kept"),
                SubmitOptions::default(),
            )
            .await
            .expect("submit");
    }

    // Phase 2: a fresh page over the same storage sees the entry
    let queue = LocalFallbackQueue::new(FileStorage::open(dir.path()).expect("storage"));
    let entries = queue.queued_orders().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].request.key.as_str(), "kept");
}

#[tokio::test]
async fn test_duplicate_submit_keeps_one_entry() {
    let enqueuer = local_enqueuer(
        &page_config(),
        RecordingTransport::new(1),
        ConnectivityMonitor::new(ConnectionStatus::Offline),
        Arc::new(MemoryStorage::new()),
    );

    for _ in 0..2 {
        enqueuer
            .submit(
                MutatingRequest::post_json("/api/orders", ORDER_BODY).with_key("same"),
                SubmitOptions::default(),
            )
            .await
            .expect("submit");
    }

    let DeferredPath::Local(local) = enqueuer.deferred() else {
        panic!("expected the local fallback path");
    };
    assert_eq!(local.queue().len().expect("len"), 1);
}

#[tokio::test]
async fn test_refused_order_stops_background_timer() {
    let transport = RecordingTransport::new(1);
    transport.set_online(false);
    transport.set_rejecting(Some(422));
    let connectivity = ConnectivityMonitor::new(ConnectionStatus::Offline);
    let mut config = page_config();
    config.retry = RetryConfig::new(20, 20, 1.0);
    let enqueuer = local_enqueuer(
        &config,
        transport.clone(),
        connectivity.clone(),
        Arc::new(MemoryStorage::new()),
    );

    enqueuer
        .submit(
            MutatingRequest::post_json("/api/orders", ORDER_BODY).with_key("refused"),
            SubmitOptions::deferred(),
        )
        .await
        .expect("submit");

    transport.set_online(true);
    connectivity.set_online(true);
    assert!(common::wait_until(|| transport.received().len() == 1).await);

    // The timer gave up after the refusal instead of resending every tick
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.received().len(), 1);

    let DeferredPath::Local(local) = enqueuer.deferred() else {
        panic!("expected the local fallback path");
    };
    assert_eq!(local.queue().len().expect("len"), 1);

    // An explicit pass still resends it
    transport.set_rejecting(None);
    let report = enqueuer
        .retry_local()
        .await
        .expect("retry")
        .expect("local path");
    assert_eq!(report.synced.len(), 1);
    assert_eq!(transport.received().len(), 2);
}

#[tokio::test]
async fn test_stale_order_is_dropped_unsent() {
    let transport = RecordingTransport::new(1);
    let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
    let mut config = page_config();
    config.retention = Duration::from_secs(60);

    let stale = MutatingRequest::post_json("/api/orders", ORDER_BODY)
        .with_key("stale")
        .into_queued(DEFAULT_SYNC_TAG, current_timestamp_ms().saturating_sub(120_000))
        .expect("valid request");
    LocalFallbackQueue::new(Arc::clone(&storage))
        .add_queued_order(stale)
        .expect("seed");

    let enqueuer = local_enqueuer(
        &config,
        transport.clone(),
        ConnectivityMonitor::default(),
        storage,
    );
    let report = enqueuer
        .retry_local()
        .await
        .expect("retry")
        .expect("local path");
    assert_eq!(report.expired, 1);
    assert_eq!(report.remaining, 0);
    assert!(transport.received().is_empty());
}

#[tokio::test]
async fn test_configured_storage_key_is_used() {
    let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
    let mut config = page_config();
    config.fallback_storage_key = "checkoutQueue".to_string();
    let enqueuer = local_enqueuer(
        &config,
        RecordingTransport::new(1),
        ConnectivityMonitor::new(ConnectionStatus::Offline),
        Arc::clone(&storage),
    );

    enqueuer
        .submit(
            MutatingRequest::post_json("/api/orders", ORDER_BODY).with_key("keyed"),
            SubmitOptions::default(),
        )
        .await
        .expect("submit");

    assert!(storage
        .get_item("checkoutQueue")
        .expect("read")
        .is_some_and(|raw| raw.contains("keyed")));
    assert!(storage.get_item(QUEUED_ORDERS_KEY).expect("read").is_none());
}
