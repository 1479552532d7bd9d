//! HTTP bridge for pages running outside the worker process.
//!
//! | Route                     | Purpose                                   |
//! |---------------------------|-------------------------------------------|
//! | `POST /outbox/messages`   | page -> worker wire message               |
//! | `POST /outbox/sync/{tag}` | platform sync trigger                     |
//! | `POST /outbox/connectivity` | platform online/offline signal        |
//! | `GET /outbox/status`      | lane snapshot (`?tag=`)                   |
//! | `GET /outbox/events`      | SSE stream of worker notifications        |
//! | `GET /health/live`, `GET /health/ready` | health checks               |
//! | `GET /metrics`            | Prometheus exposition                     |

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use metrics_exporter_prometheus::PrometheusHandle;
use outbox_core::{ClientMessage, OutboxError, SyncEvent, IDEMPOTENCY_HEADER};
use serde::Deserialize;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::error::WorkerError;
use crate::health;
use crate::worker::WorkerReply;
use crate::AppState;

/// Build the bridge router. `/metrics` is mounted when a handle is given.
pub fn build_router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let app = Router::new()
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/outbox/messages", post(post_message))
        .route("/outbox/sync/{tag}", post(trigger_sync))
        .route("/outbox/connectivity", post(set_connectivity))
        .route("/outbox/status", get(queue_status))
        .route("/outbox/events", get(events))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state);

    match metrics {
        Some(handle) => app.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(handle),
        ),
        None => app,
    }
}

/// Build a CORS layer that only allows localhost origins.
fn build_cors_layer(port: u16) -> CorsLayer {
    let localhost_origins = [
        format!("http://localhost:{port}"),
        format!("http://127.0.0.1:{port}"),
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
        "http://localhost:8080".to_string(),
        "http://127.0.0.1:3000".to_string(),
        "http://127.0.0.1:5173".to_string(),
        "http://127.0.0.1:8080".to_string(),
    ];

    let origins: Vec<HeaderValue> = localhost_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("idempotency-key"),
        ])
}

/// Serve the bridge on localhost until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the port cannot be bound.
pub async fn serve(
    state: AppState,
    metrics: Option<PrometheusHandle>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_router(state, metrics).layer(build_cors_layer(port));

    // Bind to localhost ONLY
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Outbox bridge listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

fn error_response(e: &WorkerError) -> Response {
    let status = match e {
        WorkerError::Outbox(OutboxError::Store(_)) => StatusCode::INSUFFICIENT_STORAGE,
        WorkerError::Outbox(OutboxError::Request(_)) => StatusCode::BAD_REQUEST,
        WorkerError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

/// Accept a page -> worker wire message.
#[tracing::instrument(name = "post_message", skip(state, message), fields(kind = message.kind()))]
async fn post_message(
    State(state): State<AppState>,
    Json(message): Json<ClientMessage>,
) -> Response {
    match state.worker.post(message).await {
        Ok(reply @ WorkerReply::Queued { .. }) => {
            (StatusCode::ACCEPTED, Json(reply)).into_response()
        }
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Fire a sync event and report the resulting flush.
#[tracing::instrument(name = "trigger_sync", skip(state))]
async fn trigger_sync(State(state): State<AppState>, Path(tag): Path<String>) -> Response {
    match state.worker.sync(SyncEvent::new(tag)).await {
        Ok(Some(report)) => (StatusCode::OK, Json(report)).into_response(),
        Ok(None) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "not_run" })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct ConnectivityUpdate {
    online: bool,
}

/// Record a platform online/offline transition.
#[tracing::instrument(name = "set_connectivity", skip(state))]
async fn set_connectivity(
    State(state): State<AppState>,
    Json(update): Json<ConnectivityUpdate>,
) -> Json<serde_json::Value> {
    let changed = state.connectivity.set_online(update.online);
    Json(serde_json::json!({
        "status": state.connectivity.current(),
        "changed": changed,
    }))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    tag: Option<String>,
}

/// Snapshot one lane.
#[tracing::instrument(name = "queue_status", skip(state))]
async fn queue_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    match state.worker.status(query.tag.as_deref()).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(&e),
    }
}

/// SSE stream of worker notifications.
///
/// A client that falls behind receives a `LAGGED` event and should
/// re-query `/outbox/status`.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.worker.subscribe()).map(|result| {
        let event = match result {
            Ok(notification) => Event::default()
                .event(notification.kind())
                .data(serde_json::to_string(&notification).unwrap_or_default()),
            Err(BroadcastStreamRecvError::Lagged(missed)) => Event::default()
                .event("LAGGED")
                .data(serde_json::json!({ "missed": missed }).to_string()),
        };
        Ok(event)
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("heartbeat"),
    )
}

/// Prometheus metrics endpoint.
#[tracing::instrument(name = "metrics", skip(handle))]
async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutboxConfig;
    use crate::connectivity::ConnectivityMonitor;
    use crate::worker::Worker;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use outbox_core::{
        ConnectionStatus, DeliveryResponse, MemoryQueueStore, QueuedRequest, Transport,
        TransportError,
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn deliver(&self, _: &QueuedRequest) -> Result<DeliveryResponse, TransportError> {
            Err(TransportError::Offline)
        }
    }

    fn app() -> (Router, ConnectivityMonitor) {
        let config = OutboxConfig::new(
            "unused",
            url::Url::parse("http://localhost/").expect("url"),
        );
        let store = Arc::new(MemoryQueueStore::new());
        let connectivity = ConnectivityMonitor::new(ConnectionStatus::Offline);
        let worker = Worker::spawn(
            &config,
            store.clone(),
            Arc::new(Unreachable),
            connectivity.clone(),
        );
        let state = AppState::new(worker, store, connectivity.clone());
        (build_router(state, None), connectivity)
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn test_status_route_defaults_to_order_lane() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/outbox/status")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["tag"], outbox_core::DEFAULT_SYNC_TAG);
        assert_eq!(body["pending"], 0);
    }

    #[tokio::test]
    async fn test_connectivity_route_updates_monitor() {
        let (app, connectivity) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/outbox/connectivity")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"online":true}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "online");
        assert_eq!(body["changed"], true);
        assert!(connectivity.current().is_online());
    }

    #[tokio::test]
    async fn test_skip_waiting_message_reports_lifecycle() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/outbox/messages")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"type":"SKIP_WAITING"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "activated");
        assert_eq!(body["lifecycle"], "active");
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health/live")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[test]
    fn test_error_status_mapping() {
        let stopped = error_response(&WorkerError::Stopped);
        assert_eq!(stopped.status(), StatusCode::SERVICE_UNAVAILABLE);

        let full = error_response(&WorkerError::Outbox(OutboxError::Store(
            outbox_core::StoreError::QuotaExceeded { limit: 1 },
        )));
        assert_eq!(full.status(), StatusCode::INSUFFICIENT_STORAGE);

        let bad = error_response(&WorkerError::Outbox(OutboxError::Request(
            outbox_core::RequestError::EmptyUrl,
        )));
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_cors_header_name_matches_idempotency_header() {
        assert!(IDEMPOTENCY_HEADER.eq_ignore_ascii_case("idempotency-key"));
    }
}
