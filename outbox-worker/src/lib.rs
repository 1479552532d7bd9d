//! # Outbox Worker Library
//!
//! The worker context (durable queue, background flushing, notifications)
//! and the page-side enqueuer that talks to it.
//! This library is used by both the binary and integration tests.

use std::sync::Arc;

use outbox_core::QueueStore;

pub mod config;
pub mod connectivity;
pub mod enqueuer;
pub mod error;
pub mod flush;
pub mod health;
pub mod metrics;
pub mod notifier;
pub mod page;
pub mod server;
pub mod transport;
pub mod worker;

pub use config::{OutboxArgs, OutboxConfig, RetryConfig};
pub use connectivity::ConnectivityMonitor;
pub use enqueuer::{
    DeferredPath, LocalDeferral, RequestEnqueuer, SubmitError, SubmitOptions, SubmitOutcome,
};
pub use error::{WorkerError, WorkerResult};
pub use flush::{FlushController, FlushReport, FlushState};
pub use notifier::Notifier;
pub use page::{PageSession, Transition};
pub use transport::HttpTransport;
pub use worker::{Worker, WorkerHandle, WorkerReply};

/// Shared state of the HTTP bridge.
#[derive(Clone)]
pub struct AppState {
    /// Handle to the running worker.
    pub worker: WorkerHandle,
    /// The worker's durable queue, read directly by health checks.
    pub store: Arc<dyn QueueStore>,
    /// Connectivity signal the worker listens to.
    pub connectivity: ConnectivityMonitor,
}

impl AppState {
    /// Bundle the pieces the bridge needs.
    pub fn new(
        worker: WorkerHandle,
        store: Arc<dyn QueueStore>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        Self {
            worker,
            store,
            connectivity,
        }
    }
}
