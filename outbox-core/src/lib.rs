//! # Outbox Core
//!
//! Offline-resilient request queuing shared by the worker and page contexts.
//! Compiles to WASM for use from a plain page script.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  outbox-core                    │
//! ├─────────────────────────────────────────────────┤
//! │  Request model     │  Queue stores              │
//! │  - Idempotency key │  - File (durable, worker)  │
//! │  - Captured body   │  - Blob (page storage)     │
//! │  - Mutating verbs  │  - Memory                  │
//! ├─────────────────────────────────────────────────┤
//! │  Fallback queue    │  Messages & reconciliation │
//! │  - queuedOrders    │  - Page -> worker          │
//! │  - Retry pass      │  - Worker -> pages         │
//! └─────────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod fallback;
pub mod message;
pub mod reconcile;
pub mod request;
pub mod state;
pub mod storage;
pub mod store;
pub mod transport;

#[cfg(feature = "wasm")]
pub mod wasm;

pub use error::{OutboxError, OutboxResult};
pub use fallback::{LocalFallbackQueue, RetryReport, QUEUED_ORDERS_KEY};
pub use message::{ClientMessage, Notification, QueueRequest, QueueStatus, SyncEvent};
pub use reconcile::{ItemState, Navigation, PageView};
pub use request::{
    current_timestamp_ms, HttpMethod, IdempotencyKey, MutatingRequest, QueuedRequest,
    RequestBody, RequestError, API_SYNC_TAG, DEFAULT_RETENTION, DEFAULT_SYNC_TAG,
    IDEMPOTENCY_HEADER,
};
pub use state::{ConnectionStatus, WorkerLifecycle};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use store::{
    BlobQueueStore, FileQueueStore, MemoryQueueStore, PendingOperation, QueueStore, StoreError,
};
pub use transport::{
    DeliveryOutcome, DeliveryResponse, Transport, TransportError, UNSENT_STATUS,
};

/// Outbox core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
