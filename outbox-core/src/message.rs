//! Typed cross-context messages.
//!
//! ## Page -> Worker
//!
//! - `{"type": "QUEUE_REQUEST", "key": "...", "url": "...", "method": "POST", "headers": [[..]], "body": "..."}`
//! - `{"type": "SKIP_WAITING"}`
//! - `{"type": "GET_QUEUE_STATUS", "tag": "sync-orders"}`
//!
//! ## Worker -> Pages
//!
//! - `{"type": "ORDER_SYNCED", "key": "...", "orderId": "7"}`
//! - `{"type": "ITEM_REJECTED", "key": "...", "status": 409}`
//! - `{"type": "QUEUE_STATUS", "tag": "...", "pending": 2, "keys": [..]}`
//!
//! ## Platform -> Worker
//!
//! A [`SyncEvent`] carrying the tag of the queue to flush.

use serde::{Deserialize, Serialize};

use crate::request::{
    HttpMethod, IdempotencyKey, MutatingRequest, QueuedRequest, RequestBody, RequestError,
    DEFAULT_SYNC_TAG,
};

/// Body of a `QUEUE_REQUEST` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRequest {
    /// Deduplication key of the logical operation.
    pub key: IdempotencyKey,
    /// Target endpoint.
    pub url: String,
    /// HTTP verb.
    pub method: HttpMethod,
    /// Ordered header pairs.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Serialized payload.
    #[serde(default)]
    pub body: RequestBody,
    /// Queue lane; defaults to the order queue.
    #[serde(default = "default_tag")]
    pub tag: String,
}

impl QueueRequest {
    /// Convert into the item to persist.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] if the captured request is invalid.
    pub fn into_queued(self, now_ms: u64) -> Result<QueuedRequest, RequestError> {
        let request = MutatingRequest {
            url: self.url,
            method: self.method,
            headers: self.headers,
            body: self.body,
            key: Some(self.key),
        };
        request.into_queued(&self.tag, now_ms)
    }
}

/// Messages a page sends to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Durably enqueue this mutating request.
    QueueRequest(QueueRequest),
    /// Activate a waiting worker immediately.
    SkipWaiting,
    /// Ask for a queue snapshot.
    GetQueueStatus {
        /// Lane to report; `None` reports the order queue.
        #[serde(default)]
        tag: Option<String>,
    },
}

fn default_tag() -> String {
    DEFAULT_SYNC_TAG.to_string()
}

impl ClientMessage {
    /// Build an enqueue message from a request whose key is already resolved.
    pub fn queue_request(mut request: MutatingRequest, tag: impl Into<String>) -> Self {
        let headers = request.headers_with_key();
        let key = request.ensure_key();
        Self::QueueRequest(QueueRequest {
            key,
            url: request.url,
            method: request.method,
            headers,
            body: request.body,
            tag: tag.into(),
        })
    }

    /// Wire name of this message, for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::QueueRequest(_) => "QUEUE_REQUEST",
            Self::SkipWaiting => "SKIP_WAITING",
            Self::GetQueueStatus { .. } => "GET_QUEUE_STATUS",
        }
    }
}

/// Platform "connectivity restored" event naming the queue to flush.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Tag the sync was registered under.
    pub tag: String,
}

impl SyncEvent {
    /// Create a sync event for `tag`.
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

/// Snapshot of one queue lane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Lane tag.
    pub tag: String,
    /// Number of pending items.
    pub pending: usize,
    /// Keys of pending items, oldest first.
    pub keys: Vec<IdempotencyKey>,
}

impl QueueStatus {
    /// Snapshot the items of lane `tag` from a full listing.
    #[must_use]
    pub fn from_items(tag: &str, items: &[QueuedRequest]) -> Self {
        let keys: Vec<IdempotencyKey> = items
            .iter()
            .filter(|i| i.tag == tag)
            .map(|i| i.key.clone())
            .collect();
        Self {
            tag: tag.to_string(),
            pending: keys.len(),
            keys,
        }
    }
}

/// Messages the worker broadcasts to every open page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    /// A queued operation reached the server.
    OrderSynced {
        /// Key of the synced item.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<IdempotencyKey>,
        /// Server-assigned identifier, when the response carried one.
        #[serde(
            rename = "orderId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        order_id: Option<String>,
    },
    /// A queued operation was definitively refused by the server.
    ItemRejected {
        /// Key of the rejected item.
        key: IdempotencyKey,
        /// HTTP status returned.
        status: u16,
    },
    /// Current contents of a queue lane.
    QueueStatus(QueueStatus),
}

impl Notification {
    /// Wire name of this notification, for logs and SSE event names.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::OrderSynced { .. } => "ORDER_SYNCED",
            Self::ItemRejected { .. } => "ITEM_REJECTED",
            Self::QueueStatus(_) => "QUEUE_STATUS",
        }
    }
}
