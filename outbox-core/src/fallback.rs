//! # Local Fallback Queue
//!
//! Used by a page that has no persistent worker. Pending operations live as
//! one JSON array under a well-known key in synchronous page storage and are
//! retried manually when connectivity returns.
//!
//! ## Usage
//!
//! ```text
//! 1. Offline submit: add_queued_order() appends to `queuedOrders`
//! 2. Reconnect or poll: retry_queued_orders() makes one pass
//! 3. Confirmed entries are dropped; failed ones stay, in order
//! 4. Entries past the retention window, or that can never be sent, are
//!    dropped without a network attempt being counted against them
//! ```
//!
//! The retry pass persists its result in a single write at the end, so a
//! crash mid-pass can redeliver confirmed entries. Servers collapse those
//! through the idempotency key.

use std::time::Duration;

use crate::request::{current_timestamp_ms, IdempotencyKey, QueuedRequest, DEFAULT_RETENTION};
use crate::storage::KeyValueStorage;
use crate::store::{BlobQueueStore, PendingOperation, StoreError};
use crate::transport::{DeliveryOutcome, Transport};

/// Storage key of the fallback queue.
pub const QUEUED_ORDERS_KEY: &str = "queuedOrders";

/// Default bound on queued entries.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Outcome of one retry pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// Entries confirmed by the server during this pass, marked synced.
    pub synced: Vec<PendingOperation>,
    /// Entries that got an error status and were kept.
    pub rejected: usize,
    /// Entries that got no response and were kept.
    pub network_failures: usize,
    /// Entries dropped for outliving the retention window.
    pub expired: usize,
    /// Entries dropped because the transport could not build them.
    pub undeliverable: usize,
    /// Entries left in storage after the pass.
    pub remaining: usize,
}

impl RetryReport {
    /// Whether anything left in storage is still waiting on the network.
    ///
    /// Entries the server refused stay queued but only an explicit pass
    /// retries them; entries appended mid-pass were never attempted.
    #[must_use]
    pub fn awaits_network(&self) -> bool {
        self.remaining > self.rejected
    }
}

/// Bounded pending-operation queue in synchronous page storage.
#[derive(Debug, Clone)]
pub struct LocalFallbackQueue<S> {
    blob: BlobQueueStore<S>,
    max_entries: usize,
    retention: Duration,
}

impl<S: KeyValueStorage> LocalFallbackQueue<S> {
    /// Create a queue under [`QUEUED_ORDERS_KEY`].
    pub fn new(storage: S) -> Self {
        Self::with_storage_key(storage, QUEUED_ORDERS_KEY)
    }

    /// Create a queue under a custom storage key.
    pub fn with_storage_key(storage: S, storage_key: impl Into<String>) -> Self {
        Self {
            blob: BlobQueueStore::new(storage, storage_key),
            max_entries: DEFAULT_MAX_ENTRIES,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Change how long an entry may wait before a retry pass drops it.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Change the entry bound (oldest entries are dropped beyond it).
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// The underlying blob store, usable wherever a `QueueStore` is expected.
    #[must_use]
    pub fn store(&self) -> &BlobQueueStore<S> {
        &self.blob
    }

    /// Append an order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] if the key is already queued, or the
    /// storage error if the write fails.
    pub fn add_queued_order(&self, order: QueuedRequest) -> Result<(), StoreError> {
        let mut ops = self.blob.load()?;
        if ops.iter().any(|op| op.request.key == order.key) {
            return Err(StoreError::Duplicate(order.key.to_string()));
        }
        while ops.len() >= self.max_entries {
            let dropped = ops.remove(0);
            tracing::warn!(key = %dropped.request.key, "Fallback queue full, dropping oldest entry");
        }
        ops.push(PendingOperation::new(order));
        self.blob.save(&ops)
    }

    /// Current pending operations, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    pub fn queued_orders(&self) -> Result<Vec<PendingOperation>, StoreError> {
        self.blob.load()
    }

    /// Number of pending operations.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.blob.load()?.len())
    }

    /// Whether nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Try every pending entry once.
    ///
    /// Expired entries are dropped first, unsent. Entries that fail (no
    /// response or error status) are kept in their original order;
    /// confirmed entries are dropped and `on_success` is called with their
    /// key and server-assigned id. Entries the transport cannot build are
    /// dropped. Entries appended by this context while the pass was in
    /// flight are kept after the survivors.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read or the final write fails.
    pub async fn retry_queued_orders<F>(
        &self,
        transport: &dyn Transport,
        mut on_success: F,
    ) -> Result<RetryReport, StoreError>
    where
        F: FnMut(&IdempotencyKey, Option<&str>),
    {
        let snapshot = self.blob.load()?;
        let mut report = RetryReport::default();
        if snapshot.is_empty() {
            return Ok(report);
        }

        let now = current_timestamp_ms();
        let mut kept = Vec::with_capacity(snapshot.len());
        let mut seen = Vec::with_capacity(snapshot.len());
        for mut op in snapshot {
            seen.push(op.request.key.clone());
            if op.request.is_expired(now, self.retention) {
                tracing::warn!(
                    key = %op.request.key,
                    age_ms = op.request.age_ms(now),
                    "Queued order expired, dropping"
                );
                report.expired += 1;
                continue;
            }
            op.request.attempts = op.request.attempts.saturating_add(1);
            match DeliveryOutcome::attempt(transport, &op.request).await {
                DeliveryOutcome::Delivered(response) => {
                    let server_id = response.server_id();
                    tracing::info!(key = %op.request.key, server_id = ?server_id, "Queued order synced");
                    on_success(&op.request.key, server_id.as_deref());
                    op.synced = true;
                    report.synced.push(op);
                }
                DeliveryOutcome::Rejected(response) => {
                    tracing::warn!(key = %op.request.key, status = response.status, "Queued order rejected, keeping");
                    report.rejected += 1;
                    kept.push(op);
                }
                DeliveryOutcome::NetworkFailure(e) => {
                    tracing::debug!(key = %op.request.key, "Queued order still offline: {e}");
                    report.network_failures += 1;
                    kept.push(op);
                }
                DeliveryOutcome::Undeliverable(reason) => {
                    tracing::error!(key = %op.request.key, "Queued order cannot be sent, dropping: {reason}");
                    report.undeliverable += 1;
                }
            }
        }

        let appended: Vec<PendingOperation> = self
            .blob
            .load()?
            .into_iter()
            .filter(|op| !seen.contains(&op.request.key))
            .collect();
        kept.extend(appended);
        report.remaining = kept.len();
        self.blob.save(&kept)?;
        Ok(report)
    }

    /// Drop everything pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be modified.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.blob.save(&[])
    }

}
