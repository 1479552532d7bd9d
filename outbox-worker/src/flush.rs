//! # Background Flush Controller
//!
//! Drains one queue lane in FIFO order when a sync trigger fires.
//!
//! ```text
//!   Idle ──trigger──▶ Draining ──cycle done──▶ Idle
//!                       │  ▲
//!             trigger   │  │ rerun requested
//!             (flag)    ▼  │
//!                     cycle done
//! ```
//!
//! Per cycle: expired items are dropped silently, then each remaining item
//! has its attempt count persisted and is delivered verbatim. A success, a
//! rejection, or a request the transport cannot build removes the item and
//! notifies pages. The first network failure
//! ends the cycle with that item still at the front, so nothing behind it is
//! delivered first. A `QUEUE_STATUS` snapshot is broadcast after every cycle.
//!
//! This controller is the only caller of [`QueueStore::remove`] and
//! [`QueueStore::update`] on the durable store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use outbox_core::{
    current_timestamp_ms, DeliveryOutcome, IdempotencyKey, Notification, QueueStatus,
    QueueStore, QueuedRequest, StoreError, Transport, UNSENT_STATUS,
};
use serde::Serialize;

use crate::metrics;
use crate::notifier::Notifier;

/// Whether a lane is being drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushState {
    /// No cycle running.
    #[default]
    Idle,
    /// A cycle is in progress.
    Draining,
}

/// What a flush did. Counts cover every cycle of one `flush` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Lane that was drained.
    pub tag: String,
    /// Items confirmed and removed.
    pub delivered: usize,
    /// Items refused by the server, or impossible to send, and removed.
    pub rejected: usize,
    /// Items dropped for exceeding the retention window.
    pub expired: usize,
    /// Items left in the lane afterwards.
    pub remaining: usize,
    /// Item the last cycle stopped at, if it stopped early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_on: Option<IdempotencyKey>,
    /// Whether the last cycle stopped on a storage failure.
    pub store_failed: bool,
}

impl FlushReport {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Self::default()
        }
    }

    /// Whether the lane was left empty.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.remaining == 0 && self.halted_on.is_none() && !self.store_failed
    }

    fn absorb(&mut self, cycle: Self) {
        self.delivered += cycle.delivered;
        self.rejected += cycle.rejected;
        self.expired += cycle.expired;
        self.remaining = cycle.remaining;
        self.halted_on = cycle.halted_on;
        self.store_failed = cycle.store_failed;
    }
}

#[derive(Debug, Default)]
struct LaneState {
    state: FlushState,
    rerun: bool,
}

/// Drains queue lanes against a transport.
pub struct FlushController {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    notifier: Notifier,
    retention: Duration,
    lanes: Mutex<HashMap<String, LaneState>>,
}

impl std::fmt::Debug for FlushController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushController")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl FlushController {
    /// Create a controller over `store`.
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        notifier: Notifier,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            notifier,
            retention,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of lane `tag`.
    #[must_use]
    pub fn state(&self, tag: &str) -> FlushState {
        self.lock_lanes()
            .get(tag)
            .map_or(FlushState::Idle, |lane| lane.state)
    }

    /// Drain lane `tag`.
    ///
    /// If the lane is already draining, a rerun is requested and `None` is
    /// returned; the running flush picks it up before going idle.
    pub async fn flush(&self, tag: &str) -> Option<FlushReport> {
        if !self.begin(tag) {
            tracing::debug!(tag, "Flush already running, rerun requested");
            return None;
        }

        let mut report = FlushReport::new(tag);
        loop {
            report.absorb(self.cycle(tag).await);
            if !self.finish_or_rerun(tag) {
                break;
            }
            tracing::debug!(tag, "Rerunning flush for trigger received mid-cycle");
        }
        Some(report)
    }

    fn lock_lanes(&self) -> std::sync::MutexGuard<'_, HashMap<String, LaneState>> {
        self.lanes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn begin(&self, tag: &str) -> bool {
        let mut lanes = self.lock_lanes();
        let lane = lanes.entry(tag.to_string()).or_default();
        if lane.state == FlushState::Draining {
            lane.rerun = true;
            return false;
        }
        lane.state = FlushState::Draining;
        lane.rerun = false;
        true
    }

    /// Returns `true` if another cycle should run.
    fn finish_or_rerun(&self, tag: &str) -> bool {
        let mut lanes = self.lock_lanes();
        let lane = lanes.entry(tag.to_string()).or_default();
        if lane.rerun {
            lane.rerun = false;
            return true;
        }
        lane.state = FlushState::Idle;
        false
    }

    async fn cycle(&self, tag: &str) -> FlushReport {
        let mut report = FlushReport::new(tag);

        match self.lane_items(tag) {
            Ok(items) => self.drain(items, &mut report).await,
            Err(e) => {
                tracing::error!(tag, "Flush could not read queue: {e}");
                report.store_failed = true;
            }
        }

        match self.lane_items(tag) {
            Ok(items) => {
                let status = QueueStatus::from_items(tag, &items);
                report.remaining = status.pending;
                metrics::set_queue_depth(tag, status.pending);
                self.notifier.notify(Notification::QueueStatus(status));
            }
            Err(e) => {
                tracing::error!(tag, "Flush could not snapshot queue: {e}");
                report.store_failed = true;
            }
        }

        let outcome = if report.store_failed {
            "store_error"
        } else if report.halted_on.is_some() {
            "halted"
        } else {
            "drained"
        };
        metrics::record_flush_cycle(outcome);
        tracing::info!(
            tag,
            delivered = report.delivered,
            rejected = report.rejected,
            expired = report.expired,
            remaining = report.remaining,
            outcome,
            "Flush cycle finished"
        );
        report
    }

    fn lane_items(&self, tag: &str) -> Result<Vec<QueuedRequest>, StoreError> {
        Ok(self
            .store
            .list_all()?
            .into_iter()
            .filter(|item| item.tag == tag)
            .collect())
    }

    async fn drain(&self, items: Vec<QueuedRequest>, report: &mut FlushReport) {
        let now = current_timestamp_ms();
        let (expired, live): (Vec<_>, Vec<_>) = items
            .into_iter()
            .partition(|item| item.is_expired(now, self.retention));

        for item in expired {
            if let Err(e) = self.store.remove(&item.key) {
                tracing::error!(key = %item.key, "Failed to drop expired item: {e}");
                report.store_failed = true;
                report.halted_on = Some(item.key);
                return;
            }
            tracing::info!(key = %item.key, age_ms = item.age_ms(now), "Dropped expired queued request");
            report.expired += 1;
        }
        if report.expired > 0 {
            metrics::record_expired(report.expired);
        }

        for mut item in live {
            item.attempts = item.attempts.saturating_add(1);
            match self.store.update(&item) {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) => {
                    tracing::debug!(key = %item.key, "Item left the queue before delivery");
                    continue;
                }
                Err(e) => {
                    tracing::error!(key = %item.key, "Failed to record delivery attempt: {e}");
                    report.store_failed = true;
                    report.halted_on = Some(item.key);
                    return;
                }
            }

            let status = match DeliveryOutcome::attempt(self.transport.as_ref(), &item).await {
                DeliveryOutcome::Delivered(response) => {
                    let order_id = response.server_id();
                    if let Err(e) = self.store.remove(&item.key) {
                        // Delivered but still queued: the next cycle redelivers
                        // under the same key.
                        tracing::error!(key = %item.key, "Failed to remove delivered item: {e}");
                        report.store_failed = true;
                        report.halted_on = Some(item.key);
                        return;
                    }
                    tracing::info!(key = %item.key, attempts = item.attempts, order_id = ?order_id, "Queued request delivered");
                    metrics::record_delivered("flush");
                    report.delivered += 1;
                    self.notifier.notify(Notification::OrderSynced {
                        key: Some(item.key),
                        order_id,
                    });
                    continue;
                }
                DeliveryOutcome::Rejected(response) => {
                    tracing::warn!(key = %item.key, status = response.status, "Queued request rejected by server");
                    response.status
                }
                DeliveryOutcome::Undeliverable(reason) => {
                    tracing::error!(key = %item.key, "Queued request cannot be sent, dropping: {reason}");
                    UNSENT_STATUS
                }
                DeliveryOutcome::NetworkFailure(e) => {
                    tracing::info!(key = %item.key, attempts = item.attempts, "Delivery failed, stopping flush: {e}");
                    metrics::record_network_failure("flush");
                    report.halted_on = Some(item.key);
                    return;
                }
            };

            if let Err(e) = self.store.remove(&item.key) {
                tracing::error!(key = %item.key, "Failed to remove rejected item: {e}");
                report.store_failed = true;
                report.halted_on = Some(item.key);
                return;
            }
            metrics::record_rejected("flush", status);
            report.rejected += 1;
            self.notifier.notify(Notification::ItemRejected {
                key: item.key,
                status,
            });
        }
    }
}
