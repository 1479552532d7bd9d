//! Worker-to-pages broadcast.
//!
//! Delivery is fire-and-forget. A page that is not subscribed when an event
//! is sent never sees it, and a page that falls behind is told how many
//! events it lost. Either way the page re-queries queue status instead of
//! trusting its local view.

use outbox_core::Notification;
use tokio::sync::broadcast;

use crate::metrics;

/// One-to-many channel from the worker to every open page.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    /// Create a notifier buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe a page. Events sent before this call are not replayed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Number of pages currently subscribed.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Broadcast `notification` to every subscribed page.
    pub fn notify(&self, notification: Notification) {
        let kind = notification.kind();
        metrics::record_notification(kind);
        match self.tx.send(notification) {
            Ok(receivers) => {
                tracing::debug!(kind, receivers, "Notification sent");
            }
            Err(_) => {
                // No page is listening; it will re-query on mount.
                tracing::debug!(kind, "Notification skipped: no receivers");
            }
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BROADCAST_CAPACITY)
    }
}
