//! Page-side reconciliation state.
//!
//! A page renders each operation it submitted as pending until the worker
//! says otherwise. Broadcasts are best-effort, so the view is always seeded
//! from current queue contents on mount rather than assumed empty.

use serde::Serialize;

use crate::message::{Notification, QueueStatus};
use crate::request::{IdempotencyKey, QueuedRequest};

/// Route prefix of the order tracking view.
pub const TRACKING_ROUTE: &str = "/track";

/// A navigation the page should perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Navigation {
    /// Target path.
    pub target: String,
}

impl Navigation {
    /// Navigation to the tracking view of `order_id`.
    #[must_use]
    pub fn to_tracking(order_id: &str) -> Self {
        Self {
            target: format!("{TRACKING_ROUTE}/{order_id}"),
        }
    }
}

/// What the page knows about one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemState {
    /// Still in a queue.
    Pending,
    /// Confirmed by the server.
    Confirmed {
        /// Server-assigned id, when known.
        order_id: Option<String>,
    },
    /// Refused by the server.
    Rejected {
        /// HTTP status returned.
        status: u16,
    },
    /// Not pending; no record of how it left the queue.
    Settled,
}

/// Reconciled view of one queue lane as seen by one page.
#[derive(Debug, Clone)]
pub struct PageView {
    tag: String,
    pending: Vec<IdempotencyKey>,
    confirmed: Vec<(IdempotencyKey, Option<String>)>,
    rejected: Vec<(IdempotencyKey, u16)>,
    navigation: Option<Navigation>,
    mounted: bool,
}

impl PageView {
    /// Create an unmounted view of lane `tag`.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            pending: Vec::new(),
            confirmed: Vec::new(),
            rejected: Vec::new(),
            navigation: None,
            mounted: false,
        }
    }

    /// The lane this view tracks.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Seed the pending set from a queue snapshot.
    pub fn mount(&mut self, status: &QueueStatus) {
        if status.tag == self.tag {
            self.pending.clone_from(&status.keys);
        }
        self.mounted = true;
    }

    /// Seed the pending set from raw queue contents.
    pub fn mount_from_items(&mut self, items: &[QueuedRequest]) {
        let status = QueueStatus::from_items(&self.tag, items);
        self.mount(&status);
    }

    /// Whether [`PageView::mount`] has run.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Record an operation this page just queued.
    pub fn mark_pending(&mut self, key: IdempotencyKey) {
        if !self.pending.contains(&key) {
            self.pending.push(key);
        }
    }

    /// Apply a worker notification, returning a navigation if one results.
    pub fn apply(&mut self, notification: &Notification) -> Option<Navigation> {
        match notification {
            Notification::OrderSynced { key, order_id } => {
                if let Some(key) = key {
                    self.pending.retain(|k| k != key);
                    self.confirmed.push((key.clone(), order_id.clone()));
                }
                let navigation = order_id.as_deref().map(Navigation::to_tracking)?;
                self.navigation = Some(navigation.clone());
                Some(navigation)
            }
            Notification::ItemRejected { key, status } => {
                self.pending.retain(|k| k != key);
                self.rejected.push((key.clone(), *status));
                None
            }
            Notification::QueueStatus(status) => {
                if status.tag == self.tag {
                    self.pending.clone_from(&status.keys);
                }
                None
            }
        }
    }

    /// Keys still pending, oldest first.
    #[must_use]
    pub fn pending(&self) -> &[IdempotencyKey] {
        &self.pending
    }

    /// Whether `key` is rendered as pending.
    #[must_use]
    pub fn is_pending(&self, key: &IdempotencyKey) -> bool {
        self.pending.contains(key)
    }

    /// Everything the page knows about `key`.
    #[must_use]
    pub fn state_of(&self, key: &IdempotencyKey) -> ItemState {
        if self.is_pending(key) {
            return ItemState::Pending;
        }
        if let Some((_, status)) = self.rejected.iter().find(|(k, _)| k == key) {
            return ItemState::Rejected { status: *status };
        }
        if let Some((_, order_id)) = self.confirmed.iter().find(|(k, _)| k == key) {
            return ItemState::Confirmed {
                order_id: order_id.clone(),
            };
        }
        ItemState::Settled
    }

    /// The most recent navigation target.
    #[must_use]
    pub fn navigation(&self) -> Option<&Navigation> {
        self.navigation.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::DEFAULT_SYNC_TAG;

    fn status(keys: &[&str]) -> QueueStatus {
        QueueStatus {
            tag: DEFAULT_SYNC_TAG.into(),
            pending: keys.len(),
            keys: keys.iter().map(|k| IdempotencyKey::from(*k)).collect(),
        }
    }

    #[test]
    fn test_order_synced_navigates_to_tracking() {
        let mut view = PageView::new(DEFAULT_SYNC_TAG);
        let message: Notification =
            serde_json::from_str(r#"{"type":"ORDER_SYNCED","orderId":"7"}"#).expect("parse");
        let navigation = view.apply(&message).expect("navigation");
        assert_eq!(navigation.target, "/track/7");
        assert_eq!(view.navigation().map(|n| n.target.as_str()), Some("/track/7"));
    }

    #[test]
    fn test_mount_seeds_pending() {
        let mut view = PageView::new(DEFAULT_SYNC_TAG);
        assert!(!view.is_mounted());
        view.mount(&status(&["a", "b"]));
        assert!(view.is_mounted());
        assert!(view.is_pending(&"a".into()));
        assert_eq!(view.pending().len(), 2);
    }

    #[test]
    fn test_mount_ignores_other_lanes() {
        let mut view = PageView::new(DEFAULT_SYNC_TAG);
        view.mount(&QueueStatus {
            tag: "sync-api-requests".into(),
            pending: 1,
            keys: vec!["x".into()],
        });
        assert!(view.pending().is_empty());
    }

    #[test]
    fn test_synced_clears_pending_without_navigation() {
        let mut view = PageView::new(DEFAULT_SYNC_TAG);
        view.mark_pending("a".into());
        let nav = view.apply(&Notification::OrderSynced {
            key: Some("a".into()),
            order_id: None,
        });
        assert!(nav.is_none());
        assert_eq!(
            view.state_of(&"a".into()),
            ItemState::Confirmed { order_id: None }
        );
    }

    #[test]
    fn test_rejected_leaves_pending() {
        let mut view = PageView::new(DEFAULT_SYNC_TAG);
        view.mark_pending("a".into());
        view.apply(&Notification::ItemRejected {
            key: "a".into(),
            status: 409,
        });
        assert_eq!(view.state_of(&"a".into()), ItemState::Rejected { status: 409 });
    }

    #[test]
    fn test_missed_broadcast_fixed_by_remount() {
        let mut view = PageView::new(DEFAULT_SYNC_TAG);
        view.mount(&status(&["a"]));
        // The "a synced" broadcast is never seen; the page remounts later.
        let mut remounted = PageView::new(DEFAULT_SYNC_TAG);
        remounted.mount(&status(&[]));
        assert_eq!(remounted.state_of(&"a".into()), ItemState::Settled);
        assert!(view.is_pending(&"a".into()));
    }

    #[test]
    fn test_queue_status_replaces_pending() {
        let mut view = PageView::new(DEFAULT_SYNC_TAG);
        view.mount(&status(&["a", "b"]));
        view.apply(&Notification::QueueStatus(status(&["b"])));
        assert_eq!(view.pending(), &[IdempotencyKey::from("b")]);
    }
}
