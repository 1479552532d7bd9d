//! Page context: submits requests and reconciles its view with the worker.

use outbox_core::{IdempotencyKey, MutatingRequest, Navigation, Notification, PageView};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::enqueuer::{RequestEnqueuer, SubmitError, SubmitOptions, SubmitOutcome};

/// One notification applied to the page view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The notification that arrived.
    pub notification: Notification,
    /// Navigation it caused, if any.
    pub navigation: Option<Navigation>,
}

/// A page: its enqueuer, its notification subscription and its view.
#[derive(Debug)]
pub struct PageSession {
    enqueuer: RequestEnqueuer,
    events: broadcast::Receiver<Notification>,
    view: PageView,
}

impl PageSession {
    /// Open a page tracking lane `tag`.
    ///
    /// The subscription is taken before anything else so no notification
    /// sent after this call is missed. Call [`PageSession::mount`] next.
    pub fn new(enqueuer: RequestEnqueuer, tag: impl Into<String>) -> Self {
        let events = enqueuer.subscribe();
        Self {
            enqueuer,
            events,
            view: PageView::new(tag),
        }
    }

    /// Seed the view from current queue contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be queried.
    pub async fn mount(&mut self) -> Result<(), SubmitError> {
        let status = self.enqueuer.queue_status(self.view.tag()).await?;
        tracing::debug!(tag = %status.tag, pending = status.pending, "Page mounted");
        self.view.mount(&status);
        Ok(())
    }

    /// Submit a request in this page's lane.
    ///
    /// # Errors
    ///
    /// See [`RequestEnqueuer::submit`].
    pub async fn submit(&mut self, request: MutatingRequest) -> Result<SubmitOutcome, SubmitError> {
        let options = SubmitOptions::default().with_tag(self.view.tag());
        let outcome = self.enqueuer.submit(request, options).await?;
        match &outcome {
            SubmitOutcome::Queued { key } => self.view.mark_pending(key.clone()),
            SubmitOutcome::Delivered {
                key,
                order_id: Some(order_id),
                ..
            } => {
                self.view.apply(&Notification::OrderSynced {
                    key: Some(key.clone()),
                    order_id: Some(order_id.clone()),
                });
            }
            SubmitOutcome::Delivered { .. } => {}
        }
        Ok(outcome)
    }

    /// Wait for the next notification and apply it.
    ///
    /// If the page fell behind, it re-queries queue status before waiting
    /// again. Returns `None` once the notification source is gone.
    pub async fn next_transition(&mut self) -> Option<Transition> {
        loop {
            match self.events.recv().await {
                Ok(notification) => {
                    let navigation = self.view.apply(&notification);
                    if let Some(navigation) = &navigation {
                        tracing::info!(route = %navigation.target, "Page navigating");
                    }
                    return Some(Transition {
                        notification,
                        navigation,
                    });
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Page missed notifications, re-querying status");
                    if let Err(e) = self.mount().await {
                        tracing::warn!("Re-query after lag failed: {e}");
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Whether `key` is rendered as pending.
    #[must_use]
    pub fn is_pending(&self, key: &IdempotencyKey) -> bool {
        self.view.is_pending(key)
    }

    /// The reconciled view.
    #[must_use]
    pub fn view(&self) -> &PageView {
        &self.view
    }

    /// Where the page last navigated to.
    #[must_use]
    pub fn navigation(&self) -> Option<&Navigation> {
        self.view.navigation()
    }

    /// The page's enqueuer.
    #[must_use]
    pub fn enqueuer(&self) -> &RequestEnqueuer {
        &self.enqueuer
    }
}
