//! Platform connectivity signal.
//!
//! A watch channel holding the current [`ConnectionStatus`]. The worker
//! fires its registered sync intents on every offline to online edge, and
//! the enqueuer reads the current value to decide whether to try the
//! network at all.

use std::sync::Arc;

use outbox_core::ConnectionStatus;
use tokio::sync::watch;

/// Shared connectivity state. Cloning yields another handle to the same value.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<ConnectionStatus>>,
}

impl ConnectivityMonitor {
    /// Create a monitor starting at `initial`.
    #[must_use]
    pub fn new(initial: ConnectionStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// The last reported status.
    #[must_use]
    pub fn current(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    /// Report a new status. Returns `true` if it changed.
    pub fn set(&self, status: ConnectionStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::info!(?status, "Connectivity changed");
        }
        changed
    }

    /// Shorthand for `set(ConnectionStatus::from_online(online))`.
    pub fn set_online(&self, online: bool) -> bool {
        self.set(ConnectionStatus::from_online(online))
    }

    /// Watch for changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectionStatus::Online)
    }
}
