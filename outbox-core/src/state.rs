//! Connectivity and worker lifecycle state.

use serde::{Deserialize, Serialize};

/// What a context believes about its network connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// The platform reports a network connection.
    #[default]
    Online,
    /// The platform reports no network connection.
    Offline,
}

impl ConnectionStatus {
    /// Whether an immediate delivery attempt is worth making.
    ///
    /// Being online is no guarantee; a failed attempt still falls through to
    /// the deferred path.
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }

    /// From a boolean "navigator.onLine"-style flag.
    #[must_use]
    pub const fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

/// Lifecycle of the persistent worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLifecycle {
    /// Installed but another version still controls pages.
    Waiting,
    /// Controlling pages and processing queues.
    Active,
}

impl WorkerLifecycle {
    /// Transition on a skip-waiting request.
    #[must_use]
    pub fn skip_waiting(self) -> Self {
        if self == Self::Waiting {
            tracing::info!("Worker activated by skip-waiting request");
        }
        Self::Active
    }
}
