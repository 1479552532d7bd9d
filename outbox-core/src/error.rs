//! Error types for outbox operations.

use thiserror::Error;

use crate::request::RequestError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Result type for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur in outbox operations.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// A request could not be captured for queuing.
    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),

    /// The queue store failed.
    #[error("Queue store error: {0}")]
    Store(#[from] StoreError),

    /// No response was received from the server.
    #[error("Network error: {0}")]
    Transport(#[from] TransportError),

    /// Queue or message serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The server answered with an error status.
    #[error("Request rejected with status {status}")]
    Rejected {
        /// HTTP status returned by the server.
        status: u16,
    },
}
