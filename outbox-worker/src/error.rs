//! Worker-side error types.

use outbox_core::OutboxError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by the worker runtime and its handle.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker task has stopped and no longer accepts commands.
    #[error("worker is not running")]
    Stopped,

    /// The worker processed the command but it failed.
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// Configuration was invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;
