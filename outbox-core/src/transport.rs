//! Delivery seam between the queues and the network.
//!
//! The one branch that matters everywhere: a response with an error status
//! is a definitive answer from the server and is never retried, while a
//! missing response is transient and always is. A request the transport
//! cannot even build is as final as an error status.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::QueuedRequest;

/// Status reported for an item dropped because it could never be sent.
pub const UNSENT_STATUS: u16 = 0;

/// No response was received for a delivery attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused, DNS failure, reset, and similar.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The attempt did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// The transport knows ahead of time that it is offline.
    #[error("offline")]
    Offline,
    /// The request cannot be built or its target cannot be resolved.
    /// Retrying will never help.
    #[error("request cannot be sent: {0}")]
    Invalid(String),
}

/// A response received from the server, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body as text.
    #[serde(default)]
    pub body: String,
}

impl DeliveryResponse {
    /// Create a response.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Server-assigned resource id from a JSON body (`id` or `orderId`).
    #[must_use]
    pub fn server_id(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(&self.body).ok()?;
        ["id", "orderId"]
            .iter()
            .find_map(|field| match value.get(field)? {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }
}

/// Delivers captured requests to the server.
///
/// Browser futures are not `Send`, so on `wasm32` the returned future is not
/// required to be either.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Transport: Send + Sync {
    /// Send `request` with its captured headers and body verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] only when no response was received, or
    /// [`TransportError::Invalid`] when the request could not be built. Error
    /// statuses are returned as `Ok` responses.
    async fn deliver(&self, request: &QueuedRequest) -> Result<DeliveryResponse, TransportError>;
}

/// Classified result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx response.
    Delivered(DeliveryResponse),
    /// Error status: the server rejected the request.
    Rejected(DeliveryResponse),
    /// No response: retry later.
    NetworkFailure(TransportError),
    /// Never sent because it cannot be: drop it like a rejection.
    Undeliverable(String),
}

impl DeliveryOutcome {
    /// Classify a raw transport result.
    #[must_use]
    pub fn classify(result: Result<DeliveryResponse, TransportError>) -> Self {
        match result {
            Ok(response) if response.is_success() => Self::Delivered(response),
            Ok(response) => Self::Rejected(response),
            Err(TransportError::Invalid(reason)) => Self::Undeliverable(reason),
            Err(e) => Self::NetworkFailure(e),
        }
    }

    /// Attempt delivery and classify the result.
    pub async fn attempt(transport: &dyn Transport, request: &QueuedRequest) -> Self {
        Self::classify(transport.deliver(request).await)
    }
}
