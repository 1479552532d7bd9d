//! HTTP delivery of queued requests.

use std::time::Duration;

use async_trait::async_trait;
use outbox_core::{DeliveryResponse, QueuedRequest, Transport, TransportError};
use reqwest::Client;
use url::Url;

/// Delivers captured requests with reqwest.
///
/// Origin-relative URLs (`/api/orders`) are resolved against the configured
/// base. Headers and body go out exactly as captured.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    base: Url,
}

impl HttpTransport {
    /// Build a transport with a per-attempt timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn new(base: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(concat!("outbox-worker/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { http, base })
    }

    /// Resolve a captured URL against the base.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Invalid`] if the URL cannot be resolved.
    pub fn resolve(&self, url: &str) -> Result<Url, TransportError> {
        self.base
            .join(url)
            .map_err(|e| TransportError::Invalid(format!("invalid URL {url}: {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, request: &QueuedRequest) -> Result<DeliveryResponse, TransportError> {
        let url = self.resolve(&request.url)?;
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| TransportError::Invalid(e.to_string()))?;

        let mut builder = self.http.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .body(request.body.as_bytes().to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    tracing::error!(key = %request.key, "Queued request cannot be built: {e}");
                    TransportError::Invalid(e.to_string())
                } else if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Connect(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(key = %request.key, "Response body unreadable: {e}");
                String::new()
            }
        };
        Ok(DeliveryResponse { status, body })
    }
}
