//! Queued request model.
//!
//! A [`QueuedRequest`] is a mutating network call captured verbatim at
//! enqueue time: method, target, ordered headers and raw body. Retries replay
//! exactly what was captured, never anything re-derived from application state.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Header carrying the deduplication token on every delivery attempt.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Sync tag of the order-submission queue.
pub const DEFAULT_SYNC_TAG: &str = "sync-orders";

/// Sync tag of the general API request queue.
pub const API_SYNC_TAG: &str = "sync-api-requests";

/// Default retention window: queued items older than this are dropped.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors raised while capturing a request for the queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The verb is valid HTTP but does not mutate server state.
    #[error("{0} is not a mutating method")]
    NonMutatingMethod(String),
    /// The verb is not recognised at all.
    #[error("Unknown HTTP method: {0}")]
    UnknownMethod(String),
    /// The target URL is empty.
    #[error("Request URL is empty")]
    EmptyUrl,
    /// The target URL cannot be parsed, or is absolute with a non-HTTP scheme.
    #[error("Invalid request URL {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A header name is not an HTTP token.
    #[error("Invalid header name: {0:?}")]
    InvalidHeaderName(String),
    /// A header value contains control characters.
    #[error("Invalid value for header {0}")]
    InvalidHeaderValue(String),
}

/// A mutating HTTP verb.
///
/// Only verbs that change server state may be queued; reads are never
/// deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl HttpMethod {
    /// The canonical upper-case verb.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "GET" | "HEAD" | "OPTIONS" | "TRACE" | "CONNECT" => {
                Err(RequestError::NonMutatingMethod(s.to_string()))
            }
            _ => Err(RequestError::UnknownMethod(s.to_string())),
        }
    }
}

/// Client-generated deduplication token.
///
/// Generated once when a logical operation is first captured and carried
/// unchanged through every retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Generate a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for IdempotencyKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Raw request payload.
///
/// Text bodies serialize as a plain JSON string; binary bodies as
/// `{"base64": "..."}` so persisted queues stay lossless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestBody {
    /// UTF-8 payload, typically JSON.
    Text(String),
    /// Arbitrary bytes.
    Binary {
        /// The payload bytes.
        #[serde(with = "base64_bytes")]
        base64: Vec<u8>,
    },
}

impl RequestBody {
    /// Raw bytes to put on the wire.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary { base64 } => base64,
        }
    }

    /// Whether the body carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for RequestBody {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary { base64: value }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A mutating call as handed to the enqueuer, before it has a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutatingRequest {
    /// Target endpoint, absolute or origin-relative.
    pub url: String,
    /// HTTP verb.
    pub method: HttpMethod,
    /// Ordered header pairs.
    pub headers: Vec<(String, String)>,
    /// Serialized payload.
    pub body: RequestBody,
    /// Key of the logical operation, if the caller already has one.
    pub key: Option<IdempotencyKey>,
}

impl MutatingRequest {
    /// Create a request with no headers.
    pub fn new(method: HttpMethod, url: impl Into<String>, body: impl Into<RequestBody>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            body: body.into(),
            key: None,
        }
    }

    /// Shorthand for a JSON `POST`.
    pub fn post_json(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url, body.into())
            .with_header("Content-Type", "application/json")
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Pin the idempotency key of this logical operation.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<IdempotencyKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Resolve the key for this operation, generating one only if neither an
    /// explicit key nor an idempotency header is present.
    ///
    /// The resolved key is written back so repeated calls are stable.
    pub fn ensure_key(&mut self) -> IdempotencyKey {
        if let Some(key) = &self.key {
            return key.clone();
        }
        let key = find_header(&self.headers, IDEMPOTENCY_HEADER)
            .map_or_else(IdempotencyKey::generate, IdempotencyKey::from);
        self.key = Some(key.clone());
        key
    }

    /// Headers to send, with the idempotency header stamped in.
    pub fn headers_with_key(&mut self) -> Vec<(String, String)> {
        let key = self.ensure_key();
        stamp_key(self.headers.clone(), &key)
    }

    /// Check that the target and headers can be put on the wire.
    ///
    /// A request that fails here would fail on every delivery attempt, so it
    /// is refused before it reaches a queue.
    ///
    /// # Errors
    ///
    /// Returns the first [`RequestError`] found.
    pub fn validate(&self) -> Result<(), RequestError> {
        validate_url(&self.url)?;
        for (name, value) in &self.headers {
            if name.is_empty() || !name.bytes().all(is_token_byte) {
                return Err(RequestError::InvalidHeaderName(name.clone()));
            }
            if !value.bytes().all(is_header_value_byte) {
                return Err(RequestError::InvalidHeaderValue(name.clone()));
            }
        }
        Ok(())
    }

    /// Capture this request for the queue.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::EmptyUrl`] if there is no target, or another
    /// [`RequestError`] if [`validate`](Self::validate) fails.
    pub fn into_queued(mut self, tag: &str, now_ms: u64) -> Result<QueuedRequest, RequestError> {
        self.validate()?;
        let key = self.ensure_key();
        let headers = stamp_key(self.headers, &key);
        Ok(QueuedRequest {
            key,
            url: self.url,
            method: self.method,
            headers,
            body: self.body,
            enqueued_at: now_ms,
            attempts: 0,
            tag: tag.to_string(),
        })
    }
}

/// A pending mutating network call awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
    /// Deduplication key; immutable for the lifetime of the item.
    pub key: IdempotencyKey,
    /// Target endpoint, absolute or origin-relative.
    pub url: String,
    /// HTTP verb.
    pub method: HttpMethod,
    /// Ordered header pairs captured at enqueue time.
    pub headers: Vec<(String, String)>,
    /// Payload captured at enqueue time.
    #[serde(default)]
    pub body: RequestBody,
    /// Capture time in milliseconds since the Unix epoch.
    pub enqueued_at: u64,
    /// Delivery attempts made so far.
    #[serde(default)]
    pub attempts: u32,
    /// Sync tag of the queue lane this item belongs to.
    #[serde(default = "default_tag")]
    pub tag: String,
}

fn default_tag() -> String {
    DEFAULT_SYNC_TAG.to_string()
}

impl QueuedRequest {
    /// Look up a captured header, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Milliseconds since this item was captured.
    #[must_use]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.enqueued_at)
    }

    /// Whether the item has outlived the retention window.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64, retention: Duration) -> bool {
        u128::from(self.age_ms(now_ms)) > retention.as_millis()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Stand-in origin for resolving origin-relative targets.
const PLACEHOLDER_ORIGIN: &str = "http://origin.invalid/";

fn validate_url(url: &str) -> Result<(), RequestError> {
    if url.trim().is_empty() {
        return Err(RequestError::EmptyUrl);
    }
    let invalid = |reason: &str| RequestError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };
    if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("contains whitespace or control characters"));
    }
    let resolved = Url::parse(PLACEHOLDER_ORIGIN)
        .and_then(|origin| origin.join(url))
        .map_err(|e| invalid(&e.to_string()))?;
    match resolved.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(&format!("unsupported scheme {other}"))),
    }
}

// RFC 9110 token characters.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn is_header_value_byte(b: u8) -> bool {
    b == b'\t' || (b >= 0x20 && b != 0x7f)
}

fn stamp_key(mut headers: Vec<(String, String)>, key: &IdempotencyKey) -> Vec<(String, String)> {
    match headers
        .iter_mut()
        .find(|(n, _)| n.eq_ignore_ascii_case(IDEMPOTENCY_HEADER))
    {
        Some((_, value)) => *value = key.to_string(),
        None => headers.push((IDEMPOTENCY_HEADER.to_string(), key.to_string())),
    }
    headers
}

/// Get the current Unix timestamp in milliseconds.
#[cfg(not(all(feature = "wasm", target_arch = "wasm32")))]
#[must_use]
#[allow(clippy::cast_possible_truncation)] // Timestamps won't exceed u64 for billions of years
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Get the current Unix timestamp in milliseconds.
///
/// `SystemTime` is unavailable in the browser; the JS clock is used instead.
#[cfg(all(feature = "wasm", target_arch = "wasm32"))]
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn current_timestamp_ms() -> u64 {
    js_sys::Date::now() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parsing() {
        assert_eq!("post".parse::<HttpMethod>(), Ok(HttpMethod::Post));
        assert_eq!("PATCH".parse::<HttpMethod>(), Ok(HttpMethod::Patch));
        assert_eq!(
            "GET".parse::<HttpMethod>(),
            Err(RequestError::NonMutatingMethod("GET".into()))
        );
        assert!(matches!(
            "BREW".parse::<HttpMethod>(),
            Err(RequestError::UnknownMethod(_))
        ));
    }

    #[test]
    fn test_into_queued_stamps_header() {
        let queued = MutatingRequest::post_json("/api/orders", "{}")
            .into_queued(DEFAULT_SYNC_TAG, 10)
            .expect("queued");
        assert_eq!(queued.header("idempotency-key"), Some(queued.key.as_str()));
        assert_eq!(queued.attempts, 0);
        assert_eq!(queued.enqueued_at, 10);
        assert_eq!(queued.tag, DEFAULT_SYNC_TAG);
    }

    #[test]
    fn test_existing_header_is_adopted_as_key() {
        let queued = MutatingRequest::post_json("/api/orders", "{}")
            .with_header("Idempotency-Key", "from-header")
            .into_queued(DEFAULT_SYNC_TAG, 0)
            .expect("queued");
        assert_eq!(queued.key.as_str(), "from-header");
        let count = queued
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(IDEMPOTENCY_HEADER))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_ensure_key_is_stable() {
        let mut request = MutatingRequest::post_json("/api/orders", "{}");
        let first = request.ensure_key();
        let second = request.ensure_key();
        assert_eq!(first, second);
        let headers = request.headers_with_key();
        assert_eq!(find_header(&headers, IDEMPOTENCY_HEADER), Some(first.as_str()));
    }

    #[test]
    fn test_empty_url_rejected() {
        let result = MutatingRequest::post_json("  ", "{}").into_queued(DEFAULT_SYNC_TAG, 0);
        assert_eq!(result, Err(RequestError::EmptyUrl));
    }

    #[test]
    fn test_unsendable_requests_rejected() {
        let bad_name = MutatingRequest::post_json("/api/orders", "{}")
            .with_header("bad header", "x")
            .into_queued(DEFAULT_SYNC_TAG, 0);
        assert_eq!(
            bad_name,
            Err(RequestError::InvalidHeaderName("bad header".into()))
        );

        let bad_value = MutatingRequest::post_json("/api/orders", "{}")
            .with_header("X-Note", "line\r\nInjected: 1")
            .into_queued(DEFAULT_SYNC_TAG, 0);
        assert_eq!(bad_value, Err(RequestError::InvalidHeaderValue("X-Note".into())));

        for url in ["/api/ord ers", "http://[::1", "ftp://example.com/orders"] {
            let result = MutatingRequest::post_json(url, "{}").into_queued(DEFAULT_SYNC_TAG, 0);
            assert!(
                matches!(result, Err(RequestError::InvalidUrl { .. })),
                "{url} should be refused"
            );
        }
    }

    #[test]
    fn test_valid_targets_accepted() {
        for url in [
            "/api/orders",
            "api/orders?draft=1",
            "https://shop.example/api/orders",
        ] {
            MutatingRequest::post_json(url, "{}")
                .with_header("X-Note", "caf\u{e9}\tok")
                .into_queued(DEFAULT_SYNC_TAG, 0)
                .expect(url);
        }
    }

    #[test]
    fn test_expiry() {
        let queued = MutatingRequest::post_json("/api/orders", "{}")
            .into_queued(DEFAULT_SYNC_TAG, 1_000)
            .expect("queued");
        let retention = Duration::from_secs(1);
        assert!(!queued.is_expired(2_000, retention));
        assert!(queued.is_expired(2_001, retention));
        // Clock skew never underflows
        assert!(!queued.is_expired(0, retention));
    }

    #[test]
    fn test_binary_body_survives_json() {
        let queued = MutatingRequest::new(HttpMethod::Put, "/api/blob", vec![0_u8, 159, 255])
            .into_queued(API_SYNC_TAG, 0)
            .expect("queued");
        let json = serde_json::to_string(&queued).expect("serialize");
        assert!(json.contains("\"base64\""));
        let restored: QueuedRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored.body.as_bytes(), &[0, 159, 255]);
    }

    #[test]
    fn test_text_body_is_plain_string() {
        let body = RequestBody::from(r#"{"tip":0}"#);
        let json = serde_json::to_string(&body).expect("serialize");
        assert_eq!(json, r#""{\"tip\":0}""#);
    }

    #[test]
    fn test_missing_tag_defaults_to_orders() {
        let json = r#"{"key":"k","url":"/api/orders","method":"POST","headers":[],"body":"","enqueuedAt":1}"#;
        let queued: QueuedRequest = serde_json::from_str(json).expect("deserialize");
        assert_eq!(queued.tag, DEFAULT_SYNC_TAG);
        assert_eq!(queued.attempts, 0);
    }
}
