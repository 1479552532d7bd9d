//! Runtime configuration for the outbox worker.
//!
//! Values come from command-line flags, falling back to `OUTBOX_*`
//! environment variables, falling back to the defaults below.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use outbox_core::{FileQueueStore, StoreError, API_SYNC_TAG, DEFAULT_SYNC_TAG, QUEUED_ORDERS_KEY};
use url::Url;

/// Default port for the HTTP bridge.
pub const DEFAULT_PORT: u16 = 9474;

pub use outbox_core::DEFAULT_RETENTION;

/// Default per-attempt delivery timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capacity of the notification broadcast channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 100;

/// Errors building a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The API base URL could not be parsed.
    #[error("invalid API base URL {url}: {reason}")]
    InvalidApiBase {
        /// The rejected value.
        url: String,
        /// Parser message.
        reason: String,
    },
}

/// Exponential backoff between retries of a lane that could not be drained.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom values.
    #[must_use]
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed), capped.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let base_delay = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = base_delay.min(self.max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(capped)
    }
}

/// Resolved worker configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Directory holding the durable queue.
    pub data_dir: PathBuf,
    /// Base URL origin-relative request URLs are resolved against.
    pub api_base: Url,
    /// Queued items older than this are dropped on the next flush.
    pub retention: Duration,
    /// Timeout applied to each delivery attempt.
    pub request_timeout: Duration,
    /// Backoff for re-arming a halted flush and for the page-side local
    /// retry timer.
    pub retry: RetryConfig,
    /// Capacity of the notification channel.
    pub broadcast_capacity: usize,
    /// Storage key of the page-local fallback queue.
    pub fallback_storage_key: String,
    /// Port of the HTTP bridge.
    pub port: u16,
    /// Optional cap on durable queue size.
    pub max_queue_items: Option<usize>,
    /// Sync tags the worker owns a lane for.
    pub tags: Vec<String>,
    /// Activate on start instead of waiting for a `SKIP_WAITING` message.
    pub activate_immediately: bool,
}

impl OutboxConfig {
    /// Configuration with default tuning for `data_dir` and `api_base`.
    pub fn new(data_dir: impl Into<PathBuf>, api_base: Url) -> Self {
        Self {
            data_dir: data_dir.into(),
            api_base,
            retention: DEFAULT_RETENTION,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryConfig::default(),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            fallback_storage_key: QUEUED_ORDERS_KEY.to_string(),
            port: DEFAULT_PORT,
            max_queue_items: None,
            tags: vec![DEFAULT_SYNC_TAG.to_string(), API_SYNC_TAG.to_string()],
            activate_immediately: true,
        }
    }

    /// Directory of the durable request queue.
    #[must_use]
    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }

    /// Open the durable queue under [`OutboxConfig::queue_dir`].
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open_store(&self) -> Result<FileQueueStore, StoreError> {
        let store = FileQueueStore::open(self.queue_dir())?;
        Ok(match self.max_queue_items {
            Some(max) => store.with_max_items(max),
            None => store,
        })
    }
}

/// Command-line / environment settings shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct OutboxArgs {
    /// Directory holding the durable queue
    #[arg(long, env = "OUTBOX_DATA_DIR", default_value = "outbox-data")]
    pub data_dir: PathBuf,

    /// Base URL for origin-relative request URLs (e.g., <http://localhost:8080/>)
    #[arg(long, env = "OUTBOX_API_BASE", default_value = "http://localhost:8080/")]
    pub api_base: String,

    /// Retention window in seconds for queued requests
    #[arg(long, env = "OUTBOX_RETENTION_SECS", default_value_t = DEFAULT_RETENTION.as_secs())]
    pub retention_secs: u64,

    /// Per-attempt delivery timeout in seconds
    #[arg(long, env = "OUTBOX_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
    pub timeout_secs: u64,

    /// Port for the HTTP bridge
    #[arg(long, env = "OUTBOX_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// First retry delay in milliseconds after a flush stops on a network failure
    #[arg(long, env = "OUTBOX_RETRY_INITIAL_MS", default_value_t = RetryConfig::default().initial_delay_ms)]
    pub retry_initial_ms: u64,

    /// Upper bound in milliseconds on the retry delay
    #[arg(long, env = "OUTBOX_RETRY_MAX_MS", default_value_t = RetryConfig::default().max_delay_ms)]
    pub retry_max_ms: u64,

    /// Maximum number of queued requests (unbounded if omitted)
    #[arg(long, env = "OUTBOX_MAX_ITEMS")]
    pub max_items: Option<usize>,

    /// Stay in the waiting state until a page sends SKIP_WAITING
    #[arg(long, env = "OUTBOX_WAIT_FOR_ACTIVATION")]
    pub wait_for_activation: bool,
}

impl TryFrom<OutboxArgs> for OutboxConfig {
    type Error = ConfigError;

    fn try_from(args: OutboxArgs) -> Result<Self, Self::Error> {
        let api_base = Url::parse(&args.api_base).map_err(|e| ConfigError::InvalidApiBase {
            url: args.api_base.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            retention: Duration::from_secs(args.retention_secs),
            request_timeout: Duration::from_secs(args.timeout_secs.max(1)),
            retry: RetryConfig {
                initial_delay_ms: args.retry_initial_ms,
                max_delay_ms: args.retry_max_ms.max(args.retry_initial_ms),
                ..RetryConfig::default()
            },
            port: args.port,
            max_queue_items: args.max_items,
            activate_immediately: !args.wait_for_activation,
            ..Self::new(args.data_dir, api_base)
        })
    }
}
