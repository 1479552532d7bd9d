//! Prometheus metrics for the outbox worker.
//!
//! Provides metrics collection and a Prometheus-compatible `/metrics` endpoint.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// Metric names as constants for consistency
const ENQUEUED_TOTAL: &str = "outbox_enqueued_total";
const DELIVERED_TOTAL: &str = "outbox_delivered_total";
const REJECTED_TOTAL: &str = "outbox_rejected_total";
const NETWORK_FAILURES_TOTAL: &str = "outbox_network_failures_total";
const EXPIRED_TOTAL: &str = "outbox_expired_total";
const QUEUE_DEPTH: &str = "outbox_queue_depth";
const FLUSH_CYCLES_TOTAL: &str = "outbox_flush_cycles_total";
const NOTIFICATIONS_TOTAL: &str = "outbox_notifications_total";
const MESSAGES_TOTAL: &str = "outbox_messages_total";

/// Initialize metrics and return the Prometheus handle.
///
/// # Errors
///
/// Returns an error if the Prometheus recorder cannot be installed
/// (e.g., if another recorder is already installed).
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record a request persisted for later delivery.
///
/// # Arguments
///
/// * `path` - "worker" or "local"
pub fn record_enqueued(path: &str) {
    counter!(ENQUEUED_TOTAL, "path" => path.to_string()).increment(1);
}

/// Record a successful delivery.
///
/// # Arguments
///
/// * `source` - "immediate", "flush" or "local_retry"
pub fn record_delivered(source: &str) {
    counter!(DELIVERED_TOTAL, "source" => source.to_string()).increment(1);
}

/// Record an error-status response.
pub fn record_rejected(source: &str, status: u16) {
    counter!(
        REJECTED_TOTAL,
        "source" => source.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a delivery attempt that got no response.
pub fn record_network_failure(source: &str) {
    counter!(NETWORK_FAILURES_TOTAL, "source" => source.to_string()).increment(1);
}

/// Record items dropped for exceeding the retention window.
pub fn record_expired(count: usize) {
    counter!(EXPIRED_TOTAL).increment(count as u64);
}

/// Update the queue depth of a lane.
#[allow(clippy::cast_precision_loss)]
pub fn set_queue_depth(tag: &str, depth: usize) {
    gauge!(QUEUE_DEPTH, "tag" => tag.to_string()).set(depth as f64);
}

/// Record a completed flush cycle.
///
/// # Arguments
///
/// * `outcome` - "drained", "halted" or "store_error"
pub fn record_flush_cycle(outcome: &str) {
    counter!(FLUSH_CYCLES_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Record a broadcast notification.
pub fn record_notification(kind: &str) {
    counter!(NOTIFICATIONS_TOTAL, "type" => kind.to_string()).increment(1);
}

/// Record a message received from a page.
pub fn record_message(kind: &str) {
    counter!(MESSAGES_TOTAL, "type" => kind.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_enqueued("worker");
        record_delivered("flush");
        record_rejected("flush", 409);
        record_network_failure("immediate");
        record_expired(2);
        set_queue_depth("sync-orders", 3);
        record_flush_cycle("drained");
        record_notification("ORDER_SYNCED");
        record_message("QUEUE_REQUEST");
    }
}
