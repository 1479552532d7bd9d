//! Health check endpoints for Kubernetes liveness and readiness checks.
//!
//! - `/health/live` - Liveness check (restart if fails)
//! - `/health/ready` - Readiness check (remove from LB if fails)

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::AppState;

/// Health status response.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// Overall status: "healthy" or "unhealthy"
    pub status: &'static str,
    /// Server version
    pub version: &'static str,
    /// Individual component checks
    pub checks: HealthChecks,
}

/// Individual health checks.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Durable queue readable
    pub queue_store: bool,
    /// Worker loop accepting commands
    pub worker: bool,
}

impl HealthChecks {
    fn all_ok(&self) -> bool {
        self.queue_store && self.worker
    }
}

/// Liveness check - is the server running?
#[tracing::instrument(name = "liveness_check")]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness check - can queued requests be accepted and drained?
#[tracing::instrument(name = "readiness_check", skip(state))]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let checks = HealthChecks {
        queue_store: state.store.count().is_ok(),
        worker: state.worker.is_running(),
    };
    let all_ok = checks.all_ok();

    let status = HealthStatus {
        status: if all_ok { "healthy" } else { "unhealthy" },
        version: env!("CARGO_PKG_VERSION"),
        checks,
    };

    let code = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(status))
}
