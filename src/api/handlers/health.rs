//! Health, readiness, and metrics endpoints. These stay outside the
//! authenticated router so probes and scrapers reach them unauthenticated.

use axum::{extract::State, http::StatusCode, response::Json};
use tracing::instrument;

use crate::{
    AppState,
    errors::Result,
    health::{self, HealthReport, MetricsSnapshot, ReadinessReport},
};

/// Liveness: the process is up.
pub async fn healthz() -> &'static str {
    "OK"
}

/// Full component health report.
#[instrument(skip_all)]
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health.check().await)
}

/// Readiness: 503 until the durable store answers.
#[instrument(skip_all)]
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadinessReport>) {
    let report = state.health.readiness().await;
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// Aggregate metrics as structured JSON.
#[instrument(skip_all)]
pub async fn metrics(State(state): State<AppState>) -> Result<Json<MetricsSnapshot>> {
    Ok(Json(state.health.metrics().await?))
}

/// Prometheus exposition: operational counters from the recorder plus the
/// aggregate gauges (same numbers as the JSON endpoint).
#[instrument(skip_all)]
pub async fn prometheus_metrics(State(state): State<AppState>) -> Result<String> {
    let mut output = state
        .metrics_handle
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    let snapshot = state.health.metrics().await?;
    output.push_str(&health::prometheus_text(&snapshot));

    Ok(output)
}
