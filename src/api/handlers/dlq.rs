//! HTTP handlers for dead-letter queue inspection and recovery.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use tracing::instrument;

use crate::{
    AppState,
    api::models::dlq::{
        DlqBatchRequest, DlqBatchResponse, DlqItemResponse, DlqListQuery, DlqListResponse,
        DlqPurgeQuery, DlqPurgeResponse, DlqRetryRequest, DlqRetryResponse, DlqStatsResponse,
    },
    auth::CurrentCredential,
    db::models::api_keys::Scope,
    errors::{Error, Result},
};

const LIST_DEFAULT_LIMIT: usize = 100;

/// List DLQ entries with optional filters.
#[utoipa::path(
    get,
    path = "/api/v1/dlq",
    tag = "dlq",
    params(DlqListQuery),
    responses(
        (status = 200, description = "Filtered DLQ entries", body = DlqListResponse),
    ),
)]
#[instrument(skip_all)]
pub async fn list(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Query(query): Query<DlqListQuery>,
) -> Result<Json<DlqListResponse>> {
    credential.require_scope(Scope::DlqRead)?;

    let (items, total) = state
        .dlq
        .list(
            query.limit.unwrap_or(LIST_DEFAULT_LIMIT),
            query.offset.unwrap_or(0),
            query.event_type.as_deref(),
            query.source.as_deref(),
        )
        .await?;

    Ok(Json(DlqListResponse {
        items: items.into_iter().map(Into::into).collect(),
        total,
    }))
}

/// DLQ statistics.
#[utoipa::path(
    get,
    path = "/api/v1/dlq/stats",
    tag = "dlq",
    responses(
        (status = 200, description = "DLQ statistics", body = DlqStatsResponse),
    ),
)]
#[instrument(skip_all)]
pub async fn stats(
    State(state): State<AppState>,
    credential: CurrentCredential,
) -> Result<Json<DlqStatsResponse>> {
    credential.require_scope(Scope::DlqRead)?;

    let stats = state.dlq.stats().await?;
    Ok(Json(stats.into()))
}

/// Get one DLQ entry by event id.
#[utoipa::path(
    get,
    path = "/api/v1/dlq/{event_id}",
    tag = "dlq",
    responses(
        (status = 200, description = "The entry", body = DlqItemResponse),
        (status = 404, description = "No entry for this event id"),
    ),
)]
#[instrument(skip_all, fields(event_id = %event_id))]
pub async fn get(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Path(event_id): Path<String>,
) -> Result<Json<DlqItemResponse>> {
    credential.require_scope(Scope::DlqRead)?;

    let item = state.dlq.get(&event_id).await?;
    Ok(Json(item.into()))
}

/// Re-queue one entry; a concurrent loser sees 404.
#[utoipa::path(
    post,
    path = "/api/v1/dlq/{event_id}/retry",
    tag = "dlq",
    request_body = DlqRetryRequest,
    responses(
        (status = 200, description = "Entry re-queued", body = DlqRetryResponse),
        (status = 404, description = "No entry for this event id"),
    ),
)]
#[instrument(skip_all, fields(event_id = %event_id))]
pub async fn retry(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Path(event_id): Path<String>,
    Json(request): Json<DlqRetryRequest>,
) -> Result<Json<DlqRetryResponse>> {
    credential.require_scope(Scope::DlqWrite)?;

    let outcome = state.dlq.retry(&event_id, request.modify_payload).await?;

    Ok(Json(DlqRetryResponse {
        success: true,
        event_id: outcome.event_id,
        retry_count: outcome.retry_count,
        message: "event re-queued for processing".to_string(),
    }))
}

/// Remove one entry without re-queueing; the event becomes `failed`.
#[utoipa::path(
    delete,
    path = "/api/v1/dlq/{event_id}",
    tag = "dlq",
    responses(
        (status = 204, description = "Entry dismissed"),
        (status = 404, description = "No entry for this event id"),
    ),
)]
#[instrument(skip_all, fields(event_id = %event_id))]
pub async fn dismiss(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Path(event_id): Path<String>,
) -> Result<StatusCode> {
    credential.require_scope(Scope::DlqWrite)?;

    state.dlq.dismiss(&event_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Retry a set of entries with per-id results.
#[utoipa::path(
    post,
    path = "/api/v1/dlq/retry-batch",
    tag = "dlq",
    request_body = DlqBatchRequest,
    responses(
        (status = 200, description = "Per-id results", body = DlqBatchResponse),
    ),
)]
#[instrument(skip_all)]
pub async fn retry_batch(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Json(request): Json<DlqBatchRequest>,
) -> Result<Json<DlqBatchResponse>> {
    credential.require_scope(Scope::DlqWrite)?;

    let results = state.dlq.retry_batch(request.event_ids).await;
    Ok(Json(DlqBatchResponse::from_results(results)))
}

/// Dismiss a set of entries with per-id results.
#[utoipa::path(
    post,
    path = "/api/v1/dlq/dismiss-batch",
    tag = "dlq",
    request_body = DlqBatchRequest,
    responses(
        (status = 200, description = "Per-id results", body = DlqBatchResponse),
    ),
)]
#[instrument(skip_all)]
pub async fn dismiss_batch(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Json(request): Json<DlqBatchRequest>,
) -> Result<Json<DlqBatchResponse>> {
    credential.require_scope(Scope::DlqWrite)?;

    let results = state.dlq.dismiss_batch(request.event_ids).await;
    Ok(Json(DlqBatchResponse::from_results(results)))
}

/// Purge the entire DLQ. Requires `?confirm=true`.
#[utoipa::path(
    post,
    path = "/api/v1/dlq/purge",
    tag = "dlq",
    params(DlqPurgeQuery),
    responses(
        (status = 200, description = "Entries purged", body = DlqPurgeResponse),
        (status = 400, description = "Missing confirm flag"),
    ),
)]
#[instrument(skip_all)]
pub async fn purge(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Query(query): Query<DlqPurgeQuery>,
) -> Result<Json<DlqPurgeResponse>> {
    credential.require_scope(Scope::DlqWrite)?;

    if !query.confirm {
        return Err(Error::Validation {
            message: "purging the DLQ is irreversible; pass confirm=true".to_string(),
        });
    }

    let purged = state.dlq.purge().await?;

    Ok(Json(DlqPurgeResponse {
        success: true,
        purged_count: purged,
        message: format!("purged {purged} entries from the dead letter queue"),
    }))
}
