//! HTTP handlers for the pull-mode inbox.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use tracing::instrument;

use crate::{
    AppState,
    api::models::inbox::{
        AckBatchRequest, AckBatchResponse, AckRequest, ChangeVisibilityRequest,
        ChangeVisibilityResponse, InboxFetchQuery, InboxFetchResponse, InboxStatsResponse,
    },
    auth::CurrentCredential,
    db::models::api_keys::Scope,
    errors::Result,
};

/// Fetch pending events with a visibility timeout.
#[utoipa::path(
    get,
    path = "/api/v1/inbox",
    tag = "inbox",
    params(InboxFetchQuery),
    responses(
        (status = 200, description = "Fetched events with receipt handles", body = InboxFetchResponse),
        (status = 400, description = "Parameter out of range"),
    ),
)]
#[instrument(skip_all)]
pub async fn fetch(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Query(query): Query<InboxFetchQuery>,
) -> Result<Json<InboxFetchResponse>> {
    credential.require_scope(Scope::InboxRead)?;

    let (items, has_more) = state.inbox.fetch(query.into()).await?;

    Ok(Json(InboxFetchResponse {
        items: items.into_iter().map(Into::into).collect(),
        has_more,
    }))
}

/// Acknowledge one receipt handle.
#[utoipa::path(
    post,
    path = "/api/v1/inbox/ack",
    tag = "inbox",
    request_body = AckRequest,
    responses(
        (status = 204, description = "Event acknowledged"),
        (status = 404, description = "Invalid or expired receipt handle"),
    ),
)]
#[instrument(skip_all)]
pub async fn ack(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Json(request): Json<AckRequest>,
) -> Result<StatusCode> {
    credential.require_scope(Scope::InboxRead)?;

    state.inbox.ack(&request.receipt_handle).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Acknowledge up to 100 handles with per-handle results.
#[utoipa::path(
    post,
    path = "/api/v1/inbox/ack/batch",
    tag = "inbox",
    request_body = AckBatchRequest,
    responses(
        (status = 200, description = "Per-handle results", body = AckBatchResponse),
    ),
)]
#[instrument(skip_all)]
pub async fn ack_batch(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Json(request): Json<AckBatchRequest>,
) -> Result<Json<AckBatchResponse>> {
    credential.require_scope(Scope::InboxRead)?;

    let results = state.inbox.ack_batch(request.receipt_handles).await?;

    Ok(Json(AckBatchResponse {
        results: results.into_iter().map(Into::into).collect(),
    }))
}

/// Replace a handle's visibility deadline (0 = visible immediately).
#[utoipa::path(
    post,
    path = "/api/v1/inbox/visibility",
    tag = "inbox",
    request_body = ChangeVisibilityRequest,
    responses(
        (status = 200, description = "New deadline", body = ChangeVisibilityResponse),
        (status = 404, description = "Invalid or expired receipt handle"),
    ),
)]
#[instrument(skip_all)]
pub async fn change_visibility(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Json(request): Json<ChangeVisibilityRequest>,
) -> Result<Json<ChangeVisibilityResponse>> {
    credential.require_scope(Scope::InboxRead)?;

    let deadline = state
        .inbox
        .change_visibility(&request.receipt_handle, request.visibility_timeout)
        .await?;

    Ok(Json(ChangeVisibilityResponse {
        visibility_timeout: deadline,
    }))
}

/// Inbox counters.
#[utoipa::path(
    get,
    path = "/api/v1/inbox/stats",
    tag = "inbox",
    responses(
        (status = 200, description = "Inbox statistics", body = InboxStatsResponse),
    ),
)]
#[instrument(skip_all)]
pub async fn stats(
    State(state): State<AppState>,
    credential: CurrentCredential,
) -> Result<Json<InboxStatsResponse>> {
    credential.require_scope(Scope::InboxRead)?;

    let stats = state.inbox.stats().await?;
    Ok(Json(stats.into()))
}
