//! HTTP handlers for event ingestion, reads, replay, and the live stream.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    response::sse::{Event as SseEvent, Sse},
};
use futures::Stream;
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tracing::instrument;
use utoipa::IntoParams;

use crate::{
    AppState,
    api::models::events::{
        BatchCreateEventRequest, BatchCreateEventResponse, CreateEventRequest, EventListResponse,
        EventResponse, ListEventsQuery, ReplayEventRequest, ReplayEventResponse,
    },
    api::models::pagination::{CursorPagination, encode_cursor},
    auth::CurrentCredential,
    db::errors::DbError,
    db::handlers::Deliveries,
    db::models::api_keys::Scope,
    errors::Result,
    stream::{self, StreamFilters},
};

const EVENTS_LIST_DEFAULT_LIMIT: i64 = 100;
const EVENTS_LIST_MAX_LIMIT: i64 = 1_000;

/// Admit a single event.
#[utoipa::path(
    post,
    path = "/api/v1/events",
    tag = "events",
    request_body = CreateEventRequest,
    responses(
        (status = 201, description = "Event admitted", body = EventResponse),
        (status = 400, description = "Validation error"),
        (status = 409, description = "Idempotency key already used"),
    ),
)]
#[instrument(skip_all)]
pub async fn create_event(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Json(request): Json<CreateEventRequest>,
) -> Result<(StatusCode, Json<EventResponse>)> {
    credential.require_scope(Scope::EventsWrite)?;

    let event = state
        .ingest
        .create_event(request.into(), Some(credential.id()))
        .await?;

    Ok((StatusCode::CREATED, Json(event.into())))
}

/// Admit up to 100 events in one request.
#[utoipa::path(
    post,
    path = "/api/v1/events/batch",
    tag = "events",
    request_body = BatchCreateEventRequest,
    responses(
        (status = 200, description = "Per-item results", body = BatchCreateEventResponse),
        (status = 400, description = "Batch-level validation error"),
    ),
)]
#[instrument(skip_all)]
pub async fn create_events_batch(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Json(request): Json<BatchCreateEventRequest>,
) -> Result<Json<BatchCreateEventResponse>> {
    credential.require_scope(Scope::EventsWrite)?;

    let items = request.events.into_iter().map(Into::into).collect();
    let outcome = state
        .ingest
        .create_events_batch(items, request.fail_fast, Some(credential.id()))
        .await?;

    Ok(Json(outcome.into()))
}

/// List events with filters and cursor pagination.
#[utoipa::path(
    get,
    path = "/api/v1/events",
    tag = "events",
    params(ListEventsQuery, CursorPagination),
    responses(
        (status = 200, description = "Page of events", body = EventListResponse),
    ),
)]
#[instrument(skip_all)]
pub async fn list_events(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Query(query): Query<ListEventsQuery>,
    Query(pagination): Query<CursorPagination>,
) -> Result<Json<EventListResponse>> {
    credential.require_scope(Scope::EventsRead)?;

    let filter = query.to_filter()?;
    let limit = pagination.limit(EVENTS_LIST_DEFAULT_LIMIT, EVENTS_LIST_MAX_LIMIT);

    let (events, next) = state
        .ingest
        .list_events(&filter, limit, pagination.decoded())
        .await?;

    Ok(Json(EventListResponse {
        data: events.into_iter().map(Into::into).collect(),
        next_cursor: next.map(|(created_at, id)| encode_cursor(created_at, &id)),
    }))
}

/// Get a single event by id.
#[utoipa::path(
    get,
    path = "/api/v1/events/{id}",
    tag = "events",
    responses(
        (status = 200, description = "The event", body = EventResponse),
        (status = 404, description = "Unknown event id"),
    ),
)]
#[instrument(skip_all, fields(event_id = %id))]
pub async fn get_event(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Path(id): Path<String>,
) -> Result<Json<EventResponse>> {
    credential.require_scope(Scope::EventsRead)?;

    let event = state.ingest.get_event(&id).await?;
    Ok(Json(event.into()))
}

/// Delivery rows for one event (delivery history and state).
#[instrument(skip_all, fields(event_id = %id))]
pub async fn list_event_deliveries(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Path(id): Path<String>,
) -> Result<Json<Vec<serde_json::Value>>> {
    credential.require_scope(Scope::EventsRead)?;

    // 404 for unknown events rather than an empty list
    state.ingest.get_event(&id).await?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Deliveries::new(&mut conn);
    let deliveries = repo.list_by_event(&id).await?;

    let rows = deliveries
        .into_iter()
        .map(|d| {
            serde_json::json!({
                "id": d.id,
                "event_id": d.event_id,
                "subscription_id": d.subscription_id,
                "status": d.status,
                "attempt_count": d.attempt_count,
                "max_attempts": d.max_attempts,
                "scheduled_at": d.scheduled_at,
                "started_at": d.started_at,
                "completed_at": d.completed_at,
                "next_retry_at": d.next_retry_at,
                "response_status_code": d.response_status_code,
                "response_time_ms": d.response_time_ms,
                "error_type": d.error_type,
                "error_message": d.error_message,
                "attempt_history": d.attempt_history,
                "created_at": d.created_at,
            })
        })
        .collect();

    Ok(Json(rows))
}

/// Replay an event to its matching subscriptions (or explicit targets).
#[utoipa::path(
    post,
    path = "/api/v1/events/{id}/replay",
    tag = "events",
    request_body = ReplayEventRequest,
    responses(
        (status = 200, description = "Replay outcome", body = ReplayEventResponse),
        (status = 404, description = "Unknown event or target subscription"),
    ),
)]
#[instrument(skip_all, fields(event_id = %id))]
pub async fn replay_event(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Path(id): Path<String>,
    Json(request): Json<ReplayEventRequest>,
) -> Result<Json<ReplayEventResponse>> {
    credential.require_scope(Scope::EventsWrite)?;

    let outcome = state.ingest.replay_event(&id, request.into()).await?;
    Ok(Json(outcome.into()))
}

/// Query parameters for the SSE stream. List filters are comma-separated.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct StreamQuery {
    pub event_types: Option<String>,
    pub sources: Option<String>,
    pub subscription_id: Option<String>,
}

fn split_csv(value: Option<String>) -> Option<Vec<String>> {
    value.map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

/// Live SSE stream of admitted events.
///
/// Emits `connected` on subscribe, `event` for every envelope passing the
/// filters, and `heartbeat` on idle intervals.
#[instrument(skip_all)]
pub async fn stream_events(
    State(state): State<AppState>,
    credential: CurrentCredential,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>> {
    credential.require_scope(Scope::EventsRead)?;

    let filters = StreamFilters {
        event_types: split_csv(query.event_types),
        sources: split_csv(query.sources),
        subscription_id: query.subscription_id,
    };
    let heartbeat = Duration::from_secs(state.config.stream.heartbeat_interval_secs.max(1));

    let events = stream::relay(state.store.clone(), filters, heartbeat).map(Ok::<_, Infallible>);

    Ok(Sse::new(events))
}
